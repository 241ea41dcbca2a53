#![cfg(all(unix, feature = "cli"))]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/rpcplex-exit-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_connect(path: &Path, timeout: Duration) {
    let start = Instant::now();
    loop {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("connect timeout");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn start_server(sock_path: &Path) -> Child {
    let child = Command::new(env!("CARGO_BIN_EXE_rpcplex"))
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg(sock_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve command should start");
    wait_for_connect(sock_path, Duration::from_secs(3));
    child
}

fn call(sock_path: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rpcplex"))
        .arg("--log-level")
        .arg("error")
        .arg("call")
        .arg(sock_path)
        .args(args)
        .env_remove("RPCPLEX_ARGS")
        .output()
        .expect("call should run")
}

fn stop(mut child: Child, dir: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn failures_map_to_distinct_exit_codes() {
    let dir = unique_temp_dir("codes");
    let sock_path = dir.join("rpc.sock");
    let server = start_server(&sock_path);

    let unknown_proxy = call(&sock_path, &["nope", "add"]);
    let unknown_method = call(&sock_path, &["math", "pow", "--args", "[2,8]"]);
    let handler_error = call(&sock_path, &["math", "div", "--args", "[1,0]"]);
    let bad_argument = call(&sock_path, &["math", "add", "--args", r#"["x",1]"#]);
    let timed_out = call(
        &sock_path,
        &["echo", "sleep", "--args", "[10000]", "--timeout", "200ms"],
    );

    stop(server, &dir);

    assert_eq!(unknown_proxy.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&unknown_proxy.stderr).contains("nope"));
    assert_eq!(unknown_method.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&unknown_method.stderr).contains("pow"));
    assert_eq!(handler_error.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&handler_error.stderr).contains("division by zero"));
    assert_eq!(bad_argument.status.code(), Some(1));
    assert_eq!(timed_out.status.code(), Some(124));
}

#[test]
fn missing_socket_is_a_transport_error() {
    let dir = unique_temp_dir("missing");
    let output = call(&dir.join("absent.sock"), &["math", "add"]);
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("error: connect failed"));
}

#[test]
fn invalid_args_json_is_a_usage_error() {
    let dir = unique_temp_dir("badjson");
    let output = call(&dir.join("unused.sock"), &["math", "add", "--args", "[1,"]);
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--args is not valid JSON"));
}

#[test]
fn zero_timeout_is_rejected() {
    let dir = unique_temp_dir("zero");
    let output = call(&dir.join("unused.sock"), &["math", "add", "--timeout", "0s"]);
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(output.status.code(), Some(64));
}
