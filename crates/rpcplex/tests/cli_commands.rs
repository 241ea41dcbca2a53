#![cfg(all(unix, feature = "cli"))]

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/rpcplex-{tag}-{}-{}",
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

struct Server {
    child: Child,
    dir: PathBuf,
    sock_path: PathBuf,
}

impl Server {
    fn start(tag: &str) -> Self {
        let dir = unique_temp_dir(tag);
        let sock_path = dir.join("rpc.sock");
        let child = Command::new(env!("CARGO_BIN_EXE_rpcplex"))
            .arg("--log-level")
            .arg("error")
            .arg("serve")
            .arg(&sock_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");
        wait_for_connect(&sock_path, Duration::from_secs(3));
        Self {
            child,
            dir,
            sock_path,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        let (subcommand, rest) = args.split_first().expect("subcommand required");
        Command::new(env!("CARGO_BIN_EXE_rpcplex"))
            .arg("--log-level")
            .arg("error")
            .arg("--format")
            .arg("json")
            .arg(subcommand)
            .arg(&self.sock_path)
            .args(rest)
            .env_remove("RPCPLEX_ARGS")
            .output()
            .expect("client command should run")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn json_stdout(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn call_math_add_prints_result() {
    let server = Server::start("add");

    let output = server.run(&["call", "math", "add", "--args", "[2,3]"]);

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let out = json_stdout(&output);
    assert_eq!(out["proxy"], "math");
    assert_eq!(out["method"], "add");
    assert_eq!(out["result"], 5);
}

#[test]
fn echo_round_trips_structured_values() {
    let server = Server::start("echo");

    let output = server.run(&[
        "call",
        "echo",
        "echo",
        "--args",
        r#"[{"list":[1,"two",null],"flag":true}]"#,
    ]);

    assert!(output.status.success());
    let out = json_stdout(&output);
    assert_eq!(
        out["result"],
        serde_json::json!({"list": [1, "two", null], "flag": true})
    );
}

#[test]
fn repeated_calls_share_one_server() {
    let server = Server::start("repeat");

    for (a, b) in [(1, 2), (10, 20), (-4, 4)] {
        let args = format!("[{a},{b}]");
        let output = server.run(&["call", "math", "mul", "--args", &args]);
        assert!(output.status.success());
        assert_eq!(json_stdout(&output)["result"], a * b);
    }
}

#[test]
fn notify_reports_sent() {
    let server = Server::start("notify");

    let output = server.run(&["notify", "log", "info", "--args", r#"["hello from cli"]"#]);

    assert!(output.status.success());
    let out = json_stdout(&output);
    assert_eq!(out["sent"], true);
    assert_eq!(out["proxy"], "log");

    // The server keeps serving after a notify-only connection.
    let output = server.run(&["call", "math", "add", "--args", "[1,1]"]);
    assert!(output.status.success());
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_rpcplex"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("rpcplex {}", env!("CARGO_PKG_VERSION"))
    );
}
