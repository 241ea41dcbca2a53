use std::path::Path;
use std::time::{Duration, Instant};

use rpcplex_frame::{FrameConfig, Link};
use rpcplex_rpc::{ProtocolConfig, RpcProtocol};
use tracing::debug;

use crate::cmd::{parse_call_args, parse_duration, CallArgs};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_call, CallOutput, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args = parse_call_args(args.args.as_deref())?;
    let rpc = open(&args.path, timeout).await?;

    let started = Instant::now();
    let call = rpc
        .proxy_for(&args.proxy)
        .call(&args.method, call_args)
        .map_err(|err| rpc_error("call failed", err))?;
    let id = call.id();
    debug!(id, proxy = %args.proxy, method = %args.method, "call sent");
    let result = call.with_timeout(timeout).await;

    rpc.close();
    rpc.closed().await;

    let result = result.map_err(|err| rpc_error("call failed", err))?;
    print_call(
        &CallOutput {
            proxy: &args.proxy,
            method: &args.method,
            id,
            elapsed_ms: started.elapsed().as_millis(),
            result,
        },
        format,
    );
    Ok(SUCCESS)
}

/// Connect to `path` and start a client engine on the connection.
pub(crate) async fn open(path: &Path, timeout: Duration) -> CliResult<RpcProtocol> {
    let stream = tokio::time::timeout(timeout, rpcplex_transport::connect(path))
        .await
        .map_err(|_| CliError::new(TIMEOUT, format!("connect timed out after {timeout:?}")))?
        .map_err(|err| transport_error("connect failed", err))?;
    Ok(RpcProtocol::with_config(
        Link::from_stream(stream, FrameConfig::default()),
        ProtocolConfig {
            label: "cli".to_string(),
            ..ProtocolConfig::default()
        },
    ))
}
