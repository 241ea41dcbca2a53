use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rpcplex_frame::{FrameConfig, Link};
use rpcplex_rpc::{ProtocolConfig, RpcProtocol, ServiceRegistry};
use rpcplex_transport::UnixSocketListener;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{rpc_error, transport_error, CliResult, SUCCESS};
use crate::services;

/// How long open connections get to say goodbye on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let registry = Arc::new(
        services::registry().map_err(|err| rpc_error("service setup failed", err))?,
    );
    let listener = UnixSocketListener::bind_with_mode(&args.path, args.mode)
        .map_err(|err| transport_error("bind failed", err))?;
    info!(
        path = %listener.path().display(),
        services = ?registry.names(),
        "serving"
    );

    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
    };
    serve_until(&listener, registry, interrupted).await;
    Ok(SUCCESS)
}

/// Accept connections until `stop` resolves, then close every open
/// connection and wait up to `DRAIN_TIMEOUT` for them to finish.
///
/// Returns the number of connections accepted.
async fn serve_until(
    listener: &UnixSocketListener,
    registry: Arc<ServiceRegistry>,
    stop: impl Future<Output = ()>,
) -> u64 {
    tokio::pin!(stop);
    let shutdown = CancellationToken::new();
    let mut connections = JoinSet::new();
    let mut accepted: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            stream = listener.accept() => match stream {
                Ok(stream) => {
                    accepted += 1;
                    connections.spawn(serve_connection(
                        stream,
                        format!("conn-{accepted}"),
                        Arc::clone(&registry),
                        shutdown.child_token(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    shutdown.cancel();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "connections still open at shutdown"
        );
    }
    accepted
}

async fn serve_connection(
    stream: UnixStream,
    label: String,
    registry: Arc<ServiceRegistry>,
    shutdown: CancellationToken,
) {
    let link = Link::from_stream(stream, FrameConfig::default());
    let rpc = RpcProtocol::with_config(
        link,
        ProtocolConfig {
            label,
            ..ProtocolConfig::default()
        },
    );
    let installed = registry.install(&rpc);
    info!(label = rpc.label(), services = installed, "connection open");

    tokio::select! {
        _ = rpc.closed() => {}
        _ = shutdown.cancelled() => {
            rpc.close();
            rpc.closed().await;
        }
    }
    info!(label = rpc.label(), reason = ?rpc.close_reason(), "connection closed");
}

#[cfg(test)]
mod tests {
    use rpcplex_rpc::{Arg, CloseReason};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn stop_drains_open_connections() {
        let dir = std::env::temp_dir().join(format!(
            "rpcplex-serve-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("serve.sock");
        let listener = UnixSocketListener::bind(&path).unwrap();
        let registry = Arc::new(services::registry().unwrap());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            serve_until(&listener, registry, async {
                let _ = stop_rx.await;
            })
            .await
        });

        let stream = rpcplex_transport::connect(&path).await.unwrap();
        let client = RpcProtocol::new(Link::from_stream(stream, FrameConfig::default()));
        let sum: i64 = timeout(
            WAIT,
            client
                .proxy_for("math")
                .invoke_as("add", vec![Arg::from(2), Arg::from(3)]),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(sum, 5);

        stop_tx.send(()).unwrap();
        let accepted = timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(accepted, 1);

        timeout(WAIT, client.closed())
            .await
            .expect("client should see the server close");
        assert_eq!(client.close_reason(), Some(CloseReason::RemoteGoodbye));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
