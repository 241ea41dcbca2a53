//! Demo services hosted by `rpcplex serve`.

use std::time::Duration;

use rpcplex_rpc::{
    Args, CallContext, HandlerError, MethodTable, Proxy, ProxyNamespace, ServiceProvider,
    ServiceRegistry,
};
use serde_json::Value;
use tracing::{error, info, warn};

/// Longest `echo.sleep` a caller may ask for.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Registry with the `math`, `echo` and `log` services.
pub fn registry() -> rpcplex_rpc::Result<ServiceRegistry> {
    let namespace = ProxyNamespace::new("demo");
    let mut registry = ServiceRegistry::new();
    registry.register(ServiceProvider::singleton(
        &namespace.define::<Proxy>("math")?,
        math,
    ))?;
    registry.register(ServiceProvider::per_call(
        &namespace.define::<Proxy>("echo")?,
        echo,
    ))?;
    registry.register(ServiceProvider::singleton(
        &namespace.define::<Proxy>("log")?,
        log,
    ))?;
    Ok(registry)
}

fn math() -> MethodTable {
    MethodTable::builder("math")
        .method("add", |args: Args, _ctx: CallContext| async move {
            let (a, b): (i64, i64) = (args.get(0)?, args.get(1)?);
            a.checked_add(b)
                .ok_or_else(|| HandlerError::new("integer overflow"))
        })
        .method("mul", |args: Args, _ctx: CallContext| async move {
            let (a, b): (i64, i64) = (args.get(0)?, args.get(1)?);
            a.checked_mul(b)
                .ok_or_else(|| HandlerError::new("integer overflow"))
        })
        .method("div", |args: Args, _ctx: CallContext| async move {
            let (a, b): (f64, f64) = (args.get(0)?, args.get(1)?);
            if b == 0.0 {
                return Err(HandlerError::new("division by zero"));
            }
            Ok(a / b)
        })
        .build()
}

fn echo() -> MethodTable {
    MethodTable::builder("echo")
        .method("echo", |args: Args, _ctx: CallContext| async move {
            Ok::<_, HandlerError>(args.value(0).cloned().unwrap_or(Value::Null))
        })
        .method("sleep", |args: Args, ctx: CallContext| async move {
            let millis: u64 = args.get(0)?;
            let wait = Duration::from_millis(millis).min(MAX_SLEEP);
            tokio::select! {
                _ = tokio::time::sleep(wait) => Ok(millis),
                _ = ctx.token().cancelled() => Err(HandlerError::cancelled()),
            }
        })
        .build()
}

fn log() -> MethodTable {
    MethodTable::builder("log")
        .method("info", |args: Args, ctx: CallContext| async move {
            info!(proxy = ctx.proxy(), text = %message(&args), "remote log");
            Ok::<_, HandlerError>(())
        })
        .method("warn", |args: Args, ctx: CallContext| async move {
            warn!(proxy = ctx.proxy(), text = %message(&args), "remote log");
            Ok::<_, HandlerError>(())
        })
        .method("error", |args: Args, ctx: CallContext| async move {
            error!(proxy = ctx.proxy(), text = %message(&args), "remote log");
            Ok::<_, HandlerError>(())
        })
        .build()
}

fn message(args: &Args) -> String {
    match args.value(0) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use rpcplex_frame::Link;
    use rpcplex_rpc::{Arg, RpcError, RpcProtocol};
    use serde_json::json;

    use super::*;

    fn serve() -> (RpcProtocol, RpcProtocol) {
        let (client_link, server_link) = Link::pair();
        let client = RpcProtocol::new(client_link);
        let server = RpcProtocol::new(server_link);
        assert_eq!(registry().unwrap().install(&server), 3);
        (client, server)
    }

    #[test]
    fn registry_is_rebuilt_per_call() {
        let first = registry().unwrap();
        let second = registry().unwrap();
        assert_eq!(first.names(), vec!["math", "echo", "log"]);
        assert_eq!(first.names(), second.names());
    }

    #[tokio::test]
    async fn math_methods() {
        let (client, _server) = serve();
        let math = client.proxy_for("math");

        let sum: i64 = math
            .invoke_as("add", vec![Arg::from(2), Arg::from(3)])
            .await
            .unwrap();
        assert_eq!(sum, 5);
        let product: i64 = math
            .invoke_as("mul", vec![Arg::from(4), Arg::from(-3)])
            .await
            .unwrap();
        assert_eq!(product, -12);
        let quotient: f64 = math
            .invoke_as("div", vec![Arg::from(7), Arg::from(2)])
            .await
            .unwrap();
        assert_eq!(quotient, 3.5);

        let err = math
            .invoke("div", vec![Arg::from(1), Arg::from(0)])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RemoteHandler(msg) if msg == "division by zero"));
    }

    #[tokio::test]
    async fn bad_arguments_are_reported() {
        let (client, _server) = serve();
        let err = client
            .proxy_for("math")
            .invoke("add", vec![Arg::from("two"), Arg::from(3)])
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::RemoteHandler(msg) if msg.starts_with("argument 0")));
    }

    #[tokio::test]
    async fn echo_returns_its_argument() {
        let (client, _server) = serve();
        let value = client
            .proxy_for("echo")
            .invoke("echo", vec![Arg::from(json!({"nested": [1, "two"]}))])
            .await
            .unwrap();
        assert_eq!(value, json!({"nested": [1, "two"]}));
    }

    #[tokio::test]
    async fn sleep_observes_timeout() {
        let (client, _server) = serve();
        let call = client
            .proxy_for("echo")
            .call("sleep", vec![Arg::from(10_000)])
            .unwrap();
        let err = call
            .with_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
    }

    #[tokio::test]
    async fn log_accepts_notifications() {
        let (client, _server) = serve();
        let log = client.proxy_for("log");
        log.notify("info", vec![Arg::from("plugin started")]).unwrap();
        log.notify("warn", vec![Arg::from(json!({"code": 7}))]).unwrap();

        // Notifications for unknown methods are dropped on the serving side.
        log.notify("verbose", vec![]).unwrap();
        let err = log.invoke("verbose", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::MethodNotFound { .. }));
    }
}
