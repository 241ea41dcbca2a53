//! A host and a plugin calling each other over one socket pair.
//!
//! The host serves a `Workspace` the plugin reads from; the plugin serves
//! a `Formatter` the host calls, which in turn calls back into the host.
//!
//! Run with:
//!   cargo run --example plugin-host

use std::sync::LazyLock;
use std::time::Duration;

use rpcplex::frame::{FrameConfig, Link};
use rpcplex::rpc::{
    Arg, Args, CallContext, FromProxy, HandlerError, MethodTable, Proxy, ProxyIdentifier,
    ProxyNamespace, Result, RpcError, RpcProtocol,
};

static MAIN: LazyLock<ProxyNamespace> = LazyLock::new(|| ProxyNamespace::new("main"));
static PLUGIN: LazyLock<ProxyNamespace> = LazyLock::new(|| ProxyNamespace::new("plugin"));

struct WorkspaceProxy(Proxy);

impl FromProxy for WorkspaceProxy {
    fn from_proxy(proxy: Proxy) -> Self {
        Self(proxy)
    }
}

struct FormatterProxy(Proxy);

impl FromProxy for FormatterProxy {
    fn from_proxy(proxy: Proxy) -> Self {
        Self(proxy)
    }
}

impl FormatterProxy {
    async fn format(&self, path: &str) -> Result<String> {
        let value = self
            .0
            .call("format", vec![Arg::from(path)])?
            .with_timeout(Duration::from_secs(2))
            .await?;
        serde_json::from_value(value).map_err(|err| RpcError::Decode(err.to_string()))
    }
}

fn workspace() -> MethodTable {
    MethodTable::builder("Workspace")
        .method("readFile", |args: Args, _ctx: CallContext| async move {
            let path: String = args.get(0)?;
            Ok::<_, HandlerError>(format!("fn main(){{println!(\"{path}\")}}"))
        })
        .build()
}

fn formatter(workspace: Proxy) -> MethodTable {
    MethodTable::builder("Formatter")
        .method("format", move |args: Args, _ctx: CallContext| {
            let workspace = workspace.clone();
            async move {
                let path: String = args.get(0)?;
                let source: String = workspace
                    .invoke_as("readFile", vec![Arg::from(path)])
                    .await?;
                Ok::<_, HandlerError>(source.replace('{', " {\n    ").replace('}', "\n}"))
            }
        })
        .build()
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let workspace_id: ProxyIdentifier<WorkspaceProxy> = MAIN.define("Workspace")?;
    let formatter_id: ProxyIdentifier<FormatterProxy> = PLUGIN.define("Formatter")?;

    let (host_stream, plugin_stream) = tokio::net::UnixStream::pair()?;
    let host = RpcProtocol::new(Link::from_stream(host_stream, FrameConfig::default()));
    let plugin = RpcProtocol::new(Link::from_stream(plugin_stream, FrameConfig::default()));

    host.set(&workspace_id, workspace());
    let WorkspaceProxy(remote_workspace) = plugin.get_proxy(&workspace_id);
    plugin.set(&formatter_id, formatter(remote_workspace));

    let formatted = host.get_proxy(&formatter_id).format("src/main.rs").await?;
    println!("{formatted}");

    host.close();
    plugin.closed().await;
    eprintln!("plugin saw {:?}", plugin.close_reason());
    Ok(())
}
