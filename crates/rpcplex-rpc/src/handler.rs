//! Method tables: the serving side of a proxy.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::value::{Arg, Args};

/// Boxed future returned by a registered method.
pub type MethodFuture = BoxFuture<'static, Result<Arg, HandlerError>>;

pub(crate) type MethodFn = dyn Fn(Args, CallContext) -> MethodFuture + Send + Sync;

/// Failure reported by a method body.
///
/// Only the message crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    cancelled: bool,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cancelled: false,
        }
    }

    /// The method gave up because its call was cancelled.
    pub fn cancelled() -> Self {
        Self {
            message: "call cancelled".to_string(),
            cancelled: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<RpcError> for HandlerError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Cancelled => Self::cancelled(),
            other => Self::new(other.to_string()),
        }
    }
}

/// Per-invocation context passed to every method.
#[derive(Debug, Clone)]
pub struct CallContext {
    id: Option<u64>,
    proxy: Arc<str>,
    method: Arc<str>,
    token: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        id: Option<u64>,
        proxy: Arc<str>,
        method: Arc<str>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            proxy,
            method,
            token,
        }
    }

    /// Request id, `None` for notifications.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Triggered when the caller cancels or the channel closes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Named set of async methods served under one proxy identifier.
pub struct MethodTable {
    name: String,
    methods: HashMap<String, Arc<MethodFn>>,
}

impl MethodTable {
    pub fn builder(name: impl Into<String>) -> MethodTableBuilder {
        MethodTableBuilder {
            table: MethodTable {
                name: name.into(),
                methods: HashMap::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn method(&self, name: &str) -> Option<Arc<MethodFn>> {
        self.methods.get(name).cloned()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("name", &self.name)
            .field("methods", &self.methods())
            .finish()
    }
}

pub struct MethodTableBuilder {
    table: MethodTable,
}

impl MethodTableBuilder {
    /// Register `method`. A later registration under the same name wins.
    pub fn method<F, Fut, R>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(Args, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
        R: Into<Arg>,
    {
        let method_fn: Arc<MethodFn> =
            Arc::new(move |args: Args, ctx: CallContext| -> MethodFuture {
                let fut = f(args, ctx);
                Box::pin(async move { fut.await.map(Into::into) })
            });
        self.table.methods.insert(method.to_string(), method_fn);
        self
    }

    pub fn build(self) -> MethodTable {
        self.table
    }
}

/// What is registered under a proxy name.
#[derive(Clone)]
pub enum Handler {
    /// One table serves every invocation.
    Shared(Arc<MethodTable>),
    /// A fresh table is built for every inbound invocation.
    PerCall(Arc<dyn Fn() -> MethodTable + Send + Sync>),
}

impl Handler {
    pub fn per_call(factory: impl Fn() -> MethodTable + Send + Sync + 'static) -> Self {
        Handler::PerCall(Arc::new(factory))
    }

    pub(crate) fn resolve(&self) -> Arc<MethodTable> {
        match self {
            Handler::Shared(table) => Arc::clone(table),
            Handler::PerCall(factory) => Arc::new(factory()),
        }
    }
}

impl From<MethodTable> for Handler {
    fn from(table: MethodTable) -> Self {
        Handler::Shared(Arc::new(table))
    }
}

impl From<Arc<MethodTable>> for Handler {
    fn from(table: Arc<MethodTable>) -> Self {
        Handler::Shared(table)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Shared(table) => f.debug_tuple("Shared").field(table).finish(),
            Handler::PerCall(_) => f.write_str("PerCall(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::value::{structural_clone, PassthroughConverter};

    async fn add(args: Args, _ctx: CallContext) -> Result<i64, HandlerError> {
        Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
    }

    fn ctx(method: &str) -> CallContext {
        CallContext::new(
            Some(1),
            Arc::from("Math"),
            Arc::from(method),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn builder_registers_methods() {
        let table = MethodTable::builder("Math")
            .method("add", add)
            .method("noop", |_args, _ctx| async { Ok::<_, HandlerError>(()) })
            .build();

        assert_eq!(table.name(), "Math");
        assert_eq!(table.methods(), vec!["add", "noop"]);
        assert!(table.has_method("add"));
        assert!(!table.has_method("sub"));

        let method = table.method("add").unwrap();
        let result = method(Args::new(vec![json!(2), json!(3)]), ctx("add"))
            .await
            .unwrap();
        assert_eq!(
            structural_clone(&result, &PassthroughConverter).unwrap(),
            json!(5)
        );
    }

    #[tokio::test]
    async fn argument_errors_become_handler_errors() {
        let table = MethodTable::builder("Math").method("add", add).build();
        let method = table.method("add").unwrap();

        let err = method(Args::new(vec![json!("two")]), ctx("add"))
            .await
            .unwrap_err();
        assert!(err.message().starts_with("argument 0:"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn per_call_handler_builds_fresh_tables() {
        let built = Arc::new(AtomicUsize::new(0));
        let handler = Handler::per_call({
            let built = Arc::clone(&built);
            move || {
                built.fetch_add(1, Ordering::SeqCst);
                MethodTable::builder("Scoped").build()
            }
        });

        let first = handler.resolve();
        let second = handler.resolve();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 2);

        let shared = Handler::from(MethodTable::builder("Math").build());
        assert!(Arc::ptr_eq(&shared.resolve(), &shared.resolve()));
    }

    #[test]
    fn cancelled_rpc_error_maps_to_cancelled_handler_error() {
        assert!(HandlerError::from(RpcError::Cancelled).is_cancelled());
        let err = HandlerError::from(RpcError::ChannelClosed);
        assert_eq!(err.message(), "channel closed");
        assert!(!err.is_cancelled());
    }
}
