//! Declarative registration of the handlers one side serves.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, RpcError};
use crate::handler::{Handler, MethodTable};
use crate::identifier::ProxyIdentifier;
use crate::protocol::RpcProtocol;

/// How often a provider's factory runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Once per [`ServiceRegistry::install`].
    Singleton,
    /// Once per inbound request or notification.
    PerCall,
}

type Factory = Arc<dyn Fn() -> MethodTable + Send + Sync>;

/// A handler factory bound to a proxy identifier.
#[derive(Clone)]
pub struct ServiceProvider {
    name: Arc<str>,
    namespace: Arc<str>,
    lifetime: Lifetime,
    factory: Factory,
}

impl ServiceProvider {
    pub fn singleton<T: ?Sized>(
        identifier: &ProxyIdentifier<T>,
        factory: impl Fn() -> MethodTable + Send + Sync + 'static,
    ) -> Self {
        Self::with_lifetime(identifier, Lifetime::Singleton, factory)
    }

    pub fn per_call<T: ?Sized>(
        identifier: &ProxyIdentifier<T>,
        factory: impl Fn() -> MethodTable + Send + Sync + 'static,
    ) -> Self {
        Self::with_lifetime(identifier, Lifetime::PerCall, factory)
    }

    pub fn with_lifetime<T: ?Sized>(
        identifier: &ProxyIdentifier<T>,
        lifetime: Lifetime,
        factory: impl Fn() -> MethodTable + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: identifier.shared_name(),
            namespace: Arc::from(identifier.namespace()),
            lifetime,
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    fn handler(&self) -> Handler {
        match self.lifetime {
            Lifetime::Singleton => Handler::from((self.factory)()),
            Lifetime::PerCall => Handler::PerCall(Arc::clone(&self.factory)),
        }
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

/// The set of services one side of a channel provides.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    providers: Vec<ServiceProvider>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. Two providers for one name are rejected.
    pub fn register(&mut self, provider: ServiceProvider) -> Result<()> {
        if self.providers.iter().any(|p| p.name == provider.name) {
            return Err(RpcError::DuplicateIdentifier {
                namespace: provider.namespace.to_string(),
                name: provider.name.to_string(),
            });
        }
        self.providers.push(provider);
        Ok(())
    }

    /// Provider names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Register every provider's handler on `rpc`. Returns the count.
    pub fn install(&self, rpc: &RpcProtocol) -> usize {
        for provider in &self.providers {
            rpc.set_handler(&provider.name, provider.handler());
            debug!(
                label = rpc.label(),
                proxy = %provider.name,
                lifetime = ?provider.lifetime,
                "service installed"
            );
        }
        self.providers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rpcplex_frame::Link;

    use super::*;
    use crate::handler::{CallContext, HandlerError};
    use crate::identifier::ProxyNamespace;
    use crate::proxy::Proxy;
    use crate::value::{Arg, Args};

    fn counting_table(built: &Arc<AtomicUsize>) -> impl Fn() -> MethodTable + Send + Sync + 'static {
        let built = Arc::clone(built);
        move || {
            let generation = built.fetch_add(1, Ordering::SeqCst) + 1;
            MethodTable::builder("Counter")
                .method("generation", move |_args: Args, _ctx: CallContext| async move {
                    Ok::<_, HandlerError>(generation as u64)
                })
                .build()
        }
    }

    #[test]
    fn rejects_duplicate_providers() {
        let ns = ProxyNamespace::new("main");
        let id = ns.define::<Proxy>("Counter").unwrap();
        let built = Arc::new(AtomicUsize::new(0));

        let mut registry = ServiceRegistry::new();
        registry
            .register(ServiceProvider::singleton(&id, counting_table(&built)))
            .unwrap();
        let err = registry
            .register(ServiceProvider::per_call(&id, counting_table(&built)))
            .unwrap_err();

        assert!(matches!(err, RpcError::DuplicateIdentifier { name, .. } if name == "Counter"));
        assert_eq!(registry.names(), vec!["Counter"]);
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn singleton_and_per_call_lifetimes() {
        let ns = ProxyNamespace::new("plugin");
        let single_id = ns.define::<Proxy>("Single").unwrap();
        let scoped_id = ns.define::<Proxy>("Scoped").unwrap();
        let single_built = Arc::new(AtomicUsize::new(0));
        let scoped_built = Arc::new(AtomicUsize::new(0));

        let mut registry = ServiceRegistry::new();
        registry
            .register(ServiceProvider::singleton(
                &single_id,
                counting_table(&single_built),
            ))
            .unwrap();
        registry
            .register(ServiceProvider::per_call(
                &scoped_id,
                counting_table(&scoped_built),
            ))
            .unwrap();

        let (main_link, plugin_link) = Link::pair();
        let main = RpcProtocol::new(main_link);
        let plugin = RpcProtocol::new(plugin_link);
        assert_eq!(registry.install(&plugin), 2);
        assert_eq!(single_built.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.handler_names(), vec!["Scoped", "Single"]);

        let single = main.get_proxy(&single_id);
        let scoped = main.get_proxy(&scoped_id);
        let mut single_seen = Vec::new();
        let mut scoped_seen = Vec::new();
        for _ in 0..3 {
            let no_args = Vec::<Arg>::new;
            single_seen.push(single.invoke_as::<u64>("generation", no_args()).await.unwrap());
            scoped_seen.push(scoped.invoke_as::<u64>("generation", no_args()).await.unwrap());
        }

        assert_eq!(single_seen, vec![1, 1, 1]);
        assert_eq!(scoped_seen, vec![1, 2, 3]);
        assert_eq!(single_built.load(Ordering::SeqCst), 1);
    }
}
