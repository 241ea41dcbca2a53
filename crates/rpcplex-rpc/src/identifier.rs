//! Named proxy identifiers.
//!
//! Both ends of a channel agree on a set of names up front. A name is the
//! runtime key under which one side serves a handler and the other side
//! addresses it; the type parameter only exists so that
//! [`RpcProtocol::get_proxy`](crate::RpcProtocol::get_proxy) can hand back
//! the matching typed proxy.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Result, RpcError};

const MAX_IDENTIFIER_LEN: usize = 128;

/// Immutable symbolic name of a capability served on one side of a channel.
pub struct ProxyIdentifier<T: ?Sized> {
    name: Arc<str>,
    namespace: Arc<str>,
    _tag: PhantomData<fn() -> T>,
}

impl<T: ?Sized> ProxyIdentifier<T> {
    /// The wire name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Label of the namespace that defined this identifier.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }
}

impl<T: ?Sized> Clone for ProxyIdentifier<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            namespace: Arc::clone(&self.namespace),
            _tag: PhantomData,
        }
    }
}

impl<T: ?Sized> PartialEq for ProxyIdentifier<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.namespace == other.namespace
    }
}

impl<T: ?Sized> Eq for ProxyIdentifier<T> {}

impl<T: ?Sized> fmt::Debug for ProxyIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyIdentifier")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

impl<T: ?Sized> fmt::Display for ProxyIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A set of identifiers that must not collide.
///
/// A plugin host typically keeps two: one for capabilities the main
/// process serves and one for capabilities the plugin side serves.
/// Namespaces are meant to live in statics:
///
/// ```
/// use std::sync::LazyLock;
/// use rpcplex_rpc::{Proxy, ProxyIdentifier, ProxyNamespace};
///
/// static MAIN_CONTEXT: LazyLock<ProxyNamespace> = LazyLock::new(|| ProxyNamespace::new("main"));
/// static WINDOW_MAIN: LazyLock<ProxyIdentifier<Proxy>> =
///     LazyLock::new(|| MAIN_CONTEXT.define("WindowMain").expect("unique name"));
///
/// assert_eq!(WINDOW_MAIN.name(), "WindowMain");
/// ```
pub struct ProxyNamespace {
    label: Arc<str>,
    names: Mutex<Vec<Arc<str>>>,
}

impl ProxyNamespace {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            names: Mutex::new(Vec::new()),
        }
    }

    /// Namespace label, used in diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Define a new identifier.
    ///
    /// Fails with [`RpcError::DuplicateIdentifier`] when the name was
    /// already defined here; two definitions of one name are a protocol
    /// mismatch and should surface at startup.
    pub fn define<T: ?Sized>(&self, name: &str) -> Result<ProxyIdentifier<T>> {
        validate_name(name)?;

        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        if names.iter().any(|existing| existing.as_ref() == name) {
            return Err(RpcError::DuplicateIdentifier {
                namespace: self.label.to_string(),
                name: name.to_string(),
            });
        }

        let name: Arc<str> = Arc::from(name);
        names.push(Arc::clone(&name));
        Ok(ProxyIdentifier {
            name,
            namespace: Arc::clone(&self.label),
            _tag: PhantomData,
        })
    }

    /// Defined names, in definition order.
    pub fn names(&self) -> Vec<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    /// True if `name` has been defined here.
    pub fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|existing| existing.as_ref() == name)
    }
}

impl fmt::Debug for ProxyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyNamespace")
            .field("label", &self.label)
            .field("names", &self.names())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return Err(RpcError::InvalidIdentifier(format!(
            "name length must be 1..={MAX_IDENTIFIER_LEN}, got {}",
            name.len()
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(RpcError::InvalidIdentifier(format!(
            "name '{}' contains control characters",
            name.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proxy;

    #[test]
    fn define_returns_named_identifier() {
        let ns = ProxyNamespace::new("plugin");
        let id: ProxyIdentifier<Proxy> = ns.define("Math").unwrap();

        assert_eq!(id.name(), "Math");
        assert_eq!(id.namespace(), "plugin");
        assert_eq!(id.to_string(), "Math");
        assert_eq!(ns.names(), vec!["Math".to_string()]);
    }

    #[test]
    fn duplicate_name_fails_fast() {
        let ns = ProxyNamespace::new("main");
        let _first: ProxyIdentifier<Proxy> = ns.define("Window").unwrap();
        let second = ns.define::<Proxy>("Window");

        match second {
            Err(RpcError::DuplicateIdentifier { namespace, name }) => {
                assert_eq!(namespace, "main");
                assert_eq!(name, "Window");
            }
            other => panic!("expected duplicate identifier error, got {other:?}"),
        }
    }

    #[test]
    fn same_name_in_different_namespaces_is_allowed() {
        let main = ProxyNamespace::new("main");
        let plugin = ProxyNamespace::new("plugin");

        assert!(main.define::<Proxy>("Commands").is_ok());
        assert!(plugin.define::<Proxy>("Commands").is_ok());
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        let ns = ProxyNamespace::new("main");
        assert!(matches!(
            ns.define::<Proxy>(""),
            Err(RpcError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            ns.define::<Proxy>(&"x".repeat(MAX_IDENTIFIER_LEN + 1)),
            Err(RpcError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            ns.define::<Proxy>("bad\nname"),
            Err(RpcError::InvalidIdentifier(_))
        ));
        assert!(ns.names().is_empty());
    }

    #[test]
    fn preserves_definition_order() {
        let ns = ProxyNamespace::new("main");
        for name in ["Zeta", "Alpha", "Mid"] {
            ns.define::<Proxy>(name).unwrap();
        }
        assert_eq!(ns.names(), vec!["Zeta", "Alpha", "Mid"]);
        assert!(ns.contains("Alpha"));
        assert!(!ns.contains("Omega"));
    }
}
