//! Outbound argument graphs and their conversion to wire values.
//!
//! Arguments are built as [`Arg`] trees. Plain JSON covers most calls; a
//! [`SharedArg`] node lets callers pass graphs whose parts are referenced
//! from more than one place (and can therefore contain cycles), and a
//! [`Marker`] carries a host value that only a [`ValueConverter`] knows how
//! to put on the wire.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, RpcError};
use crate::handler::HandlerError;

/// One node of an outbound argument graph.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A plain JSON value, copied as is.
    Value(Value),
    Array(Vec<Arg>),
    Object(BTreeMap<String, Arg>),
    /// A node that may be referenced from several places.
    Shared(SharedArg),
    /// An opaque host value, replaced through the converter.
    Marker(Marker),
}

impl Arg {
    pub fn null() -> Self {
        Arg::Value(Value::Null)
    }

    /// Serialize any `Serialize` type into a plain node.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Arg::Value(serde_json::to_value(value)?))
    }

    /// Build an object node from key/value pairs.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Arg)>,
    {
        Arg::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<()> for Arg {
    fn from(_: ()) -> Self {
        Arg::null()
    }
}

macro_rules! arg_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Value(Value::from(value))
                }
            }
        )*
    };
}

arg_from_scalar!(bool, i32, i64, u32, u64, f64, &str, String);

impl From<Vec<Arg>> for Arg {
    fn from(items: Vec<Arg>) -> Self {
        Arg::Array(items)
    }
}

impl From<SharedArg> for Arg {
    fn from(shared: SharedArg) -> Self {
        Arg::Shared(shared)
    }
}

impl From<Marker> for Arg {
    fn from(marker: Marker) -> Self {
        Arg::Marker(marker)
    }
}

/// A reference node inside an argument graph.
///
/// Clones point at the same node, so storing a clone inside its own
/// contents builds a cycle.
#[derive(Clone)]
pub struct SharedArg(Arc<RwLock<Arg>>);

impl SharedArg {
    pub fn new(arg: impl Into<Arg>) -> Self {
        Self(Arc::new(RwLock::new(arg.into())))
    }

    /// Replace the node contents.
    pub fn set(&self, arg: impl Into<Arg>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = arg.into();
    }

    /// Identity of the node, shared by all clones.
    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for SharedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Contents may refer back to this node.
        write!(f, "SharedArg({:#x})", self.key())
    }
}

/// An opaque host value carried through an argument graph.
#[derive(Clone)]
pub struct Marker {
    kind: Arc<str>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Marker {
    pub fn new<T: Any + Send + Sync>(kind: &str, payload: T) -> Self {
        Self {
            kind: Arc::from(kind),
            payload: Arc::new(payload),
        }
    }

    /// Tag used by converters to recognise the value.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marker")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Host hook for values that JSON cannot express directly.
///
/// `replace` runs on every [`Marker`] while arguments and results are
/// cloned for sending. `revive` runs on every inbound argument and
/// successful result before it reaches user code.
pub trait ValueConverter: Send + Sync {
    fn replace(&self, marker: &Marker) -> Option<Value>;

    fn revive(&self, value: Value) -> Value {
        value
    }
}

/// Converter that knows no markers and leaves inbound values alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughConverter;

impl ValueConverter for PassthroughConverter {
    fn replace(&self, _marker: &Marker) -> Option<Value> {
        None
    }
}

/// Most argument nodes a single clone may produce.
const MAX_CLONE_NODES: usize = 1 << 20;

/// Deepest argument nesting a clone accepts; the peer's JSON decoder
/// refuses anything deeper anyway.
const MAX_CLONE_DEPTH: usize = 128;

/// Deep-copy an argument graph into an owned wire value.
///
/// A shared node met again while it is still being copied is a cycle and
/// fails with [`RpcError::SerializationCycle`]. A node reachable along two
/// separate paths appears once per path in the output, but is only walked
/// once. Markers the converter declines, graphs that expand past
/// `MAX_CLONE_NODES` nodes and nesting deeper than `MAX_CLONE_DEPTH` levels
/// fail with [`RpcError::Serialization`].
pub fn structural_clone(arg: &Arg, converter: &dyn ValueConverter) -> Result<Value> {
    CloneState {
        converter,
        path: HashSet::new(),
        done: HashMap::new(),
        nodes: 0,
        deepest: 0,
    }
    .clone_node(arg, 0)
}

struct CloneState<'a> {
    converter: &'a dyn ValueConverter,
    /// Shared nodes currently being copied.
    path: HashSet<usize>,
    /// Finished shared nodes with the node count and height of their copy.
    done: HashMap<usize, (Value, usize, usize)>,
    nodes: usize,
    deepest: usize,
}

impl CloneState<'_> {
    fn count(&mut self, nodes: usize) -> Result<()> {
        self.nodes = self.nodes.saturating_add(nodes);
        if self.nodes > MAX_CLONE_NODES {
            return Err(RpcError::Serialization(format!(
                "argument graph expands past {MAX_CLONE_NODES} nodes"
            )));
        }
        Ok(())
    }

    fn reach(&mut self, depth: usize) -> Result<()> {
        if depth > MAX_CLONE_DEPTH {
            return Err(RpcError::Serialization(format!(
                "argument nested deeper than {MAX_CLONE_DEPTH} levels"
            )));
        }
        self.deepest = self.deepest.max(depth);
        Ok(())
    }

    fn clone_node(&mut self, arg: &Arg, depth: usize) -> Result<Value> {
        self.reach(depth)?;
        if !matches!(arg, Arg::Shared(_)) {
            self.count(1)?;
        }
        match arg {
            Arg::Value(value) => Ok(value.clone()),
            Arg::Array(items) => items
                .iter()
                .map(|item| self.clone_node(item, depth + 1))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Arg::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, field) in fields {
                    map.insert(key.clone(), self.clone_node(field, depth + 1)?);
                }
                Ok(Value::Object(map))
            }
            Arg::Shared(shared) => {
                let key = shared.key();
                if let Some((value, nodes, height)) = self.done.get(&key).cloned() {
                    self.reach(depth + height)?;
                    self.count(nodes)?;
                    return Ok(value);
                }
                if !self.path.insert(key) {
                    return Err(RpcError::SerializationCycle);
                }
                let before = self.nodes;
                let outer = std::mem::replace(&mut self.deepest, depth);
                let result = {
                    let node = shared.0.read().unwrap_or_else(PoisonError::into_inner);
                    self.clone_node(&node, depth)
                };
                self.path.remove(&key);
                let value = result?;
                let height = self.deepest - depth;
                self.deepest = self.deepest.max(outer);
                self.done
                    .insert(key, (value.clone(), self.nodes - before, height));
                Ok(value)
            }
            Arg::Marker(marker) => self.converter.replace(marker).ok_or_else(|| {
                RpcError::Serialization(format!(
                    "no conversion for opaque value of kind '{}'",
                    marker.kind()
                ))
            }),
        }
    }
}

/// Inbound argument list handed to a method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Deserialize the argument at `index`.
    ///
    /// A missing trailing argument reads as `null`, so `Option<T>`
    /// parameters may be omitted by the caller.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, HandlerError> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|err| HandlerError::new(format!("argument {index}: {err}")))
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
