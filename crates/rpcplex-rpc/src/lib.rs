//! Bidirectional RPC over named proxy identifiers.
//!
//! Each side of a [`Link`](rpcplex_frame::Link) runs an [`RpcProtocol`].
//! A side serves [`MethodTable`]s under names defined in a
//! [`ProxyNamespace`], and calls the other side's handlers through
//! [`Proxy`] objects obtained with [`RpcProtocol::get_proxy`]. Calls carry
//! ids and resolve out of order; they can be cancelled, and they all fail
//! with [`RpcError::ChannelClosed`] when the channel goes away.

pub mod control;
pub mod disposable;
pub mod error;
pub mod event;
pub mod handler;
pub mod identifier;
pub mod message;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod value;

pub use control::{ControlMessage, CONTROL_GOODBYE};
pub use disposable::{Disposable, DisposableCollection};
pub use error::{Result, RpcError};
pub use event::{Emitter, Subscription};
pub use handler::{CallContext, Handler, HandlerError, MethodFuture, MethodTable, MethodTableBuilder};
pub use identifier::{ProxyIdentifier, ProxyNamespace};
pub use message::{Failure, FailureCode, Message, Outcome};
pub use protocol::{CloseReason, ProtocolConfig, ProtocolState, RpcProtocol};
pub use proxy::{CallCanceller, FromProxy, PendingCall, Proxy};
pub use service::{Lifetime, ServiceProvider, ServiceRegistry};
pub use value::{structural_clone, Arg, Args, Marker, PassthroughConverter, SharedArg, ValueConverter};
