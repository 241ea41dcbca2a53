//! Bidirectional RPC over named proxies for plugin hosts.
//!
//! rpcplex lets two processes (a host and its plugins) serve handlers to
//! each other and call them through proxies, over one framed channel.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket listener and connector
//! - [`frame`]: Length-prefixed framing and in-memory or stream-backed links
//! - [`rpc`]: Proxy identifiers, the protocol engine, cancellation and services

/// Re-export transport types.
pub mod transport {
    pub use rpcplex_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rpcplex_frame::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use rpcplex_rpc::*;
}
