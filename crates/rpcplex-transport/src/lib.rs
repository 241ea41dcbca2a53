//! Local byte-stream transports for rpcplex.
//!
//! This is the lowest layer of rpcplex. It hands out connected
//! [`tokio::net::UnixStream`]s; framing and RPC live in the layers above.
//!
//! Windows named pipes are not wired up yet.

pub mod error;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use uds::{connect, PeerCredentials, UnixSocketListener};
