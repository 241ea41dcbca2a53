use std::time::Duration;

/// Errors surfaced to the caller of a failed RPC operation.
///
/// None of these tear down the protocol engine; they belong to the single
/// operation that produced them.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The channel is closing or closed; no further calls are possible.
    #[error("channel closed")]
    ChannelClosed,

    /// The identifier name is already taken in its namespace.
    #[error("proxy identifier '{name}' already defined in namespace '{namespace}'")]
    DuplicateIdentifier { namespace: String, name: String },

    /// The identifier name is not usable (empty, too long).
    #[error("invalid proxy identifier: {0}")]
    InvalidIdentifier(String),

    /// The argument graph references itself.
    #[error("cannot serialize cyclic argument graph")]
    SerializationCycle,

    /// A value could not be turned into its wire form.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// No handler is registered for the addressed proxy on the remote side.
    #[error("no handler registered for '{proxy}'")]
    HandlerNotFound { proxy: String },

    /// The addressed handler has no such method.
    #[error("method '{method}' not found on '{proxy}'")]
    MethodNotFound { proxy: String, method: String },

    /// The remote handler ran and failed.
    #[error("remote handler failed: {0}")]
    RemoteHandler(String),

    /// The call was cancelled before a response arrived.
    #[error("call cancelled")]
    Cancelled,

    /// The call did not settle in time and was cancelled.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// A successful result did not deserialize into the requested type.
    #[error("cannot decode result: {0}")]
    Decode(String),

    /// The underlying link failed.
    #[error("frame error: {0}")]
    Frame(#[from] rpcplex_frame::FrameError),

    /// JSON encoding/decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RpcError>;
