//! Length-prefixed message framing and message links for rpcplex.
//!
//! Every message is framed with:
//! - A 2-byte magic number ("RP") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID
//!
//! A [`Link`] is the message channel the RPC layer talks to: ordered,
//! reliable, bidirectional delivery of whole frames, either in memory or
//! over any byte stream.

pub mod channel;
pub mod codec;
pub mod error;
pub mod link;

pub use channel::{channel_name, CONTROL, RPC, USER_CHANNEL_START};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use link::{Drained, Link, LinkReceiver, LinkSender};
