//! Built-in channel IDs.
//!
//! Channels 0-255 are reserved for built-in use.
//! Channels 256-65535 are available for application-defined use.

/// Link management (goodbye on graceful close).
pub const CONTROL: u16 = 0;

/// RPC protocol messages (requests, responses, notifications, cancels).
pub const RPC: u16 = 1;

/// First user-defined channel ID.
pub const USER_CHANNEL_START: u16 = 256;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        RPC => "RPC",
        2..=255 => "RESERVED",
        _ => "USER",
    }
}

/// Returns true if the channel ID is in the reserved range.
pub fn is_reserved(id: u16) -> bool {
    id < USER_CHANNEL_START
}
