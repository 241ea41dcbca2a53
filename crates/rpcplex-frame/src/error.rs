/// Errors that can occur during framing and link delivery.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x5250 \"RP\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended in the middle of a frame.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The other end of the link is gone.
    #[error("link closed")]
    LinkClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
