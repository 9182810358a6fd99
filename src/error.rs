//! Error types for the ingestion core. Codec and store errors are typed so the
//! Connection Handler can branch on them (spec §5/§7); everything else bubbles
//! up through `anyhow` the way the teacher's bootstrap code does.

use thiserror::Error;

/// A per-frame parse failure. Never fatal to the connection on its own — the
/// handler logs it and resynchronizes on the next frame delimiter.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed numeric field: {0}")]
    MalformedField(String),

    #[error("crc16 mismatch (expected {expected:#06x}, got {actual:#06x})")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("unexpected codec id {0:#04x}")]
    UnknownCodecId(u8),

    #[error("frame too short: need at least {needed} bytes, have {have}")]
    TooShort { needed: usize, have: usize },
}

/// A decision made while routing a newly accepted connection.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("neither protocol matched within the peek budget")]
    NoProtocolMatched,

    #[error("peek timed out before enough bytes arrived")]
    PeekTimeout,

    #[error("socket error while peeking: {0}")]
    Io(#[from] std::io::Error),
}

/// Store Gateway failure, distinguished so callers can apply spec §7's retry
/// policy: transient failures get one immediate retry then a counted drop;
/// repeated transient failures push the connection into backpressure mode.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("store error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether the handler should treat this as retriable-then-droppable
    /// rather than connection-fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Fatal-to-connection errors that cause the handler to move to Closing.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("identification handshake timed out")]
    HandshakeTimeout,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
