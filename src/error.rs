//! Error types for a single SNTP exchange.

use thiserror::Error;

/// Why one sync attempt against one server was discarded.
///
/// None of these escape the sync worker; they only drive the retry loop
/// and end up in the log.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Socket creation, send, receive or timeout failure
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Host name did not resolve to any address
    #[error("could not resolve {0}")]
    Resolve(String),

    /// Reply shorter than a full SNTP packet
    #[error("short reply: {len} bytes")]
    ShortReply { len: usize },

    /// Server answered with an unset transmit timestamp
    #[error("reply carries no transmit timestamp")]
    ZeroTimestamp,
}

impl SyncError {
    /// Protocol errors come from the reply contents rather than the socket.
    pub fn is_protocol(&self) -> bool {
        matches!(self, SyncError::ShortReply { .. } | SyncError::ZeroTimestamp)
    }
}

/// Result type for SNTP exchanges.
pub type Result<T> = std::result::Result<T, SyncError>;
