//! Rivet Error Types
//!
//! Every failure a connection can surface is normalized into one of these
//! kinds before it reaches a caller.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for Rivet operations
///
/// The error is `Clone` so a latched terminal error can be handed to every
/// past and future receiver of a connection.
#[derive(Error, Debug, Clone)]
pub enum RivetError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Peer declared a frame larger than the configured incoming limit
    #[error("Incoming packet too large: {size} bytes (max: {max})")]
    ExceedMaxIncomingPacket { size: usize, max: usize },

    /// Malformed frame or sub-message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Gzip encode/decode failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Dialing gave up after the configured number of retries
    #[error("Maximum dial retries reached after {attempts} attempts")]
    MaxOfRetry { attempts: u32 },

    /// Operation cancelled, or the connection was closed on purpose
    #[error("Canceled")]
    Canceled,

    /// Outbound buffer is closed
    #[error("Disconnected")]
    Disconnected,

    /// Queue closed; no further items are accepted
    #[error("Closed")]
    Closed,

    /// Outbound message can never fit in a single frame
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Flush loop is already bound to a sender
    #[error("Already running")]
    AlreadyRunning,

    /// A connection task panicked
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

/// Result type alias for Rivet operations
pub type Result<T> = std::result::Result<T, RivetError>;

impl From<io::Error> for RivetError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl RivetError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a compression error with a message
    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    /// Map an I/O error seen on an established connection.
    ///
    /// EOF and the family of "socket is gone" errors mean the peer or a local
    /// `close` ended the connection, so they become `Canceled`. Everything
    /// else stays an I/O error.
    #[must_use]
    pub fn normalize_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => Self::Canceled,
            _ => err.into(),
        }
    }

    /// Map an error coming out of a reader or writer loop into the value
    /// delivered to receivers.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            Self::Io(err) => match Arc::try_unwrap(err) {
                Ok(err) => Self::normalize_io(err),
                Err(shared) => {
                    let kind = shared.kind();
                    Self::normalize_io(io::Error::new(kind, shared.to_string()))
                }
            },
            other => other,
        }
    }

    /// Check if this is an expected shutdown rather than a failure
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Check if the peer broke the framing protocol
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::ExceedMaxIncomingPacket { .. } | Self::Protocol(_) | Self::Compression(_)
        )
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::TaskPanicked(_) => true,
            _ => false,
        }
    }

    /// Check if this is a connection error
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Closed | Self::Canceled | Self::MaxOfRetry { .. }
        )
    }
}
