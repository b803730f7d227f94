//! Connection configuration options
//!
//! Dial-side and accept-side options for Rivet connections, plus the
//! [`ConnConfig`] both collapse into once a socket exists.

use std::time::Duration;

/// Default maximum size of one incoming frame (1 MiB)
pub const DEFAULT_MAX_INCOMING_PACKET: usize = 1024 * 1024;

/// Default read deadline for one frame
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default write deadline for one frame
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a single TCP connect attempt
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Default keepalive probe interval
pub const DEFAULT_ACK_INTERVAL: Duration = Duration::from_secs(10);

/// Default time to wait for a heartbeat ack before declaring the peer dead
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay after the first failed dial attempt
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);

/// Default number of dial retries after the first attempt
pub const DEFAULT_MAX_RETRIED: u32 = 5;

/// Default number of sub-messages batched into one frame
pub const DEFAULT_BATCH_LIMIT: usize = 64;

/// Initial capacity of the outbound write-ahead buffer (8KB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8192;

/// Client-side (dialing) connection options.
///
/// # Examples
///
/// ```
/// use rivet_core::options::DialOptions;
/// use std::time::Duration;
///
/// let opts = DialOptions::default()
///     .with_gzip(true)
///     .with_read_timeout(Duration::from_secs(30))
///     .with_block(true);
/// assert!(opts.is_gzip);
/// assert!(opts.is_block);
/// ```
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Maximum accepted incoming frame length (bytes after the length field)
    pub max_incoming_packet: usize,

    /// Gzip-compress outgoing frames
    pub is_gzip: bool,

    /// Read deadline for one frame
    pub read_timeout: Duration,

    /// Write deadline for one frame
    pub write_timeout: Duration,

    /// Deadline for one TCP connect attempt
    pub dial_timeout: Duration,

    /// Wait for the dial outcome inside `dial` instead of in the background
    pub is_block: bool,

    /// Keepalive probe interval
    pub ack_interval: Duration,

    /// Time to wait for a heartbeat ack
    pub ping_timeout: Duration,

    /// Delay after the first failed dial attempt, doubled per retry
    pub retry_base: Duration,

    /// Retries after the first attempt before giving up
    pub max_retried: u32,

    /// Maximum sub-messages per outbound frame
    pub batch_limit: usize,

    /// Maximum outbound frame length. `None` means `max_incoming_packet`,
    /// assuming the peer runs with the same limit.
    pub max_frame_size: Option<usize>,

    /// Initial capacity of the outbound write-ahead buffer
    pub write_buffer_size: usize,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            max_incoming_packet: DEFAULT_MAX_INCOMING_PACKET,
            is_gzip: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            is_block: false,
            ack_interval: DEFAULT_ACK_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            retry_base: DEFAULT_RETRY_BASE,
            max_retried: DEFAULT_MAX_RETRIED,
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_frame_size: None,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl DialOptions {
    /// Create new dial options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum incoming frame size.
    pub fn with_max_incoming_packet(mut self, size: usize) -> Self {
        self.max_incoming_packet = size;
        self
    }

    /// Enable or disable gzip for outgoing frames.
    pub fn with_gzip(mut self, enabled: bool) -> Self {
        self.is_gzip = enabled;
        self
    }

    /// Set the per-frame read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the per-frame write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the per-attempt connect deadline.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Dial synchronously.
    pub fn with_block(mut self, block: bool) -> Self {
        self.is_block = block;
        self
    }

    /// Set the keepalive probe interval.
    pub fn with_ack_interval(mut self, interval: Duration) -> Self {
        self.ack_interval = interval;
        self
    }

    /// Set the heartbeat ack deadline.
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Set the number of retries after the first dial attempt.
    pub fn with_max_retried(mut self, retries: u32) -> Self {
        self.max_retried = retries;
        self
    }

    /// Set the maximum number of sub-messages per frame.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Set the maximum outbound frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Set the initial write-ahead buffer capacity.
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Collapse into the per-connection configuration.
    #[must_use]
    pub fn conn_config(&self) -> ConnConfig {
        ConnConfig {
            max_incoming_packet: self.max_incoming_packet,
            is_gzip: self.is_gzip,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            batch_limit: self.batch_limit,
            max_frame_size: self.max_frame_size.unwrap_or(self.max_incoming_packet),
            write_buffer_size: self.write_buffer_size,
        }
    }

    /// Validate option values before dialing.
    pub fn validate(&self) -> std::io::Result<()> {
        self.conn_config().validate()?;
        if self.ack_interval.is_zero() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "ack interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Server-side (accepted) connection options.
///
/// Mirrors [`DialOptions`] minus the dial and heartbeat-initiation fields.
#[derive(Debug, Clone)]
pub struct AcceptOptions {
    /// Maximum accepted incoming frame length
    pub max_incoming_packet: usize,

    /// Gzip-compress outgoing frames
    pub is_gzip: bool,

    /// Read deadline for one frame; an idle peer is dropped after this
    pub read_timeout: Duration,

    /// Write deadline for one frame
    pub write_timeout: Duration,

    /// Maximum sub-messages per outbound frame
    pub batch_limit: usize,

    /// Maximum outbound frame length, `None` means `max_incoming_packet`
    pub max_frame_size: Option<usize>,

    /// Initial capacity of the outbound write-ahead buffer
    pub write_buffer_size: usize,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            max_incoming_packet: DEFAULT_MAX_INCOMING_PACKET,
            is_gzip: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_frame_size: None,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl AcceptOptions {
    /// Create new accept options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum incoming frame size.
    pub fn with_max_incoming_packet(mut self, size: usize) -> Self {
        self.max_incoming_packet = size;
        self
    }

    /// Enable or disable gzip for outgoing frames.
    pub fn with_gzip(mut self, enabled: bool) -> Self {
        self.is_gzip = enabled;
        self
    }

    /// Set the per-frame read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the per-frame write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum number of sub-messages per frame.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    /// Set the maximum outbound frame size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Collapse into the per-connection configuration.
    #[must_use]
    pub fn conn_config(&self) -> ConnConfig {
        ConnConfig {
            max_incoming_packet: self.max_incoming_packet,
            is_gzip: self.is_gzip,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            batch_limit: self.batch_limit,
            max_frame_size: self.max_frame_size.unwrap_or(self.max_incoming_packet),
            write_buffer_size: self.write_buffer_size,
        }
    }
}

/// Settings shared by client and server connections once a socket exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnConfig {
    pub max_incoming_packet: usize,
    pub is_gzip: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub batch_limit: usize,
    pub max_frame_size: usize,
    pub write_buffer_size: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        AcceptOptions::default().conn_config()
    }
}

impl ConnConfig {
    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> std::io::Result<()> {
        // A frame carries at least the gzip flag and the type byte.
        if self.max_incoming_packet < 2 || self.max_frame_size < 2 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame size limits must be at least 2 bytes",
            ));
        }
        if self.batch_limit == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "batch limit must be at least 1",
            ));
        }
        Ok(())
    }
}
