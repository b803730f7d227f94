//! Rivet Core
//!
//! This crate contains the protocol-agnostic building blocks of the rivet
//! transport:
//! - io_uring-safe read/write buffers (`alloc`)
//! - MPSC wake queue with a single draining consumer (`queue`)
//! - Inbound block receiver with a latched terminal error (`receiver`)
//! - Cancellation tokens with optional deadlines (`cancel`)
//! - Dial backoff (`backoff`) and connection options (`options`)
//! - TCP socket helpers (`tcp`) and I/O timeouts (`timeout`)
//! - Error types (`error`)

// The tcp and alloc modules need raw fd / buffer access
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
pub mod alloc;
pub mod backoff;
pub mod cancel;
pub mod error;
pub mod options;
pub mod queue;
pub mod receiver;
pub mod tcp;
pub mod timeout;

// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::alloc::{FrameBuf, IoBytes};
    pub use crate::backoff::DialBackoff;
    pub use crate::cancel::CancelToken;
    pub use crate::error::{Result, RivetError};
    pub use crate::options::{AcceptOptions, ConnConfig, DialOptions};
    pub use crate::queue::{wake_queue, QueueConsumer, WakeQueue};
    pub use crate::receiver::BlockReceiver;
    pub use crate::tcp::{enable_tcp_nodelay, ShutdownHandle};
}
