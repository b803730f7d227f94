//! # Rivet Wire
//!
//! Framing protocol and TCP connection engine for Rivet.
//!
//! ## Overview
//!
//! - **codec**: `length | gzipped | type | payload` frames carrying batches of
//!   length-prefixed sub-messages, with optional gzip
//! - **outbound**: write-ahead buffer that batches messages into frames, and
//!   the single writer that serializes every frame onto the socket
//! - **conn**: client connections (dial with retry, heartbeat, close/dial
//!   rendezvous) and accepted server connections
//! - **server**: listener helper yielding ready server connections
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rivet_core::cancel::CancelToken;
//! use rivet_core::options::DialOptions;
//! use rivet_wire::conn::{Conn, TcpClientConn};
//!
//! #[compio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = DialOptions::default().with_gzip(true).with_block(true);
//!     let conn = TcpClientConn::dial("127.0.0.1:7000".parse()?, options).await?;
//!
//!     conn.send(b"Hello!")?;
//!     let reply = conn.recv(&CancelToken::new()).await?;
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::let_underscore_future)]

pub mod codec;
pub mod conn;
pub mod outbound;
pub mod server;

pub use codec::{Frame, FrameDecoder, MsgType};
pub use conn::{Conn, ConnState, TcpClientConn, TcpServerConn};
pub use outbound::{ControlBuffer, SenderWrapper};
pub use server::TcpServer;
