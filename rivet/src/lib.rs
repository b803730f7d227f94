//! # Rivet
//!
//! Auto-framing, flow-controlled TCP connections built on `io_uring`.
//!
//! ## Architecture
//!
//! - **`rivet-core`**: wake queues, block receivers, cancellation, backoff, options
//! - **`rivet-wire`**: wire codec and the connection engine
//! - **`rivet`**: public API surface (this crate)
//!
//! Every message sent on a connection is batched with its neighbours into
//! `length | gzipped | type | payload` frames and delivered to the peer's
//! `recv` in order. Client connections dial in the background with
//! exponential backoff and keep the link alive with heartbeats.
//!
//! ## Quick Start
//!
//! ### Client
//!
//! ```rust,no_run
//! use rivet::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = rivet::dial("127.0.0.1:7000", DialOptions::default().with_block(true)).await?;
//!
//! conn.send(b"Hello")?;
//! let reply = conn.recv(&CancelToken::new()).await?;
//! println!("Received: {:?}", reply);
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Server
//!
//! ```rust,no_run
//! use rivet::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = rivet::bind("127.0.0.1:7000", AcceptOptions::default()).await?;
//!
//! // Echo server
//! let conn = server.accept().await?;
//! while let Ok(msg) = conn.recv(&CancelToken::new()).await {
//!     conn.send(&msg)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery
//!
//! - `send` never blocks and never drops; memory grows if the peer is slow
//! - Messages in flight when a connection drops are lost
//! - After a connection ends, every `recv` returns the same terminal error

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dev_tracing;

use compio::net::ToSocketAddrsAsync;
use std::io;
use std::net::SocketAddr;

// Re-export core types
pub use bytes::Bytes;
pub use rivet_core::cancel::CancelToken;
pub use rivet_core::error::{Result, RivetError};
pub use rivet_core::options::{AcceptOptions, DialOptions};
pub use rivet_wire::conn::{Conn, ConnState, TcpClientConn, TcpServerConn};
pub use rivet_wire::server::TcpServer;

/// Wire codec, for tools that speak the framing protocol directly.
pub mod codec {
    pub use rivet_wire::codec::*;
}

/// Convenient imports for Rivet connections.
pub mod prelude {
    pub use crate::{
        AcceptOptions, Bytes, CancelToken, Conn, ConnState, DialOptions, RivetError, TcpClientConn,
        TcpServer, TcpServerConn,
    };
}

/// Dial `addr` and return a client connection.
///
/// Host names are resolved on the compio runtime; the first resolved
/// address is used. See [`TcpClientConn::dial`].
pub async fn dial(addr: impl ToSocketAddrsAsync, options: DialOptions) -> Result<TcpClientConn> {
    TcpClientConn::dial(resolve(addr).await?, options).await
}

/// Bind a listener on `addr`. See [`TcpServer::bind`].
pub async fn bind(addr: impl ToSocketAddrsAsync, options: AcceptOptions) -> Result<TcpServer> {
    TcpServer::bind(resolve(addr).await?, options).await
}

async fn resolve(addr: impl ToSocketAddrsAsync) -> Result<SocketAddr> {
    let resolved = addr.to_socket_addrs_async().await?.next().ok_or_else(|| {
        RivetError::from(io::Error::new(
            io::ErrorKind::InvalidInput,
            "address resolved to nothing",
        ))
    })?;
    tracing::trace!(addr = %resolved, "[rivet] resolved address");
    Ok(resolved)
}
