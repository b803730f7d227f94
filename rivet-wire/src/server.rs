//! TCP listener yielding ready server connections.

use crate::conn::TcpServerConn;
use compio::net::TcpListener;
use rivet_core::error::Result;
use rivet_core::options::AcceptOptions;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Accept loop helper.
///
/// # Example
///
/// ```rust,no_run
/// use rivet_core::cancel::CancelToken;
/// use rivet_core::options::AcceptOptions;
/// use rivet_wire::conn::Conn;
/// use rivet_wire::server::TcpServer;
///
/// # compio::runtime::Runtime::new().unwrap().block_on(async {
/// let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), AcceptOptions::default()).await?;
/// loop {
///     let conn = server.accept().await?;
///     compio::runtime::spawn(async move {
///         while let Ok(msg) = conn.recv(&CancelToken::new()).await {
///             let _ = conn.send(&msg);
///         }
///     })
///     .detach();
/// }
/// # Ok::<_, rivet_core::error::RivetError>(())
/// # }).unwrap();
/// ```
pub struct TcpServer {
    listener: TcpListener,
    options: AcceptOptions,
}

impl TcpServer {
    /// Bind a listener. Options are validated up front.
    pub async fn bind(addr: SocketAddr, options: AcceptOptions) -> Result<Self> {
        options.conn_config().validate()?;
        let listener = TcpListener::bind(addr).await?;
        debug!(addr = %listener.local_addr()?, "[TcpServer] listening");
        Ok(Self { listener, options })
    }

    /// Wait for the next peer and start its connection tasks.
    pub async fn accept(&self) -> Result<TcpServerConn> {
        let (stream, peer) = self.listener.accept().await?;
        trace!(%peer, "[TcpServer] incoming connection");
        TcpServerConn::accept(stream, self.options.clone())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn options(&self) -> &AcceptOptions {
        &self.options
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}
