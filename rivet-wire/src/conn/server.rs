//! Accepted side of a connection.

use super::{drive, Conn, ConnCore, ConnState, HandleGuard, Role};
use async_trait::async_trait;
use bytes::Bytes;
use compio::net::TcpStream;
use rivet_core::cancel::CancelToken;
use rivet_core::error::Result;
use rivet_core::options::AcceptOptions;
use rivet_core::tcp::{enable_tcp_nodelay, ShutdownHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Server connection over an accepted socket.
///
/// Never initiates heartbeats; it answers the peer's with an ack. A peer
/// that stays silent longer than `read_timeout` is dropped. Dropping the
/// last clone closes the connection.
#[derive(Clone)]
pub struct TcpServerConn {
    core: Arc<HandleGuard>,
}

impl TcpServerConn {
    /// Wrap an accepted stream and start its tasks.
    ///
    /// Spawns the owner task on the current compio runtime; it spawns and
    /// joins the reader, writer and flush tasks.
    pub fn accept(stream: TcpStream, options: AcceptOptions) -> Result<Self> {
        let config = options.conn_config();
        config.validate()?;

        let peer = stream.peer_addr()?;
        if let Err(e) = enable_tcp_nodelay(&stream) {
            debug!(%peer, error = %e, "[TcpServerConn] TCP_NODELAY not set");
        }
        let handle = Arc::new(ShutdownHandle::new(&stream)?);

        let core = Arc::new(ConnCore::new(Role::Server, peer, config, ConnState::Active));
        core.install_socket(handle);
        core.record_alive();
        core.broadcast_dialed();
        info!(%peer, "[TcpServerConn] accepted");

        compio::runtime::spawn(drive(core.clone(), stream, None)).detach();

        Ok(Self {
            core: HandleGuard::new(core),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    /// Address of the remote peer.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.core.peer
    }

    /// Wait until the connection is fully torn down.
    pub async fn closed(&self) {
        self.core.done().await;
    }

    /// Messages buffered for sending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.core.control.pending()
    }
}

#[async_trait(?Send)]
impl Conn for TcpServerConn {
    fn send(&self, data: &[u8]) -> Result<()> {
        self.core.send(data)
    }

    async fn recv(&self, cancel: &CancelToken) -> Result<Bytes> {
        self.core.receiver.recv(cancel).await
    }

    /// Shut the socket down and stop every task. Idempotent.
    async fn close(&self) -> Result<()> {
        if !self.core.closing.is_cancelled() {
            debug!(peer = %self.core.peer, "[TcpServerConn] close requested");
        }
        self.core.closing.cancel();
        self.core.shutdown_socket();
        self.core.token.cancel();
        Ok(())
    }
}

impl std::fmt::Debug for TcpServerConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServerConn")
            .field("peer", &self.core.peer)
            .field("state", &self.core.state())
            .finish()
    }
}
