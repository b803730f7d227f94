//! Dialing side of a connection.

use super::{drive, Conn, ConnCore, ConnState, HandleGuard, Role};
use crate::codec::MsgType;
use crate::outbound::SenderWrapper;
use async_trait::async_trait;
use bytes::Bytes;
use compio::net::TcpStream;
use rivet_core::backoff::DialBackoff;
use rivet_core::cancel::CancelToken;
use rivet_core::error::{Result, RivetError};
use rivet_core::options::DialOptions;
use rivet_core::tcp::{enable_tcp_nodelay, ShutdownHandle};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Heartbeat timing for one client connection
#[derive(Debug, Clone, Copy)]
pub(crate) struct Heartbeat {
    pub(crate) ack_interval: Duration,
    pub(crate) ping_timeout: Duration,
}

/// Client connection with background dialing, retry and keepalive.
///
/// `dial` returns at once (unless `is_block` is set) and the connection is
/// established by a background owner task; messages sent in the meantime
/// are buffered and flushed once connected. Clones share the connection;
/// dropping the last clone closes it.
///
/// # Example
///
/// ```rust,no_run
/// use rivet_core::cancel::CancelToken;
/// use rivet_core::options::DialOptions;
/// use rivet_wire::conn::{Conn, TcpClientConn};
///
/// # compio::runtime::Runtime::new().unwrap().block_on(async {
/// let addr = "127.0.0.1:7000".parse().unwrap();
/// let conn = TcpClientConn::dial(addr, DialOptions::default().with_block(true)).await?;
///
/// conn.send(b"hello")?;
/// let reply = conn.recv(&CancelToken::new()).await?;
/// conn.close().await?;
/// # Ok::<_, rivet_core::error::RivetError>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct TcpClientConn {
    core: Arc<HandleGuard>,
}

impl TcpClientConn {
    /// Start dialing `addr`.
    ///
    /// Spawns the owner task on the current compio runtime. The owner dials
    /// with retry, then spawns and joins the reader, writer, flush and
    /// heartbeat tasks. With `is_block` this waits for the dial outcome and
    /// returns the failure, if any.
    pub async fn dial(addr: SocketAddr, options: DialOptions) -> Result<Self> {
        options.validate()?;

        let core = Arc::new(ConnCore::new(
            Role::Client,
            addr,
            options.conn_config(),
            ConnState::Idle,
        ));

        compio::runtime::spawn(owner(core.clone(), options.clone())).detach();
        let core = HandleGuard::new(core);

        if options.is_block {
            core.dialed().await;
            if core.state() == ConnState::ConnectedFailed {
                return Err(core.receiver.terminal().unwrap_or(RivetError::Canceled));
            }
        }

        Ok(Self { core })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    /// The dialed address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.core.peer
    }

    /// Wait until the dial outcome is known.
    pub async fn connected(&self) -> Result<()> {
        self.core.dialed().await;
        match self.core.state() {
            ConnState::ConnectedFailed => Err(self.core.receiver.terminal().unwrap_or(RivetError::Canceled)),
            _ => Ok(()),
        }
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
impl Conn for TcpClientConn {
    fn send(&self, data: &[u8]) -> Result<()> {
        self.core.send(data)
    }

    async fn recv(&self, cancel: &CancelToken) -> Result<Bytes> {
        self.core.receiver.recv(cancel).await
    }

    /// Stop the connection.
    ///
    /// While a dial is in flight this waits for its outcome, so the socket
    /// is never touched before it exists. Idempotent.
    async fn close(&self) -> Result<()> {
        let core = &self.core;
        let first = !core.closing.is_cancelled();
        core.closing.cancel();
        if first {
            debug!(peer = %core.peer, "[TcpClientConn] close requested");
        }

        core.dialed().await;

        if core.has_socket() {
            core.shutdown_socket();
        }
        core.token.cancel();
        Ok(())
    }
}

impl std::fmt::Debug for TcpClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClientConn")
            .field("peer", &self.core.peer)
            .field("state", &self.core.state())
            .finish()
    }
}

/// Owner task: dial, then drive the connection until torn down.
async fn owner(core: Arc<ConnCore>, options: DialOptions) {
    core.set_state(ConnState::Connecting);

    let stream = match dial_with_retry(&core, &options).await {
        Ok(stream) => stream,
        Err(err) => {
            fail_dial(&core, err);
            return;
        }
    };

    if let Err(e) = enable_tcp_nodelay(&stream) {
        debug!(peer = %core.peer, error = %e, "[TcpClientConn] TCP_NODELAY not set");
    }
    let handle = match ShutdownHandle::new(&stream) {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            fail_dial(&core, e.into());
            return;
        }
    };

    {
        // Order the transition against a concurrent close.
        let mut state = core.state.lock();
        if core.closing.is_cancelled() {
            drop(state);
            fail_dial(&core, RivetError::Canceled);
            return;
        }
        core.install_socket(handle);
        *state = ConnState::Connected;
    }
    core.record_alive();
    core.broadcast_dialed();
    info!(peer = %core.peer, "[TcpClientConn] connected");

    let heartbeat = Heartbeat {
        ack_interval: options.ack_interval,
        ping_timeout: options.ping_timeout,
    };
    drive(core, stream, Some(heartbeat)).await;
}

fn fail_dial(core: &ConnCore, err: RivetError) {
    if err.is_canceled() {
        debug!(peer = %core.peer, "[TcpClientConn] dial canceled");
    } else {
        warn!(peer = %core.peer, error = %err, "[TcpClientConn] dial failed");
    }
    core.set_state(ConnState::ConnectedFailed);
    core.receiver.on_close(err);
    core.control.on_close();
    core.broadcast_dialed();
    core.token.cancel();
    core.broadcast_done();
}

/// Connect with exponential backoff.
///
/// Makes at most `max_retried + 1` attempts, each bounded by
/// `dial_timeout`. A `close` stops retrying with `Canceled`.
async fn dial_with_retry(core: &ConnCore, options: &DialOptions) -> Result<TcpStream> {
    use futures::{select, FutureExt};

    let mut backoff = DialBackoff::new(options);
    loop {
        if core.closing.is_cancelled() {
            return Err(RivetError::Canceled);
        }

        let attempt = backoff.attempts() + 1;
        trace!(peer = %core.peer, attempt, "[TcpClientConn] dialing");

        let res = select! {
            res = connect(core.peer, options.dial_timeout).fuse() => res,
            _ = core.closing.cancelled().fuse() => return Err(RivetError::Canceled),
        };
        let err = match res {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };

        let Some(delay) = backoff.next_delay() else {
            debug!(peer = %core.peer, attempts = backoff.attempts(), error = %err, "[TcpClientConn] giving up");
            return Err(RivetError::MaxOfRetry {
                attempts: backoff.attempts(),
            });
        };
        debug!(peer = %core.peer, attempt, ?delay, error = %err, "[TcpClientConn] dial failed, retrying");

        select! {
            _ = compio::time::sleep(delay).fuse() => {}
            _ = core.closing.cancelled().fuse() => return Err(RivetError::Canceled),
        }
    }
}

async fn connect(addr: SocketAddr, dial_timeout: Duration) -> io::Result<TcpStream> {
    if dial_timeout.is_zero() {
        return TcpStream::connect(addr).await;
    }
    compio::time::timeout(dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_elapsed| io::Error::new(io::ErrorKind::TimedOut, "Connect operation timed out"))?
}

/// Probe a silent peer and tear the connection down when it stays silent.
///
/// Sleeps until `last_alive + ack_interval`; without newer liveness by then
/// it sends a heartbeat and waits `ping_timeout` for any sign of life.
pub(crate) async fn heartbeat_loop(
    core: Arc<ConnCore>,
    sender: SenderWrapper,
    hb: Heartbeat,
) -> Result<()> {
    use futures::{select, FutureExt};

    loop {
        let last = core.last_alive();
        let wait = (last + hb.ack_interval).saturating_duration_since(Instant::now());
        select! {
            _ = compio::time::sleep(wait).fuse() => {}
            _ = core.token.cancelled().fuse() => return Ok(()),
        }
        if core.last_alive() > last {
            continue;
        }

        trace!(peer = %core.peer, "[TcpClientConn] sending heartbeat");
        if sender.send_control(MsgType::Heartbeat).is_err() {
            return Ok(());
        }

        select! {
            _ = compio::time::sleep(hb.ping_timeout).fuse() => {}
            _ = core.token.cancelled().fuse() => return Ok(()),
        }
        if core.last_alive() > last {
            continue;
        }

        warn!(
            peer = %core.peer,
            silent_for = ?last.elapsed(),
            "[TcpClientConn] heartbeat timed out, closing"
        );
        core.fail(
            io::Error::new(io::ErrorKind::TimedOut, "heartbeat ack not received").into(),
        );
        return Ok(());
    }
}
