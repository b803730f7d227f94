//! Connection engine
//!
//! Each connection runs as a small tree of compio tasks on the thread that
//! dialed or accepted it:
//!
//! ```text
//!   owner ─┬─ reader     decode frames, answer heartbeats, feed BlockReceiver
//!          ├─ writer     SenderWrapper queue → socket
//!          ├─ flush      ControlBuffer → SenderWrapper
//!          └─ heartbeat  (client only) probe and time out a silent peer
//! ```
//!
//! The owner waits on the connection token, then shuts the socket down,
//! closes the outbound pipeline and joins every child before the connection
//! counts as `Disconnected`. Child panics are caught at the task boundary
//! and surface as [`RivetError::TaskPanicked`].
//!
//! The public handles share one `HandleGuard` around the `Arc<ConnCore>`,
//! which is `Send + Sync`; socket I/O stays on the owning thread. Dropping
//! the last handle closes the connection.

mod client;
mod server;

pub use client::TcpClientConn;
pub use server::TcpServerConn;

use crate::codec::{FrameDecoder, MsgType};
use crate::outbound::{ControlBuffer, SenderWrapper};
use async_trait::async_trait;
use bytes::Bytes;
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use futures::FutureExt;
use parking_lot::Mutex;
use rivet_core::cancel::CancelToken;
use rivet_core::error::{Result, RivetError};
use rivet_core::options::ConnConfig;
use rivet_core::receiver::BlockReceiver;
use rivet_core::tcp::ShutdownHandle;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Connection lifecycle.
///
/// Clients move `Idle → Connecting → {Connected | ConnectedFailed} →
/// Disconnected`; accepted connections move `Active → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    ConnectedFailed,
    Active,
    Disconnected,
}

impl ConnState {
    /// Returns true while frames can flow.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Active)
    }
}

/// Message-oriented connection boundary shared by both connection kinds.
#[async_trait(?Send)]
pub trait Conn {
    /// Queue one message. Never blocks.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Wait for the next message, the terminal error, or `cancel`.
    async fn recv(&self, cancel: &CancelToken) -> Result<Bytes>;

    /// Tear the connection down.
    async fn close(&self) -> Result<()>;
}

/// Which side of the connection a task runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    const fn name(self) -> &'static str {
        match self {
            Self::Client => "TcpClientConn",
            Self::Server => "TcpServerConn",
        }
    }
}

/// State shared between a connection handle and its tasks.
pub(crate) struct ConnCore {
    pub(crate) role: Role,
    pub(crate) peer: SocketAddr,
    pub(crate) config: ConnConfig,
    pub(crate) control: Arc<ControlBuffer>,
    pub(crate) receiver: BlockReceiver,
    /// Fires when the connection must be torn down
    pub(crate) token: CancelToken,
    /// Fires when `close` was called; doubles as the stopped flag
    pub(crate) closing: CancelToken,
    pub(crate) state: Mutex<ConnState>,
    /// Dropped once the dial outcome is known
    dialed_tx: Mutex<Option<Sender<()>>>,
    dialed_rx: Receiver<()>,
    /// Dropped once every task has exited
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    socket: Mutex<Option<Arc<ShutdownHandle>>>,
    last_alive: Mutex<Instant>,
}

impl ConnCore {
    pub(crate) fn new(role: Role, peer: SocketAddr, config: ConnConfig, state: ConnState) -> Self {
        let (dialed_tx, dialed_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(1);
        Self {
            role,
            peer,
            config,
            control: Arc::new(ControlBuffer::new(config)),
            receiver: BlockReceiver::new(),
            token: CancelToken::new(),
            closing: CancelToken::new(),
            state: Mutex::new(state),
            dialed_tx: Mutex::new(Some(dialed_tx)),
            dialed_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            socket: Mutex::new(None),
            last_alive: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: ConnState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        debug!(peer = %self.peer, ?prev, ?next, "[{}] state change", self.role.name());
    }

    /// Publish the dial outcome. Idempotent.
    pub(crate) fn broadcast_dialed(&self) {
        drop(self.dialed_tx.lock().take());
    }

    /// Wait until the dial outcome is known.
    pub(crate) async fn dialed(&self) {
        // Only ever disconnects; no value is sent.
        let _ = self.dialed_rx.recv_async().await;
    }

    pub(crate) fn broadcast_done(&self) {
        drop(self.done_tx.lock().take());
    }

    /// Wait until every task of the connection has exited.
    pub(crate) async fn done(&self) {
        let _ = self.done_rx.recv_async().await;
    }

    pub(crate) fn install_socket(&self, handle: Arc<ShutdownHandle>) {
        *self.socket.lock() = Some(handle);
    }

    /// Shut the socket down if there is one.
    pub(crate) fn shutdown_socket(&self) {
        let handle = self.socket.lock().clone();
        if let Some(handle) = handle {
            handle.shutdown();
        }
    }

    pub(crate) fn has_socket(&self) -> bool {
        self.socket.lock().is_some()
    }

    pub(crate) fn record_alive(&self) {
        *self.last_alive.lock() = Instant::now();
    }

    pub(crate) fn last_alive(&self) -> Instant {
        *self.last_alive.lock()
    }

    /// Queue a message on the outbound buffer.
    pub(crate) fn send(&self, data: &[u8]) -> Result<()> {
        self.control.set(data)
    }

    /// Stop the connection without waiting, once no handle is left.
    ///
    /// Taking the state lock orders this against the dial transition: the
    /// owner either sees `closing` before installing the socket or is
    /// already driving the connection when the token fires.
    fn release(&self) {
        if self.token.is_cancelled() {
            return;
        }
        {
            let _state = self.state.lock();
            self.closing.cancel();
        }
        debug!(peer = %self.peer, "[{}] last handle dropped, closing", self.role.name());
        self.token.cancel();
    }

    /// Fail the connection from a child task: latch `err`, stop the
    /// outbound side and wake the owner.
    pub(crate) fn fail(&self, err: RivetError) {
        self.receiver.on_close(err);
        self.shutdown_socket();
        self.control.on_close();
        self.token.cancel();
    }
}

/// Shared by every clone of a public handle. Dropping the last one stops
/// the connection; the tasks only hold the inner `ConnCore`.
pub(crate) struct HandleGuard(Arc<ConnCore>);

impl HandleGuard {
    pub(crate) fn new(core: Arc<ConnCore>) -> Arc<Self> {
        Arc::new(Self(core))
    }
}

impl Deref for HandleGuard {
    type Target = ConnCore;

    fn deref(&self) -> &ConnCore {
        &self.0
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Run a connection task, turning a panic into `TaskPanicked`.
async fn guarded<F>(core: Arc<ConnCore>, task: &'static str, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => {
            trace!(peer = %core.peer, task, ok = res.is_ok(), "[{}] task exited", core.role.name());
            res
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(peer = %core.peer, task, panic = %msg, "[{}] task panicked", core.role.name());
            let err = RivetError::TaskPanicked(format!("{task}: {msg}"));
            core.fail(err.clone());
            Err(err)
        }
    }
}

/// Drive an established connection until it is torn down.
///
/// Spawns the reader, writer, flush and (when `heartbeat` is given)
/// heartbeat tasks, waits for the connection token, then joins them all.
pub(crate) async fn drive(
    core: Arc<ConnCore>,
    stream: TcpStream,
    heartbeat: Option<client::Heartbeat>,
) {
    use compio::runtime::spawn;

    let stream = Rc::new(stream);
    let (sender, frame_writer) = SenderWrapper::new();

    let flush = match core.control.run(sender.clone()) {
        Ok(flush) => flush,
        Err(e) => {
            warn!(peer = %core.peer, error = %e, "[{}] outbound already running", core.role.name());
            core.fail(e);
            core.set_state(ConnState::Disconnected);
            core.broadcast_done();
            return;
        }
    };

    let flush_task = spawn(guarded(core.clone(), "flush", async move {
        flush.await;
        Ok(())
    }));
    let writer_task = spawn(guarded(
        core.clone(),
        "writer",
        frame_writer.writer(stream.clone(), core.config, core.token.clone()),
    ));
    let reader_task = spawn(guarded(
        core.clone(),
        "reader",
        reader_loop(core.clone(), stream.clone(), sender.clone()),
    ));
    let heartbeat_task = heartbeat.map(|hb| {
        spawn(guarded(
            core.clone(),
            "heartbeat",
            client::heartbeat_loop(core.clone(), sender.clone(), hb),
        ))
    });

    core.token.cancelled().await;
    debug!(peer = %core.peer, "[{}] tearing down", core.role.name());

    core.shutdown_socket();
    core.control.on_close();
    sender.on_close();

    let mut first_err = None;
    let mut results = vec![reader_task.await, writer_task.await, flush_task.await];
    if let Some(task) = heartbeat_task {
        results.push(task.await);
    }
    for res in results {
        if let Err(e) = res {
            first_err.get_or_insert(e);
        }
    }

    // A clean close reports Canceled; otherwise the first failure wins,
    // unless the reader already latched its own error.
    let terminal = first_err.map_or(RivetError::Canceled, RivetError::normalize);
    core.receiver.on_close(terminal);

    drop(stream);
    core.set_state(ConnState::Disconnected);
    core.broadcast_done();
}

/// Decode frames until the socket fails or the connection token fires.
async fn reader_loop(core: Arc<ConnCore>, stream: Rc<TcpStream>, sender: SenderWrapper) -> Result<()> {
    use futures::select;

    let mut decoder = FrameDecoder::new(core.config.max_incoming_packet);
    let read_timeout = Some(core.config.read_timeout);
    let mut reader = &*stream;

    loop {
        let frame = select! {
            frame = decoder.decode_frame(&mut reader, read_timeout).fuse() => frame,
            _ = core.token.cancelled().fuse() => return Ok(()),
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                let err = e.normalize();
                if err.is_canceled() {
                    trace!(peer = %core.peer, "[{}] connection closed (EOF)", core.role.name());
                } else {
                    debug!(peer = %core.peer, error = %err, "[{}] read failed", core.role.name());
                }
                core.fail(err);
                return Ok(());
            }
        };

        match frame.msg_type {
            MsgType::Heartbeat => {
                core.record_alive();
                if core.role == Role::Server {
                    trace!(peer = %core.peer, "[TcpServerConn] heartbeat, sending ack");
                    if sender.send_control(MsgType::HeartbeatAck).is_err() {
                        return Ok(());
                    }
                }
            }
            MsgType::HeartbeatAck => core.record_alive(),
            MsgType::Raw => {
                let messages = match frame.sub_messages() {
                    Ok(messages) => messages,
                    Err(e) => {
                        debug!(peer = %core.peer, error = %e, "[{}] malformed batch", core.role.name());
                        core.fail(e);
                        return Ok(());
                    }
                };
                trace!(peer = %core.peer, count = messages.len(), "[{}] received batch", core.role.name());
                for msg in messages {
                    if core.receiver.put(Some(msg), None).is_err() {
                        // Terminal error already latched; nobody will read more.
                        return Ok(());
                    }
                }
            }
        }
    }
}
