//! Outbound pipeline
//!
//! ```text
//!  send() ──► ControlBuffer ──flush loop──► SenderWrapper ──writer──► socket
//!             (subLength|data)  (one frame)   (WakeQueue<Bytes>)
//!  heartbeat / ack frames ──────────────────────────┘
//! ```
//!
//! `ControlBuffer::set` appends to a write-ahead buffer and never blocks.
//! The flush loop cuts the buffer into frames of at most `batch_limit`
//! sub-messages and `max_frame_size` bytes. Every frame on a connection,
//! batches and control frames alike, goes through one `SenderWrapper` whose
//! single writer task performs the socket writes in order.
//!
//! There is no admission control: if the peer drains slower than callers
//! produce, the write-ahead buffer keeps growing.

use crate::codec::{self, MsgType, FRAME_PREFIX_LEN, LENGTH_FIELD_LEN, SUB_LENGTH_LEN};
use bytes::{Bytes, BytesMut};
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use rivet_core::alloc::IoBytes;
use rivet_core::cancel::CancelToken;
use rivet_core::error::{Result, RivetError};
use rivet_core::options::ConnConfig;
use rivet_core::queue::{wake_queue, QueueConsumer, WakeQueue, DEFAULT_QUEUE_CAPACITY};
use rivet_core::timeout::write_all_with_timeout;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Producer side of a connection's frame queue.
#[derive(Clone)]
pub struct SenderWrapper {
    queue: WakeQueue<Bytes>,
}

/// Consumer side of a connection's frame queue; owns the socket writes.
pub struct FrameWriter {
    consumer: QueueConsumer<Bytes>,
}

impl SenderWrapper {
    /// Create a frame queue pair.
    #[must_use]
    pub fn new() -> (Self, FrameWriter) {
        let (queue, consumer) = wake_queue(DEFAULT_QUEUE_CAPACITY);
        (Self { queue }, FrameWriter { consumer })
    }

    /// Queue an encoded frame. Never blocks.
    ///
    /// Fails with [`RivetError::Closed`] once the writer is gone.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.queue.send(frame)
    }

    /// Encode and queue a frame with an empty payload.
    pub fn send_control(&self, msg_type: MsgType) -> Result<()> {
        self.send(codec::encode(&[], msg_type, false)?)
    }

    /// Stop accepting frames. The writer drains what is queued, then exits.
    pub fn on_close(&self) {
        self.queue.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Frames waiting for the writer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl FrameWriter {
    /// Write queued frames to `stream` one at a time until the queue is
    /// closed or `stop` fires.
    ///
    /// The first failed write cancels `stop` so the rest of the connection
    /// notices; frames queued after that are discarded.
    pub async fn writer(
        self,
        stream: Rc<TcpStream>,
        config: ConnConfig,
        stop: CancelToken,
    ) -> Result<()> {
        let failure: Rc<RefCell<Option<RivetError>>> = Rc::new(RefCell::new(None));

        let write_timeout = Some(config.write_timeout);
        let on_error = stop.clone();
        let failed = failure.clone();
        self.consumer
            .receive(&stop, move |frame| {
                let stream = stream.clone();
                let failed = failed.clone();
                let on_error = on_error.clone();
                async move {
                    if failed.borrow().is_some() {
                        return;
                    }
                    let mut writer = &*stream;
                    let res = match write_all_with_timeout(&mut writer, IoBytes::new(frame), write_timeout).await {
                        Ok(compio::buf::BufResult(res, _)) => res,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = res {
                        debug!(error = %e, "[FrameWriter] write failed");
                        *failed.borrow_mut() = Some(RivetError::from(e));
                        on_error.cancel();
                    }
                }
            })
            .await;

        let err = failure.borrow_mut().take();
        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Lifecycle of the flush loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    NotStarted,
    Running,
    Closed,
}

struct Inner {
    buf: BytesMut,
    /// Sub-messages in `buf`
    pending: usize,
    state: FlushState,
    /// Flush loop is parked on the wake slot
    idle: bool,
    sender: Option<SenderWrapper>,
}

/// Write-ahead buffer batching outgoing messages into frames.
///
/// # Example
///
/// ```rust
/// use rivet_core::options::ConnConfig;
/// use rivet_wire::outbound::ControlBuffer;
///
/// let control = ControlBuffer::new(ConnConfig::default());
/// control.set(b"hello").unwrap();
/// assert_eq!(control.pending(), 1);
///
/// control.on_close();
/// assert!(control.set(b"late").is_err());
/// ```
pub struct ControlBuffer {
    inner: Mutex<Inner>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    config: ConnConfig,
}

impl ControlBuffer {
    #[must_use]
    pub fn new(config: ConnConfig) -> Self {
        let (wake_tx, wake_rx) = flume::bounded(1);
        Self {
            inner: Mutex::new(Inner {
                buf: BytesMut::with_capacity(config.write_buffer_size),
                pending: 0,
                state: FlushState::NotStarted,
                idle: false,
                sender: None,
            }),
            wake_tx,
            wake_rx,
            config,
        }
    }

    /// Largest single message that still fits in one frame.
    #[inline]
    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.config
            .max_frame_size
            .saturating_sub(FRAME_PREFIX_LEN + SUB_LENGTH_LEN)
    }

    /// Append one message. Never blocks, never drops.
    ///
    /// Fails with [`RivetError::Disconnected`] once closed, and with
    /// [`RivetError::MessageTooLarge`] for a message no frame could carry.
    pub fn set(&self, data: &[u8]) -> Result<()> {
        let max = self.max_message_size();
        if data.len() > max {
            return Err(RivetError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut inner = self.inner.lock();
        if inner.state == FlushState::Closed {
            return Err(RivetError::Disconnected);
        }
        codec::put_sub_message(&mut inner.buf, data)?;
        inner.pending += 1;

        let wake = std::mem::replace(&mut inner.idle, false);
        drop(inner);

        if wake {
            let _ = self.wake_tx.try_send(());
        }
        Ok(())
    }

    /// Bind `sender` and return the flush loop.
    ///
    /// Only valid while not running. A buffer that was closed is reopened
    /// empty for the new connection generation.
    pub fn run(self: &Arc<Self>, sender: SenderWrapper) -> Result<impl Future<Output = ()>> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                FlushState::Running => return Err(RivetError::AlreadyRunning),
                FlushState::Closed => {
                    inner.buf.clear();
                    inner.pending = 0;
                }
                FlushState::NotStarted => {}
            }
            inner.state = FlushState::Running;
            inner.idle = false;
            inner.sender = Some(sender.clone());
        }

        let this = Arc::clone(self);
        Ok(async move { this.flush_loop(sender).await })
    }

    async fn flush_loop(&self, sender: SenderWrapper) {
        loop {
            let payload = {
                let mut inner = self.inner.lock();
                if inner.state != FlushState::Running {
                    break;
                }
                let payload = self.take_batch(&mut inner);
                if payload.is_none() {
                    inner.idle = true;
                }
                payload
            };

            let Some((payload, count)) = payload else {
                // Parked; `set` or `on_close` wakes us.
                let _ = self.wake_rx.recv_async().await;
                continue;
            };

            let frame = match self.encode_frame(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "[ControlBuffer] failed to encode batch");
                    self.on_close();
                    break;
                }
            };
            trace!(messages = count, bytes = frame.len(), "[ControlBuffer] frame flushed");

            if sender.send(frame).is_err() {
                debug!("[ControlBuffer] sender closed, stopping flush loop");
                break;
            }
        }
    }

    /// Encode one batch, falling back to a plain frame when gzip would
    /// push it past `max_frame_size`.
    fn encode_frame(&self, payload: &[u8]) -> Result<Bytes> {
        let frame = codec::encode(payload, MsgType::Raw, self.config.is_gzip)?;
        let limit = LENGTH_FIELD_LEN + self.config.max_frame_size;
        if !self.config.is_gzip || frame.len() <= limit {
            return Ok(frame);
        }
        trace!(
            compressed = frame.len(),
            plain = LENGTH_FIELD_LEN + FRAME_PREFIX_LEN + payload.len(),
            "[ControlBuffer] gzip grew the batch, sending it uncompressed"
        );
        codec::encode(payload, MsgType::Raw, false)
    }

    /// Cut the next frame payload off the front of the buffer.
    fn take_batch(&self, inner: &mut Inner) -> Option<(Bytes, usize)> {
        if inner.pending == 0 {
            return None;
        }

        let budget = self.config.max_frame_size.saturating_sub(FRAME_PREFIX_LEN);
        let mut offset = 0;
        let mut count = 0;
        while count < self.config.batch_limit && offset + SUB_LENGTH_LEN <= inner.buf.len() {
            let b = &inner.buf[offset..offset + SUB_LENGTH_LEN];
            let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
            let next = offset + SUB_LENGTH_LEN + len;
            // A frame always carries at least one message.
            if count > 0 && next > budget {
                break;
            }
            offset = next;
            count += 1;
        }

        inner.pending -= count;
        let payload = inner.buf.split_to(offset).freeze();

        if inner.pending == 0 && inner.buf.capacity() > self.config.write_buffer_size * 4 {
            inner.buf = BytesMut::with_capacity(self.config.write_buffer_size);
        }
        Some((payload, count))
    }

    /// Close the buffer. Idempotent, safe to race with `set`.
    ///
    /// Buffered messages are dropped and the bound sender is closed.
    pub fn on_close(&self) {
        let sender = {
            let mut inner = self.inner.lock();
            if inner.state == FlushState::Closed {
                return;
            }
            inner.state = FlushState::Closed;
            inner.buf = BytesMut::new();
            inner.pending = 0;
            inner.idle = false;
            inner.sender.take()
        };

        if let Some(sender) = sender {
            sender.on_close();
        }
        let _ = self.wake_tx.try_send(());
    }

    #[must_use]
    pub fn state(&self) -> FlushState {
        self.inner.lock().state
    }

    /// Messages waiting to be flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().pending
    }

    /// Bytes waiting to be flushed, including sub-message headers.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().buf.len()
    }
}

impl std::fmt::Debug for ControlBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ControlBuffer")
            .field("state", &inner.state)
            .field("pending", &inner.pending)
            .field("buffered", &inner.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_body, split_sub_messages};
    use std::time::Duration;

    fn config(batch_limit: usize, max_frame_size: usize) -> ConnConfig {
        ConnConfig {
            batch_limit,
            max_frame_size,
            ..ConnConfig::default()
        }
    }

    /// Collect every frame the flush loop hands to the sender.
    async fn collect(consumer: QueueConsumer<Bytes>) -> Vec<Vec<Bytes>> {
        let mut frames = Vec::new();
        consumer
            .receive(&CancelToken::new(), |frame| {
                let body = decode_body(&frame[LENGTH_FIELD_LEN..], usize::MAX).unwrap();
                frames.push(split_sub_messages(&body.payload).unwrap());
                async {}
            })
            .await;
        frames
    }

    #[compio::test]
    async fn batches_respect_limit() {
        let control = Arc::new(ControlBuffer::new(config(3, 1 << 20)));
        for i in 0..7u8 {
            control.set(&[i]).unwrap();
        }

        let (sender, writer) = SenderWrapper::new();
        let flush = compio::runtime::spawn(control.run(sender).unwrap());
        compio::time::sleep(Duration::from_millis(20)).await;
        control.on_close();
        flush.await;

        let frames = collect(writer.consumer).await;
        let sizes: Vec<_> = frames.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        let flat: Vec<u8> = frames.into_iter().flatten().map(|m| m[0]).collect();
        assert_eq!(flat, (0..7).collect::<Vec<_>>());
    }

    #[compio::test]
    async fn batches_respect_frame_size() {
        // Prefix 2 + two 10-byte sub-messages (14 each) = 30 bytes.
        let control = Arc::new(ControlBuffer::new(config(64, 30)));
        for _ in 0..5 {
            control.set(&[1u8; 10]).unwrap();
        }

        let (sender, writer) = SenderWrapper::new();
        let flush = compio::runtime::spawn(control.run(sender).unwrap());
        compio::time::sleep(Duration::from_millis(20)).await;
        control.on_close();
        flush.await;

        let sizes: Vec<_> = collect(writer.consumer).await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    /// Bytes gzip cannot shrink.
    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[compio::test]
    async fn gzip_never_exceeds_frame_size() {
        let control = Arc::new(ControlBuffer::new(ConnConfig {
            is_gzip: true,
            ..config(64, 1024)
        }));
        let big = noise(control.max_message_size());
        control.set(&big).unwrap();
        control.set(&[7u8; 512]).unwrap();

        let (sender, writer) = SenderWrapper::new();
        let flush = compio::runtime::spawn(control.run(sender).unwrap());
        compio::time::sleep(Duration::from_millis(20)).await;
        control.on_close();
        flush.await;

        let mut raw = Vec::new();
        writer
            .consumer
            .receive(&CancelToken::new(), |frame| {
                raw.push(frame);
                async {}
            })
            .await;

        assert_eq!(raw.len(), 2);
        for frame in &raw {
            assert!(frame.len() <= LENGTH_FIELD_LEN + 1024, "{} bytes", frame.len());
        }
        // Incompressible batch goes out plain, the compressible one stays gzipped.
        assert_eq!(raw[0][LENGTH_FIELD_LEN], 0);
        assert_eq!(raw[1][LENGTH_FIELD_LEN], 1);

        let first = decode_body(&raw[0][LENGTH_FIELD_LEN..], 1024).unwrap();
        assert_eq!(split_sub_messages(&first.payload).unwrap(), vec![Bytes::from(big)]);
        let second = decode_body(&raw[1][LENGTH_FIELD_LEN..], 1024).unwrap();
        assert_eq!(split_sub_messages(&second.payload).unwrap(), vec![Bytes::from(vec![7u8; 512])]);
    }

    #[test]
    fn oversized_message_rejected() {
        let control = ControlBuffer::new(config(64, 30));
        assert_eq!(control.max_message_size(), 24);
        control.set(&[0u8; 24]).unwrap();
        assert!(matches!(
            control.set(&[0u8; 25]),
            Err(RivetError::MessageTooLarge { size: 25, max: 24 })
        ));
    }

    #[test]
    fn run_twice_fails() {
        let control = Arc::new(ControlBuffer::new(ConnConfig::default()));
        let (sender, _writer) = SenderWrapper::new();
        let _flush = control.run(sender.clone()).unwrap();
        assert!(matches!(control.run(sender), Err(RivetError::AlreadyRunning)));
        assert_eq!(control.state(), FlushState::Running);
    }

    #[test]
    fn close_is_idempotent_and_closes_sender() {
        let control = Arc::new(ControlBuffer::new(ConnConfig::default()));
        let (sender, _writer) = SenderWrapper::new();
        let _flush = control.run(sender.clone()).unwrap();

        control.set(b"dropped").unwrap();
        control.on_close();
        control.on_close();

        assert_eq!(control.state(), FlushState::Closed);
        assert_eq!(control.pending(), 0);
        assert!(sender.is_closed());
        assert!(matches!(control.set(b"x"), Err(RivetError::Disconnected)));

        // A new generation may start from Closed.
        let (next, _writer) = SenderWrapper::new();
        let _flush = control.run(next).unwrap();
        control.set(b"again").unwrap();
    }

    #[compio::test]
    async fn wakes_idle_flush_loop() {
        let control = Arc::new(ControlBuffer::new(ConnConfig::default()));
        let (sender, writer) = SenderWrapper::new();
        let flush = compio::runtime::spawn(control.run(sender).unwrap());

        compio::time::sleep(Duration::from_millis(10)).await;
        control.set(b"late").unwrap();
        compio::time::sleep(Duration::from_millis(10)).await;
        control.on_close();
        flush.await;

        let frames = collect(writer.consumer).await;
        assert_eq!(frames, vec![vec![Bytes::from_static(b"late")]]);
    }
}
