//! Inbound block receiver.
//!
//! Delivers decoded payloads, in order, to a blocking consumer and latches a
//! terminal error that every later `recv` observes.
//!
//! The handoff slot is a `flume::bounded(1)` channel; items that arrive while
//! the slot is occupied wait in an overflow list and are promoted one by one
//! as the consumer takes from the slot. The terminal error travels through
//! the same path as payloads, so it is never delivered ahead of data that
//! was buffered before it.

use crate::cancel::CancelToken;
use crate::error::{Result, RivetError};
use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

type Item = std::result::Result<Bytes, RivetError>;

struct Inner {
    overflow: VecDeque<Item>,
    terminal: Option<RivetError>,
}

/// Single-consumer inbound delivery primitive.
pub struct BlockReceiver {
    inner: Mutex<Inner>,
    slot_tx: Sender<Item>,
    slot_rx: Receiver<Item>,
}

impl BlockReceiver {
    #[must_use]
    pub fn new() -> Self {
        let (slot_tx, slot_rx) = flume::bounded(1);
        Self {
            inner: Mutex::new(Inner {
                overflow: VecDeque::new(),
                terminal: None,
            }),
            slot_tx,
            slot_rx,
        }
    }

    /// Queue a payload, a terminal error, or both.
    ///
    /// Fails with [`RivetError::Closed`] once a terminal error is latched;
    /// the producer should stop. Never blocks.
    pub fn put(&self, payload: Option<Bytes>, err: Option<RivetError>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return Err(RivetError::Closed);
        }

        if let Some(payload) = payload {
            self.enqueue(&mut inner, Ok(payload));
        }
        if let Some(err) = err {
            trace!(error = %err, "[BlockReceiver] terminal error latched");
            inner.terminal = Some(err.clone());
            self.enqueue(&mut inner, Err(err));
        }
        Ok(())
    }

    /// Deliver the terminal reason to current and future `recv` callers.
    ///
    /// Later calls are ignored; the first latched error wins.
    pub fn on_close(&self, err: RivetError) {
        let _ = self.put(None, Some(err));
    }

    /// Wait for the next payload.
    ///
    /// Returns the terminal error once it is reached, and keeps returning it
    /// on every later call. Returns [`RivetError::Canceled`] if `cancel`
    /// fires first; buffered items stay untouched in that case.
    pub async fn recv(&self, cancel: &CancelToken) -> Result<Bytes> {
        use futures::{select, FutureExt};

        if cancel.is_cancelled() {
            return Err(RivetError::Canceled);
        }

        let item = select! {
            item = self.slot_rx.recv_async().fuse() => item,
            _ = cancel.cancelled().fuse() => return Err(RivetError::Canceled),
        };

        // The receiver keeps both channel ends, so the channel never disconnects.
        let item = item.map_err(|_| RivetError::Closed)?;

        let mut inner = self.inner.lock();
        match item {
            Ok(payload) => {
                self.promote(&mut inner);
                Ok(payload)
            }
            Err(err) => {
                // Nothing follows the terminal error; put it back for the next caller.
                let _ = self.slot_tx.try_send(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    ///
    /// Returns `None` when nothing is buffered yet.
    pub fn try_recv(&self) -> Option<Result<Bytes>> {
        let item = self.slot_rx.try_recv().ok()?;
        let mut inner = self.inner.lock();
        match item {
            Ok(payload) => {
                self.promote(&mut inner);
                Some(Ok(payload))
            }
            Err(err) => {
                let _ = self.slot_tx.try_send(Err(err.clone()));
                Some(Err(err))
            }
        }
    }

    /// The latched terminal error, if any.
    #[must_use]
    pub fn terminal(&self) -> Option<RivetError> {
        self.inner.lock().terminal.clone()
    }

    /// Number of buffered items, including a pending terminal error.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().overflow.len() + self.slot_rx.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enqueue(&self, inner: &mut Inner, item: Item) {
        // Fast path: straight into an empty slot.
        if inner.overflow.is_empty() {
            match self.slot_tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(item) | TrySendError::Disconnected(item)) => {
                    inner.overflow.push_back(item);
                }
            }
        } else {
            inner.overflow.push_back(item);
        }
    }

    fn promote(&self, inner: &mut Inner) {
        if let Some(next) = inner.overflow.pop_front() {
            if let Err(TrySendError::Full(next) | TrySendError::Disconnected(next)) =
                self.slot_tx.try_send(next)
            {
                inner.overflow.push_front(next);
            }
        }
    }
}

impl Default for BlockReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BlockReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReceiver")
            .field("buffered", &self.len())
            .field("terminal", &self.terminal())
            .finish()
    }
}
