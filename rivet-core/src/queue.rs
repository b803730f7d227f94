//! MPSC wake queue.
//!
//! Any number of producers push without blocking; exactly one consumer task
//! drains everything with as few wake-ups as possible.
//!
//! Design:
//! - Producers append to the `incoming` ring under a short critical section
//! - The consumer swaps `incoming` with its private `output` ring, so the lock
//!   is never held while items are processed
//! - A parked consumer is woken through a single-slot flume channel; one
//!   pending wake is enough because the consumer re-checks state every time
//! - Rings grow by doubling (`VecDeque`) and are reset to their initial
//!   capacity once observed empty
//! - Closing never loses items: whatever was queued before the close is
//!   still handed to the consumer (drain-before-close)

use crate::cancel::CancelToken;
use crate::error::{Result, RivetError};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;

/// Default initial ring capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct State<T> {
    incoming: VecDeque<T>,
    /// Consumer is parked waiting for a wake
    waiting: bool,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    wake_tx: Sender<()>,
    initial_capacity: usize,
}

impl<T> Shared<T> {
    fn wake(&self) {
        // Best-effort: a full slot already guarantees a wake.
        let _ = self.wake_tx.try_send(());
    }
}

/// Producer handle. Cheap to clone, safe to share across threads.
pub struct WakeQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WakeQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The single consumer side of a [`WakeQueue`].
pub struct QueueConsumer<T> {
    shared: Arc<Shared<T>>,
    wake_rx: Receiver<()>,
    output: VecDeque<T>,
}

/// Create a wake queue pair.
///
/// # Example
///
/// ```rust
/// use rivet_core::cancel::CancelToken;
/// use rivet_core::queue::wake_queue;
///
/// # compio::runtime::Runtime::new().unwrap().block_on(async {
/// let (queue, consumer) = wake_queue::<u32>(16);
/// queue.send(1).unwrap();
/// queue.send(2).unwrap();
/// queue.close();
///
/// let mut seen = Vec::new();
/// consumer
///     .receive(&CancelToken::new(), |item| {
///         seen.push(item);
///         async {}
///     })
///     .await;
/// assert_eq!(seen, vec![1, 2]);
/// # });
/// ```
#[must_use]
pub fn wake_queue<T>(initial_capacity: usize) -> (WakeQueue<T>, QueueConsumer<T>) {
    let initial_capacity = initial_capacity.max(1);
    let (wake_tx, wake_rx) = flume::bounded(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            incoming: VecDeque::with_capacity(initial_capacity),
            waiting: false,
            closed: false,
        }),
        wake_tx,
        initial_capacity,
    });

    (
        WakeQueue {
            shared: Arc::clone(&shared),
        },
        QueueConsumer {
            shared,
            wake_rx,
            output: VecDeque::with_capacity(initial_capacity),
        },
    )
}

impl<T> WakeQueue<T> {
    /// Enqueue an item. Never blocks.
    ///
    /// Fails with [`RivetError::Closed`] once the queue has been closed.
    pub fn send(&self, item: T) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(RivetError::Closed);
        }
        state.incoming.push_back(item);
        let parked = std::mem::replace(&mut state.waiting, false);
        drop(state);

        if parked {
            self.shared.wake();
        }
        Ok(())
    }

    /// Latch the queue closed and wake the consumer. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.waiting = false;
        drop(state);

        self.shared.wake();
    }

    /// Returns true once the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of items waiting to be picked up by the consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().incoming.len()
    }

    /// Returns true if no items are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn incoming_capacity(&self) -> usize {
        self.shared.state.lock().incoming.capacity()
    }
}

impl<T> QueueConsumer<T> {
    /// Run the consumer loop until `stop` fires or the queue is closed.
    ///
    /// `consumer` is invoked once per item, in enqueue order, outside of any
    /// lock. On exit the queue is latched closed and every item still queued
    /// is handed to `consumer` before the buffers are released.
    pub async fn receive<F, Fut>(mut self, stop: &CancelToken, mut consumer: F)
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        use futures::{select, FutureExt};

        loop {
            let closed = self.swap_incoming(false);

            while let Some(item) = self.output.pop_front() {
                consumer(item).await;
            }
            self.contract_output();

            if closed {
                break;
            }

            select! {
                _ = self.wake_rx.recv_async().fuse() => {}
                _ = stop.cancelled().fuse() => break,
            }
        }

        // Drain-before-close: latch, then deliver whatever slipped in.
        self.swap_incoming(true);
        let remaining = self.output.len();
        while let Some(item) = self.output.pop_front() {
            consumer(item).await;
        }
        trace!(remaining, "[WakeQueue] consumer exited");
    }

    /// Move everything from `incoming` to `output` and park.
    ///
    /// Returns whether the queue is closed.
    fn swap_incoming(&mut self, close: bool) -> bool {
        let initial = self.shared.initial_capacity;
        let mut state = self.shared.state.lock();
        if close {
            state.closed = true;
        }
        std::mem::swap(&mut state.incoming, &mut self.output);
        // `incoming` now holds the drained output ring.
        if state.incoming.capacity() > initial {
            state.incoming = VecDeque::with_capacity(initial);
        }
        state.waiting = !state.closed;
        state.closed
    }

    fn contract_output(&mut self) {
        let initial = self.shared.initial_capacity;
        if self.output.capacity() > initial {
            self.output = VecDeque::with_capacity(initial);
        }
    }

    /// A producer handle for this consumer's queue.
    #[must_use]
    pub fn producer(&self) -> WakeQueue<T> {
        WakeQueue {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[compio::test]
    async fn drains_in_order() {
        let (queue, consumer) = wake_queue::<usize>(4);
        for i in 0..100 {
            queue.send(i).unwrap();
        }
        queue.close();

        let mut seen = Vec::new();
        consumer
            .receive(&CancelToken::new(), |item| {
                seen.push(item);
                async {}
            })
            .await;

        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[compio::test]
    async fn send_after_close_fails() {
        let (queue, _consumer) = wake_queue::<u8>(4);
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(queue.send(1), Err(RivetError::Closed)));
    }

    #[compio::test]
    async fn drain_before_close_on_stop() {
        let (queue, consumer) = wake_queue::<u32>(4);
        let stop = CancelToken::new();

        let producer = queue.clone();
        let stopper = stop.clone();
        compio::runtime::spawn(async move {
            compio::time::sleep(Duration::from_millis(10)).await;
            producer.send(7).unwrap();
            producer.send(8).unwrap();
            // Stop right behind the sends; both items must still arrive.
            stopper.cancel();
        })
        .detach();

        let mut seen = Vec::new();
        consumer
            .receive(&stop, |item| {
                seen.push(item);
                async {}
            })
            .await;

        assert_eq!(seen, vec![7, 8]);
        assert!(matches!(queue.send(9), Err(RivetError::Closed)));
    }

    #[compio::test]
    async fn producers_on_other_threads() {
        let (queue, consumer) = wake_queue::<(usize, usize)>(8);
        let mut handles = Vec::new();
        for producer_id in 0..4 {
            let q = queue.clone();
            handles.push(std::thread::spawn(move || {
                for seq in 0..250 {
                    q.send((producer_id, seq)).unwrap();
                }
            }));
        }

        let closer = queue.clone();
        std::thread::spawn(move || {
            for h in handles {
                h.join().unwrap();
            }
            closer.close();
        });

        let mut seen = Vec::new();
        consumer
            .receive(&CancelToken::new(), |item| {
                seen.push(item);
                async {}
            })
            .await;

        assert_eq!(seen.len(), 1000);
        // Per-producer order is preserved.
        for producer_id in 0..4 {
            let seqs: Vec<_> = seen
                .iter()
                .filter(|(p, _)| *p == producer_id)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs, (0..250).collect::<Vec<_>>());
        }
    }

    #[compio::test]
    async fn buffers_contract_after_burst() {
        let (queue, consumer) = wake_queue::<u64>(4);
        let stop = CancelToken::new();

        let producer = queue.clone();
        let stopper = stop.clone();
        let observer = compio::runtime::spawn(async move {
            for i in 0..1024 {
                producer.send(i).unwrap();
            }
            let grown = producer.incoming_capacity();
            compio::time::sleep(Duration::from_millis(20)).await;
            // The consumer has swapped the burst out by now.
            let contracted = producer.incoming_capacity();
            stopper.cancel();
            (grown, contracted)
        });

        let mut count = 0;
        consumer
            .receive(&stop, |_| {
                count += 1;
                async {}
            })
            .await;
        assert_eq!(count, 1024);

        let (grown, contracted) = observer.await;
        assert!(grown >= 1024);
        assert!(contracted < 1024);
    }
}
