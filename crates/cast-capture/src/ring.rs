//! Bounded drop-oldest channels between pipeline stages.
//!
//! The pipeline never blocks a producer: when a stage falls behind, the
//! oldest queued item is evicted to admit the newest. Implemented as a
//! mutex-guarded ring with a [`Notify`] wakeup for the consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Create a bounded drop-oldest channel.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        RingSender {
            shared: Arc::clone(&shared),
        },
        RingReceiver { shared },
    )
}

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Producing half. Publishing never waits.
pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RingSender<T> {
    /// Publish an item, evicting the oldest queued item when full.
    ///
    /// Returns `false` once the receiving half is gone.
    pub fn send(&self, item: T) -> bool {
        {
            let mut inner = self.shared.lock();
            if inner.closed {
                return false;
            }
            if inner.queue.len() == inner.capacity {
                inner.queue.pop_front();
                inner.dropped += 1;
            }
            inner.queue.push_back(item);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Total items evicted so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }

    /// Whether the receiver has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<T> Drop for RingSender<T> {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

/// Consuming half.
pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> RingReceiver<T> {
    /// Receive the next item, waiting if the ring is empty.
    ///
    /// Returns `None` once the sender is gone and the ring is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut inner = self.shared.lock();
                if let Some(item) = inner.queue.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.lock().queue.pop_front()
    }
}

impl<T> Drop for RingReceiver<T> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.closed = true;
        inner.queue.clear();
    }
}
