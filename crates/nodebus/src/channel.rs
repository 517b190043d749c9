//! Bounded work channels with a fixed pool of worker tasks.
//!
//! The router owns two of these: an ordered channel with one worker and an
//! unordered channel with several. Enqueue never blocks; a full channel
//! rejects the item and the caller reports backpressure. Stopping drains what
//! is already queued.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Boxed future returned by a [`WorkHandler`].
pub type WorkFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Processes one dequeued item.
pub type WorkHandler<T> = Arc<dyn Fn(T) -> WorkFuture + Send + Sync>;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Name used in logs and backpressure errors.
    pub name: &'static str,
    /// Maximum queued items.
    pub capacity: usize,
    /// Number of worker tasks.
    pub workers: usize,
}

/// Snapshot of channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Items accepted.
    pub enqueued: u64,
    /// Items refused because the channel was full or stopped.
    pub rejected: u64,
    /// Items handed to the handler and completed.
    pub processed: u64,
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    stopped: AtomicBool,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
}

impl<T> Shared<T> {
    async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.queue.lock().pop_front() {
                return Some(item);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

/// A bounded FIFO drained by `workers` tasks.
pub struct WorkChannel<T> {
    name: &'static str,
    shared: Arc<Shared<T>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkChannel<T> {
    /// Creates the channel and spawns its workers. Must be called inside a
    /// Tokio runtime.
    pub fn start(config: ChannelConfig, handler: WorkHandler<T>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            capacity: config.capacity,
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        });

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                let name = config.name;
                tokio::spawn(async move {
                    debug!(channel = name, worker, "worker started");
                    while let Some(item) = shared.dequeue().await {
                        handler(item).await;
                        shared.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!(channel = name, worker, "worker exiting");
                })
            })
            .collect();

        Self {
            name: config.name,
            shared,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Queues an item without blocking. Returns false if the channel is full
    /// or stopped.
    pub fn enqueue(&self, item: T) -> bool {
        {
            let mut queue = self.shared.queue.lock();
            if self.shared.stopped.load(Ordering::Acquire) || queue.len() >= self.shared.capacity {
                drop(queue);
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            queue.push_back(item);
        }
        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
        true
    }

    /// Stops accepting work and waits until the workers have drained every
    /// queued item. Idempotent; every caller returns only after the drain.
    pub async fn stop(&self) {
        {
            // Taken under the queue lock so no enqueue slips in after the
            // workers decide the queue is empty.
            let _queue = self.shared.queue.lock();
            self.shared.stopped.store(true, Ordering::Release);
        }
        self.shared.notify.notify_waiters();

        // Held across the joins so a concurrent caller waits for them too.
        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            return;
        }
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(channel = self.name, error = %e, "worker terminated abnormally");
            }
        }
        info!(channel = self.name, processed = self.shared.processed.load(Ordering::Relaxed), "channel stopped");
    }

    /// True once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum queued items.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Channel name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
        }
    }
}
