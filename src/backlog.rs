use async_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

use crate::dataset::Request;
use crate::metrics::Metrics;

/// Capacity used when a backlog of size zero is requested.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 100;

/// Bounded FIFO of released requests waiting for a worker.
///
/// The scheduler is the only producer and blocks while the backlog is full;
/// workers consume concurrently and block while it is empty. Clones share the
/// same queue.
///
/// A slot is claimed from `slots` before a request is queued and handed back
/// only after it has been dequeued, so `depth` never undercounts the queue and
/// never exceeds `capacity`.
#[derive(Clone)]
pub struct Backlog {
    tx: Sender<Request>,
    rx: Receiver<Request>,
    slots: Arc<Semaphore>,
    capacity: usize,
    depth: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_BACKLOG_CAPACITY
        } else {
            capacity
        };
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            depth: Arc::new(AtomicUsize::new(0)),
            high_water: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enqueues a request, waiting for room. Returns the request back if the
    /// backlog has been closed.
    pub async fn push(&self, request: Request) -> Result<(), Request> {
        let Ok(slot) = self.slots.acquire().await else {
            return Err(request);
        };
        slot.forget();

        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(e) = self.tx.try_send(request) {
            self.release_slot();
            return Err(e.into_inner());
        }

        self.high_water.fetch_max(depth, Ordering::Relaxed);
        Metrics::record_backlog_depth(depth);
        Ok(())
    }

    /// Dequeues the oldest request, waiting for one to arrive. `None` once the
    /// backlog is closed and drained.
    pub async fn pop(&self) -> Option<Request> {
        let request = self.rx.recv().await.ok()?;
        let depth = self.release_slot();
        Metrics::record_backlog_depth(depth);
        Some(request)
    }

    /// Returns a slot to producers and the depth left behind.
    fn release_slot(&self) -> usize {
        let depth = self.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        self.slots.add_permits(1);
        depth
    }

    /// Stops accepting requests; queued requests can still be popped.
    pub fn close(&self) {
        self.slots.close();
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deepest the backlog has been since it was created.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}
