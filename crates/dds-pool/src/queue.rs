//! Per-slot serialized task queue.
//!
//! A fair async mutex gates execution so tasks run one at a time, in the order
//! they started waiting. Depth is tracked separately so the scheduler can rank
//! slots without touching the gate. There are no retries: a failed task hands
//! its error back to whoever submitted it and the queue moves on.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

/// Reservation of one place in a queue.
///
/// Counts toward the queue depth from creation until drop, which covers both
/// waiting and running. Dropping an unused ticket simply releases the place.
#[must_use = "a ticket only counts while it is held"]
#[derive(Debug)]
pub struct QueueTicket {
    depth: Arc<AtomicUsize>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    gate: Mutex<()>,
    depth: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks queued, including the one in flight.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Reserve a place synchronously, before any await point.
    pub fn reserve(&self) -> QueueTicket {
        self.depth.fetch_add(1, Ordering::AcqRel);
        QueueTicket {
            depth: Arc::clone(&self.depth),
        }
    }

    /// Wait for this ticket's turn, then run the task to completion.
    pub async fn run<F, Fut, T>(&self, ticket: QueueTicket, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _ticket = ticket;
        let _turn = self.gate.lock().await;
        task().await
    }

    /// Reserve and run in one step.
    pub async fn push<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.reserve();
        self.run(ticket, task).await
    }
}
