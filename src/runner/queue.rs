//! Device work queue with join semantics
//!
//! Device ids are pushed once at start-up and the queue is then closed.
//! Workers pull [`WorkItem`]s; an item is marked done when it is consumed with
//! [`WorkItem::done`] or dropped, so every dequeued id is completed exactly
//! once even if its worker unwinds. [`WorkQueue::join_all`] returns once every
//! enqueued id has been completed.

use crate::devices::DeviceId;
use crate::error::WorkerError;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Statistics for the work queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total ids enqueued
    pub enqueued: AtomicU64,

    /// Total ids handed to workers
    pub dequeued: AtomicU64,

    /// Total ids marked done
    pub completed: AtomicU64,

    /// Ids dropped without being dequeued (cancellation)
    pub discarded: AtomicU64,
}

impl QueueStats {
    /// Ids still waiting to be marked done
    pub fn outstanding(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst) - self.completed.load(Ordering::SeqCst)
    }
}

struct Shared {
    sender: Mutex<Option<Sender<DeviceId>>>,
    receiver: Receiver<DeviceId>,
    pending: Mutex<u64>,
    drained: Condvar,
    stats: QueueStats,
}

impl Shared {
    fn complete(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.stats.completed.fetch_add(count, Ordering::SeqCst);

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = pending.saturating_sub(count);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

/// Result of a bounded dequeue
#[derive(Debug)]
pub enum Poll {
    /// An id is ready
    Ready(WorkItem),
    /// Nothing arrived within the timeout
    Idle,
    /// Queue closed and empty
    Closed,
}

/// Thread-safe FIFO of pending device ids
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Create an empty, open queue
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();

        Self {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(sender)),
                receiver,
                pending: Mutex::new(0),
                drained: Condvar::new(),
                stats: QueueStats::default(),
            }),
        }
    }

    /// Add a device id
    pub fn enqueue(&self, device: DeviceId) -> Result<(), WorkerError> {
        let sender = self.shared.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = sender.as_ref().ok_or(WorkerError::QueueClosed)?;

        // Count before sending so a fast worker cannot complete an id
        // that join_all has not seen yet
        *self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.shared.stats.enqueued.fetch_add(1, Ordering::SeqCst);

        if sender.send(device).is_err() {
            self.shared.complete(1);
            return Err(WorkerError::QueueClosed);
        }
        Ok(())
    }

    /// Stop accepting ids. Already queued ids are still delivered.
    pub fn close(&self) {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Block until an id is available; `None` once closed and empty
    pub fn dequeue(&self) -> Option<WorkItem> {
        self.shared.receiver.recv().ok().map(|device| self.item(device))
    }

    /// Wait up to `timeout` for an id
    pub fn dequeue_timeout(&self, timeout: Duration) -> Poll {
        match self.shared.receiver.recv_timeout(timeout) {
            Ok(device) => Poll::Ready(self.item(device)),
            Err(RecvTimeoutError::Timeout) => Poll::Idle,
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    fn item(&self, device: DeviceId) -> WorkItem {
        self.shared.stats.dequeued.fetch_add(1, Ordering::SeqCst);
        WorkItem {
            device,
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    /// Block until every enqueued id has been marked done
    pub fn join_all(&self) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = self
                .shared
                .drained
                .wait(pending)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Wait up to `timeout` for the queue to drain; true if drained
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());

        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = self
                .shared
                .drained
                .wait_timeout(pending, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    /// Drop every id not yet dequeued, marking it done. Returns the count.
    pub fn discard_pending(&self) -> usize {
        let mut discarded = 0u64;
        while self.shared.receiver.try_recv().is_ok() {
            discarded += 1;
        }

        self.shared.stats.discarded.fetch_add(discarded, Ordering::SeqCst);
        self.shared.complete(discarded);
        discarded as usize
    }

    /// Queue statistics
    pub fn stats(&self) -> &QueueStats {
        &self.shared.stats
    }

    /// Ids waiting to be dequeued
    pub fn len(&self) -> usize {
        self.shared.receiver.len()
    }

    /// True if no ids are waiting to be dequeued
    pub fn is_empty(&self) -> bool {
        self.shared.receiver.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A dequeued device id; marks itself done when consumed or dropped
pub struct WorkItem {
    device: DeviceId,
    shared: Option<Arc<Shared>>,
}

impl WorkItem {
    /// The device to check
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Mark this id done
    pub fn done(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(1);
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("device", &self.device)
            .field("done", &self.shared.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_queue_basic() {
        let queue = WorkQueue::new();
        queue.enqueue(7).unwrap();
        assert_eq!(queue.len(), 1);

        let item = queue.dequeue().unwrap();
        assert_eq!(item.device(), 7);
        assert!(!queue.join_timeout(Duration::from_millis(10)));

        item.done();
        assert!(queue.join_timeout(Duration::from_millis(10)));
        assert_eq!(queue.stats().completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_queue() {
        let queue = WorkQueue::new();
        queue.enqueue(1).unwrap();
        queue.close();

        assert!(matches!(queue.enqueue(2), Err(WorkerError::QueueClosed)));

        // Queued ids survive close
        let item = queue.dequeue().unwrap();
        assert_eq!(item.device(), 1);
        drop(item);

        assert!(queue.dequeue().is_none());
        assert!(matches!(queue.dequeue_timeout(Duration::from_millis(5)), Poll::Closed));
    }

    #[test]
    fn test_idle_poll() {
        let queue = WorkQueue::new();
        assert!(matches!(queue.dequeue_timeout(Duration::from_millis(5)), Poll::Idle));
    }

    #[test]
    fn test_drop_marks_done() {
        let queue = WorkQueue::new();
        queue.enqueue(1).unwrap();
        {
            let _item = queue.dequeue().unwrap();
        }
        assert!(queue.join_timeout(Duration::from_millis(10)));
        assert_eq!(queue.stats().outstanding(), 0);
    }

    #[test]
    fn test_discard_pending() {
        let queue = WorkQueue::new();
        for id in 0..5 {
            queue.enqueue(id).unwrap();
        }
        let item = queue.dequeue().unwrap();

        assert_eq!(queue.discard_pending(), 4);
        assert!(!queue.join_timeout(Duration::from_millis(10)));

        item.done();
        assert!(queue.join_timeout(Duration::from_millis(10)));
        assert_eq!(queue.stats().discarded.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_concurrent_dequeue_no_duplicates() {
        let queue = WorkQueue::new();
        for id in 0..1000 {
            queue.enqueue(id).unwrap();
        }
        queue.close();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = queue.dequeue() {
                        seen.push(item.device());
                        item.done();
                    }
                    seen
                })
            })
            .collect();

        queue.join_all();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }
}
