//! Bounded blocking FIFO between pipeline stages.
//!
//! Each stage worker waits on its own `StageQueue`. The wait is always
//! bounded so the worker can re-check its stop flag. `release()` drains the
//! queue and wakes every current waiter with [`PopResult::Released`], which
//! is how a flush unblocks workers without sending them fake frames.

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Outcome of a bounded wait.
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    Item(T),
    /// The queue was released while waiting
    Released,
    TimedOut,
}

pub struct StageQueue<T> {
    name: String,
    capacity: usize,
    tx: Sender<T>,
    rx: Receiver<T>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    waiters: AtomicUsize,
}

impl<T> StageQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        let (wake_tx, wake_rx) = unbounded();
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            tx,
            rx,
            wake_tx,
            wake_rx,
            waiters: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Enqueue, blocking while the queue is full. Never drops.
    pub fn push(&self, item: T) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                tracing::debug!("Queue {} full ({}), applying backpressure", self.name, self.capacity);
                // Both channel ends live in `self`, so the send cannot disconnect
                let _ = self.tx.send(item);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Enqueue without blocking; the item comes back when the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|e| e.into_inner())
    }

    /// Wait up to `timeout` for the next item.
    pub fn wait_and_pop(&self, timeout: Duration) -> PopResult<T> {
        if let Ok(item) = self.rx.try_recv() {
            return PopResult::Item(item);
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let result = select! {
            recv(self.rx) -> msg => match msg {
                Ok(item) => PopResult::Item(item),
                Err(_) => PopResult::Released,
            },
            recv(self.wake_rx) -> _ => PopResult::Released,
            default(timeout) => PopResult::TimedOut,
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Drain all queued items and wake every waiter.
    pub fn release(&self) -> Vec<T> {
        let drained: Vec<T> = self.rx.try_iter().collect();
        let waiters = self.waiters.load(Ordering::SeqCst);
        for _ in 0..waiters {
            let _ = self.wake_tx.send(());
        }
        if !drained.is_empty() || waiters > 0 {
            tracing::debug!(
                "Queue {} released: {} drained, {} waiters woken",
                self.name,
                drained.len(),
                waiters
            );
        }
        drained
    }

    /// Drop wake tokens left over from a release nobody consumed
    pub fn clear_wakeups(&self) {
        while self.wake_rx.try_recv().is_ok() {}
    }
}

impl<T> std::fmt::Debug for StageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = StageQueue::new("isp", 4);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.wait_and_pop(Duration::from_millis(1)), PopResult::Item(1));
        assert_eq!(queue.wait_and_pop(Duration::from_millis(1)), PopResult::Item(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_timeout_on_empty() {
        let queue: StageQueue<u32> = StageQueue::new("3aa", 2);
        let start = Instant::now();
        assert_eq!(queue.wait_and_pop(Duration::from_millis(20)), PopResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_try_push_full() {
        let queue = StageQueue::new("scaler", 1);
        queue.try_push(1).unwrap();
        assert_eq!(queue.try_push(2), Err(2));
    }

    #[test]
    fn test_release_drains_and_wakes() {
        let queue: Arc<StageQueue<u32>> = Arc::new(StageQueue::new("sensor", 4));

        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_and_pop(Duration::from_secs(5)))
        };

        // Give the waiter time to park
        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.waiters.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(queue.release().is_empty());
        assert_eq!(waiter.join().unwrap(), PopResult::Released);
    }

    #[test]
    fn test_release_returns_items() {
        let queue = StageQueue::new("dump", 4);
        queue.push(7);
        queue.push(8);
        assert_eq!(queue.release(), vec![7, 8]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_blocking_push_unblocks_after_pop() {
        let queue = Arc::new(StageQueue::new("isp", 1));
        queue.push(1);

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.push(2))
        };

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(queue.wait_and_pop(Duration::from_millis(100)), PopResult::Item(1));
        producer.join().unwrap();
        assert_eq!(queue.wait_and_pop(Duration::from_millis(100)), PopResult::Item(2));
    }
}
