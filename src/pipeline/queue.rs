//! Bounded work queues and item pools
//!
//! Thin wrappers over crossbeam channels giving the pipeline stages the two
//! primitives they share: a bounded FIFO with a stop sentinel (dropping the
//! sender), and a pool of reusable work items that blocks when exhausted.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use std::sync::Mutex;

use crate::core::error::Error;
use crate::core::types::Result;

/// Bounded multi-producer FIFO connecting two pipeline stages.
pub struct WorkQueue<T> {
    tx: Mutex<Option<Sender<T>>>,
    rx: Receiver<T>,
}

impl<T: Send> WorkQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity > 0);
        let (tx, rx) = bounded(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Enqueue an item, blocking while the queue is full. Producers are
    /// serialised; consumers drain independently.
    pub fn push(&self, item: T) -> Result<()> {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx
                .send(item)
                .map_err(|_| Error::State("work queue has no consumers")),
            None => Err(Error::State("work queue is stopped")),
        }
    }

    /// Dequeue an item; `None` once the queue is stopped and drained.
    pub fn pop(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Receiver handle for worker threads.
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Close the queue. Consumers see end-of-stream after draining.
    pub fn stop(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Pool of pre-allocated, recyclable work items.
pub struct ItemPool<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for ItemPool<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send> ItemPool<T> {
    pub fn new(items: Vec<T>) -> Self {
        let (tx, rx) = unbounded();
        for item in items {
            tx.send(item).expect("pool receiver alive");
        }
        Self { tx, rx }
    }

    /// Take an item, blocking until one is available.
    pub fn acquire(&self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::State("item pool disconnected"))
    }

    /// True iff `acquire` would not block right now.
    pub fn can_acquire(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Return an item to the pool.
    pub fn release(&self, item: T) {
        // The pool is unbounded and we hold the receiver, so this cannot fail.
        let _ = self.tx.send(item);
    }

    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_queue_fifo() {
        let q = WorkQueue::bounded(8);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_queue_stop_drains() {
        let q = WorkQueue::bounded(8);
        q.push(1).unwrap();
        q.stop();
        assert!(q.push(2).is_err());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_queue_blocks_when_full() {
        let q = Arc::new(WorkQueue::bounded(1));
        q.push(1).unwrap();
        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            q2.push(2).unwrap(); // blocks until the consumer pops
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn test_pool_recycles() {
        let pool = ItemPool::new(vec![10, 20]);
        assert!(pool.can_acquire());
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(!pool.can_acquire());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_pool_blocks_until_release() {
        let pool = ItemPool::new(vec![0u32]);
        let item = pool.acquire().unwrap();
        let pool2 = pool.clone();
        let handle = std::thread::spawn(move || pool2.acquire().unwrap());
        std::thread::sleep(Duration::from_millis(20));
        pool.release(item);
        assert_eq!(handle.join().unwrap(), 0);
    }
}
