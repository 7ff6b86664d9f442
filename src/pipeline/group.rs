//! Worker pool framework shared by the pipeline stages
//!
//! A group owns a pool of reusable work items and a bounded inbound queue.
//! Producers `get` an item (blocking while the pool is empty, which is the
//! back-pressure), fill it and `push` it; each worker thread pops, processes,
//! and returns the item to the pool. Stopping closes the queue and joins the
//! threads; the first error any worker raised is rethrown to the caller.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::pipeline::queue::{ItemPool, WorkQueue};

/// Per-stage work processing. One handler instance runs per worker thread.
pub trait WorkHandler: Send + 'static {
    type Item: Send + 'static;

    fn process(&mut self, item: &mut Self::Item) -> Result<()>;

    /// Called once per worker after the queue drains, before the thread
    /// exits. Stages with internal batching flush here.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

type FreeHook<T> = Arc<dyn Fn(&mut T) + Send + Sync>;
type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

pub struct WorkerGroup<H: WorkHandler> {
    name: &'static str,
    pool: ItemPool<H::Item>,
    queue: WorkQueue<H::Item>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    error: Arc<Mutex<Option<Error>>>,
    /// Strips transient state off an item before it returns to the pool
    free_hook: Option<FreeHook<H::Item>>,
    /// Runs after an item has re-entered the pool (wakeup notifications)
    release_hook: Option<ReleaseHook>,
}

impl<H: WorkHandler> WorkerGroup<H> {
    pub fn new(name: &'static str, items: Vec<H::Item>, queue_capacity: usize) -> Self {
        assert!(!items.is_empty());
        Self {
            name,
            pool: ItemPool::new(items),
            queue: WorkQueue::bounded(queue_capacity),
            threads: Mutex::new(Vec::new()),
            error: Arc::new(Mutex::new(None)),
            free_hook: None,
            release_hook: None,
        }
    }

    pub fn set_free_hook(&mut self, hook: FreeHook<H::Item>) {
        self.free_hook = Some(hook);
    }

    pub fn set_release_hook(&mut self, hook: ReleaseHook) {
        self.release_hook = Some(hook);
    }

    /// Take a work item, blocking while the pool is empty.
    pub fn get(&self) -> Result<H::Item> {
        self.pool.acquire()
    }

    /// True iff `get` would not block right now. Reported without locking so
    /// dispatchers can poll across groups.
    pub fn can_get(&self) -> bool {
        self.pool.can_acquire()
    }

    /// Enqueue a filled item for the workers.
    pub fn push(&self, item: H::Item) -> Result<()> {
        self.queue.push(item)
    }

    /// Spawn one worker thread per handler.
    pub fn start(&self, handlers: Vec<H>) {
        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "worker group started twice");
        for (idx, handler) in handlers.into_iter().enumerate() {
            let rx = self.queue.receiver();
            let pool = self.pool.clone();
            let error = self.error.clone();
            let free_hook = self.free_hook.clone();
            let release_hook = self.release_hook.clone();
            let name = self.name;
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    worker_loop(handler, rx, pool, free_hook, release_hook, error, name)
                })
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        log::debug!("{}: started {} worker(s)", self.name, threads.len());
    }

    /// Close the queue, join the workers and rethrow their first error.
    pub fn stop(&self) -> Result<()> {
        self.queue.stop();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                let mut slot = self.error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(Error::State("worker thread panicked"));
                }
            }
        }
        self.error.lock().unwrap().take().map_or(Ok(()), Err)
    }
}

fn record_error(slot: &Mutex<Option<Error>>, name: &str, err: Error) {
    log::error!("{name}: worker failed: {err}");
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn worker_loop<H: WorkHandler>(
    mut handler: H,
    rx: Receiver<H::Item>,
    pool: ItemPool<H::Item>,
    free_hook: Option<FreeHook<H::Item>>,
    release_hook: Option<ReleaseHook>,
    error: Arc<Mutex<Option<Error>>>,
    name: &'static str,
) {
    while let Ok(mut item) = rx.recv() {
        let result = handler.process(&mut item);
        if let Some(hook) = &free_hook {
            hook(&mut item);
        }
        pool.release(item);
        if let Some(hook) = &release_hook {
            hook();
        }
        if let Err(err) = result {
            record_error(&error, name, err);
            return;
        }
    }
    if let Err(err) = handler.finish() {
        record_error(&error, name, err);
    }
}
