//! Fixed-size worker pool used to materialize independent entries in parallel.
use crate::ext::mutex::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job<T> = Box<dyn FnOnce() -> T + Send + 'static>;

/// Pending job count plus the condition `join` waits on.
struct Pending {
    count: AtomicUsize,
    lock: Mutex<()>,
    done: Condvar,
}

/// A pool of `size` workers. Job results are collected in completion order.
///
/// Submission blocks once every worker is busy and the queue holds `size` jobs.
pub struct ThreadPool<T: Send + 'static> {
    sender: Option<SyncSender<Job<T>>>,
    workers: Vec<JoinHandle<()>>,
    results: Arc<Mutex<Vec<T>>>,
    pending: Arc<Pending>,
}

impl<T: Send + 'static> ThreadPool<T> {
    pub fn new(size: usize, name: &str) -> std::io::Result<Self> {
        if size == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "worker count must be > 0",
            ));
        }
        let (tx, rx) = sync_channel::<Job<T>>(size);
        let receiver: Arc<Mutex<Receiver<Job<T>>>> = Arc::new(Mutex::new(rx));
        let results = Arc::new(Mutex::new(Vec::new()));
        let pending = Arc::new(Pending {
            count: AtomicUsize::new(0),
            lock: Mutex::new(()),
            done: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let results = Arc::clone(&results);
            let pending = Arc::clone(&pending);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || {
                    loop {
                        // the guard is dropped before the job runs
                        let job = receiver.lock_blocking().recv();
                        let Ok(job) = job else {
                            break;
                        };
                        let value = job();
                        results.lock_blocking().push(value);
                        pending.count.fetch_sub(1, Ordering::SeqCst);
                        let _g = pending.lock.lock_blocking();
                        pending.done.notify_all();
                    }
                })?;
            workers.push(handle);
        }
        Ok(ThreadPool {
            sender: Some(tx),
            workers,
            results,
            pending,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job, blocking while the queue is full.
    pub fn execute<F>(&self, job: F) -> std::io::Result<()>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let closed = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "thread pool is closed");
        let sender = self.sender.as_ref().ok_or_else(closed)?;
        self.pending.count.fetch_add(1, Ordering::SeqCst);
        if sender.send(Box::new(job)).is_err() {
            self.pending.count.fetch_sub(1, Ordering::SeqCst);
            return Err(closed());
        }
        Ok(())
    }

    /// Waits until every queued job has finished.
    pub fn join(&self) {
        let mut guard = self.pending.lock.lock_blocking();
        while self.pending.count.load(Ordering::SeqCst) != 0 {
            guard = match self.pending.done.wait(guard) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn into_results(self) -> Vec<T> {
        self.join();
        std::mem::take(&mut *self.results.lock_blocking())
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        // closing the channel ends every worker loop
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_pool_collects_all_results() {
    let pool = ThreadPool::new(3, "test").unwrap();
    for i in 0..20u32 {
        pool.execute(move || i * 2).unwrap();
    }
    let mut results = pool.into_results();
    results.sort();
    assert_eq!(results, (0..20u32).map(|i| i * 2).collect::<Vec<_>>());
}

#[test]
fn test_pool_rejects_zero_workers() {
    assert!(ThreadPool::<()>::new(0, "test").is_err());
}
