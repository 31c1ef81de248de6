//! Bounded FIFO worker pool for background jobs.
//!
//! A fixed number of workers pull boxed futures from one shared queue, so
//! at most `concurrency` jobs run at once and jobs start in submission
//! order. A panicking job is logged and does not take its worker down.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_channel as chan;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// A queued unit of work.
pub type Job = BoxFuture<'static, ()>;

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    completed: AtomicUsize,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub concurrency: usize,
    pub queued: usize,
    pub active: usize,
    /// Highest number of jobs ever running at once
    pub max_active: usize,
    pub completed: usize,
}

/// Fixed-size pool of async workers fed by a FIFO queue.
pub struct WorkerPool {
    concurrency: usize,
    tx: chan::Sender<Job>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers (at least one) on the current runtime.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = chan::unbounded::<Job>();
        let counters = Arc::new(Counters::default());

        let workers = (0..concurrency)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, rx.clone(), counters.clone())))
            .collect();

        info!(concurrency, "Started worker pool");

        Self {
            concurrency,
            tx,
            counters,
            workers: Mutex::new(workers),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue a job behind everything already submitted.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        self.tx.try_send(job.boxed()).map_err(|_| {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            Error::Internal("worker pool is shut down".to_string())
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            concurrency: self.concurrency,
            queued: self.counters.queued.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            max_active: self.counters.max_active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop accepting jobs, let queued jobs drain, and wait for workers.
    pub async fn shutdown(&self) {
        self.tx.close();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(worker_id: usize, rx: chan::Receiver<Job>, counters: Arc<Counters>) {
    while let Ok(job) = rx.recv().await {
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(active, Ordering::SeqCst);
        debug!(worker_id, active, "Job started");

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!(worker_id, "Job panicked");
        }

        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::SeqCst);
    }
    debug!(worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_concurrency() {
        let pool = WorkerPool::new(2);
        for _ in 0..6 {
            pool.submit(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
            })
            .unwrap();
        }
        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.max_active, 2);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_single_worker_runs_in_submission_order() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            pool.submit(async move {
                order.lock().unwrap().push(i);
            })
            .unwrap();
        }
        pool.shutdown().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        pool.submit(async { panic!("boom") }).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        pool.submit(async move {
            flag.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().completed, 2);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.concurrency(), 1);
        pool.shutdown().await;
        assert!(pool.is_closed());
        assert!(pool.submit(async {}).is_err());
    }
}
