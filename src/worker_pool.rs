//! Fixed-size worker pool for CPU-heavy per-client work.
//!
//! Wraps a `rayon::ThreadPool` with explicit lifecycle and lightweight
//! metrics. A task that panics is logged and omitted; it never takes the
//! pool or the caller down with it.
//!
//! ```ignore
//! let pool = WorkerPool::new(4)?;
//! let results = pool.map_unordered(|id: &String| compute(id), &client_ids);
//! pool.shutdown();
//! ```

use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

/// Prefix for worker-thread names.
pub const THREAD_NAME_PREFIX: &str = "vibesensor-worker";

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("failed to build worker pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),

    #[error("worker task failed: {0}")]
    TaskFailed(String),
}

/// Snapshot of pool metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub total_tasks: u64,
    /// Cumulative wall time spent waiting in `map_unordered` (s).
    pub total_wait_s: f64,
    pub alive: bool,
}

/// Handle to a task started with [`WorkerPool::submit`].
pub struct TaskHandle<R> {
    rx: mpsc::Receiver<Result<R, String>>,
}

impl<R> TaskHandle<R> {
    /// Block until the task finishes.
    pub fn wait(self) -> Result<R, PoolError> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(PoolError::TaskFailed(msg)),
            Err(_) => Err(PoolError::TaskFailed("task dropped before completion".to_string())),
        }
    }
}

pub struct WorkerPool {
    pool: RwLock<Option<Arc<rayon::ThreadPool>>>,
    max_workers: usize,
    total_tasks: AtomicU64,
    total_wait_us: AtomicU64,
}

impl WorkerPool {
    /// Build a pool with `max_workers` threads (at least one).
    pub fn new(max_workers: usize) -> Result<Self, PoolError> {
        let max_workers = max_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("{THREAD_NAME_PREFIX}-{i}"))
            .build()?;
        info!(max_workers, "Worker pool started");
        Ok(Self {
            pool: RwLock::new(Some(Arc::new(pool))),
            max_workers,
            total_tasks: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
        })
    }

    fn handle(&self) -> Option<Arc<rayon::ThreadPool>> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a single closure on the pool.
    ///
    /// Fails with [`PoolError::ShutDown`] once [`shutdown`](Self::shutdown)
    /// has been called.
    pub fn submit<R, F>(&self, f: F) -> Result<TaskHandle<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.handle().ok_or(PoolError::ShutDown)?;
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f)).map_err(|p| panic_message(p.as_ref()));
            // Receiver may have been dropped; nothing left to report to.
            let _ = tx.send(outcome);
        });
        Ok(TaskHandle { rx })
    }

    /// Run `f` on every item concurrently and collect `item → result`.
    ///
    /// Items whose task panics are logged and left out of the map. An empty
    /// map is returned when the pool has been shut down.
    pub fn map_unordered<K, R, F>(&self, f: F, items: &[K]) -> HashMap<K, R>
    where
        K: Eq + Hash + Clone + Debug + Send + Sync,
        R: Send,
        F: Fn(&K) -> R + Sync,
    {
        if items.is_empty() {
            return HashMap::new();
        }
        let Some(pool) = self.handle() else {
            warn!(items = items.len(), "map_unordered called on a shut down worker pool");
            return HashMap::new();
        };

        let started = Instant::now();
        self.total_tasks.fetch_add(items.len() as u64, Ordering::Relaxed);
        let results: HashMap<K, R> = pool.install(|| {
            items
                .par_iter()
                .filter_map(|item| match catch_unwind(AssertUnwindSafe(|| f(item))) {
                    Ok(result) => Some((item.clone(), result)),
                    Err(payload) => {
                        warn!(
                            item = ?item,
                            error = %panic_message(payload.as_ref()),
                            "WorkerPool task failed, skipping"
                        );
                        None
                    }
                })
                .collect()
        });
        let waited_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.total_wait_us.fetch_add(waited_us, Ordering::Relaxed);
        results
    }

    /// Stop accepting work. Safe to call multiple times.
    ///
    /// In-flight tasks finish; the threads exit once they drain.
    pub fn shutdown(&self) {
        let previous = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("Worker pool shut down");
        }
    }

    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_alive(&self) -> bool {
        self.handle().is_some()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            total_wait_s: self.total_wait_us.load(Ordering::Relaxed) as f64 / 1e6,
            alive: self.is_alive(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_unordered_returns_every_item() {
        let pool = WorkerPool::new(3).expect("pool");
        let items: Vec<u32> = (0..20).collect();
        let results = pool.map_unordered(|x| x * 2, &items);
        assert_eq!(results.len(), 20);
        for x in &items {
            assert_eq!(results[x], x * 2);
        }
        let stats = pool.stats();
        assert_eq!(stats.max_workers, 3);
        assert_eq!(stats.total_tasks, 20);
        assert!(stats.alive);
    }

    #[test]
    fn test_failed_task_is_omitted() {
        let pool = WorkerPool::new(2).expect("pool");
        let items = vec!["ok-1".to_string(), "boom".to_string(), "ok-2".to_string()];
        let results = pool.map_unordered(
            |item: &String| {
                assert!(item != "boom", "simulated failure");
                item.len()
            },
            &items,
        );
        assert_eq!(results.len(), 2);
        assert!(!results.contains_key("boom"));
        assert_eq!(results["ok-1"], 4);
    }

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new(1).expect("pool");
        let handle = pool.submit(|| 40 + 2).expect("submit");
        assert_eq!(handle.wait().expect("task result"), 42);

        let failing = pool.submit(|| -> u8 { panic!("bad task") }).expect("submit");
        match failing.wait() {
            Err(PoolError::TaskFailed(msg)) => assert!(msg.contains("bad task")),
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_shutdown_is_idempotent_and_rejects_submit() {
        let pool = WorkerPool::new(2).expect("pool");
        pool.shutdown();
        pool.shutdown();
        assert!(!pool.is_alive());
        assert!(matches!(pool.submit(|| 1), Err(PoolError::ShutDown)));
        assert!(pool.map_unordered(|x: &u8| *x, &[1, 2]).is_empty());
        assert!(!pool.stats().alive);
    }
}
