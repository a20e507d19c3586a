//! Bounded worker pool.
//!
//! Every task is spawned up front and waits for a semaphore permit, so at
//! most `max_concurrency` tasks are in flight and the rest queue in FIFO
//! order. A failed task never cancels its siblings: [`WorkerPool::run`]
//! returns only after the whole pool drained.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Progress reports list in-flight keys once fewer than this many remain.
const LIST_REMAINING_BELOW: usize = 10;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Label used in progress lines, e.g. "builds" or "tests".
    pub label: &'static str,
    pub max_concurrency: usize,
    pub progress_interval: Duration,
}

impl PoolConfig {
    pub fn new(label: &'static str, max_concurrency: usize) -> Self {
        Self {
            label,
            max_concurrency,
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Shared counters, readable while the pool drains.
#[derive(Debug, Default)]
struct Progress {
    completed: AtomicUsize,
    active: Mutex<BTreeSet<String>>,
}

impl Progress {
    fn start(&self, key: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(key.to_string());
        }
    }

    fn finish(&self, key: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(key);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn active(&self) -> Vec<String> {
        self.active
            .lock()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct WorkerPool {
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.max_concurrency == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "{} concurrency must be at least 1",
                config.label
            )));
        }
        Ok(Self { config })
    }

    /// Run `task` once per item, keyed by `key`. Items with a key already
    /// seen are skipped. Results come back in completion order.
    pub async fn run<I, T, K, F, Fut>(&self, items: Vec<I>, key: K, task: F) -> Result<Vec<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        K: Fn(&I) -> String,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let label = self.config.label;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let progress = Arc::new(Progress::default());
        let task = Arc::new(task);

        let mut seen = HashSet::new();
        let mut join_set = JoinSet::new();
        for item in items {
            let item_key = key(&item);
            if !seen.insert(item_key.clone()) {
                warn!(key = %item_key, "duplicate {label} task skipped");
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let progress = Arc::clone(&progress);
            let task = Arc::clone(&task);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                progress.start(&item_key);
                let output = task(item).await;
                progress.finish(&item_key);
                debug!(key = %item_key, "finished {label} task");
                output
            });
        }

        let total = seen.len();
        let mut results = Vec::with_capacity(total);
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok(output)) => results.push(output),
                    Some(Err(e)) => {
                        // Drain the rest before surfacing the panic.
                        while join_set.join_next().await.is_some() {}
                        return Err(PipelineError::WorkerPanicked(e.to_string()));
                    }
                    None => break,
                },
                _ = ticker.tick() => self.report(total, &progress),
            }
        }

        info!("all {total} {label} tasks have completed");
        Ok(results)
    }

    fn report(&self, total: usize, progress: &Progress) {
        let label = self.config.label;
        let completed = progress.completed.load(Ordering::SeqCst);
        let active = progress.active();
        let pending = total.saturating_sub(completed + active.len());
        info!(
            "{completed}/{total} {label} completed. Active: {}, Pending: {pending}",
            active.len()
        );
        if total - completed < LIST_REMAINING_BELOW && !active.is_empty() {
            info!("remaining {label}:\n   - {}", active.join("\n   - "));
        }
    }
}
