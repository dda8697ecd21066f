//! Per-class worker pool.
//!
//! Each pool runs a fixed number of pull loops against the store, so a class
//! can never exceed its configured concurrency. Handler invocations are
//! wrapped in the class execution timeout; a timeout counts as a failed
//! attempt and goes through the same retry path as a handler error.

use crate::config::ClassConfig;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobClass};
use crate::metrics;
use crate::policy::RetryPolicy;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Processes jobs of one class.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one job. A returned value is recorded on the Completed record.
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>>;

    /// Handler name for logs.
    fn name(&self) -> &'static str;
}

/// Worker pool for a single job class.
pub struct WorkerPool {
    class: JobClass,
    handler: Arc<dyn JobHandler>,
    store: Arc<dyn JobStore>,
    config: ClassConfig,
    poll_interval: Duration,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        class: JobClass,
        handler: Arc<dyn JobHandler>,
        store: Arc<dyn JobStore>,
        config: ClassConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            class,
            handler,
            store,
            config,
            poll_interval,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share an externally-owned in-flight counter, so the lifecycle
    /// coordinator can observe drain progress.
    pub fn with_active(mut self, active: Arc<AtomicUsize>) -> Self {
        self.active = active;
        self
    }

    /// Jobs currently being processed by this pool.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.base_delay, self.config.max_attempts)
    }

    /// Run the pool until shutdown is signalled, then drain in-flight jobs.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            class = %self.class,
            handler = self.handler.name(),
            concurrency = self.config.concurrency,
            "Worker pool starting"
        );

        let mut workers = JoinSet::new();
        for worker_idx in 0..self.config.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                pool.pull_loop(worker_idx, shutdown).await;
            });
        }

        while workers.join_next().await.is_some() {}
        info!(class = %self.class, "Worker pool stopped");
    }

    async fn pull_loop(&self, worker_idx: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(class = %self.class, worker_idx, "Pull loop started");

        let mut consecutive_errors = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.take(self.class).await {
                Ok(Some(job)) => {
                    consecutive_errors = 0;
                    self.process(job).await;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff = self
                        .poll_interval
                        .saturating_mul(2u32.saturating_pow(consecutive_errors.min(6)));
                    error!(
                        class = %self.class,
                        worker_idx,
                        error = %e,
                        consecutive_errors,
                        "Failed to pull job, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        debug!(class = %self.class, worker_idx, "Pull loop exited");
    }

    async fn process(&self, job: Job) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active(self.class, active);

        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(self.config.execution_timeout, self.handler.handle(&job)).await;

        let result = match outcome {
            Ok(Ok(value)) => {
                let elapsed = started.elapsed();
                debug!(
                    job_id = %job.id,
                    class = %self.class,
                    attempt = job.attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
                metrics::record_completed(self.class, elapsed);
                self.store.mark_completed(&job, value).await
            }
            Ok(Err(e)) => self.handle_failure(job, e).await,
            Err(_) => {
                metrics::record_timeout(self.class);
                let timeout = QueueError::Timeout {
                    class: self.class,
                    elapsed_ms: self.config.execution_timeout.as_millis() as u64,
                };
                self.handle_failure(job, timeout).await
            }
        };

        if let Err(e) = result {
            error!(class = %self.class, error = %e, "Failed to record job outcome");
        }

        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active(self.class, active);
    }

    /// Retry with backoff while attempts remain, otherwise mark Failed.
    async fn handle_failure(&self, job: Job, err: QueueError) -> Result<()> {
        if job.attempts_remaining() {
            let next = job.next_attempt();
            let delay = self.retry_policy().delay_for_attempt(next.attempt);
            let run_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            warn!(
                job_id = %next.id,
                class = %self.class,
                attempt = next.attempt,
                max_attempts = next.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Job failed, scheduling retry"
            );
            metrics::record_retry(self.class);
            self.store.reschedule(&next, run_at).await
        } else {
            metrics::record_failed(self.class);
            self.store.mark_failed(&job, &err.to_string()).await
        }
    }
}
