//! Backing store abstraction.
//!
//! The queue talks to its store through `JobStore`; the concrete
//! implementation (durable Redis or degraded discard) is chosen once, on
//! first use, and never re-evaluated for the process lifetime.

use crate::config::QueueConfig;
use crate::discard_store::DiscardStore;
use crate::error::Result;
use crate::job::{Job, JobClass, JobId};
use crate::redis_store::RedisJobStore;
use crate::stats::ClassStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Persistence operations the queue needs from its backing store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job, immediately eligible or delayed per its
    /// `scheduled_at`.
    async fn put(&self, job: &Job) -> Result<()>;

    /// Claim the next eligible job of a class, transitioning it to Active.
    /// Returns None when nothing is ready.
    async fn take(&self, class: JobClass) -> Result<Option<Job>>;

    /// Record a successful terminal transition. Idempotent: repeated calls
    /// for the same job must not duplicate effects.
    async fn mark_completed(&self, job: &Job, value: Option<serde_json::Value>) -> Result<()>;

    /// Record a failed terminal transition (attempts exhausted). Idempotent.
    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()>;

    /// Re-queue a job for a later attempt at `run_at`.
    async fn reschedule(&self, job: &Job, run_at: DateTime<Utc>) -> Result<()>;

    /// Fetch a job record by id, if still retained.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Current per-class counts.
    async fn stats(&self, class: JobClass) -> Result<ClassStats>;

    /// Liveness check against the underlying broker.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Release store resources. Called after workers have drained.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Lazily-initialized handle to the process-wide store.
///
/// Construction is cheap and infallible; the expensive connect happens on
/// the first `get()` and is raced safely by concurrent callers. The losing
/// callers await the winner's result, so exactly one store is ever built.
pub struct StoreHandle {
    config: QueueConfig,
    cell: OnceCell<Arc<dyn JobStore>>,
}

impl StoreHandle {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            cell: OnceCell::new(),
        }
    }

    /// A handle pre-seeded with a store, bypassing bootstrap. Used by tests
    /// and embedders that manage their own store.
    pub fn preset(config: QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            cell: OnceCell::new_with(Some(store)),
        }
    }

    /// The store, bootstrapping it on first call.
    pub async fn get(&self) -> Result<Arc<dyn JobStore>> {
        self.cell
            .get_or_try_init(|| async {
                let store = build_store(&self.config).await?;
                Ok(store)
            })
            .await
            .cloned()
    }

    /// Whether bootstrap has already happened.
    pub fn initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

async fn build_store(config: &QueueConfig) -> Result<Arc<dyn JobStore>> {
    if config.durable {
        let store = RedisJobStore::connect(config).await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(DiscardStore::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_degraded_config_builds_discard_store() {
        let handle = StoreHandle::new(QueueConfig::degraded());
        assert!(!handle.initialized());

        let store = handle.get().await.unwrap();
        assert!(handle.initialized());

        // Degraded store accepts and discards.
        let job = Job::new(
            crate::job::JobPayload::Email(crate::job::EmailPayload {
                to: "a@b.com".into(),
                from: "noreply@example.com".into(),
                subject: "s".into(),
                html_body: "b".into(),
            }),
            None,
            3,
        );
        store.put(&job).await.unwrap();
        assert!(store.take(JobClass::Email).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_initializes_once() {
        let handle = Arc::new(StoreHandle::new(QueueConfig::degraded()));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move { handle.get().await.unwrap() }));
        }

        let stores: Vec<_> = join_all(tasks).await;
        let first = &stores[0];
        for store in &stores {
            assert!(Arc::ptr_eq(first, store));
        }
    }

    async fn join_all(
        tasks: Vec<tokio::task::JoinHandle<Arc<dyn JobStore>>>,
    ) -> Vec<Arc<dyn JobStore>> {
        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(task.await.unwrap());
        }
        out
    }
}
