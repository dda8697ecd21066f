//! Degraded backing store: log-and-discard.
//!
//! Used when the durable queue is disabled or the broker is unreachable at
//! boot. Every enqueue is accepted, logged loudly, and dropped. Nothing is
//! ever handed to workers, so handlers never run in degraded mode.

use crate::error::Result;
use crate::job::{Job, JobClass, JobId};
use crate::metrics;
use crate::stats::ClassStats;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub struct DiscardStore {
    discarded: AtomicU64,
}

impl DiscardStore {
    pub fn new() -> Self {
        warn!(
            "Job queue running in DEGRADED mode: durable store disabled, \
             all enqueued jobs will be logged and DISCARDED"
        );
        Self {
            discarded: AtomicU64::new(0),
        }
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl Default for DiscardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for DiscardStore {
    async fn put(&self, job: &Job) -> Result<()> {
        let total = self.discarded.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            job_id = %job.id,
            class = %job.class,
            discarded_total = total,
            "DEGRADED queue: job discarded, it will never run"
        );
        metrics::record_discarded(job.class);
        Ok(())
    }

    async fn take(&self, _class: JobClass) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn mark_completed(&self, _job: &Job, _value: Option<serde_json::Value>) -> Result<()> {
        Ok(())
    }

    async fn mark_failed(&self, _job: &Job, _error: &str) -> Result<()> {
        Ok(())
    }

    async fn reschedule(&self, _job: &Job, _run_at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _id: JobId) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn stats(&self, _class: JobClass) -> Result<ClassStats> {
        Ok(ClassStats::default())
    }
}
