//! Shared test doubles: an in-memory store and scriptable spy handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use job_queue::{
    ClassStats, EmailPayload, Job, JobClass, JobHandler, JobId, JobOutcome, JobPayload, JobStatus,
    JobStore, QueueError, Result,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn email_payload() -> EmailPayload {
    EmailPayload {
        to: "auditor@example.com".to_string(),
        from: "noreply@example.com".to_string(),
        subject: "Control review due".to_string(),
        html_body: "<p>Please review.</p>".to_string(),
    }
}

pub fn email_job(max_attempts: u32) -> Job {
    Job::new(JobPayload::Email(email_payload()), None, max_attempts)
}

/// One reschedule observed by the store: the attempt counter on the job and
/// how far in the future it was pushed.
#[derive(Debug, Clone)]
pub struct Reschedule {
    pub job_id: JobId,
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Default)]
struct MemoryInner {
    ready: HashMap<JobClass, VecDeque<Job>>,
    delayed: Vec<Job>,
    records: HashMap<JobId, Job>,
    completed: HashMap<JobClass, u64>,
    failed: HashMap<JobClass, u64>,
    reschedules: Vec<Reschedule>,
}

/// In-memory `JobStore` with the same transition semantics as the durable
/// store, plus inspection helpers for assertions.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: JobId) -> Option<Job> {
        self.inner.lock().unwrap().records.get(&id).cloned()
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.record(id).map(|job| job.status)
    }

    pub fn reschedules(&self) -> Vec<Reschedule> {
        self.inner.lock().unwrap().reschedules.clone()
    }

    pub fn completed_count(&self, class: JobClass) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .completed
            .get(&class)
            .copied()
            .unwrap_or(0)
    }

    pub fn failed_count(&self, class: JobClass) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .failed
            .get(&class)
            .copied()
            .unwrap_or(0)
    }

    /// Pending jobs (ready or delayed) of a class.
    pub fn pending_count(&self, class: JobClass) -> usize {
        let inner = self.inner.lock().unwrap();
        let ready = inner.ready.get(&class).map(|q| q.len()).unwrap_or(0);
        let delayed = inner.delayed.iter().filter(|j| j.class == class).count();
        ready + delayed
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(job.id, job.clone());
        if job.scheduled_at > Utc::now() {
            inner.delayed.push(job.clone());
        } else {
            inner.ready.entry(job.class).or_default().push_back(job.clone());
        }
        Ok(())
    }

    async fn take(&self, class: JobClass) -> Result<Option<Job>> {
        let mut inner = self.inner.lock().unwrap();

        let now = Utc::now();
        let due: Vec<Job> = {
            let (due, pending): (Vec<Job>, Vec<Job>) = inner
                .delayed
                .drain(..)
                .partition(|job| job.scheduled_at <= now);
            inner.delayed = pending;
            due
        };
        for job in due {
            inner.ready.entry(job.class).or_default().push_back(job);
        }

        let Some(mut job) = inner.ready.entry(class).or_default().pop_front() else {
            return Ok(None);
        };

        job.status = JobStatus::Active;
        inner.records.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn mark_completed(&self, job: &Job, value: Option<serde_json::Value>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.records.get(&job.id) {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }

        let mut terminal = job.clone();
        terminal.status = JobStatus::Completed;
        terminal.result = Some(JobOutcome::Success { value });
        inner.records.insert(job.id, terminal);
        *inner.completed.entry(job.class).or_default() += 1;
        Ok(())
    }

    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.records.get(&job.id) {
            if existing.status.is_terminal() {
                return Ok(());
            }
        }

        let mut terminal = job.clone();
        terminal.status = JobStatus::Failed;
        terminal.result = Some(JobOutcome::Error {
            message: error.to_string(),
        });
        inner.records.insert(job.id, terminal);
        *inner.failed.entry(job.class).or_default() += 1;
        Ok(())
    }

    async fn reschedule(&self, job: &Job, run_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let delay = (run_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        inner.reschedules.push(Reschedule {
            job_id: job.id,
            attempt: job.attempt,
            delay,
        });

        let mut next = job.clone();
        next.scheduled_at = run_at;
        inner.records.insert(next.id, next.clone());
        inner.delayed.push(next);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.record(id))
    }

    async fn stats(&self, class: JobClass) -> Result<ClassStats> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        Ok(ClassStats {
            waiting: inner.ready.get(&class).map(|q| q.len()).unwrap_or(0) as u64,
            active: inner
                .records
                .values()
                .filter(|j| j.class == class && j.status == JobStatus::Active)
                .count() as u64,
            completed: inner.completed.get(&class).copied().unwrap_or(0),
            failed: inner.failed.get(&class).copied().unwrap_or(0),
            delayed: inner
                .delayed
                .iter()
                .filter(|j| j.class == class && j.scheduled_at > now)
                .count() as u64,
        })
    }
}

/// Scriptable handler: fails the first `fail_times` invocations, optionally
/// sleeps, and tracks invocation and concurrency counts.
pub struct SpyHandler {
    fail_times: usize,
    sleep: Option<Duration>,
    invocations: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
    seen_attempts: Mutex<Vec<u32>>,
}

impl SpyHandler {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::new(0, None))
    }

    pub fn failing_first(fail_times: usize) -> Arc<Self> {
        Arc::new(Self::new(fail_times, None))
    }

    pub fn always_failing() -> Arc<Self> {
        Arc::new(Self::new(usize::MAX, None))
    }

    pub fn slow(sleep: Duration) -> Arc<Self> {
        Arc::new(Self::new(0, Some(sleep)))
    }

    fn new(fail_times: usize, sleep: Option<Duration>) -> Self {
        Self {
            fail_times,
            sleep,
            invocations: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen_attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seen_attempts(&self) -> Vec<u32> {
        self.seen_attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobHandler for SpyHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        let invocation = self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen_attempts.lock().unwrap().push(job.attempt);

        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        if let Some(sleep) = self.sleep {
            tokio::time::sleep(sleep).await;
        }

        self.current.fetch_sub(1, Ordering::SeqCst);

        if invocation < self.fail_times {
            Err(QueueError::handler(format!(
                "scripted failure on invocation {}",
                invocation
            )))
        } else {
            Ok(Some(serde_json::json!({ "invocation": invocation })))
        }
    }

    fn name(&self) -> &'static str {
        "spy"
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
