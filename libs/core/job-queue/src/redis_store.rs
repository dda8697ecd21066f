//! Durable backing store on Redis Streams.
//!
//! Layout per job class:
//! - `jobs:{class}` - stream of ready jobs, consumed through a consumer group
//! - `jobs:{class}:delayed` - sorted set of not-yet-eligible jobs, scored by
//!   their scheduled time in epoch milliseconds
//! - `jobs:{class}:dlq` - dead letter stream for exhausted and unparseable jobs
//! - `jobs:record:{id}` - hash holding the job record (terminal records expire)
//!
//! Eligible jobs are promoted from the delayed set into the stream by the
//! consumers themselves on each `take`, so no separate scheduler process is
//! needed.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobClass, JobId, JobOutcome, JobStatus};
use crate::stats::ClassStats;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How many delayed jobs one take() promotes at most.
const PROMOTE_BATCH: usize = 64;

const CONNECT_ATTEMPTS: u32 = 5;

fn record_key(id: JobId) -> String {
    format!("jobs:record:{}", id)
}

fn completed_counter(class: JobClass) -> String {
    format!("jobs:{}:completed_total", class.as_ref())
}

fn failed_counter(class: JobClass) -> String {
    format!("jobs:{}:failed_total", class.as_ref())
}

/// Stream entry currently held by this consumer, keyed by job id.
struct InFlight {
    class: JobClass,
    entry_id: String,
}

/// Idle threshold for reclaiming entries from dead consumers.
///
/// An entry's idle clock keeps running while its handler executes, so the
/// threshold must sit above the largest per-class execution timeout or a
/// peer would claim a job whose handler is merely slow and run it a second
/// time.
fn effective_claim_idle_ms(config: &QueueConfig) -> u64 {
    let max_timeout_ms = JobClass::all()
        .map(|class| config.class(class).execution_timeout.as_millis() as u64)
        .max()
        .unwrap_or(0);

    if config.claim_idle_ms > max_timeout_ms {
        config.claim_idle_ms
    } else {
        max_timeout_ms * 2
    }
}

pub struct RedisJobStore {
    redis: Arc<ConnectionManager>,
    config: QueueConfig,
    claim_idle_ms: u64,
    in_flight: Mutex<HashMap<JobId, InFlight>>,
    /// Entries reclaimed from dead consumers, drained before reading new ones.
    claimed: Mutex<HashMap<JobClass, VecDeque<(String, Job)>>>,
    /// Last reclaim scan per class, to rate-limit XPENDING polling.
    last_claim: Mutex<HashMap<JobClass, std::time::Instant>>,
}

impl RedisJobStore {
    /// Connect to the broker and create the per-class consumer groups.
    ///
    /// Retries the initial connection with exponential backoff; a broker that
    /// stays unreachable fails the bootstrap.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let redis_config = config
            .redis
            .as_ref()
            .ok_or_else(|| QueueError::Config("durable store requires Redis settings".into()))?;

        let client = redis::Client::open(redis_config.url())
            .map_err(QueueError::Redis)?;

        let mut attempt = 0u32;
        let manager = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => break manager,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    attempt += 1;
                    let backoff = Duration::from_millis(500 * 2u64.saturating_pow(attempt));
                    warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Redis connection failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        };

        let claim_idle_ms = effective_claim_idle_ms(config);
        if claim_idle_ms != config.claim_idle_ms {
            warn!(
                configured_ms = config.claim_idle_ms,
                effective_ms = claim_idle_ms,
                "Configured claim idle is within an execution timeout, raising it"
            );
        }

        let store = Self {
            redis: Arc::new(manager),
            config: config.clone(),
            claim_idle_ms,
            in_flight: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashMap::new()),
            last_claim: Mutex::new(HashMap::new()),
        };

        for class in JobClass::all() {
            store.ensure_consumer_group(class).await?;
        }

        info!(consumer_id = %config.consumer_id, "Connected to Redis job store");
        Ok(store)
    }

    async fn ensure_consumer_group(&self, class: JobClass) -> Result<()> {
        let mut conn = (*self.redis).clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(class.stream())
            .arg(class.consumer_group())
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream = %class.stream(), group = %class.consumer_group(), "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %class.stream(), "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    async fn write_record(&self, job: &Job) -> Result<()> {
        let mut conn = (*self.redis).clone();
        let json = serde_json::to_string(job)?;

        let _: () = redis::cmd("HSET")
            .arg(record_key(job.id))
            .arg("data")
            .arg(&json)
            .arg("status")
            .arg(job.status.as_ref())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn record_status(&self, id: JobId) -> Result<Option<JobStatus>> {
        let mut conn = (*self.redis).clone();
        let status: Option<String> = conn.hget(record_key(id), "status").await?;
        Ok(status.and_then(|s| s.parse().ok()))
    }

    async fn add_to_stream(&self, job: &Job) -> Result<String> {
        let mut conn = (*self.redis).clone();
        let json = serde_json::to_string(job)?;

        // MAXLEN ~ for approximate trimming (more efficient)
        let entry_id: String = redis::cmd("XADD")
            .arg(job.class.stream())
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_stream_length)
            .arg("*")
            .arg("job")
            .arg(&json)
            .query_async(&mut conn)
            .await?;

        Ok(entry_id)
    }

    /// Move due entries from the delayed set into the ready stream.
    async fn promote_due(&self, class: JobClass) -> Result<()> {
        let mut conn = (*self.redis).clone();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(class.delayed_set())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        for member in due {
            // ZREM first so two consumers racing on the same member promote
            // it exactly once.
            let removed: i64 = conn.zrem(class.delayed_set(), &member).await?;
            if removed == 0 {
                continue;
            }

            match serde_json::from_str::<Job>(&member) {
                Ok(job) => {
                    self.add_to_stream(&job).await?;
                    debug!(job_id = %job.id, class = %class, "Promoted delayed job");
                }
                Err(e) => {
                    warn!(class = %class, error = %e, "Unparseable delayed entry, dropping to DLQ");
                    self.dead_letter_raw(class, &member, "unparseable delayed entry")
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Reclaim entries stuck pending on dead consumers. Rate-limited per
    /// class; reclaimed entries land in the local buffer.
    async fn claim_stale(&self, class: JobClass) -> Result<()> {
        {
            let mut last = self.last_claim.lock().await;
            let now = std::time::Instant::now();
            match last.get(&class) {
                Some(prev) if now.duration_since(*prev).as_millis() < self.claim_idle_ms as u128 => {
                    return Ok(());
                }
                _ => {
                    last.insert(class, now);
                }
            }
        }

        let mut conn = (*self.redis).clone();

        let pending: RedisResult<Vec<(String, String, i64, i64)>> = redis::cmd("XPENDING")
            .arg(class.stream())
            .arg(class.consumer_group())
            .arg("-")
            .arg("+")
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await;

        let pending = match pending {
            Ok(p) => p,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(()),
            Err(e) => return Err(QueueError::Redis(e)),
        };

        let claim_ids: Vec<String> = pending
            .iter()
            .filter(|(_, consumer, idle, _)| {
                *consumer != self.config.consumer_id && *idle > self.claim_idle_ms as i64
            })
            .map(|(id, _, _, _)| id.clone())
            .collect();

        if claim_ids.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(class.stream())
            .arg(class.consumer_group())
            .arg(&self.config.consumer_id)
            .arg(self.claim_idle_ms);
        for id in &claim_ids {
            cmd.arg(id);
        }

        let entries: Vec<(String, Vec<(String, String)>)> = cmd.query_async(&mut conn).await?;
        if entries.is_empty() {
            return Ok(());
        }

        warn!(class = %class, count = entries.len(), "Claimed abandoned jobs");

        let parsed = self.parse_entries(class, entries).await?;
        let mut claimed = self.claimed.lock().await;
        claimed.entry(class).or_default().extend(parsed);

        Ok(())
    }

    async fn read_new(&self, class: JobClass) -> Result<Option<(String, Job)>> {
        let mut conn = (*self.redis).clone();

        let result: RedisResult<Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>>> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(class.consumer_group())
                .arg(&self.config.consumer_id)
                .arg("BLOCK")
                .arg(self.config.block_timeout_ms)
                .arg("COUNT")
                .arg(1)
                .arg("STREAMS")
                .arg(class.stream())
                .arg(">")
                .query_async(&mut conn)
                .await;

        let streams = match result {
            Ok(Some(streams)) => streams,
            Ok(None) => return Ok(None),
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(None),
            Err(e) => return Err(QueueError::Redis(e)),
        };

        for (_stream, entries) in streams {
            let mut parsed = self.parse_entries(class, entries).await?;
            if let Some(first) = parsed.pop_front() {
                // COUNT 1, so at most one entry survives parsing.
                return Ok(Some(first));
            }
        }

        Ok(None)
    }

    /// Parse stream entries; unparseable ones go to the DLQ and are acked so
    /// they never wedge the group.
    async fn parse_entries(
        &self,
        class: JobClass,
        entries: Vec<(String, Vec<(String, String)>)>,
    ) -> Result<VecDeque<(String, Job)>> {
        let mut jobs = VecDeque::new();

        for (entry_id, fields) in entries {
            let json = fields
                .iter()
                .find(|(k, _)| k == "job")
                .map(|(_, v)| v.as_str());

            let Some(json) = json else {
                warn!(entry_id = %entry_id, class = %class, "Missing 'job' field in entry");
                self.dead_letter_raw(class, "", "missing job field").await?;
                self.ack(class, &entry_id).await?;
                continue;
            };

            match serde_json::from_str::<Job>(json) {
                Ok(job) => jobs.push_back((entry_id, job)),
                Err(e) => {
                    warn!(entry_id = %entry_id, class = %class, error = %e, "Unparseable job entry");
                    self.dead_letter_raw(class, json, &e.to_string()).await?;
                    self.ack(class, &entry_id).await?;
                }
            }
        }

        Ok(jobs)
    }

    async fn ack(&self, class: JobClass, entry_id: &str) -> Result<()> {
        let mut conn = (*self.redis).clone();

        let _: i64 = redis::cmd("XACK")
            .arg(class.stream())
            .arg(class.consumer_group())
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;

        let _: i64 = redis::cmd("XDEL")
            .arg(class.stream())
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn dead_letter_raw(&self, class: JobClass, payload: &str, error: &str) -> Result<()> {
        let mut conn = (*self.redis).clone();

        let _: String = redis::cmd("XADD")
            .arg(class.dlq_stream())
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.dlq_max_length)
            .arg("*")
            .arg("job")
            .arg(payload)
            .arg("error")
            .arg(error)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Ack the stream entry for a job we hold, if any.
    async fn release_entry(&self, id: JobId) -> Result<()> {
        let entry = self.in_flight.lock().await.remove(&id);
        if let Some(entry) = entry {
            self.ack(entry.class, &entry.entry_id).await?;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        job: &Job,
        status: JobStatus,
        outcome: &JobOutcome,
        counter: String,
    ) -> Result<bool> {
        self.release_entry(job.id).await?;

        // Idempotence: a record already terminal keeps its first outcome.
        if let Some(existing) = self.record_status(job.id).await? {
            if existing.is_terminal() {
                debug!(job_id = %job.id, status = %existing, "Job already terminal, skipping");
                return Ok(false);
            }
        }

        let mut terminal = job.clone();
        terminal.status = status;
        terminal.result = Some(outcome.clone());
        self.write_record(&terminal).await?;

        let mut conn = (*self.redis).clone();
        let _: () = conn
            .expire(record_key(job.id), self.config.retention_secs as i64)
            .await?;
        let _: i64 = conn.incr(counter, 1).await?;

        Ok(true)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn put(&self, job: &Job) -> Result<()> {
        self.write_record(job).await?;

        if job.scheduled_at > Utc::now() {
            let mut conn = (*self.redis).clone();
            let json = serde_json::to_string(job)?;
            let _: () = conn
                .zadd(
                    job.class.delayed_set(),
                    json,
                    job.scheduled_at.timestamp_millis(),
                )
                .await?;
            debug!(job_id = %job.id, class = %job.class, scheduled_at = %job.scheduled_at, "Enqueued delayed job");
        } else {
            let entry_id = self.add_to_stream(job).await?;
            debug!(job_id = %job.id, class = %job.class, entry_id = %entry_id, "Enqueued job");
        }

        Ok(())
    }

    async fn take(&self, class: JobClass) -> Result<Option<Job>> {
        self.promote_due(class).await?;
        self.claim_stale(class).await?;

        let buffered = self.claimed.lock().await.get_mut(&class).and_then(|q| q.pop_front());
        let next = match buffered {
            Some(entry) => Some(entry),
            None => self.read_new(class).await?,
        };

        let Some((entry_id, mut job)) = next else {
            return Ok(None);
        };

        job.status = JobStatus::Active;
        self.write_record(&job).await?;
        self.in_flight
            .lock()
            .await
            .insert(job.id, InFlight { class, entry_id });

        Ok(Some(job))
    }

    async fn mark_completed(&self, job: &Job, value: Option<serde_json::Value>) -> Result<()> {
        let outcome = JobOutcome::Success { value };
        if self
            .finalize(job, JobStatus::Completed, &outcome, completed_counter(job.class))
            .await?
        {
            debug!(job_id = %job.id, class = %job.class, attempt = job.attempt, "Job completed");
        }
        Ok(())
    }

    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()> {
        let outcome = JobOutcome::Error {
            message: error.to_string(),
        };
        if self
            .finalize(job, JobStatus::Failed, &outcome, failed_counter(job.class))
            .await?
        {
            let json = serde_json::to_string(job)?;
            self.dead_letter_raw(job.class, &json, error).await?;
            error!(
                job_id = %job.id,
                class = %job.class,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                error = %error,
                "Job failed permanently, moved to DLQ"
            );
        }
        Ok(())
    }

    async fn reschedule(&self, job: &Job, run_at: DateTime<Utc>) -> Result<()> {
        self.release_entry(job.id).await?;

        let mut next = job.clone();
        next.scheduled_at = run_at;
        self.write_record(&next).await?;

        let mut conn = (*self.redis).clone();
        let json = serde_json::to_string(&next)?;
        let _: () = conn
            .zadd(next.class.delayed_set(), json, run_at.timestamp_millis())
            .await?;

        debug!(
            job_id = %next.id,
            class = %next.class,
            attempt = next.attempt,
            run_at = %run_at,
            "Rescheduled job for retry"
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = (*self.redis).clone();
        let json: Option<String> = conn.hget(record_key(id), "data").await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn stats(&self, class: JobClass) -> Result<ClassStats> {
        let mut conn = (*self.redis).clone();

        let length: i64 = conn.xlen(class.stream()).await?;

        let pending: RedisResult<(i64, Option<String>, Option<String>, Option<Vec<(String, i64)>>)> =
            redis::cmd("XPENDING")
                .arg(class.stream())
                .arg(class.consumer_group())
                .query_async(&mut conn)
                .await;
        let active = pending.map(|(count, _, _, _)| count).unwrap_or(0).max(0) as u64;

        let delayed: i64 = conn.zcard(class.delayed_set()).await?;
        let completed: Option<u64> = conn.get(completed_counter(class)).await?;
        let failed: Option<u64> = conn.get(failed_counter(class)).await?;

        Ok(ClassStats {
            waiting: (length.max(0) as u64).saturating_sub(active),
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            delayed: delayed.max(0) as u64,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = (*self.redis).clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let held = self.in_flight.lock().await.len();
        if held > 0 {
            warn!(held, "Closing store with unacked entries, they will be reclaimed");
        }
        info!("Redis job store closed");
        Ok(())
    }
}
