//! Job model: classes, typed payloads, status, and the job record itself.
//!
//! Payloads are a closed tagged enum; the worker pool dispatches on the tag.
//! Each class carries its own policy defaults (attempts, backoff base,
//! concurrency, execution timeout) which configuration may override.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// Job identifier, assigned at enqueue time.
pub type JobId = Uuid;

/// The category of background work. Fixed at creation, never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobClass {
    /// Outbound email delivery.
    Email,
    /// PDF/document text extraction (CPU-bound).
    DocumentExtraction,
    /// AI-completion calls against a rate-limited external endpoint.
    AiCompletion,
}

impl JobClass {
    /// Get all job class variants.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Redis stream name for this class.
    pub fn stream(&self) -> String {
        format!("jobs:{}", self.as_ref())
    }

    /// Consumer group name for this class.
    pub fn consumer_group(&self) -> String {
        format!("{}_workers", self.as_ref())
    }

    /// Delayed-job sorted set for this class (backoff and enqueue delays).
    pub fn delayed_set(&self) -> String {
        format!("jobs:{}:delayed", self.as_ref())
    }

    /// Dead letter stream for this class.
    pub fn dlq_stream(&self) -> String {
        format!("jobs:{}:dlq", self.as_ref())
    }

    /// Default attempt ceiling before a job is marked Failed.
    pub fn default_max_attempts(&self) -> u32 {
        match self {
            JobClass::Email => 3,
            JobClass::DocumentExtraction => 2,
            JobClass::AiCompletion => 2,
        }
    }

    /// Default number of concurrent pull loops for this class.
    pub fn default_concurrency(&self) -> usize {
        match self {
            JobClass::Email => 5,
            JobClass::DocumentExtraction => 3,
            JobClass::AiCompletion => 2,
        }
    }

    /// Base delay for exponential retry backoff.
    pub fn default_base_delay(&self) -> Duration {
        match self {
            JobClass::Email => Duration::from_secs(5),
            JobClass::DocumentExtraction => Duration::from_secs(10),
            JobClass::AiCompletion => Duration::from_secs(15),
        }
    }

    /// Per-invocation execution timeout for handlers of this class.
    pub fn default_execution_timeout(&self) -> Duration {
        match self {
            JobClass::Email => Duration::from_secs(30),
            JobClass::DocumentExtraction => Duration::from_secs(120),
            JobClass::AiCompletion => Duration::from_secs(60),
        }
    }
}

/// Payload for an outbound email job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Recipient address.
    pub to: String,
    /// Sender address.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Rendered HTML body.
    pub html_body: String,
}

/// Payload for a document text-extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentExtractionPayload {
    /// Raw file content.
    pub file_bytes: Vec<u8>,
    /// Original file name.
    pub file_name: String,
    /// MIME type of the uploaded file.
    pub mime_type: String,
    /// User who requested the extraction.
    pub requesting_user_id: Uuid,
}

/// Payload for an AI-completion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiCompletionPayload {
    /// Prompt text.
    pub prompt: String,
    /// Optional additional context prepended to the prompt.
    pub context: Option<String>,
    /// User who requested the completion.
    pub requesting_user_id: Uuid,
}

/// Closed union over all job payloads, tagged by class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum JobPayload {
    Email(EmailPayload),
    DocumentExtraction(DocumentExtractionPayload),
    AiCompletion(AiCompletionPayload),
}

impl JobPayload {
    /// The job class this payload belongs to.
    pub fn class(&self) -> JobClass {
        match self {
            JobPayload::Email(_) => JobClass::Email,
            JobPayload::DocumentExtraction(_) => JobClass::DocumentExtraction,
            JobPayload::AiCompletion(_) => JobClass::AiCompletion,
        }
    }
}

/// Job lifecycle status.
///
/// Transitions: Pending -> Active -> {Completed | Pending | Failed}.
/// Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for pickup (includes delayed/backoff jobs).
    Pending,
    /// Claimed by a worker, handler running.
    Active,
    /// Handler succeeded.
    Completed,
    /// Attempts exhausted.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Terminal result of a job, recorded on the Completed/Failed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Handler succeeded, optionally with a result value.
    Success { value: Option<serde_json::Value> },
    /// Attempts exhausted; the last handler error.
    Error { message: String },
}

/// Per-enqueue overrides.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Minimum delay before the job becomes eligible for pickup.
    pub delay: Option<Duration>,
    /// Override of the class-default attempt ceiling.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// One unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at enqueue time.
    pub id: JobId,
    /// Job class (matches the payload tag).
    pub class: JobClass,
    /// Class-specific payload.
    pub payload: JobPayload,
    /// Failures so far; starts at 0.
    pub attempt: u32,
    /// Attempt ceiling for this job.
    pub max_attempts: u32,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// When the job was created.
    pub enqueued_at: DateTime<Utc>,
    /// When the job becomes eligible for pickup.
    pub scheduled_at: DateTime<Utc>,
    /// Terminal result, if any.
    pub result: Option<JobOutcome>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(payload: JobPayload, delay: Option<Duration>, max_attempts: u32) -> Self {
        let class = payload.class();
        let now = Utc::now();
        let scheduled_at = match delay {
            Some(d) => now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()),
            None => now,
        };

        Self {
            id: Uuid::new_v4(),
            class,
            payload,
            attempt: 0,
            max_attempts,
            status: JobStatus::Pending,
            enqueued_at: now,
            scheduled_at,
            result: None,
        }
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn attempts_remaining(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// The job as it should be re-queued after a failure: incremented
    /// attempt, back to Pending.
    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self.status = JobStatus::Pending;
        self
    }
}
