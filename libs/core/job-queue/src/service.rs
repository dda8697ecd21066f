//! Producer API.
//!
//! One typed method per job class. Enqueue never runs the job inline: it
//! persists the record and returns the id. The backing store bootstraps
//! lazily on the first call, so constructing a `QueueService` is free.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::{
    AiCompletionPayload, DocumentExtractionPayload, EmailPayload, EnqueueOptions, Job, JobId,
    JobPayload,
};
use crate::metrics;
use crate::store::StoreHandle;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct QueueService {
    store: Arc<StoreHandle>,
}

impl QueueService {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            store: Arc::new(StoreHandle::new(config)),
        }
    }

    /// Build a service over an existing store handle. The handle is shared
    /// with the worker side so both see the same store.
    pub(crate) fn from_handle(store: Arc<StoreHandle>) -> Self {
        Self { store }
    }

    /// Queue an email for delivery.
    pub async fn enqueue_email(
        &self,
        payload: EmailPayload,
        options: EnqueueOptions,
    ) -> Result<JobId> {
        self.enqueue(JobPayload::Email(payload), options).await
    }

    /// Queue a document for text extraction.
    pub async fn enqueue_document_extraction(
        &self,
        payload: DocumentExtractionPayload,
        options: EnqueueOptions,
    ) -> Result<JobId> {
        self.enqueue(JobPayload::DocumentExtraction(payload), options)
            .await
    }

    /// Queue an AI completion request.
    pub async fn enqueue_ai_completion(
        &self,
        payload: AiCompletionPayload,
        options: EnqueueOptions,
    ) -> Result<JobId> {
        self.enqueue(JobPayload::AiCompletion(payload), options)
            .await
    }

    async fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<JobId> {
        let class = payload.class();
        let max_attempts = options
            .max_attempts
            .unwrap_or_else(|| self.store.config().class(class).max_attempts);

        let job = Job::new(payload, options.delay, max_attempts);
        let id = job.id;

        self.store.get().await?.put(&job).await?;
        metrics::record_enqueued(class);
        debug!(job_id = %id, class = %class, max_attempts, "Job enqueued");

        Ok(id)
    }
}
