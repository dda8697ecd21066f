//! Job handlers for the three background job classes.
//!
//! Each handler is a thin adapter between the queue and a provider trait, so
//! the real integrations (SMTP relay, extraction engine, model endpoint) can
//! be swapped without touching queue code. The default providers log and
//! return synthetic results, which is what local development runs on.

use async_trait::async_trait;
use job_queue::{
    AiCompletionPayload, DocumentExtractionPayload, EmailPayload, Job, JobHandler, JobPayload,
    QueueError, Result,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outbound email delivery.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send one email, returning the provider message id.
    async fn send(&self, payload: &EmailPayload) -> Result<String>;
}

/// Development sender: logs the email instead of delivering it.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, payload: &EmailPayload) -> Result<String> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            to = %payload.to,
            subject = %payload.subject,
            message_id = %message_id,
            "Email logged instead of sent (no delivery provider configured)"
        );
        Ok(message_id)
    }
}

pub struct EmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl EmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

impl Default for EmailHandler {
    fn default() -> Self {
        Self::new(Arc::new(LogEmailSender))
    }
}

#[async_trait]
impl JobHandler for EmailHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        let JobPayload::Email(payload) = &job.payload else {
            return Err(QueueError::Handler(format!(
                "email handler received {} payload",
                job.payload.class()
            )));
        };

        if payload.to.trim().is_empty() {
            return Err(QueueError::Handler("empty recipient address".into()));
        }

        let message_id = self.sender.send(payload).await?;
        Ok(Some(serde_json::json!({ "message_id": message_id })))
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

/// Document text extraction.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, payload: &DocumentExtractionPayload) -> Result<String>;
}

/// Development extractor: decodes `text/*` uploads, anything else yields an
/// empty extraction with a warning.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, payload: &DocumentExtractionPayload) -> Result<String> {
        if payload.mime_type.starts_with("text/") {
            String::from_utf8(payload.file_bytes.clone())
                .map_err(|e| QueueError::Handler(format!("invalid UTF-8 in {}: {e}", payload.file_name)))
        } else {
            warn!(
                file = %payload.file_name,
                mime_type = %payload.mime_type,
                "No extractor for this MIME type, returning empty text"
            );
            Ok(String::new())
        }
    }
}

pub struct DocumentExtractionHandler {
    extractor: Arc<dyn TextExtractor>,
}

impl DocumentExtractionHandler {
    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        Self { extractor }
    }
}

impl Default for DocumentExtractionHandler {
    fn default() -> Self {
        Self::new(Arc::new(PlainTextExtractor))
    }
}

#[async_trait]
impl JobHandler for DocumentExtractionHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        let JobPayload::DocumentExtraction(payload) = &job.payload else {
            return Err(QueueError::Handler(format!(
                "extraction handler received {} payload",
                job.payload.class()
            )));
        };

        let text = self.extractor.extract(payload).await?;
        info!(
            file = %payload.file_name,
            user_id = %payload.requesting_user_id,
            chars = text.len(),
            "Document extracted"
        );

        Ok(Some(serde_json::json!({
            "file_name": payload.file_name,
            "chars": text.len(),
            "text": text,
        })))
    }

    fn name(&self) -> &'static str {
        "document_extraction"
    }
}

/// AI completion calls.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Development client: echoes a canned response.
pub struct EchoCompletionClient;

#[async_trait]
impl CompletionClient for EchoCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        info!(prompt_chars = prompt.len(), "Echoing completion (no model endpoint configured)");
        Ok(format!("[echo] {prompt}"))
    }
}

pub struct AiCompletionHandler {
    client: Arc<dyn CompletionClient>,
}

impl AiCompletionHandler {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    fn full_prompt(payload: &AiCompletionPayload) -> String {
        match &payload.context {
            Some(context) => format!("{context}\n\n{}", payload.prompt),
            None => payload.prompt.clone(),
        }
    }
}

impl Default for AiCompletionHandler {
    fn default() -> Self {
        Self::new(Arc::new(EchoCompletionClient))
    }
}

#[async_trait]
impl JobHandler for AiCompletionHandler {
    async fn handle(&self, job: &Job) -> Result<Option<serde_json::Value>> {
        let JobPayload::AiCompletion(payload) = &job.payload else {
            return Err(QueueError::Handler(format!(
                "completion handler received {} payload",
                job.payload.class()
            )));
        };

        let completion = self.client.complete(&Self::full_prompt(payload)).await?;
        Ok(Some(serde_json::json!({ "completion": completion })))
    }

    fn name(&self) -> &'static str {
        "ai_completion"
    }
}
