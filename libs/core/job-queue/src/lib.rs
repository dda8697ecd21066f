//! Asynchronous job queue and worker pools.
//!
//! Background work (email delivery, document text extraction, AI
//! completions) is enqueued through [`QueueService`] and processed by
//! per-class [`WorkerPool`]s coordinated by a [`JobSystem`]. The backing
//! store is either durable (Redis Streams) or degraded (log-and-discard),
//! chosen once from configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use job_queue::{JobSystem, JobClass, QueueConfig, EmailPayload, EnqueueOptions};
//!
//! let system = JobSystem::builder(QueueConfig::from_env()?)
//!     .handler(JobClass::Email, Arc::new(EmailHandler::new()))
//!     .build();
//! system.start().await?;
//!
//! let service = system.service();
//! let job_id = service
//!     .enqueue_email(payload, EnqueueOptions::default())
//!     .await?;
//!
//! shutdown_signal().await;
//! system.shutdown().await?;
//! ```

pub mod config;
pub mod discard_store;
pub mod error;
pub mod job;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod redis_store;
pub mod service;
pub mod stats;
pub mod store;
pub mod system;

pub use config::{ClassConfig, QueueConfig};
pub use discard_store::DiscardStore;
pub use error::{QueueError, Result};
pub use job::{
    AiCompletionPayload, DocumentExtractionPayload, EmailPayload, EnqueueOptions, Job, JobClass,
    JobId, JobOutcome, JobPayload, JobStatus,
};
pub use metrics::{init_metrics, render_metrics};
pub use policy::RetryPolicy;
pub use pool::{JobHandler, WorkerPool};
pub use redis_store::RedisJobStore;
pub use service::QueueService;
pub use stats::{admin_router, AdminState, ClassStats, ClassStatsSnapshot, SystemStats};
pub use store::{JobStore, StoreHandle};
pub use system::{shutdown_signal, JobSystem, JobSystemBuilder};
