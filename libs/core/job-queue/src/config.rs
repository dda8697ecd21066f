//! Queue configuration.
//!
//! `QueueConfig` is resolved once at boot (env vars or builders) and decides,
//! among other things, which backing store the queue uses for the whole
//! process lifetime. Per-class tuning lives in `ClassConfig`.

use crate::job::JobClass;
use core_config::{env_flag, env_parse_or, redis::RedisConfig, ConfigError, FromEnv};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Per-class tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ClassConfig {
    /// Number of concurrent pull loops.
    pub concurrency: usize,
    /// Attempt ceiling (per-enqueue override wins).
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub base_delay: Duration,
    /// Hard ceiling on a single handler invocation.
    pub execution_timeout: Duration,
}

impl ClassConfig {
    pub fn for_class(class: JobClass) -> Self {
        Self {
            concurrency: class.default_concurrency(),
            max_attempts: class.default_max_attempts(),
            base_delay: class.default_base_delay(),
            execution_timeout: class.default_execution_timeout(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }
}

/// Top-level queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Whether the durable (Redis) store is enabled. When false the queue
    /// runs degraded: enqueues are logged and discarded.
    pub durable: bool,

    /// Broker connection settings; required when `durable` is true.
    pub redis: Option<RedisConfig>,

    /// Consumer name within each consumer group. Unique per process.
    pub consumer_id: String,

    /// XREADGROUP block timeout.
    pub block_timeout_ms: u64,

    /// Idle sleep between empty polls in a pull loop.
    pub poll_interval_ms: u64,

    /// Minimum idle time before stale pending entries are reclaimed. Must
    /// exceed the largest per-class execution timeout, or a healthy slow
    /// handler's entry gets claimed by a peer while it is still running;
    /// the durable store raises it when configured lower.
    pub claim_idle_ms: u64,

    /// Approximate MAXLEN cap on each class stream.
    pub max_stream_length: usize,

    /// Approximate MAXLEN cap on each dead letter stream.
    pub dlq_max_length: usize,

    /// TTL on terminal job records.
    pub retention_secs: u64,

    /// How long shutdown waits for active jobs to drain.
    pub grace_window: Duration,

    /// Per-class overrides; classes not present use defaults.
    classes: HashMap<JobClass, ClassConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            durable: false,
            redis: None,
            consumer_id: format!("worker-{}", Uuid::new_v4()),
            block_timeout_ms: 1000,
            poll_interval_ms: 500,
            claim_idle_ms: 300_000,
            max_stream_length: 100_000,
            dlq_max_length: 10_000,
            retention_secs: 86_400,
            grace_window: Duration::from_secs(30),
            classes: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Durable queue against the given broker.
    pub fn durable(redis: RedisConfig) -> Self {
        Self {
            durable: true,
            redis: Some(redis),
            ..Self::default()
        }
    }

    /// Degraded queue: enqueues are logged and discarded.
    pub fn degraded() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, class: JobClass, config: ClassConfig) -> Self {
        self.classes.insert(class, config);
        self
    }

    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    /// Effective tuning for a class: override if set, class defaults otherwise.
    pub fn class(&self, class: JobClass) -> ClassConfig {
        self.classes
            .get(&class)
            .copied()
            .unwrap_or_else(|| ClassConfig::for_class(class))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Load QueueConfig from environment variables.
///
/// Environment variables:
/// - `JOB_QUEUE_DURABLE` - enable the Redis-backed store ("1"/"true"/"yes")
/// - `REDIS_HOST` etc. - broker settings, required when durable (see RedisConfig)
/// - `JOB_QUEUE_GRACE_SECS` - shutdown drain window, default 30
/// - `JOB_QUEUE_POLL_INTERVAL_MS` - idle poll sleep, default 500
/// - `JOB_QUEUE_<CLASS>_CONCURRENCY` - per-class worker count, e.g.
///   `JOB_QUEUE_EMAIL_CONCURRENCY=10`
/// - `JOB_QUEUE_<CLASS>_MAX_ATTEMPTS` - per-class attempt ceiling
impl FromEnv for QueueConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let durable = env_flag("JOB_QUEUE_DURABLE", false);

        let redis = if durable {
            Some(RedisConfig::from_env()?)
        } else {
            None
        };

        let mut config = Self {
            durable,
            redis,
            grace_window: Duration::from_secs(env_parse_or("JOB_QUEUE_GRACE_SECS", 30u64)?),
            poll_interval_ms: env_parse_or("JOB_QUEUE_POLL_INTERVAL_MS", 500u64)?,
            ..Self::default()
        };

        for class in JobClass::all() {
            let prefix = format!("JOB_QUEUE_{}", class.as_ref().to_ascii_uppercase());
            let defaults = ClassConfig::for_class(class);

            let concurrency =
                env_parse_or(&format!("{prefix}_CONCURRENCY"), defaults.concurrency)?;
            let max_attempts =
                env_parse_or(&format!("{prefix}_MAX_ATTEMPTS"), defaults.max_attempts)?;

            if concurrency != defaults.concurrency || max_attempts != defaults.max_attempts {
                config.classes.insert(
                    class,
                    defaults
                        .with_concurrency(concurrency)
                        .with_max_attempts(max_attempts),
                );
            }
        }

        Ok(config)
    }
}
