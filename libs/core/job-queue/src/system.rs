//! Lifecycle coordinator.
//!
//! `JobSystem` owns the store handle, the producer service, and one worker
//! pool per registered handler. Startup is explicit; shutdown signals the
//! pools, waits for in-flight jobs to drain within the grace window, and
//! only then closes the store.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::JobClass;
use crate::pool::{JobHandler, WorkerPool};
use crate::service::QueueService;
use crate::stats::{ClassStatsSnapshot, SystemStats};
use crate::store::{JobStore, StoreHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How often shutdown re-checks the in-flight count while draining.
const DRAIN_POLL: Duration = Duration::from_millis(50);

struct PoolRuntime {
    class: JobClass,
    active: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

/// Builder for a `JobSystem`.
pub struct JobSystemBuilder {
    config: QueueConfig,
    store: Option<Arc<StoreHandle>>,
    handlers: HashMap<JobClass, Arc<dyn JobHandler>>,
}

impl JobSystemBuilder {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            store: None,
            handlers: HashMap::new(),
        }
    }

    /// Register a handler; a worker pool is started for each registered class.
    pub fn handler(mut self, class: JobClass, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(class, handler);
        self
    }

    /// Use a pre-seeded store instead of bootstrapping from config.
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(Arc::new(StoreHandle::preset(self.config.clone(), store)));
        self
    }

    pub fn build(self) -> JobSystem {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(StoreHandle::new(self.config.clone())));
        let service = QueueService::from_handle(store.clone());
        let (shutdown_tx, _) = watch::channel(false);

        JobSystem {
            config: self.config,
            store,
            service,
            handlers: self.handlers,
            shutdown_tx,
            running: Mutex::new(Vec::new()),
        }
    }
}

pub struct JobSystem {
    config: QueueConfig,
    store: Arc<StoreHandle>,
    service: QueueService,
    handlers: HashMap<JobClass, Arc<dyn JobHandler>>,
    shutdown_tx: watch::Sender<bool>,
    running: Mutex<Vec<PoolRuntime>>,
}

impl JobSystem {
    pub fn builder(config: QueueConfig) -> JobSystemBuilder {
        JobSystemBuilder::new(config)
    }

    /// Producer handle. Usable before `start()`; the store bootstraps on the
    /// first enqueue.
    pub fn service(&self) -> QueueService {
        self.service.clone()
    }

    /// Start one worker pool per registered handler.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().expect("running lock poisoned");
        if !running.is_empty() {
            warn!("Job system already started");
            return Ok(());
        }

        for (&class, handler) in &self.handlers {
            let active = Arc::new(AtomicUsize::new(0));
            let store = self.store.clone();
            let handler = handler.clone();
            let class_config = self.config.class(class);
            let poll_interval = self.config.poll_interval();
            let shutdown = self.shutdown_tx.subscribe();
            let pool_active = active.clone();

            let task = tokio::spawn(async move {
                // Store bootstrap happens here so a bad broker config
                // surfaces at startup rather than on the first enqueue.
                let store = match store.get().await {
                    Ok(store) => store,
                    Err(e) => {
                        error!(class = %class, error = %e, "Worker pool failed to acquire store");
                        return;
                    }
                };

                let pool = Arc::new(
                    WorkerPool::new(class, handler, store, class_config, poll_interval)
                        .with_active(pool_active),
                );
                pool.run(shutdown).await;
            });

            running.push(PoolRuntime {
                class,
                active,
                task,
            });
        }

        info!(pools = running.len(), "Job system started");
        Ok(())
    }

    /// Jobs currently being processed across all pools.
    pub fn total_active(&self) -> usize {
        self.running
            .lock()
            .expect("running lock poisoned")
            .iter()
            .map(|p| p.active.load(Ordering::SeqCst))
            .sum()
    }

    /// Signal the pools, drain in-flight jobs within the grace window, then
    /// close the store. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        info!(grace_secs = self.config.grace_window.as_secs(), "Job system shutting down");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.grace_window;
        loop {
            let active = self.total_active();
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "Grace window elapsed with jobs still in flight");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let pools = std::mem::take(&mut *self.running.lock().expect("running lock poisoned"));
        for pool in pools {
            let abort = pool.task.abort_handle();
            match tokio::time::timeout_at(deadline + DRAIN_POLL, pool.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    error!(class = %pool.class, "Worker pool panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(class = %pool.class, "Worker pool did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        if self.store.initialized() {
            self.store.get().await?.close().await?;
        }

        info!("Job system stopped");
        Ok(())
    }

    /// Liveness of the backing store.
    pub async fn ping(&self) -> Result<()> {
        self.store.get().await?.ping().await
    }

    /// Per-class queue counts.
    pub async fn stats(&self) -> Result<SystemStats> {
        let store = self.store.get().await?;
        let mut classes = Vec::new();
        for class in JobClass::all() {
            let counts = store.stats(class).await?;
            classes.push(ClassStatsSnapshot { class, counts });
        }
        Ok(SystemStats { classes })
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
