// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for digi-orchestrator.
//!
//! [`OrchestratorRuntime`] wires persistence, the external clients, cache
//! and pub/sub into a job worker running on the current tokio runtime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use digi_orchestrator::persistence::PostgresPersistence;
//! use digi_orchestrator::runtime::OrchestratorRuntime;
//!
//! let runtime = OrchestratorRuntime::builder()
//!     .persistence(Arc::new(PostgresPersistence::new(pool)))
//!     .hypervisor(hypervisor)
//!     .proxy(proxy)
//!     .engine(engine)
//!     .image_builder(builder)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let deployment_id = runtime.commands().request_deploy(&service_id, &user_id).await?;
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use digi_clients::{ContainerEngine, DnsProvider, Hypervisor, ImageBuilder, ProxyAdmin};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{Cache, MemoryCache};
use crate::handlers::{HandlerContext, OrchestratorSettings};
use crate::node_directory::NodeDirectory;
use crate::persistence::Persistence;
use crate::pubsub::{MemoryPubSub, PubSub};
use crate::queue::{DEFAULT_MAX_ATTEMPTS, JobQueue};
use crate::services::ServiceCommands;
use crate::worker::{Worker, WorkerConfig};

/// Builder for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    hypervisor: Option<Arc<dyn Hypervisor>>,
    proxy: Option<Arc<dyn ProxyAdmin>>,
    dns: Option<Arc<dyn DnsProvider>>,
    engine: Option<Arc<dyn ContainerEngine>>,
    image_builder: Option<Arc<dyn ImageBuilder>>,
    cache: Option<Arc<dyn Cache>>,
    pubsub: Option<Arc<dyn PubSub>>,
    settings: OrchestratorSettings,
    worker_config: WorkerConfig,
    max_attempts: i32,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            hypervisor: None,
            proxy: None,
            dns: None,
            engine: None,
            image_builder: None,
            cache: None,
            pubsub: None,
            settings: OrchestratorSettings::default(),
            worker_config: WorkerConfig::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the hypervisor client (required).
    pub fn hypervisor(mut self, hypervisor: Arc<dyn Hypervisor>) -> Self {
        self.hypervisor = Some(hypervisor);
        self
    }

    /// Set the proxy admin client (required).
    pub fn proxy(mut self, proxy: Arc<dyn ProxyAdmin>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the DNS provider. Without one, DNS steps are skipped.
    pub fn dns(mut self, dns: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Set the container engine client (required).
    pub fn engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the image builder (required).
    pub fn image_builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.image_builder = Some(builder);
        self
    }

    /// Set the cache.
    ///
    /// Default: in-memory
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the pub/sub bus.
    ///
    /// Default: in-memory
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Set the handler settings.
    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the worker loop configuration.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Set the number of claims allowed per job.
    ///
    /// Default: 3
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let hypervisor = self
            .hypervisor
            .ok_or_else(|| anyhow::anyhow!("hypervisor is required"))?;
        let proxy = self
            .proxy
            .ok_or_else(|| anyhow::anyhow!("proxy is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;
        let builder = self
            .image_builder
            .ok_or_else(|| anyhow::anyhow!("image_builder is required"))?;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let pubsub = self
            .pubsub
            .unwrap_or_else(|| Arc::new(MemoryPubSub::new()));

        let ctx = HandlerContext {
            nodes: Arc::new(NodeDirectory::new(persistence.clone())),
            persistence: persistence.clone(),
            hypervisor,
            proxy,
            dns: self.dns,
            engine,
            builder,
            cache,
            pubsub: pubsub.clone(),
            settings: self.settings,
        };
        let queue = JobQueue::new(persistence, pubsub).with_max_attempts(self.max_attempts);

        Ok(OrchestratorRuntimeConfig {
            ctx,
            queue,
            worker_config: self.worker_config,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    ctx: HandlerContext,
    queue: JobQueue,
    worker_config: WorkerConfig,
}

impl OrchestratorRuntimeConfig {
    /// Mutation entry points over this configuration, without a worker.
    pub fn commands(&self) -> ServiceCommands {
        ServiceCommands::new(self.ctx.clone(), self.queue.clone())
    }

    /// Start the runtime, spawning the job worker.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let worker = Worker::new(self.queue.clone(), self.ctx.clone(), self.worker_config);
        let worker_shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        info!("OrchestratorRuntime started");

        Ok(OrchestratorRuntime {
            commands: ServiceCommands::new(self.ctx, self.queue.clone()),
            queue: self.queue,
            worker_handle,
            worker_shutdown,
        })
    }
}

/// A running orchestrator: a job worker plus the entry points that feed it.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    commands: ServiceCommands,
    queue: JobQueue,
    worker_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Mutation entry points.
    pub fn commands(&self) -> &ServiceCommands {
        &self.commands
    }

    /// The job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Gracefully shut down the runtime.
    ///
    /// A job in flight runs to completion before the worker exits.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");
        self.worker_shutdown.notify_one();
        self.worker_handle.await?;
        info!("OrchestratorRuntime shut down");
        Ok(())
    }
}
