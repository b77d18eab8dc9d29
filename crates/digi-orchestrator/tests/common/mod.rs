// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for digi-orchestrator tests.
//!
//! Provides a [`Harness`] wiring in-memory persistence, cache and pub/sub
//! with mock clients, plus fixtures for nodes, domains and services.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use digi_clients::PollPolicy;
use digi_clients::mock::{
    MockContainerEngine, MockDnsProvider, MockHypervisor, MockImageBuilder, MockProxyAdmin,
};
use digi_orchestrator::cache::MemoryCache;
use digi_orchestrator::handlers::{HandlerContext, OrchestratorSettings};
use digi_orchestrator::node_directory::NodeDirectory;
use digi_orchestrator::persistence::{
    MemoryPersistence, NodeRecord, NodeStatus, Persistence, PlatformDomainRecord, ServiceRecord,
    SourceType,
};
use digi_orchestrator::pubsub::MemoryPubSub;
use digi_orchestrator::queue::JobQueue;
use digi_orchestrator::services::ServiceCommands;
use digi_orchestrator::worker::{Worker, WorkerConfig};

pub const EDGE_PROXY: &str = "http://edge.test:2019";
pub const ZONE_ID: &str = "zone-apps";
pub const PLATFORM_DOMAIN: &str = "apps.example.com";
pub const NODE_NAME: &str = "pve1";
pub const GUEST_IP: &str = "10.0.0.21";

/// Settings with instant polling.
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        edge_proxy_url: EDGE_PROXY.to_string(),
        task_poll: PollPolicy::new(3, Duration::from_millis(1)),
        guest_network_poll: PollPolicy::new(3, Duration::from_millis(1)),
        platform_name: "digi".to_string(),
        ..OrchestratorSettings::default()
    }
}

/// Worker settings with zero retry delay.
pub fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(50),
        stale_timeout: Duration::from_secs(900),
        retry_backoff: Duration::ZERO,
    }
}

/// In-memory orchestrator with mock clients.
pub struct Harness {
    pub persistence: MemoryPersistence,
    pub hypervisor: Arc<MockHypervisor>,
    pub proxy: Arc<MockProxyAdmin>,
    pub dns: Arc<MockDnsProvider>,
    pub engine: Arc<MockContainerEngine>,
    pub builder: Arc<MockImageBuilder>,
    pub cache: Arc<MemoryCache>,
    pub pubsub: Arc<MemoryPubSub>,
    pub ctx: HandlerContext,
    pub queue: JobQueue,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_hypervisor(MockHypervisor::new())
    }

    pub fn with_hypervisor(hypervisor: MockHypervisor) -> Self {
        Self::build(hypervisor, MockProxyAdmin::new(), MockContainerEngine::new())
    }

    pub fn with_engine(engine: MockContainerEngine) -> Self {
        Self::build(MockHypervisor::new(), MockProxyAdmin::new(), engine)
    }

    pub fn with_proxy(proxy: MockProxyAdmin) -> Self {
        Self::build(MockHypervisor::new(), proxy, MockContainerEngine::new())
    }

    fn build(hypervisor: MockHypervisor, proxy: MockProxyAdmin, engine: MockContainerEngine) -> Self {
        let persistence = MemoryPersistence::new();
        let hypervisor = Arc::new(hypervisor);
        let proxy = Arc::new(proxy);
        let dns = Arc::new(MockDnsProvider::new());
        let engine = Arc::new(engine);
        let builder = Arc::new(MockImageBuilder::new());
        let cache = Arc::new(MemoryCache::new());
        let pubsub = Arc::new(MemoryPubSub::new());

        let store: Arc<dyn Persistence> = Arc::new(persistence.clone());
        let ctx = HandlerContext {
            persistence: store.clone(),
            hypervisor: hypervisor.clone(),
            proxy: proxy.clone(),
            dns: Some(dns.clone()),
            engine: engine.clone(),
            builder: builder.clone(),
            cache: cache.clone(),
            pubsub: pubsub.clone(),
            nodes: Arc::new(NodeDirectory::new(store.clone())),
            settings: test_settings(),
        };
        let queue = JobQueue::new(store, pubsub.clone());

        Self {
            persistence,
            hypervisor,
            proxy,
            dns,
            engine,
            builder,
            cache,
            pubsub,
            ctx,
            queue,
        }
    }

    pub fn commands(&self) -> ServiceCommands {
        ServiceCommands::new(self.ctx.clone(), self.queue.clone())
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.queue.clone(), self.ctx.clone(), test_worker_config())
    }

    /// Engine URL of the mock guest.
    pub fn guest_engine_url(&self) -> String {
        self.ctx.settings.engine_url(GUEST_IP)
    }

    /// VM-local proxy admin URL of the mock guest.
    pub fn guest_proxy_url(&self) -> String {
        self.ctx.settings.vm_proxy_admin_url(GUEST_IP)
    }

    /// One active hypervisor node.
    pub async fn seed_node(&self) -> NodeRecord {
        let node = NodeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: NODE_NAME.to_string(),
            hostname: "pve1.internal".to_string(),
            port: 8006,
            api_token_id: "root@pam!digi".to_string(),
            api_token_secret: "secret".to_string(),
            region: "eu-central".to_string(),
            status: NodeStatus::Active,
            max_vms: 50,
        };
        self.persistence.insert_node(&node).await.unwrap();
        node
    }

    /// The default platform domain, counting `service_count` services.
    pub async fn seed_domain(&self, service_count: i32) -> PlatformDomainRecord {
        let domain = PlatformDomainRecord {
            id: uuid::Uuid::new_v4().to_string(),
            domain: PLATFORM_DOMAIN.to_string(),
            cloudflare_zone_id: ZONE_ID.to_string(),
            is_default: true,
            service_count,
        };
        self.persistence.insert_platform_domain(&domain).await.unwrap();
        domain
    }

    /// An image-sourced service under `domain`.
    pub async fn seed_docker_service(
        &self,
        subdomain: &str,
        image: &str,
        domain: Option<&PlatformDomainRecord>,
    ) -> ServiceRecord {
        let mut service = ServiceRecord::new("user-1", subdomain, subdomain, SourceType::Docker);
        service.docker_image = Some(image.to_string());
        service.port = 80;
        service.platform_domain_id = domain.map(|d| d.id.clone());
        self.persistence.insert_service(&service).await.unwrap();
        service
    }

    /// A git-sourced service under `domain`.
    pub async fn seed_github_service(
        &self,
        subdomain: &str,
        domain: Option<&PlatformDomainRecord>,
    ) -> ServiceRecord {
        let mut service = ServiceRecord::new("user-1", subdomain, subdomain, SourceType::Github);
        service.git_url = Some(format!("https://github.com/acme/{}.git", subdomain));
        service.platform_domain_id = domain.map(|d| d.id.clone());
        self.persistence.insert_service(&service).await.unwrap();
        service
    }
}
