// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers.
//!
//! One module per job kind. Handlers receive a [`HandlerContext`] holding
//! every collaborator as a trait object, so the same code runs against real
//! clients in the worker binary and against mocks in tests.

pub mod build;
pub mod deploy;
pub mod destroy;
pub mod scale;

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use digi_clients::{
    ContainerEngine, ContainerState, DnsProvider, Hypervisor, ImageBuilder, PollPolicy, ProxyAdmin,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::error::Result;
use crate::node_directory::NodeDirectory;
use crate::persistence::{
    ContainerRecord, ContainerStatus, DeploymentStatus, Persistence, PlatformDomainRecord,
};
use crate::pubsub::{Channels, PubSub};

/// Platform settings the handlers need.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Admin API of the edge proxy.
    pub edge_proxy_url: String,
    /// Admin API port of the proxy inside each VM.
    pub vm_proxy_admin_port: u16,
    /// HTTP port of the proxy inside each VM.
    pub vm_proxy_http_port: u16,
    /// Container engine API port inside each VM.
    pub docker_api_port: u16,
    /// Hypervisor template cloned for new VMs.
    pub vm_template_id: u32,
    /// Base URL of the user dashboard.
    pub dashboard_url: Option<String>,
    /// Platform name, used in VM names and verification records.
    pub platform_name: String,
    /// Budget for hypervisor task polling.
    pub task_poll: PollPolicy,
    /// Budget for waiting on a guest's network.
    pub guest_network_poll: PollPolicy,
    /// vCPUs of new VMs.
    pub vm_cpu_cores: i32,
    /// Memory of new VMs, MiB.
    pub vm_memory_mb: i32,
    /// Disk of new VMs, GiB.
    pub vm_disk_gb: i32,
    /// Hypervisor id of the first VM.
    pub first_vm_id: u32,
    /// Lowest loopback port handed to containers.
    pub first_host_port: u16,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            edge_proxy_url: "http://127.0.0.1:2019".to_string(),
            vm_proxy_admin_port: 2019,
            vm_proxy_http_port: 80,
            docker_api_port: 2375,
            vm_template_id: 9000,
            dashboard_url: None,
            platform_name: "digi".to_string(),
            task_poll: PollPolicy::tasks(),
            guest_network_poll: PollPolicy::guest_network(),
            vm_cpu_cores: 2,
            vm_memory_mb: 2048,
            vm_disk_gb: 50,
            first_vm_id: 200,
            first_host_port: 10000,
        }
    }
}

impl OrchestratorSettings {
    /// Admin API of the proxy inside the VM at `vm_ip`.
    pub fn vm_proxy_admin_url(&self, vm_ip: &str) -> String {
        format!("http://{}:{}", vm_ip, self.vm_proxy_admin_port)
    }

    /// Container engine API of the VM at `vm_ip`.
    pub fn engine_url(&self, vm_ip: &str) -> String {
        format!("http://{}:{}", vm_ip, self.docker_api_port)
    }

    /// Dashboard link of a service.
    pub fn service_dashboard_url(&self, service_id: &str) -> Option<String> {
        self.dashboard_url
            .as_ref()
            .map(|base| format!("{}/services/{}", base.trim_end_matches('/'), service_id))
    }
}

/// Collaborators shared by all handlers.
#[derive(Clone)]
pub struct HandlerContext {
    /// Durable state.
    pub persistence: Arc<dyn Persistence>,
    /// VM control plane.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// Edge and VM-local proxy admin API.
    pub proxy: Arc<dyn ProxyAdmin>,
    /// DNS provider; DNS steps are skipped when unset.
    pub dns: Option<Arc<dyn DnsProvider>>,
    /// Per-VM container engine.
    pub engine: Arc<dyn ContainerEngine>,
    /// Image build pipeline.
    pub builder: Arc<dyn ImageBuilder>,
    /// Cache of derived views.
    pub cache: Arc<dyn Cache>,
    /// Notification bus.
    pub pubsub: Arc<dyn PubSub>,
    /// Hypervisor node cache.
    pub nodes: Arc<NodeDirectory>,
    /// Platform settings.
    pub settings: OrchestratorSettings,
}

impl HandlerContext {
    /// Drop a cache key. Failures are logged; the entry expires anyway.
    pub(crate) async fn invalidate(&self, key: &str) {
        if let Err(e) = self.cache.del(key).await {
            warn!(key, error = %e, "Failed to invalidate cache key");
        }
    }

    /// Publish a deployment progress event. Failures are logged.
    pub(crate) async fn publish_deployment_event(&self, event: &DeploymentEvent) {
        let channel = Channels::deployment(&event.deployment_id);
        let message = match serde_json::to_value(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to encode deployment event");
                return;
            }
        };
        if let Err(e) = self.pubsub.publish(&channel, &message).await {
            warn!(channel = %channel, error = %e, "Failed to publish deployment event");
        }
    }

    /// Move a deployment to `status` and announce it.
    pub(crate) async fn advance_deployment(
        &self,
        service_id: &str,
        deployment_id: &str,
        status: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        self.persistence
            .set_deployment_status(deployment_id, &status, error, now)
            .await?;
        self.publish_deployment_event(&DeploymentEvent {
            deployment_id: deployment_id.to_string(),
            service_id: service_id.to_string(),
            status,
            message: error.map(str::to_string),
            timestamp: now,
        })
        .await;
        Ok(())
    }
}

/// Progress event published on `deployment:{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
    /// Deployment id.
    pub deployment_id: String,
    /// Service id.
    pub service_id: String,
    /// New deployment status.
    pub status: DeploymentStatus,
    /// Error message, for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// Run an external step whose failure must not stop the caller.
///
/// Not-found is the expected outcome of deleting something already gone and
/// is logged at debug; anything else at warn.
pub(crate) fn best_effort<T>(
    result: digi_clients::Result<T>,
    step: &str,
    target: impl Display,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_not_found() => {
            debug!(step, target = %target, "Already gone");
            None
        }
        Err(e) => {
            warn!(step, target = %target, error = %e, "Step failed; continuing");
            None
        }
    }
}

/// Public host name of `subdomain`: `{subdomain}.{domain}`, or the bare
/// label when the service has no platform domain.
pub(crate) fn public_host(subdomain: &str, domain: Option<&PlatformDomainRecord>) -> String {
    match domain {
        Some(domain) => format!("{}.{}", subdomain, domain.domain),
        None => subdomain.to_string(),
    }
}

/// Drive one container to `target` on the VM at `vm_ip`.
///
/// Returns the status to record. A container without a runtime handle has
/// nothing to drive and keeps its recorded status.
pub(crate) async fn apply_container_state(
    ctx: &HandlerContext,
    vm_ip: &str,
    container: &ContainerRecord,
    target: ContainerState,
) -> Result<ContainerStatus> {
    let Some(handle) = &container.docker_container_id else {
        debug!(container_id = %container.id, "Container has no runtime handle");
        return Ok(container.status.clone());
    };

    ctx.engine
        .set_container_state(&ctx.settings.engine_url(vm_ip), handle, target)
        .await?;

    let status = match target {
        ContainerState::Running => ContainerStatus::Running,
        ContainerState::Stopped => ContainerStatus::Stopped,
    };
    ctx.persistence
        .set_container_status(&container.id, &status)
        .await?;
    Ok(status)
}
