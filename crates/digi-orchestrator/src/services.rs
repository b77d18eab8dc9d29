// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutation entry points.
//!
//! What an API layer calls when a user acts on a service. Long-running work
//! is never done inline: the service row is moved to its transitional status
//! and a job is enqueued for a worker. The synchronous operations here are
//! the ones that touch a single external resource.

use std::sync::Arc;

use digi_clients::{ContainerState, VmCurrentStatus, verify_domain_ownership};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheKeys, VM_STATS_TTL};
use crate::error::{Error, Result};
use crate::handlers::{HandlerContext, apply_container_state};
use crate::persistence::{
    ContainerRecord, ContainerStatus, ContainerType, DeploymentRecord, ServiceRecord,
    ServiceStatus,
};
use crate::queue::{JobCommand, JobQueue};

const SUBDOMAIN_SUFFIX_LEN: usize = 4;

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUBDOMAIN_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Service mutations backed by the job queue.
#[derive(Clone)]
pub struct ServiceCommands {
    ctx: HandlerContext,
    queue: JobQueue,
}

impl ServiceCommands {
    /// Commands over the handler collaborators and `queue`.
    pub fn new(ctx: HandlerContext, queue: JobQueue) -> Self {
        Self { ctx, queue }
    }

    async fn service(&self, service_id: &str) -> Result<ServiceRecord> {
        self.ctx
            .persistence
            .get_service(service_id)
            .await?
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))
    }

    /// Start a deployment. Returns the new deployment id.
    pub async fn request_deploy(&self, service_id: &str, user_id: &str) -> Result<String> {
        let service = self.service(service_id).await?;
        if service.status == ServiceStatus::Destroying {
            return Err(Error::InvalidRequest(format!(
                "service {} is being destroyed",
                service_id
            )));
        }

        let deployment = DeploymentRecord::queued(service_id, user_id);
        self.ctx.persistence.insert_deployment(&deployment).await?;
        self.ctx
            .persistence
            .set_service_status(service_id, &ServiceStatus::Deploying)
            .await?;

        let job_id = self
            .queue
            .enqueue(
                &JobCommand::Deploy {
                    service_id: service_id.to_string(),
                    deployment_id: deployment.id.clone(),
                },
                None,
            )
            .await?;
        self.ctx
            .invalidate(&CacheKeys::user_services(&service.user_id))
            .await;

        info!(service_id, deployment_id = %deployment.id, job_id = %job_id, "Deploy requested");
        Ok(deployment.id)
    }

    /// Schedule a service's teardown. Returns the job id.
    pub async fn request_destroy(&self, service_id: &str) -> Result<String> {
        let service = self.service(service_id).await?;
        self.ctx
            .persistence
            .set_service_status(service_id, &ServiceStatus::Destroying)
            .await?;

        let job_id = self
            .queue
            .enqueue(
                &JobCommand::Destroy {
                    service_id: service_id.to_string(),
                },
                None,
            )
            .await?;
        self.ctx
            .invalidate(&CacheKeys::user_services(&service.user_id))
            .await;

        info!(service_id, job_id = %job_id, "Destroy requested");
        Ok(job_id)
    }

    /// Schedule a scale change. Returns the job id.
    pub async fn request_scale(&self, service_id: &str, replicas: u32) -> Result<String> {
        self.service(service_id).await?;
        let job_id = self
            .queue
            .enqueue(
                &JobCommand::Scale {
                    service_id: service_id.to_string(),
                    replicas,
                },
                None,
            )
            .await?;
        info!(service_id, replicas, job_id = %job_id, "Scale requested");
        Ok(job_id)
    }

    /// Schedule an image build without deploying. Returns the deployment id.
    pub async fn request_build(&self, service_id: &str, user_id: &str) -> Result<String> {
        self.service(service_id).await?;
        let deployment = DeploymentRecord::queued(service_id, user_id);
        self.ctx.persistence.insert_deployment(&deployment).await?;

        let job_id = self
            .queue
            .enqueue(
                &JobCommand::Build {
                    service_id: service_id.to_string(),
                    deployment_id: deployment.id.clone(),
                },
                None,
            )
            .await?;

        info!(service_id, deployment_id = %deployment.id, job_id = %job_id, "Build requested");
        Ok(deployment.id)
    }

    /// Declare an extra container on a service. It is started by the next
    /// deploy.
    ///
    /// Public containers get their own subdomain,
    /// `{service subdomain}-{random suffix}`. Raw docker containers need an
    /// image.
    pub async fn add_container(
        &self,
        service_id: &str,
        container_type: ContainerType,
        image: Option<String>,
    ) -> Result<ContainerRecord> {
        let service = self.service(service_id).await?;
        match &container_type {
            ContainerType::App => {
                return Err(Error::InvalidRequest(
                    "the app container is created by deploy".to_string(),
                ));
            }
            ContainerType::Docker if image.is_none() => {
                return Err(Error::InvalidRequest(
                    "docker containers need an image".to_string(),
                ));
            }
            ContainerType::Unknown(other) => {
                return Err(Error::InvalidRequest(format!(
                    "unsupported container type {}",
                    other
                )));
            }
            _ => {}
        }

        let mut container = ContainerRecord::new(
            service_id,
            container_type.clone(),
            format!("{}-{}", service.subdomain, container_type),
        );
        container.image = image;
        if let Some((_, port)) = container_type.addon_defaults() {
            container.container_port = Some(i32::from(port));
        }
        if container_type.is_public() {
            container.subdomain = Some(format!("{}-{}", service.subdomain, random_suffix()));
        }

        self.ctx.persistence.insert_container(&container).await?;
        info!(service_id, container_id = %container.id, container_type = %container.container_type, "Container added");
        Ok(container)
    }

    /// Stop or restart one container of a service.
    pub async fn set_container_state(
        &self,
        service_id: &str,
        container_id: &str,
        target: ContainerState,
    ) -> Result<ContainerStatus> {
        let bundle = self
            .ctx
            .persistence
            .load_service_bundle(service_id)
            .await?
            .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
        let container = bundle
            .containers
            .iter()
            .find(|c| c.id == container_id)
            .ok_or_else(|| Error::not_found("Container", container_id))?;
        let vm_ip = bundle.vm_ip().ok_or_else(|| {
            Error::InvalidRequest(format!("service {} has no provisioned VM", service_id))
        })?;

        let status = apply_container_state(&self.ctx, vm_ip, container, target).await?;
        self.ctx
            .invalidate(&CacheKeys::user_services(&bundle.service.user_id))
            .await;
        info!(service_id, container_id, status = %status, "Container state changed");
        Ok(status)
    }

    /// Runtime status of a VM, cached briefly.
    pub async fn vm_stats(&self, vm_id: &str) -> Result<VmCurrentStatus> {
        let key = CacheKeys::vm_stats(vm_id);
        match cache::get_json::<VmCurrentStatus>(self.ctx.cache.as_ref(), &key).await {
            Ok(Some(stats)) => {
                debug!(vm_id, "VM stats cache hit");
                return Ok(stats);
            }
            Ok(None) => {}
            Err(e) => warn!(vm_id, error = %e, "VM stats cache read failed"),
        }

        let vm = self
            .ctx
            .persistence
            .get_vm(vm_id)
            .await?
            .ok_or_else(|| Error::not_found("VM", vm_id))?;
        let hypervisor_id = u32::try_from(vm.proxmox_vm_id).map_err(|_| {
            Error::Other(format!("VM {} has invalid hypervisor id", vm_id))
        })?;
        let credentials = self.ctx.nodes.credentials(&vm.server_id).await?;
        let stats = self
            .ctx
            .hypervisor
            .current_status(&credentials, hypervisor_id)
            .await?;

        if let Err(e) = cache::set_json(self.ctx.cache.as_ref(), &key, &stats, VM_STATS_TTL).await
        {
            warn!(vm_id, error = %e, "VM stats cache write failed");
        }
        Ok(stats)
    }

    /// Check a custom domain's TXT record and mark it verified.
    ///
    /// Returns whether the domain is verified.
    pub async fn verify_custom_domain(&self, custom_domain_id: &str) -> Result<bool> {
        let domain = self
            .ctx
            .persistence
            .get_custom_domain(custom_domain_id)
            .await?
            .ok_or_else(|| Error::not_found("Custom domain", custom_domain_id))?;
        if domain.is_verified {
            return Ok(true);
        }

        let token = domain.verification_token.as_deref().ok_or_else(|| {
            Error::InvalidRequest(format!("domain {} has no verification token", domain.domain))
        })?;
        let dns = self
            .ctx
            .dns
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::Other("no DNS provider configured".to_string()))?;
        let zone = self.verification_zone(&domain.service_id).await?;

        let verified = verify_domain_ownership(
            dns.as_ref(),
            &zone,
            &self.ctx.settings.platform_name,
            &domain.domain,
            token,
        )
        .await?;
        if !verified {
            info!(custom_domain_id, domain = %domain.domain, "Verification record not found");
            return Ok(false);
        }

        self.ctx
            .persistence
            .mark_custom_domain_verified(custom_domain_id)
            .await?;
        self.ctx.invalidate(&CacheKeys::domains_list()).await;
        info!(custom_domain_id, domain = %domain.domain, "Custom domain verified");
        Ok(true)
    }

    /// Zone searched for verification records: the platform domain zone of
    /// the service the custom domain belongs to.
    async fn verification_zone(&self, service_id: &str) -> Result<String> {
        let service = self.service(service_id).await?;
        let domain_id = service.platform_domain_id.ok_or_else(|| {
            Error::InvalidRequest(format!("service {} has no platform domain", service_id))
        })?;
        let domain = self
            .ctx
            .persistence
            .get_platform_domain(&domain_id)
            .await?
            .ok_or_else(|| Error::not_found("Platform domain", domain_id.clone()))?;
        Ok(domain.cloudflare_zone_id)
    }
}
