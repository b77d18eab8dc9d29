// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence.
//!
//! Mirrors the Postgres backend's semantics (conditional claim, one
//! processing job per service, cascading service delete, clamped domain
//! counter) under a single lock. Used by tests and local runs without a
//! database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    ContainerRecord, ContainerRuntimeUpdate, ContainerStatus, CustomDomainRecord,
    DeploymentRecord, DeploymentStatus, DnsRecordRow, JobRecord, JobStatus, NewJob, NodeCapacity,
    NodeRecord, Persistence, PersistenceError, PlatformDomainRecord, Result, STALE_JOB_ERROR,
    ServiceBundle, ServiceRecord, ServiceStatus, StaleJobsOutcome, VmRecord, VmStatus,
};

#[derive(Debug, Default)]
struct State {
    /// Insertion order doubles as `created_at` order.
    jobs: Vec<JobRecord>,
    services: HashMap<String, ServiceRecord>,
    containers: Vec<ContainerRecord>,
    vms: HashMap<String, VmRecord>,
    nodes: Vec<NodeRecord>,
    platform_domains: HashMap<String, PlatformDomainRecord>,
    dns_records: Vec<DnsRecordRow>,
    custom_domains: HashMap<String, CustomDomainRecord>,
    deployments: HashMap<String, DeploymentRecord>,
}

impl State {
    /// The job, if it is still `processing` under claim number `attempt`.
    fn claimed_job_mut(&mut self, job_id: &str, attempt: i32) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| {
            j.id == job_id && j.status == JobStatus::Processing && j.attempts == attempt
        })
    }

    fn service_mut(&mut self, service_id: &str) -> Result<&mut ServiceRecord> {
        self.services
            .get_mut(service_id)
            .ok_or_else(|| not_found("Service", service_id))
    }

    fn container_mut(&mut self, container_id: &str) -> Result<&mut ContainerRecord> {
        self.containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| not_found("Container", container_id))
    }

    fn vm_mut(&mut self, vm_id: &str) -> Result<&mut VmRecord> {
        self.vms
            .get_mut(vm_id)
            .ok_or_else(|| not_found("Vm", vm_id))
    }

    fn deployment_mut(&mut self, deployment_id: &str) -> Result<&mut DeploymentRecord> {
        self.deployments
            .get_mut(deployment_id)
            .ok_or_else(|| not_found("Deployment", deployment_id))
    }

    fn service_busy(&self, service_id: Option<&str>, except_job: Option<&str>) -> bool {
        let Some(service_id) = service_id else {
            return false;
        };
        self.jobs.iter().any(|j| {
            j.status == JobStatus::Processing
                && j.service_id.as_deref() == Some(service_id)
                && Some(j.id.as_str()) != except_job
        })
    }
}

fn not_found(entity: &'static str, id: &str) -> PersistenceError {
    PersistenceError::NotFound {
        entity,
        id: id.to_string(),
    }
}

/// In-memory persistence implementation.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<State>>,
}

impl MemoryPersistence {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs, oldest first.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        self.state.lock().await.jobs.clone()
    }

    /// All containers of a service.
    pub async fn containers(&self, service_id: &str) -> Vec<ContainerRecord> {
        let state = self.state.lock().await;
        state
            .containers
            .iter()
            .filter(|c| c.service_id == service_id)
            .cloned()
            .collect()
    }

    /// All DNS record rows.
    pub async fn dns_records(&self) -> Vec<DnsRecordRow> {
        self.state.lock().await.dns_records.clone()
    }

    /// Move a job's `started_at` back, simulating a worker that died mid-job.
    pub async fn backdate_job_start(&self, job_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| not_found("Job", job_id))?
            .started_at = Some(started_at);
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn insert_job(&self, job: &NewJob) -> Result<JobRecord> {
        let record = JobRecord {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            last_error: None,
            service_id: job.service_id.clone(),
            scheduled_at: job.scheduled_at,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.state.lock().await.jobs.push(record.clone());
        Ok(record)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn find_claimable_job(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        // min_by_key keeps the first of equal keys, so ties go to insertion order.
        let job = state
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Retrying))
            .filter(|j| j.scheduled_at <= now)
            .filter(|j| !state.service_busy(j.service_id.as_deref(), None))
            .min_by_key(|j| j.scheduled_at)
            .cloned();
        Ok(job)
    }

    async fn try_claim_job(
        &self,
        job_id: &str,
        observed: &JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock().await;
        let Some(index) = state.jobs.iter().position(|j| j.id == job_id) else {
            return Ok(None);
        };
        if &state.jobs[index].status != observed {
            return Ok(None);
        }
        let service_id = state.jobs[index].service_id.clone();
        if state.service_busy(service_id.as_deref(), Some(job_id)) {
            return Ok(None);
        }

        let job = &mut state.jobs[index];
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, job_id: &str, attempt: i32, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job_mut(job_id, attempt) else {
            return Ok(false);
        };
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        Ok(true)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        attempt: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job_mut(job_id, attempt) else {
            return Ok(false);
        };
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_string());
        job.completed_at = Some(now);
        Ok(true)
    }

    async fn retry_job(
        &self,
        job_id: &str,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job_mut(job_id, attempt) else {
            return Ok(false);
        };
        job.status = JobStatus::Retrying;
        job.last_error = Some(error.to_string());
        job.scheduled_at = run_at;
        Ok(true)
    }

    async fn requeue_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StaleJobsOutcome> {
        let mut state = self.state.lock().await;
        let mut outcome = StaleJobsOutcome::default();
        for job in state.jobs.iter_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|t| t < started_before);
            if !stale {
                continue;
            }
            job.last_error = Some(STALE_JOB_ERROR.to_string());
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                outcome.failed += 1;
            } else {
                job.status = JobStatus::Retrying;
                job.scheduled_at = now;
                outcome.requeued += 1;
            }
        }
        Ok(outcome)
    }

    async fn insert_service(&self, service: &ServiceRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .services
            .values()
            .any(|s| s.subdomain == service.subdomain)
        {
            return Err(PersistenceError::Conflict(format!(
                "subdomain {} is taken",
                service.subdomain
            )));
        }
        state.services.insert(service.id.clone(), service.clone());
        Ok(())
    }

    async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.state.lock().await.services.get(service_id).cloned())
    }

    async fn load_service_bundle(&self, service_id: &str) -> Result<Option<ServiceBundle>> {
        let state = self.state.lock().await;
        let Some(service) = state.services.get(service_id).cloned() else {
            return Ok(None);
        };
        let containers = state
            .containers
            .iter()
            .filter(|c| c.service_id == service_id)
            .cloned()
            .collect();
        let vm = service
            .vm_id
            .as_ref()
            .and_then(|id| state.vms.get(id))
            .cloned();
        let platform_domain = service
            .platform_domain_id
            .as_ref()
            .and_then(|id| state.platform_domains.get(id))
            .cloned();
        let dns_records = state
            .dns_records
            .iter()
            .filter(|r| r.service_id.as_deref() == Some(service_id))
            .cloned()
            .collect();

        Ok(Some(ServiceBundle {
            service,
            containers,
            vm,
            platform_domain,
            dns_records,
        }))
    }

    async fn set_service_status(&self, service_id: &str, status: &ServiceStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let service = state.service_mut(service_id)?;
        service.status = status.clone();
        service.updated_at = Utc::now();
        Ok(())
    }

    async fn set_service_vm(&self, service_id: &str, vm_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let service = state.service_mut(service_id)?;
        service.vm_id = Some(vm_id.to_string());
        service.updated_at = Utc::now();
        Ok(())
    }

    async fn set_service_urls(
        &self,
        service_id: &str,
        public_url: Option<&str>,
        dashboard_url: Option<&str>,
        current_deployment_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let service = state.service_mut(service_id)?;
        service.public_url = public_url.map(str::to_string);
        service.dashboard_url = dashboard_url.map(str::to_string);
        service.current_deployment_id = Some(current_deployment_id.to_string());
        service.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_service(&self, service_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.services.remove(service_id).is_none() {
            return Ok(false);
        }
        state.containers.retain(|c| c.service_id != service_id);
        state.deployments.retain(|_, d| d.service_id != service_id);
        let removed_domains: Vec<String> = state
            .custom_domains
            .values()
            .filter(|d| d.service_id == service_id)
            .map(|d| d.id.clone())
            .collect();
        state.custom_domains.retain(|_, d| d.service_id != service_id);
        state.dns_records.retain(|r| {
            r.service_id.as_deref() != Some(service_id)
                && !r
                    .domain_id
                    .as_ref()
                    .is_some_and(|id| removed_domains.contains(id))
        });
        Ok(true)
    }

    async fn insert_container(&self, container: &ContainerRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.services.contains_key(&container.service_id) {
            return Err(not_found("Service", &container.service_id));
        }
        state.containers.push(container.clone());
        Ok(())
    }

    async fn update_container_runtime(
        &self,
        container_id: &str,
        update: &ContainerRuntimeUpdate,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state.container_mut(container_id)?;
        container.docker_container_id = update.docker_container_id.clone();
        if let Some(image) = &update.image {
            container.image = Some(image.clone());
        }
        if let Some(port) = update.host_port {
            container.host_port = Some(port);
        }
        container.status = update.status.clone();
        container.updated_at = Utc::now();
        Ok(())
    }

    async fn set_container_status(
        &self,
        container_id: &str,
        status: &ContainerStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state.container_mut(container_id)?;
        container.status = status.clone();
        container.updated_at = Utc::now();
        Ok(())
    }

    async fn list_vm_host_ports(&self, vm_id: &str) -> Result<Vec<i32>> {
        let state = self.state.lock().await;
        let ports = state
            .containers
            .iter()
            .filter(|c| {
                state
                    .services
                    .get(&c.service_id)
                    .is_some_and(|s| s.vm_id.as_deref() == Some(vm_id))
            })
            .filter_map(|c| c.host_port)
            .collect();
        Ok(ports)
    }

    async fn insert_node(&self, node: &NodeRecord) -> Result<()> {
        self.state.lock().await.nodes.push(node.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut nodes = self.state.lock().await.nodes.clone();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn list_node_capacity(&self) -> Result<Vec<NodeCapacity>> {
        let state = self.state.lock().await;
        let mut capacity: Vec<NodeCapacity> = state
            .nodes
            .iter()
            .map(|node| NodeCapacity {
                node: node.clone(),
                vm_count: state.vms.values().filter(|v| v.server_id == node.id).count() as i64,
            })
            .collect();
        capacity.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        Ok(capacity)
    }

    async fn max_hypervisor_vm_id(&self) -> Result<Option<i32>> {
        let state = self.state.lock().await;
        Ok(state.vms.values().map(|v| v.proxmox_vm_id).max())
    }

    async fn insert_vm(&self, vm: &VmRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .vms
            .values()
            .any(|v| v.proxmox_vm_id == vm.proxmox_vm_id)
        {
            return Err(PersistenceError::Conflict(format!(
                "hypervisor vm id {} is taken",
                vm.proxmox_vm_id
            )));
        }
        state.vms.insert(vm.id.clone(), vm.clone());
        Ok(())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmRecord>> {
        Ok(self.state.lock().await.vms.get(vm_id).cloned())
    }

    async fn update_vm_network(
        &self,
        vm_id: &str,
        ip_address: &str,
        status: &VmStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        vm.ip_address = Some(ip_address.to_string());
        vm.status = status.clone();
        vm.updated_at = Utc::now();
        Ok(())
    }

    async fn set_vm_status(&self, vm_id: &str, status: &VmStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vm_id)?;
        vm.status = status.clone();
        vm.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_platform_domain(&self, domain: &PlatformDomainRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .platform_domains
            .insert(domain.id.clone(), domain.clone());
        Ok(())
    }

    async fn get_platform_domain(&self, domain_id: &str) -> Result<Option<PlatformDomainRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .platform_domains
            .get(domain_id)
            .cloned())
    }

    async fn decrement_domain_service_count(&self, domain_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(domain) = state.platform_domains.get_mut(domain_id)
            && domain.service_count > 0
        {
            domain.service_count -= 1;
        }
        Ok(())
    }

    async fn insert_dns_record(&self, record: &DnsRecordRow) -> Result<()> {
        self.state.lock().await.dns_records.push(record.clone());
        Ok(())
    }

    async fn insert_custom_domain(&self, domain: &CustomDomainRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .custom_domains
            .insert(domain.id.clone(), domain.clone());
        Ok(())
    }

    async fn get_custom_domain(&self, domain_id: &str) -> Result<Option<CustomDomainRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .custom_domains
            .get(domain_id)
            .cloned())
    }

    async fn mark_custom_domain_verified(&self, domain_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let domain = state
            .custom_domains
            .get_mut(domain_id)
            .ok_or_else(|| not_found("CustomDomain", domain_id))?;
        domain.is_verified = true;
        Ok(())
    }

    async fn insert_deployment(&self, deployment: &DeploymentRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .deployments
            .insert(deployment.id.clone(), deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .deployments
            .get(deployment_id)
            .cloned())
    }

    async fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: &DeploymentStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let deployment = state.deployment_mut(deployment_id)?;
        deployment.status = status.clone();
        if let Some(error) = error {
            deployment.error_message = Some(error.to_string());
        }
        match status {
            DeploymentStatus::Building => {
                deployment.started_at.get_or_insert(now);
            }
            DeploymentStatus::Live | DeploymentStatus::Failed => {
                deployment.completed_at = Some(now);
            }
            _ => {}
        }
        Ok(())
    }

    async fn set_deployment_image(
        &self,
        deployment_id: &str,
        image_tag: &str,
        build_logs: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let deployment = state.deployment_mut(deployment_id)?;
        deployment.image_tag = Some(image_tag.to_string());
        if let Some(logs) = build_logs {
            deployment.build_logs = Some(logs.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{ContainerType, SourceType};
    use chrono::Duration;
    use serde_json::json;

    fn new_job(service_id: Option<&str>, scheduled_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: "deploy".to_string(),
            payload: json!({ "serviceId": service_id }),
            service_id: service_id.map(str::to_string),
            scheduled_at,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_claim_is_conditional_on_observed_status() {
        let store = MemoryPersistence::new();
        let now = Utc::now();
        let job = store.insert_job(&new_job(None, now)).await.unwrap();

        let first = store
            .try_claim_job(&job.id, &JobStatus::Pending, now)
            .await
            .unwrap();
        let second = store
            .try_claim_job(&job.id, &JobStatus::Pending, now)
            .await
            .unwrap();

        assert_eq!(first.unwrap().attempts, 1);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_busy_service_is_not_claimable() {
        let store = MemoryPersistence::new();
        let now = Utc::now();
        let a = store.insert_job(&new_job(Some("svc"), now)).await.unwrap();
        let b = store.insert_job(&new_job(Some("svc"), now)).await.unwrap();

        store
            .try_claim_job(&a.id, &JobStatus::Pending, now)
            .await
            .unwrap()
            .unwrap();

        assert!(store.find_claimable_job(now).await.unwrap().is_none());
        assert!(
            store
                .try_claim_job(&b.id, &JobStatus::Pending, now)
                .await
                .unwrap()
                .is_none()
        );

        assert!(store.complete_job(&a.id, 1, now).await.unwrap());
        let next = store.find_claimable_job(now).await.unwrap().unwrap();
        assert_eq!(next.id, b.id);
    }

    #[tokio::test]
    async fn test_settling_requires_the_current_claim() {
        let store = MemoryPersistence::new();
        let now = Utc::now();
        let job = store.insert_job(&new_job(Some("svc"), now)).await.unwrap();
        store
            .try_claim_job(&job.id, &JobStatus::Pending, now)
            .await
            .unwrap()
            .unwrap();
        store
            .requeue_stale_jobs(now + Duration::seconds(1), now)
            .await
            .unwrap();
        let reclaimed = store
            .try_claim_job(&job.id, &JobStatus::Retrying, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);

        assert!(!store.complete_job(&job.id, 1, now).await.unwrap());
        assert!(!store.fail_job(&job.id, 1, "late", now).await.unwrap());
        assert!(!store.retry_job(&job.id, 1, "late", now).await.unwrap());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);

        assert!(store.complete_job(&job.id, 2, now).await.unwrap());
        assert!(!store.complete_job(&job.id, 2, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_future_jobs_are_not_claimable() {
        let store = MemoryPersistence::new();
        let now = Utc::now();
        store
            .insert_job(&new_job(None, now + Duration::seconds(60)))
            .await
            .unwrap();
        assert!(store.find_claimable_job(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_domain_counter_clamps_at_zero() {
        let store = MemoryPersistence::new();
        store
            .insert_platform_domain(&PlatformDomainRecord {
                id: "pd".to_string(),
                domain: "apps.example.com".to_string(),
                cloudflare_zone_id: "zone".to_string(),
                is_default: true,
                service_count: 1,
            })
            .await
            .unwrap();

        for _ in 0..3 {
            store.decrement_domain_service_count("pd").await.unwrap();
        }

        let domain = store.get_platform_domain("pd").await.unwrap().unwrap();
        assert_eq!(domain.service_count, 0);
    }

    #[tokio::test]
    async fn test_delete_service_cascades() {
        let store = MemoryPersistence::new();
        let service = ServiceRecord::new("user", "web", "web", SourceType::Docker);
        store.insert_service(&service).await.unwrap();
        store
            .insert_container(&ContainerRecord::new(
                &service.id,
                ContainerType::App,
                "web-app",
            ))
            .await
            .unwrap();

        assert!(store.delete_service(&service.id).await.unwrap());
        assert!(store.containers(&service.id).await.is_empty());
        assert!(!store.delete_service(&service.id).await.unwrap());
    }
}
