// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for digi-orchestrator.
//!
//! Every operation is a free function over `&PgPool`; [`PostgresPersistence`]
//! delegates to them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{
    ContainerRecord, ContainerRuntimeUpdate, ContainerStatus, CustomDomainRecord,
    DeploymentRecord, DeploymentStatus, DnsRecordRow, JobRecord, JobStatus, NewJob, NodeCapacity,
    NodeRecord, Persistence, PersistenceError, PlatformDomainRecord, Result, STALE_JOB_ERROR,
    ServiceBundle, ServiceRecord, ServiceStatus, StaleJobsOutcome, VmRecord, VmStatus,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn ensure_found(rows_affected: u64, entity: &'static str, id: &str) -> Result<()> {
    if rows_affected == 0 {
        return Err(PersistenceError::NotFound {
            entity,
            id: id.to_string(),
        });
    }
    Ok(())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ============================================================================
// Job Operations
// ============================================================================

/// Insert a pending job.
pub async fn insert_job(pool: &PgPool, job: &NewJob) -> Result<JobRecord> {
    let record = sqlx::query_as::<_, JobRecord>(
        r#"
        INSERT INTO jobs (id, type, payload, status, attempts, max_attempts, service_id, scheduled_at, created_at)
        VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, NOW())
        RETURNING *
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.max_attempts)
    .bind(&job.service_id)
    .bind(job.scheduled_at)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Fetch a job.
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Oldest claimable job.
pub async fn find_claimable_job(pool: &PgPool, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
    let record = sqlx::query_as::<_, JobRecord>(
        r#"
        SELECT j.*
        FROM jobs j
        WHERE j.status IN ('pending', 'retrying')
          AND j.scheduled_at <= $1
          AND (
            j.service_id IS NULL
            OR NOT EXISTS (
              SELECT 1 FROM jobs p
              WHERE p.service_id = j.service_id AND p.status = 'processing'
            )
          )
        ORDER BY j.scheduled_at ASC, j.created_at ASC
        LIMIT 1
        "#,
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Conditionally move a job to `processing`.
///
/// A unique violation on the one-processing-job-per-service index means a
/// concurrent claim for the same service won; that is reported as `None`.
pub async fn try_claim_job(
    pool: &PgPool,
    job_id: &str,
    observed: &JobStatus,
    now: DateTime<Utc>,
) -> Result<Option<JobRecord>> {
    let result = sqlx::query_as::<_, JobRecord>(
        r#"
        UPDATE jobs
        SET status = 'processing', attempts = attempts + 1, started_at = $3
        WHERE id = $1 AND status = $2
        RETURNING *
        "#,
    )
    .bind(job_id)
    .bind(observed.as_str())
    .bind(now)
    .fetch_optional(pool)
    .await;

    match result {
        Ok(record) => Ok(record),
        Err(e) if is_unique_violation(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Mark a job completed, if `attempt` still holds its claim.
///
/// Returns `false` when the job was requeued and reclaimed since.
pub async fn complete_job(
    pool: &PgPool,
    job_id: &str,
    attempt: i32,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed', completed_at = $3
        WHERE id = $1 AND status = 'processing' AND attempts = $2
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a job failed, if `attempt` still holds its claim.
pub async fn fail_job(
    pool: &PgPool,
    job_id: &str,
    attempt: i32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', last_error = $3, completed_at = $4
        WHERE id = $1 AND status = 'processing' AND attempts = $2
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Put a job back for a later attempt, if `attempt` still holds its claim.
pub async fn retry_job(
    pool: &PgPool,
    job_id: &str,
    attempt: i32,
    error: &str,
    run_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'retrying', last_error = $3, scheduled_at = $4
        WHERE id = $1 AND status = 'processing' AND attempts = $2
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .bind(error)
    .bind(run_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Recover jobs left in `processing` by a crashed worker.
pub async fn requeue_stale_jobs(
    pool: &PgPool,
    started_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<StaleJobsOutcome> {
    let mut tx = pool.begin().await?;

    let failed = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', last_error = $2, completed_at = $3
        WHERE status = 'processing' AND started_at < $1 AND attempts >= max_attempts
        "#,
    )
    .bind(started_before)
    .bind(STALE_JOB_ERROR)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let requeued = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'retrying', last_error = $2, scheduled_at = $3
        WHERE status = 'processing' AND started_at < $1
        "#,
    )
    .bind(started_before)
    .bind(STALE_JOB_ERROR)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    Ok(StaleJobsOutcome { requeued, failed })
}

// ============================================================================
// Service & Container Operations
// ============================================================================

/// Insert a service.
pub async fn insert_service(pool: &PgPool, service: &ServiceRecord) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO services (
            id, user_id, vm_id, name, subdomain, platform_domain_id, source_type, git_url,
            branch, docker_image, port, env_vars, status, current_deployment_id,
            dashboard_url, public_url, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(&service.id)
    .bind(&service.user_id)
    .bind(&service.vm_id)
    .bind(&service.name)
    .bind(&service.subdomain)
    .bind(&service.platform_domain_id)
    .bind(service.source_type.as_str())
    .bind(&service.git_url)
    .bind(&service.branch)
    .bind(&service.docker_image)
    .bind(service.port)
    .bind(&service.env_vars)
    .bind(service.status.as_str())
    .bind(&service.current_deployment_id)
    .bind(&service.dashboard_url)
    .bind(&service.public_url)
    .bind(service.created_at)
    .bind(service.updated_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(PersistenceError::Conflict(format!(
            "subdomain {} is taken",
            service.subdomain
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Fetch a service.
pub async fn get_service(pool: &PgPool, service_id: &str) -> Result<Option<ServiceRecord>> {
    let record = sqlx::query_as::<_, ServiceRecord>("SELECT * FROM services WHERE id = $1")
        .bind(service_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Fetch a service and everything attached to it.
pub async fn load_service_bundle(pool: &PgPool, service_id: &str) -> Result<Option<ServiceBundle>> {
    let Some(service) = get_service(pool, service_id).await? else {
        return Ok(None);
    };

    let containers = sqlx::query_as::<_, ContainerRecord>(
        "SELECT * FROM containers WHERE service_id = $1 ORDER BY created_at ASC",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;

    let vm = match &service.vm_id {
        Some(vm_id) => get_vm(pool, vm_id).await?,
        None => None,
    };

    let platform_domain = match &service.platform_domain_id {
        Some(domain_id) => get_platform_domain(pool, domain_id).await?,
        None => None,
    };

    let dns_records = sqlx::query_as::<_, DnsRecordRow>(
        "SELECT * FROM dns_records WHERE service_id = $1 ORDER BY created_at ASC",
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;

    Ok(Some(ServiceBundle {
        service,
        containers,
        vm,
        platform_domain,
        dns_records,
    }))
}

/// Set a service's status.
pub async fn set_service_status(
    pool: &PgPool,
    service_id: &str,
    status: &ServiceStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE services SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(service_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;

    ensure_found(result.rows_affected(), "Service", service_id)
}

/// Attach a service to a VM.
pub async fn set_service_vm(pool: &PgPool, service_id: &str, vm_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE services SET vm_id = $2, updated_at = NOW() WHERE id = $1")
        .bind(service_id)
        .bind(vm_id)
        .execute(pool)
        .await?;

    ensure_found(result.rows_affected(), "Service", service_id)
}

/// Record a deployed service's URLs and current deployment.
pub async fn set_service_urls(
    pool: &PgPool,
    service_id: &str,
    public_url: Option<&str>,
    dashboard_url: Option<&str>,
    current_deployment_id: &str,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE services
        SET public_url = $2, dashboard_url = $3, current_deployment_id = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(service_id)
    .bind(public_url)
    .bind(dashboard_url)
    .bind(current_deployment_id)
    .execute(pool)
    .await?;

    ensure_found(result.rows_affected(), "Service", service_id)
}

/// Delete a service. Dependent rows cascade.
pub async fn delete_service(pool: &PgPool, service_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM services WHERE id = $1")
        .bind(service_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a container.
pub async fn insert_container(pool: &PgPool, container: &ContainerRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO containers (
            id, service_id, type, name, subdomain, docker_container_id, image,
            container_port, host_port, status, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&container.id)
    .bind(&container.service_id)
    .bind(container.container_type.as_str())
    .bind(&container.name)
    .bind(&container.subdomain)
    .bind(&container.docker_container_id)
    .bind(&container.image)
    .bind(container.container_port)
    .bind(container.host_port)
    .bind(container.status.as_str())
    .bind(container.created_at)
    .bind(container.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a container's runtime state. `None` image or port keeps the stored value.
pub async fn update_container_runtime(
    pool: &PgPool,
    container_id: &str,
    update: &ContainerRuntimeUpdate,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE containers
        SET docker_container_id = $2,
            image = COALESCE($3, image),
            host_port = COALESCE($4, host_port),
            status = $5,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(container_id)
    .bind(&update.docker_container_id)
    .bind(&update.image)
    .bind(update.host_port)
    .bind(update.status.as_str())
    .execute(pool)
    .await?;

    ensure_found(result.rows_affected(), "Container", container_id)
}

/// Set a container's status.
pub async fn set_container_status(
    pool: &PgPool,
    container_id: &str,
    status: &ContainerStatus,
) -> Result<()> {
    let result =
        sqlx::query("UPDATE containers SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(container_id)
            .bind(status.as_str())
            .execute(pool)
            .await?;

    ensure_found(result.rows_affected(), "Container", container_id)
}

/// Loopback ports used by containers of services on a VM.
pub async fn list_vm_host_ports(pool: &PgPool, vm_id: &str) -> Result<Vec<i32>> {
    let ports = sqlx::query_scalar::<_, i32>(
        r#"
        SELECT c.host_port
        FROM containers c
        JOIN services s ON s.id = c.service_id
        WHERE s.vm_id = $1 AND c.host_port IS NOT NULL
        "#,
    )
    .bind(vm_id)
    .fetch_all(pool)
    .await?;

    Ok(ports)
}

// ============================================================================
// Node & VM Operations
// ============================================================================

#[derive(sqlx::FromRow)]
struct NodeCapacityRow {
    #[sqlx(flatten)]
    node: NodeRecord,
    vm_count: i64,
}

/// Insert a hypervisor node.
pub async fn insert_node(pool: &PgPool, node: &NodeRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO servers (id, name, hostname, port, api_token_id, api_token_secret, region, status, max_vms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&node.id)
    .bind(&node.name)
    .bind(&node.hostname)
    .bind(node.port)
    .bind(&node.api_token_id)
    .bind(&node.api_token_secret)
    .bind(&node.region)
    .bind(node.status.as_str())
    .bind(node.max_vms)
    .execute(pool)
    .await?;

    Ok(())
}

/// All hypervisor nodes.
pub async fn list_nodes(pool: &PgPool) -> Result<Vec<NodeRecord>> {
    let records = sqlx::query_as::<_, NodeRecord>(
        r#"
        SELECT id, name, hostname, port, api_token_id, api_token_secret, region, status, max_vms
        FROM servers
        ORDER BY name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// All nodes with their VM counts.
pub async fn list_node_capacity(pool: &PgPool) -> Result<Vec<NodeCapacity>> {
    let rows = sqlx::query_as::<_, NodeCapacityRow>(
        r#"
        SELECT s.id, s.name, s.hostname, s.port, s.api_token_id, s.api_token_secret,
               s.region, s.status, s.max_vms, COUNT(v.id) AS vm_count
        FROM servers s
        LEFT JOIN vms v ON v.server_id = s.id
        GROUP BY s.id
        ORDER BY s.name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| NodeCapacity {
            node: row.node,
            vm_count: row.vm_count,
        })
        .collect())
}

/// Highest hypervisor-native VM id in use.
pub async fn max_hypervisor_vm_id(pool: &PgPool) -> Result<Option<i32>> {
    let max = sqlx::query_scalar::<_, Option<i32>>("SELECT MAX(proxmox_vm_id) FROM vms")
        .fetch_one(pool)
        .await?;

    Ok(max)
}

/// Insert a VM.
pub async fn insert_vm(pool: &PgPool, vm: &VmRecord) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO vms (
            id, server_id, proxmox_vm_id, name, ip_address, status,
            cpu_cores, memory_mb, disk_gb, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&vm.id)
    .bind(&vm.server_id)
    .bind(vm.proxmox_vm_id)
    .bind(&vm.name)
    .bind(&vm.ip_address)
    .bind(vm.status.as_str())
    .bind(vm.cpu_cores)
    .bind(vm.memory_mb)
    .bind(vm.disk_gb)
    .bind(vm.created_at)
    .bind(vm.updated_at)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(PersistenceError::Conflict(format!(
            "hypervisor vm id {} is taken",
            vm.proxmox_vm_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Fetch a VM.
pub async fn get_vm(pool: &PgPool, vm_id: &str) -> Result<Option<VmRecord>> {
    let record = sqlx::query_as::<_, VmRecord>("SELECT * FROM vms WHERE id = $1")
        .bind(vm_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Record a VM's guest address and status.
pub async fn update_vm_network(
    pool: &PgPool,
    vm_id: &str,
    ip_address: &str,
    status: &VmStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE vms SET ip_address = $2, status = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(vm_id)
    .bind(ip_address)
    .bind(status.as_str())
    .execute(pool)
    .await?;

    ensure_found(result.rows_affected(), "Vm", vm_id)
}

/// Set a VM's status.
pub async fn set_vm_status(pool: &PgPool, vm_id: &str, status: &VmStatus) -> Result<()> {
    let result = sqlx::query("UPDATE vms SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(vm_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;

    ensure_found(result.rows_affected(), "Vm", vm_id)
}

// ============================================================================
// Domain & DNS Operations
// ============================================================================

/// Insert a platform domain.
pub async fn insert_platform_domain(pool: &PgPool, domain: &PlatformDomainRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO platform_domains (id, domain, cloudflare_zone_id, is_default, service_count)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&domain.id)
    .bind(&domain.domain)
    .bind(&domain.cloudflare_zone_id)
    .bind(domain.is_default)
    .bind(domain.service_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a platform domain.
pub async fn get_platform_domain(
    pool: &PgPool,
    domain_id: &str,
) -> Result<Option<PlatformDomainRecord>> {
    let record =
        sqlx::query_as::<_, PlatformDomainRecord>("SELECT * FROM platform_domains WHERE id = $1")
            .bind(domain_id)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// Decrement a platform domain's service count, clamped at zero.
pub async fn decrement_domain_service_count(pool: &PgPool, domain_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE platform_domains
        SET service_count = service_count - 1
        WHERE id = $1 AND service_count > 0
        "#,
    )
    .bind(domain_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a DNS record row.
pub async fn insert_dns_record(pool: &PgPool, record: &DnsRecordRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dns_records (
            id, domain_id, service_id, cloudflare_record_id, type, name, content, proxied, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&record.id)
    .bind(&record.domain_id)
    .bind(&record.service_id)
    .bind(&record.cloudflare_record_id)
    .bind(&record.record_type)
    .bind(&record.name)
    .bind(&record.content)
    .bind(record.proxied)
    .bind(record.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a custom domain.
pub async fn insert_custom_domain(pool: &PgPool, domain: &CustomDomainRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO custom_domains (
            id, service_id, domain, verification_token, is_verified, ssl_status, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&domain.id)
    .bind(&domain.service_id)
    .bind(&domain.domain)
    .bind(&domain.verification_token)
    .bind(domain.is_verified)
    .bind(&domain.ssl_status)
    .bind(domain.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a custom domain.
pub async fn get_custom_domain(
    pool: &PgPool,
    domain_id: &str,
) -> Result<Option<CustomDomainRecord>> {
    let record =
        sqlx::query_as::<_, CustomDomainRecord>("SELECT * FROM custom_domains WHERE id = $1")
            .bind(domain_id)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// Mark a custom domain verified.
pub async fn mark_custom_domain_verified(pool: &PgPool, domain_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE custom_domains SET is_verified = TRUE WHERE id = $1")
        .bind(domain_id)
        .execute(pool)
        .await?;

    ensure_found(result.rows_affected(), "CustomDomain", domain_id)
}

// ============================================================================
// Deployment Operations
// ============================================================================

/// Insert a deployment.
pub async fn insert_deployment(pool: &PgPool, deployment: &DeploymentRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deployments (
            id, service_id, user_id, commit_sha, status, image_tag, build_logs,
            error_message, started_at, completed_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&deployment.id)
    .bind(&deployment.service_id)
    .bind(&deployment.user_id)
    .bind(&deployment.commit_sha)
    .bind(deployment.status.as_str())
    .bind(&deployment.image_tag)
    .bind(&deployment.build_logs)
    .bind(&deployment.error_message)
    .bind(deployment.started_at)
    .bind(deployment.completed_at)
    .bind(deployment.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a deployment.
pub async fn get_deployment(pool: &PgPool, deployment_id: &str) -> Result<Option<DeploymentRecord>> {
    let record = sqlx::query_as::<_, DeploymentRecord>("SELECT * FROM deployments WHERE id = $1")
        .bind(deployment_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Move a deployment to a new status, stamping start and completion times.
pub async fn set_deployment_status(
    pool: &PgPool,
    deployment_id: &str,
    status: &DeploymentStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE deployments
        SET status = $2,
            error_message = COALESCE($3, error_message),
            started_at = CASE WHEN $2 = 'building' THEN COALESCE(started_at, $4) ELSE started_at END,
            completed_at = CASE WHEN $2 IN ('live', 'failed') THEN $4 ELSE completed_at END
        WHERE id = $1
        "#,
    )
    .bind(deployment_id)
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;

    ensure_found(result.rows_affected(), "Deployment", deployment_id)
}

/// Record the image built or pulled for a deployment.
pub async fn set_deployment_image(
    pool: &PgPool,
    deployment_id: &str,
    image_tag: &str,
    build_logs: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE deployments
        SET image_tag = $2, build_logs = COALESCE($3, build_logs)
        WHERE id = $1
        "#,
    )
    .bind(deployment_id)
    .bind(image_tag)
    .bind(build_logs)
    .execute(pool)
    .await?;

    ensure_found(result.rows_affected(), "Deployment", deployment_id)
}

// ============================================================================
// Trait Implementation
// ============================================================================

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_job(&self, job: &NewJob) -> Result<JobRecord> {
        insert_job(&self.pool, job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        get_job(&self.pool, job_id).await
    }

    async fn find_claimable_job(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        find_claimable_job(&self.pool, now).await
    }

    async fn try_claim_job(
        &self,
        job_id: &str,
        observed: &JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        try_claim_job(&self.pool, job_id, observed, now).await
    }

    async fn complete_job(&self, job_id: &str, attempt: i32, now: DateTime<Utc>) -> Result<bool> {
        complete_job(&self.pool, job_id, attempt, now).await
    }

    async fn fail_job(
        &self,
        job_id: &str,
        attempt: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        fail_job(&self.pool, job_id, attempt, error, now).await
    }

    async fn retry_job(
        &self,
        job_id: &str,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        retry_job(&self.pool, job_id, attempt, error, run_at).await
    }

    async fn requeue_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StaleJobsOutcome> {
        requeue_stale_jobs(&self.pool, started_before, now).await
    }

    async fn insert_service(&self, service: &ServiceRecord) -> Result<()> {
        insert_service(&self.pool, service).await
    }

    async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>> {
        get_service(&self.pool, service_id).await
    }

    async fn load_service_bundle(&self, service_id: &str) -> Result<Option<ServiceBundle>> {
        load_service_bundle(&self.pool, service_id).await
    }

    async fn set_service_status(&self, service_id: &str, status: &ServiceStatus) -> Result<()> {
        set_service_status(&self.pool, service_id, status).await
    }

    async fn set_service_vm(&self, service_id: &str, vm_id: &str) -> Result<()> {
        set_service_vm(&self.pool, service_id, vm_id).await
    }

    async fn set_service_urls(
        &self,
        service_id: &str,
        public_url: Option<&str>,
        dashboard_url: Option<&str>,
        current_deployment_id: &str,
    ) -> Result<()> {
        set_service_urls(
            &self.pool,
            service_id,
            public_url,
            dashboard_url,
            current_deployment_id,
        )
        .await
    }

    async fn delete_service(&self, service_id: &str) -> Result<bool> {
        delete_service(&self.pool, service_id).await
    }

    async fn insert_container(&self, container: &ContainerRecord) -> Result<()> {
        insert_container(&self.pool, container).await
    }

    async fn update_container_runtime(
        &self,
        container_id: &str,
        update: &ContainerRuntimeUpdate,
    ) -> Result<()> {
        update_container_runtime(&self.pool, container_id, update).await
    }

    async fn set_container_status(
        &self,
        container_id: &str,
        status: &ContainerStatus,
    ) -> Result<()> {
        set_container_status(&self.pool, container_id, status).await
    }

    async fn list_vm_host_ports(&self, vm_id: &str) -> Result<Vec<i32>> {
        list_vm_host_ports(&self.pool, vm_id).await
    }

    async fn insert_node(&self, node: &NodeRecord) -> Result<()> {
        insert_node(&self.pool, node).await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        list_nodes(&self.pool).await
    }

    async fn list_node_capacity(&self) -> Result<Vec<NodeCapacity>> {
        list_node_capacity(&self.pool).await
    }

    async fn max_hypervisor_vm_id(&self) -> Result<Option<i32>> {
        max_hypervisor_vm_id(&self.pool).await
    }

    async fn insert_vm(&self, vm: &VmRecord) -> Result<()> {
        insert_vm(&self.pool, vm).await
    }

    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmRecord>> {
        get_vm(&self.pool, vm_id).await
    }

    async fn update_vm_network(
        &self,
        vm_id: &str,
        ip_address: &str,
        status: &VmStatus,
    ) -> Result<()> {
        update_vm_network(&self.pool, vm_id, ip_address, status).await
    }

    async fn set_vm_status(&self, vm_id: &str, status: &VmStatus) -> Result<()> {
        set_vm_status(&self.pool, vm_id, status).await
    }

    async fn insert_platform_domain(&self, domain: &PlatformDomainRecord) -> Result<()> {
        insert_platform_domain(&self.pool, domain).await
    }

    async fn get_platform_domain(&self, domain_id: &str) -> Result<Option<PlatformDomainRecord>> {
        get_platform_domain(&self.pool, domain_id).await
    }

    async fn decrement_domain_service_count(&self, domain_id: &str) -> Result<()> {
        decrement_domain_service_count(&self.pool, domain_id).await
    }

    async fn insert_dns_record(&self, record: &DnsRecordRow) -> Result<()> {
        insert_dns_record(&self.pool, record).await
    }

    async fn insert_custom_domain(&self, domain: &CustomDomainRecord) -> Result<()> {
        insert_custom_domain(&self.pool, domain).await
    }

    async fn get_custom_domain(&self, domain_id: &str) -> Result<Option<CustomDomainRecord>> {
        get_custom_domain(&self.pool, domain_id).await
    }

    async fn mark_custom_domain_verified(&self, domain_id: &str) -> Result<()> {
        mark_custom_domain_verified(&self.pool, domain_id).await
    }

    async fn insert_deployment(&self, deployment: &DeploymentRecord) -> Result<()> {
        insert_deployment(&self.pool, deployment).await
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>> {
        get_deployment(&self.pool, deployment_id).await
    }

    async fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: &DeploymentStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        set_deployment_status(&self.pool, deployment_id, status, error, now).await
    }

    async fn set_deployment_image(
        &self,
        deployment_id: &str,
        image_tag: &str,
        build_logs: Option<&str>,
    ) -> Result<()> {
        set_deployment_image(&self.pool, deployment_id, image_tag, build_logs).await
    }
}
