// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for digi-orchestrator.
//!
//! The relational rows are the single source of truth for jobs, services,
//! containers, VMs and domains. Handlers and the queue only ever see the
//! [`Persistence`] trait; [`PostgresPersistence`] backs production and
//! [`MemoryPersistence`] backs tests and local runs.
//!
//! Status columns are plain text. Values this build does not know are kept
//! as `Unknown(..)` instead of being rejected, because other subsystems
//! (UI, CLI) may write newer values.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digi_clients::NodeCredentials;
use sqlx::types::Json;

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Row with the given id does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Row id.
        id: String,
    },

    /// Insert collided with an existing row.
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Result type using PersistenceError.
pub type Result<T> = std::result::Result<T, PersistenceError>;

macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            /// A value written by something newer than this build.
            Unknown(String),
        }

        impl $name {
            /// Text stored in the database.
            pub fn as_str(&self) -> &str {
                match self {
                    $($name::$variant => $text,)+
                    $name::Unknown(value) => value.as_str(),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                match value {
                    $($text => $name::$variant,)+
                    other => $name::Unknown(other.to_string()),
                }
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                $name::from(value.as_str())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

text_enum! {
    /// Job lifecycle state.
    JobStatus {
        /// Waiting to be claimed.
        Pending => "pending",
        /// Claimed by a worker.
        Processing => "processing",
        /// Finished successfully.
        Completed => "completed",
        /// Gave up.
        Failed => "failed",
        /// Waiting for another attempt.
        Retrying => "retrying",
    }
}

text_enum! {
    /// Service lifecycle state.
    ServiceStatus {
        /// Created, never deployed.
        Created => "created",
        /// Deploy in progress.
        Deploying => "deploying",
        /// Serving traffic.
        Running => "running",
        /// Containers stopped.
        Stopped => "stopped",
        /// Last deploy failed.
        Error => "error",
        /// Teardown in progress.
        Destroying => "destroying",
    }
}

text_enum! {
    /// Where a service's app image comes from.
    SourceType {
        /// Built from a Git repository.
        Github => "github",
        /// Pulled by image reference.
        Docker => "docker",
    }
}

text_enum! {
    /// Kind of container inside a service.
    ContainerType {
        /// The service's main process.
        App => "app",
        /// PostgreSQL add-on.
        Postgres => "postgres",
        /// Redis add-on.
        Redis => "redis",
        /// Arbitrary image.
        Docker => "docker",
    }
}

text_enum! {
    /// Container lifecycle state.
    ContainerStatus {
        /// Declared, not yet created.
        Pending => "pending",
        /// Being created.
        Creating => "creating",
        /// Running.
        Running => "running",
        /// Stopped.
        Stopped => "stopped",
        /// Failed to start.
        Error => "error",
        /// Being removed.
        Destroying => "destroying",
    }
}

text_enum! {
    /// VM lifecycle state.
    VmStatus {
        /// Being cloned and booted.
        Provisioning => "provisioning",
        /// Running with a known address.
        Running => "running",
        /// Powered off.
        Stopped => "stopped",
        /// Provisioning failed.
        Error => "error",
        /// Being removed.
        Destroying => "destroying",
    }
}

text_enum! {
    /// Hypervisor node state.
    NodeStatus {
        /// Accepts new VMs.
        Active => "active",
        /// Existing VMs keep running, no new placements.
        Maintenance => "maintenance",
        /// Unreachable.
        Offline => "offline",
    }
}

text_enum! {
    /// Deployment lifecycle state.
    DeploymentStatus {
        /// Waiting for the worker.
        Queued => "queued",
        /// Image being produced.
        Building => "building",
        /// Containers and routing being set up.
        Deploying => "deploying",
        /// Serving traffic.
        Live => "live",
        /// Failed.
        Failed => "failed",
        /// Replaced by an earlier deployment.
        RolledBack => "rolled_back",
    }
}

impl ContainerType {
    /// Whether containers of this kind get public routing.
    pub fn is_public(&self) -> bool {
        matches!(self, ContainerType::App | ContainerType::Docker)
    }

    /// Default image and listening port of an add-on.
    pub fn addon_defaults(&self) -> Option<(&'static str, u16)> {
        match self {
            ContainerType::Postgres => Some(("postgres:16-alpine", 5432)),
            ContainerType::Redis => Some(("redis:7-alpine", 6379)),
            _ => None,
        }
    }
}

// ============================================================================
// Record Types
// ============================================================================

/// Job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Job id.
    pub id: String,
    /// Job type (`deploy`, `destroy`, `scale`, `build`).
    #[sqlx(rename = "type")]
    pub job_type: String,
    /// Type-specific payload.
    pub payload: serde_json::Value,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    /// Number of times the job was claimed.
    pub attempts: i32,
    /// Claims allowed before the job is failed.
    pub max_attempts: i32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Service the job acts on, copied from the payload.
    pub service_id: Option<String>,
    /// Earliest time the job may be claimed.
    pub scheduled_at: DateTime<Utc>,
    /// When the current or last attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

/// Job to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job type.
    pub job_type: String,
    /// Payload.
    pub payload: serde_json::Value,
    /// Service the job acts on.
    pub service_id: Option<String>,
    /// Earliest claim time.
    pub scheduled_at: DateTime<Utc>,
    /// Claims allowed.
    pub max_attempts: i32,
}

/// Outcome of a stale-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleJobsOutcome {
    /// Jobs put back for another attempt.
    pub requeued: u64,
    /// Jobs that had no attempts left.
    pub failed: u64,
}

/// Error recorded on jobs abandoned by their worker.
pub const STALE_JOB_ERROR: &str = "stale: worker did not finish";

/// Service row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceRecord {
    /// Service id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// VM the service runs on.
    pub vm_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Unique public subdomain label.
    pub subdomain: String,
    /// Platform domain the subdomain lives under.
    pub platform_domain_id: Option<String>,
    /// Image source.
    #[sqlx(try_from = "String")]
    pub source_type: SourceType,
    /// Repository URL for Git-sourced services.
    pub git_url: Option<String>,
    /// Branch to build.
    pub branch: String,
    /// Image reference for image-sourced services.
    pub docker_image: Option<String>,
    /// Port the app listens on.
    pub port: i32,
    /// Environment passed to the app.
    pub env_vars: Json<BTreeMap<String, String>>,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: ServiceStatus,
    /// Deployment currently serving.
    pub current_deployment_id: Option<String>,
    /// Dashboard link.
    pub dashboard_url: Option<String>,
    /// Public URL.
    pub public_url: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    /// A fresh service in `created` state.
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        subdomain: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            vm_id: None,
            name: name.into(),
            subdomain: subdomain.into(),
            platform_domain_id: None,
            source_type,
            git_url: None,
            branch: "main".to_string(),
            docker_image: None,
            port: 3000,
            env_vars: Json(BTreeMap::new()),
            status: ServiceStatus::Created,
            current_deployment_id: None,
            dashboard_url: None,
            public_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Container row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContainerRecord {
    /// Container id.
    pub id: String,
    /// Owning service.
    pub service_id: String,
    /// Kind of container.
    #[sqlx(rename = "type", try_from = "String")]
    pub container_type: ContainerType,
    /// Name on the VM's engine.
    pub name: String,
    /// Subdomain label routed to this container.
    pub subdomain: Option<String>,
    /// Runtime handle on the VM.
    pub docker_container_id: Option<String>,
    /// Image the container runs.
    pub image: Option<String>,
    /// Port the process listens on inside the container.
    pub container_port: Option<i32>,
    /// Loopback port on the VM the VM-local proxy forwards to.
    pub host_port: Option<i32>,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: ContainerStatus,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// A fresh `pending` container.
    pub fn new(
        service_id: impl Into<String>,
        container_type: ContainerType,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            container_type,
            name: name.into(),
            subdomain: None,
            docker_container_id: None,
            image: None,
            container_port: None,
            host_port: None,
            status: ContainerStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Runtime fields written after a container is (re)started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntimeUpdate {
    /// Runtime handle on the VM.
    pub docker_container_id: Option<String>,
    /// Image running.
    pub image: Option<String>,
    /// Published loopback port.
    pub host_port: Option<i32>,
    /// New state.
    pub status: ContainerStatus,
}

/// VM row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VmRecord {
    /// VM id.
    pub id: String,
    /// Hypervisor node hosting the VM.
    pub server_id: String,
    /// Hypervisor-native VM id.
    pub proxmox_vm_id: i32,
    /// VM name.
    pub name: String,
    /// Guest address, once known.
    pub ip_address: Option<String>,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: VmStatus,
    /// vCPUs.
    pub cpu_cores: i32,
    /// Memory, MiB.
    pub memory_mb: i32,
    /// Disk, GiB.
    pub disk_gb: i32,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Hypervisor node row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRecord {
    /// Node id.
    pub id: String,
    /// Node name, as known to the hypervisor.
    pub name: String,
    /// Hostname of the control-plane API.
    pub hostname: String,
    /// Port of the control-plane API.
    pub port: i32,
    /// API token id.
    pub api_token_id: String,
    /// API token secret.
    pub api_token_secret: String,
    /// Region label.
    pub region: String,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: NodeStatus,
    /// VM capacity.
    pub max_vms: i32,
}

impl NodeRecord {
    /// Credentials for the hypervisor client.
    pub fn credentials(&self) -> NodeCredentials {
        let port = u16::try_from(self.port).unwrap_or(8006);
        NodeCredentials::new(
            &self.hostname,
            port,
            self.name.clone(),
            self.api_token_id.clone(),
            self.api_token_secret.clone(),
        )
    }
}

/// A node with its current VM count.
#[derive(Debug, Clone)]
pub struct NodeCapacity {
    /// Node row.
    pub node: NodeRecord,
    /// VMs placed on the node.
    pub vm_count: i64,
}

/// Platform domain row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlatformDomainRecord {
    /// Domain id.
    pub id: String,
    /// Base domain.
    pub domain: String,
    /// DNS provider zone id.
    pub cloudflare_zone_id: String,
    /// Offered by default for new services.
    pub is_default: bool,
    /// Services using this domain.
    pub service_count: i32,
}

/// DNS record row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DnsRecordRow {
    /// Row id.
    pub id: String,
    /// Custom domain the record belongs to.
    pub domain_id: Option<String>,
    /// Service the record belongs to.
    pub service_id: Option<String>,
    /// Provider-assigned id, used for deletion.
    pub cloudflare_record_id: Option<String>,
    /// Record type.
    #[sqlx(rename = "type")]
    pub record_type: String,
    /// Fully qualified name.
    pub name: String,
    /// Content.
    pub content: String,
    /// Whether traffic is proxied.
    pub proxied: bool,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

/// Deployment row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeploymentRecord {
    /// Deployment id.
    pub id: String,
    /// Service deployed.
    pub service_id: String,
    /// User who requested it.
    pub user_id: String,
    /// Commit deployed, when known.
    pub commit_sha: Option<String>,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub status: DeploymentStatus,
    /// Image produced for this deployment.
    pub image_tag: Option<String>,
    /// Build output.
    pub build_logs: Option<String>,
    /// Failure reason.
    pub error_message: Option<String>,
    /// When work started.
    pub started_at: Option<DateTime<Utc>>,
    /// When work finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// A fresh `queued` deployment.
    pub fn queued(service_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            user_id: user_id.into(),
            commit_sha: None,
            status: DeploymentStatus::Queued,
            image_tag: None,
            build_logs: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Custom domain row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomDomainRecord {
    /// Custom domain id.
    pub id: String,
    /// Service the domain points at.
    pub service_id: String,
    /// The domain.
    pub domain: String,
    /// Token expected in the verification TXT record.
    pub verification_token: Option<String>,
    /// Whether ownership was proven.
    pub is_verified: bool,
    /// Certificate state.
    pub ssl_status: String,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

/// A service with everything deploy and destroy need.
#[derive(Debug, Clone)]
pub struct ServiceBundle {
    /// The service.
    pub service: ServiceRecord,
    /// Its containers.
    pub containers: Vec<ContainerRecord>,
    /// Its VM.
    pub vm: Option<VmRecord>,
    /// Its platform domain.
    pub platform_domain: Option<PlatformDomainRecord>,
    /// DNS records owned by the service.
    pub dns_records: Vec<DnsRecordRow>,
}

impl ServiceBundle {
    /// Guest address of the service's VM, if provisioned.
    pub fn vm_ip(&self) -> Option<&str> {
        self.vm.as_ref().and_then(|vm| vm.ip_address.as_deref())
    }
}

// ============================================================================
// Persistence Trait
// ============================================================================

/// Durable storage used by the queue, worker and handlers.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---- Jobs ----

    /// Insert a `pending` job.
    async fn insert_job(&self, job: &NewJob) -> Result<JobRecord>;

    /// Fetch a job.
    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Oldest claimable job: `pending` or `retrying`, due at `now`, and not
    /// for a service that already has a `processing` job.
    async fn find_claimable_job(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Move a job from `observed` to `processing`, bumping `attempts`.
    ///
    /// Returns `None` if the job is no longer in `observed` state, or if
    /// another job for the same service became `processing` meanwhile.
    async fn try_claim_job(
        &self,
        job_id: &str,
        observed: &JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    /// Mark a job `completed`.
    ///
    /// The three settling writes below apply only while the job is still
    /// `processing` under the claim numbered `attempt`, and return whether
    /// they did. A stale claim that was requeued and reclaimed by another
    /// worker gets `false` and leaves the row alone.
    async fn complete_job(&self, job_id: &str, attempt: i32, now: DateTime<Utc>) -> Result<bool>;

    /// Mark a job `failed`.
    async fn fail_job(
        &self,
        job_id: &str,
        attempt: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Put a job back as `retrying`, claimable from `run_at`.
    async fn retry_job(
        &self,
        job_id: &str,
        attempt: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Recover jobs stuck in `processing` since before `started_before`.
    async fn requeue_stale_jobs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<StaleJobsOutcome>;

    // ---- Services & containers ----

    /// Insert a service.
    async fn insert_service(&self, service: &ServiceRecord) -> Result<()>;

    /// Fetch a service.
    async fn get_service(&self, service_id: &str) -> Result<Option<ServiceRecord>>;

    /// Fetch a service with its containers, VM, platform domain and DNS records.
    async fn load_service_bundle(&self, service_id: &str) -> Result<Option<ServiceBundle>>;

    /// Set a service's status.
    async fn set_service_status(&self, service_id: &str, status: &ServiceStatus) -> Result<()>;

    /// Attach a service to a VM.
    async fn set_service_vm(&self, service_id: &str, vm_id: &str) -> Result<()>;

    /// Record where a deployed service is reachable.
    async fn set_service_urls(
        &self,
        service_id: &str,
        public_url: Option<&str>,
        dashboard_url: Option<&str>,
        current_deployment_id: &str,
    ) -> Result<()>;

    /// Delete a service; its containers, deployments and DNS rows go with it.
    ///
    /// Returns whether a row was deleted.
    async fn delete_service(&self, service_id: &str) -> Result<bool>;

    /// Insert a container.
    async fn insert_container(&self, container: &ContainerRecord) -> Result<()>;

    /// Record a container's runtime handle, image, port and status.
    async fn update_container_runtime(
        &self,
        container_id: &str,
        update: &ContainerRuntimeUpdate,
    ) -> Result<()>;

    /// Set a container's status.
    async fn set_container_status(&self, container_id: &str, status: &ContainerStatus)
    -> Result<()>;

    /// Loopback ports in use by containers of services on `vm_id`.
    async fn list_vm_host_ports(&self, vm_id: &str) -> Result<Vec<i32>>;

    // ---- Nodes & VMs ----

    /// Insert a hypervisor node.
    async fn insert_node(&self, node: &NodeRecord) -> Result<()>;

    /// All hypervisor nodes.
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    /// All nodes with their VM counts.
    async fn list_node_capacity(&self) -> Result<Vec<NodeCapacity>>;

    /// Highest hypervisor-native VM id in use.
    async fn max_hypervisor_vm_id(&self) -> Result<Option<i32>>;

    /// Insert a VM.
    async fn insert_vm(&self, vm: &VmRecord) -> Result<()>;

    /// Fetch a VM.
    async fn get_vm(&self, vm_id: &str) -> Result<Option<VmRecord>>;

    /// Record a VM's guest address and status.
    async fn update_vm_network(&self, vm_id: &str, ip_address: &str, status: &VmStatus)
    -> Result<()>;

    /// Set a VM's status.
    async fn set_vm_status(&self, vm_id: &str, status: &VmStatus) -> Result<()>;

    // ---- Domains & DNS ----

    /// Insert a platform domain.
    async fn insert_platform_domain(&self, domain: &PlatformDomainRecord) -> Result<()>;

    /// Fetch a platform domain.
    async fn get_platform_domain(&self, domain_id: &str) -> Result<Option<PlatformDomainRecord>>;

    /// Decrement `service_count`, never below zero.
    async fn decrement_domain_service_count(&self, domain_id: &str) -> Result<()>;

    /// Insert a DNS record row.
    async fn insert_dns_record(&self, record: &DnsRecordRow) -> Result<()>;

    /// Insert a custom domain.
    async fn insert_custom_domain(&self, domain: &CustomDomainRecord) -> Result<()>;

    /// Fetch a custom domain.
    async fn get_custom_domain(&self, domain_id: &str) -> Result<Option<CustomDomainRecord>>;

    /// Mark a custom domain verified.
    async fn mark_custom_domain_verified(&self, domain_id: &str) -> Result<()>;

    // ---- Deployments ----

    /// Insert a deployment.
    async fn insert_deployment(&self, deployment: &DeploymentRecord) -> Result<()>;

    /// Fetch a deployment.
    async fn get_deployment(&self, deployment_id: &str) -> Result<Option<DeploymentRecord>>;

    /// Move a deployment to `status`.
    ///
    /// `building` sets `started_at` if unset; `live` and `failed` set
    /// `completed_at`. `error` is stored as the failure reason when given.
    async fn set_deployment_status(
        &self,
        deployment_id: &str,
        status: &DeploymentStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Record the image produced for a deployment.
    async fn set_deployment_image(
        &self,
        deployment_id: &str,
        image_tag: &str,
        build_logs: Option<&str>,
    ) -> Result<()>;
}
