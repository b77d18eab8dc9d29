// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy handler.
//!
//! Brings a service's containers into a running state on its VM and wires
//! up routing:
//!
//! 1. Load the service with its containers, VM and platform domain.
//! 2. Provision the VM if the service has none (clone template, start, wait
//!    for the guest to report an address), and make sure an app container
//!    row exists.
//! 3. Build or pull the app image.
//! 4. (Re)start each container on the VM, register a VM-local route to its
//!    loopback port and an edge route to the VM, and make sure the DNS
//!    record exists.
//! 5. Record URLs and statuses, invalidate the owner's service list.
//!
//! Every step is safe to repeat: routes are keyed by subdomain, DNS records
//! are looked up before they are created and container rows are reused. A
//! failure marks the service `error` and the deployment `failed` without
//! rolling back completed steps; a retry starts again from the top.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use digi_clients::{
    ContainerSpec, NewDnsRecord, NodeCredentials, Route, wait_for_guest_ipv4, wait_for_task,
};
use tracing::{error, info, warn};

use super::build::produce_image;
use super::{HandlerContext, best_effort, public_host};
use crate::cache::CacheKeys;
use crate::error::{Error, Result};
use crate::persistence::{
    ContainerRecord, ContainerRuntimeUpdate, ContainerStatus, ContainerType, DeploymentStatus,
    DnsRecordRow, NodeStatus, ServiceBundle, ServiceRecord, ServiceStatus, VmRecord, VmStatus,
};

/// Handle a deploy job.
pub async fn handle(ctx: &HandlerContext, service_id: &str, deployment_id: &str) -> Result<()> {
    let result = run(ctx, service_id, deployment_id).await;

    if let Err(e) = &result {
        error!(service_id, deployment_id, error = %e, "Deploy failed");
        let message = e.to_string();
        if let Err(e) = ctx
            .persistence
            .set_service_status(service_id, &ServiceStatus::Error)
            .await
        {
            warn!(service_id, error = %e, "Failed to mark service as errored");
        }
        if let Err(e) = ctx
            .advance_deployment(
                service_id,
                deployment_id,
                DeploymentStatus::Failed,
                Some(&message),
            )
            .await
        {
            warn!(deployment_id, error = %e, "Failed to record deploy failure");
        }
    }

    result
}

async fn run(ctx: &HandlerContext, service_id: &str, deployment_id: &str) -> Result<()> {
    let bundle = ctx
        .persistence
        .load_service_bundle(service_id)
        .await?
        .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
    let deployment = ctx
        .persistence
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| Error::not_found("Deployment", deployment_id))?;
    let service = &bundle.service;

    info!(service_id, deployment_id, subdomain = %service.subdomain, "Deploying service");
    ctx.persistence
        .set_service_status(service_id, &ServiceStatus::Deploying)
        .await?;
    ctx.advance_deployment(service_id, deployment_id, DeploymentStatus::Building, None)
        .await?;

    let (vm, vm_ip) = ensure_vm(ctx, &bundle).await?;
    let containers = ensure_containers(ctx, &bundle).await?;

    let app_image = match &deployment.image_tag {
        Some(tag) => tag.clone(),
        None => produce_image(ctx, service, &deployment, &vm_ip).await?,
    };

    ctx.advance_deployment(service_id, deployment_id, DeploymentStatus::Deploying, None)
        .await?;

    let mut ports = PortAllocator::new(
        ctx.persistence.list_vm_host_ports(&vm.id).await?,
        ctx.settings.first_host_port,
    );
    let mut public_url = None;

    for container in &containers {
        let host_port = match container.host_port.and_then(|p| u16::try_from(p).ok()) {
            Some(port) => port,
            None => ports.allocate()?,
        };
        start_container(ctx, service, container, &app_image, &vm_ip, host_port).await?;

        if let Some(subdomain) = routed_subdomain(container) {
            let host = route_container(ctx, &bundle, subdomain, &vm_ip, host_port).await?;
            if container.container_type == ContainerType::App && bundle.platform_domain.is_some()
            {
                public_url = Some(format!("https://{}", host));
            }
        }
    }

    let dashboard_url = ctx.settings.service_dashboard_url(service_id);
    ctx.persistence
        .set_service_urls(
            service_id,
            public_url.as_deref(),
            dashboard_url.as_deref(),
            deployment_id,
        )
        .await?;
    ctx.persistence
        .set_service_status(service_id, &ServiceStatus::Running)
        .await?;
    ctx.advance_deployment(service_id, deployment_id, DeploymentStatus::Live, None)
        .await?;
    ctx.invalidate(&CacheKeys::user_services(&service.user_id))
        .await;

    info!(service_id, deployment_id, vm_ip = %vm_ip, "Service is live");
    Ok(())
}

// ============================================================================
// VM
// ============================================================================

fn hypervisor_vm_id(vm: &VmRecord) -> Result<u32> {
    u32::try_from(vm.proxmox_vm_id)
        .map_err(|_| Error::Other(format!("invalid hypervisor vm id {}", vm.proxmox_vm_id)))
}

/// The service's VM and its address, provisioning a VM if needed.
async fn ensure_vm(ctx: &HandlerContext, bundle: &ServiceBundle) -> Result<(VmRecord, String)> {
    let Some(vm) = &bundle.vm else {
        return provision_vm(ctx, &bundle.service).await;
    };
    if let Some(ip) = &vm.ip_address {
        return Ok((vm.clone(), ip.clone()));
    }

    // A VM row without an address: an earlier deploy stopped partway.
    let creds = ctx.nodes.credentials(&vm.server_id).await?;
    let hv_id = hypervisor_vm_id(vm)?;
    let fresh = match ctx.hypervisor.current_status(&creds, hv_id).await {
        Ok(_) => false,
        Err(e) if e.is_not_found() => true,
        Err(e) => return Err(e.into()),
    };
    info!(vm_id = %vm.id, hypervisor_vm_id = hv_id, fresh, "Resuming VM without a recorded address");

    let booted = boot_vm(ctx, &creds, vm, hv_id, fresh).await;
    record_boot(ctx, vm.clone(), booted).await
}

/// Place, clone, boot and address a new VM for `service`.
async fn provision_vm(ctx: &HandlerContext, service: &ServiceRecord) -> Result<(VmRecord, String)> {
    let capacity = ctx.persistence.list_node_capacity().await?;
    let node = capacity
        .into_iter()
        .filter(|c| c.node.status == NodeStatus::Active && c.vm_count < i64::from(c.node.max_vms))
        .min_by_key(|c| c.vm_count)
        .map(|c| c.node)
        .ok_or(Error::NoCapacity)?;

    let first = ctx.settings.first_vm_id;
    let hv_id = match ctx.persistence.max_hypervisor_vm_id().await? {
        Some(max) => u32::try_from(max).map_or(first, |max| (max + 1).max(first)),
        None => first,
    };

    let now = Utc::now();
    let vm = VmRecord {
        id: uuid::Uuid::new_v4().to_string(),
        server_id: node.id.clone(),
        proxmox_vm_id: i32::try_from(hv_id)
            .map_err(|_| Error::Other(format!("hypervisor vm id {} out of range", hv_id)))?,
        name: format!("{}-{}", ctx.settings.platform_name, service.subdomain),
        ip_address: None,
        status: VmStatus::Provisioning,
        cpu_cores: ctx.settings.vm_cpu_cores,
        memory_mb: ctx.settings.vm_memory_mb,
        disk_gb: ctx.settings.vm_disk_gb,
        created_at: now,
        updated_at: now,
    };

    // Row first, so a crash mid-provisioning leaves a VM the next deploy resumes.
    ctx.persistence.insert_vm(&vm).await?;
    ctx.persistence.set_service_vm(&service.id, &vm.id).await?;
    info!(vm_id = %vm.id, node = %node.name, hypervisor_vm_id = hv_id, "Provisioning VM");

    let booted = boot_vm(ctx, &node.credentials(), &vm, hv_id, true).await;
    record_boot(ctx, vm, booted).await
}

/// Clone (when `fresh`) and start a VM, then wait for its guest address.
///
/// Starting a VM that was not fresh may fail because it already runs; that
/// is not an error as long as the guest reports an address.
async fn boot_vm(
    ctx: &HandlerContext,
    creds: &NodeCredentials,
    vm: &VmRecord,
    hv_id: u32,
    fresh: bool,
) -> digi_clients::Result<String> {
    let hv = ctx.hypervisor.as_ref();
    let poll = ctx.settings.task_poll;

    if fresh {
        let task = hv
            .clone_template(creds, ctx.settings.vm_template_id, hv_id, &vm.name)
            .await?;
        wait_for_task(hv, creds, &task, poll).await?;
        let task = hv.start_vm(creds, hv_id).await?;
        wait_for_task(hv, creds, &task, poll).await?;
    } else if let Some(task) = best_effort(hv.start_vm(creds, hv_id).await, "start vm", hv_id) {
        best_effort(
            wait_for_task(hv, creds, &task, poll).await,
            "wait for vm start",
            hv_id,
        );
    }

    wait_for_guest_ipv4(hv, creds, hv_id, ctx.settings.guest_network_poll).await
}

/// Persist the outcome of [`boot_vm`].
async fn record_boot(
    ctx: &HandlerContext,
    mut vm: VmRecord,
    booted: digi_clients::Result<String>,
) -> Result<(VmRecord, String)> {
    match booted {
        Ok(ip) => {
            ctx.persistence
                .update_vm_network(&vm.id, &ip, &VmStatus::Running)
                .await?;
            info!(vm_id = %vm.id, ip = %ip, "VM is up");
            vm.ip_address = Some(ip.clone());
            vm.status = VmStatus::Running;
            Ok((vm, ip))
        }
        Err(e) => {
            if let Err(e) = ctx.persistence.set_vm_status(&vm.id, &VmStatus::Error).await {
                warn!(vm_id = %vm.id, error = %e, "Failed to mark VM as errored");
            }
            Err(e.into())
        }
    }
}

// ============================================================================
// Containers
// ============================================================================

/// The service's container rows, creating the app container if missing.
async fn ensure_containers(
    ctx: &HandlerContext,
    bundle: &ServiceBundle,
) -> Result<Vec<ContainerRecord>> {
    let service = &bundle.service;
    let mut containers = bundle.containers.clone();

    if !containers
        .iter()
        .any(|c| c.container_type == ContainerType::App)
    {
        let mut app = ContainerRecord::new(
            &service.id,
            ContainerType::App,
            format!("{}-app", service.subdomain),
        );
        app.subdomain = Some(service.subdomain.clone());
        app.container_port = Some(service.port);
        ctx.persistence.insert_container(&app).await?;
        containers.insert(0, app);
    }

    Ok(containers)
}

/// Image and listening port of a container.
fn container_image_and_port(
    service: &ServiceRecord,
    container: &ContainerRecord,
    app_image: &str,
) -> Result<(String, u16)> {
    let declared_port = container.container_port.and_then(|p| u16::try_from(p).ok());
    let service_port = u16::try_from(service.port)
        .map_err(|_| Error::InvalidRequest(format!("invalid service port {}", service.port)))?;

    match &container.container_type {
        ContainerType::App => Ok((app_image.to_string(), service_port)),
        ContainerType::Postgres | ContainerType::Redis => {
            let (image, port) = container
                .container_type
                .addon_defaults()
                .ok_or_else(|| Error::Other("add-on without defaults".to_string()))?;
            Ok((
                container.image.clone().unwrap_or_else(|| image.to_string()),
                declared_port.unwrap_or(port),
            ))
        }
        ContainerType::Docker => {
            let image = container.image.clone().ok_or_else(|| {
                Error::InvalidRequest(format!("container {} has no image", container.id))
            })?;
            Ok((image, declared_port.unwrap_or(service_port)))
        }
        ContainerType::Unknown(other) => Err(Error::InvalidRequest(format!(
            "unsupported container type {}",
            other
        ))),
    }
}

/// Replace whatever runs for `container` with a fresh instance.
async fn start_container(
    ctx: &HandlerContext,
    service: &ServiceRecord,
    container: &ContainerRecord,
    app_image: &str,
    vm_ip: &str,
    host_port: u16,
) -> Result<()> {
    let (image, container_port) = container_image_and_port(service, container, app_image)?;
    let engine_url = ctx.settings.engine_url(vm_ip);

    if container.container_type != ContainerType::App {
        ctx.engine.pull_image(&engine_url, &image).await?;
    }
    if let Some(previous) = &container.docker_container_id {
        best_effort(
            ctx.engine.remove_container(&engine_url, previous).await,
            "remove previous container",
            previous,
        );
    }

    ctx.persistence
        .set_container_status(&container.id, &ContainerStatus::Creating)
        .await?;

    let env = match container.container_type {
        ContainerType::App => service.env_vars.0.clone(),
        _ => BTreeMap::new(),
    };
    let labels = BTreeMap::from([
        ("digi.service".to_string(), service.id.clone()),
        ("digi.container".to_string(), container.id.clone()),
    ]);
    let spec = ContainerSpec {
        name: container.name.clone(),
        image: image.clone(),
        env,
        container_port,
        host_port,
        labels,
    };

    let handle = match ctx.engine.run_container(&engine_url, &spec).await {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(e) = ctx
                .persistence
                .set_container_status(&container.id, &ContainerStatus::Error)
                .await
            {
                warn!(container_id = %container.id, error = %e, "Failed to mark container as errored");
            }
            return Err(e.into());
        }
    };

    ctx.persistence
        .update_container_runtime(
            &container.id,
            &ContainerRuntimeUpdate {
                docker_container_id: Some(handle.clone()),
                image: Some(image),
                host_port: Some(i32::from(host_port)),
                status: ContainerStatus::Running,
            },
        )
        .await?;

    info!(container_id = %container.id, handle = %handle, host_port, "Container running");
    Ok(())
}

/// Subdomain a container is publicly routed under, if any.
fn routed_subdomain(container: &ContainerRecord) -> Option<&str> {
    if !container.container_type.is_public() {
        return None;
    }
    container.subdomain.as_deref().filter(|s| !s.is_empty())
}

/// Register the VM-local and edge routes and the DNS record for `subdomain`.
/// Returns the public host name.
async fn route_container(
    ctx: &HandlerContext,
    bundle: &ServiceBundle,
    subdomain: &str,
    vm_ip: &str,
    host_port: u16,
) -> Result<String> {
    let host = public_host(subdomain, bundle.platform_domain.as_ref());

    ctx.proxy
        .upsert_route(
            &ctx.settings.vm_proxy_admin_url(vm_ip),
            &Route::vm_local(subdomain, &host, host_port),
        )
        .await?;
    ctx.proxy
        .upsert_route(
            &ctx.settings.edge_proxy_url,
            &Route::edge(subdomain, &host, vm_ip, ctx.settings.vm_proxy_http_port),
        )
        .await?;

    ensure_dns_record(ctx, bundle, &host).await?;
    Ok(host)
}

/// Make sure a proxied CNAME `host -> domain` exists and is recorded.
async fn ensure_dns_record(ctx: &HandlerContext, bundle: &ServiceBundle, host: &str) -> Result<()> {
    let Some(domain) = &bundle.platform_domain else {
        return Ok(());
    };
    let Some(dns) = &ctx.dns else {
        warn!(host, "No DNS provider configured; skipping DNS record");
        return Ok(());
    };

    if bundle
        .dns_records
        .iter()
        .any(|r| r.name == host && r.cloudflare_record_id.is_some())
    {
        return Ok(());
    }

    let zone = &domain.cloudflare_zone_id;
    let existing = dns.list_records(zone, Some(host)).await?;
    let record = match existing.into_iter().next() {
        Some(record) => {
            info!(host, record_id = %record.id, "Reusing existing DNS record");
            record
        }
        None => {
            dns.create_record(zone, &NewDnsRecord::cname(host, &domain.domain))
                .await?
        }
    };

    ctx.persistence
        .insert_dns_record(&DnsRecordRow {
            id: uuid::Uuid::new_v4().to_string(),
            domain_id: None,
            service_id: Some(bundle.service.id.clone()),
            cloudflare_record_id: Some(record.id),
            record_type: record.record_type,
            name: host.to_string(),
            content: record.content,
            proxied: record.proxied,
            created_at: Utc::now(),
        })
        .await?;
    Ok(())
}

// ============================================================================
// Host ports
// ============================================================================

/// Hands out the lowest free loopback port at or above a floor.
struct PortAllocator {
    used: BTreeSet<u16>,
    floor: u16,
}

impl PortAllocator {
    fn new(used: Vec<i32>, floor: u16) -> Self {
        Self {
            used: used
                .into_iter()
                .filter_map(|p| u16::try_from(p).ok())
                .collect(),
            floor,
        }
    }

    fn allocate(&mut self) -> Result<u16> {
        let port = (self.floor..=u16::MAX)
            .find(|p| !self.used.contains(p))
            .ok_or_else(|| Error::Other("no free host port on VM".to_string()))?;
        self.used.insert(port);
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_allocator_fills_gaps() {
        let mut ports = PortAllocator::new(vec![10000, 10002, 80], 10000);
        assert_eq!(ports.allocate().unwrap(), 10001);
        assert_eq!(ports.allocate().unwrap(), 10003);
    }

    #[test]
    fn test_addon_defaults() {
        let service = ServiceRecord::new("u1", "Web", "web", crate::persistence::SourceType::Docker);
        let pg = ContainerRecord::new(&service.id, ContainerType::Postgres, "web-postgres");
        let (image, port) = container_image_and_port(&service, &pg, "ignored").unwrap();
        assert_eq!(image, "postgres:16-alpine");
        assert_eq!(port, 5432);
    }

    #[test]
    fn test_only_public_containers_are_routed() {
        let mut redis = ContainerRecord::new("s", ContainerType::Redis, "r");
        redis.subdomain = Some("web-redis-ab12".into());
        assert_eq!(routed_subdomain(&redis), None);

        let mut app = ContainerRecord::new("s", ContainerType::App, "a");
        app.subdomain = Some("web".into());
        assert_eq!(routed_subdomain(&app), Some("web"));
    }
}
