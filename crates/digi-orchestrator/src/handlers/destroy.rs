// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Destroy handler.
//!
//! Tears a service down in reverse order of deployment. Every external step
//! deletes by stored id and tolerates the resource being gone, so the
//! handler can be re-run after a partial deploy or a partial destroy. Only
//! the database delete propagates failure.

use tracing::{info, warn};

use super::{HandlerContext, best_effort};
use crate::cache::CacheKeys;
use crate::error::Result;
use crate::persistence::{ServiceBundle, ServiceStatus};

/// Handle a destroy job. A service that no longer exists is already destroyed.
pub async fn handle(ctx: &HandlerContext, service_id: &str) -> Result<()> {
    let Some(bundle) = ctx.persistence.load_service_bundle(service_id).await? else {
        info!(service_id, "Service already gone; nothing to destroy");
        return Ok(());
    };

    info!(service_id, subdomain = %bundle.service.subdomain, "Destroying service");
    ctx.persistence
        .set_service_status(service_id, &ServiceStatus::Destroying)
        .await?;

    remove_vm_resources(ctx, &bundle).await;
    remove_edge_routes(ctx, &bundle).await;
    remove_dns_records(ctx, &bundle).await;

    let deleted = ctx.persistence.delete_service(service_id).await?;
    if deleted && let Some(domain_id) = &bundle.service.platform_domain_id {
        ctx.persistence
            .decrement_domain_service_count(domain_id)
            .await?;
    }

    ctx.invalidate(&CacheKeys::user_services(&bundle.service.user_id))
        .await;
    ctx.invalidate(&CacheKeys::domains_list()).await;

    info!(service_id, "Service destroyed");
    Ok(())
}

/// Containers and VM-local routes. Skipped when the VM never got an address.
async fn remove_vm_resources(ctx: &HandlerContext, bundle: &ServiceBundle) {
    let Some(vm_ip) = bundle.vm_ip() else {
        info!(service_id = %bundle.service.id, "No VM address; skipping container and VM route cleanup");
        return;
    };

    let engine_url = ctx.settings.engine_url(vm_ip);
    let admin_url = ctx.settings.vm_proxy_admin_url(vm_ip);

    for container in &bundle.containers {
        let Some(handle) = &container.docker_container_id else {
            continue;
        };
        best_effort(
            ctx.engine.remove_container(&engine_url, handle).await,
            "remove container",
            handle,
        );
        if let Some(subdomain) = &container.subdomain {
            best_effort(
                ctx.proxy.remove_route(&admin_url, subdomain).await,
                "remove vm route",
                subdomain,
            );
        }
    }
}

async fn remove_edge_routes(ctx: &HandlerContext, bundle: &ServiceBundle) {
    for subdomain in bundle
        .containers
        .iter()
        .filter_map(|c| c.subdomain.as_deref())
    {
        best_effort(
            ctx.proxy
                .remove_route(&ctx.settings.edge_proxy_url, subdomain)
                .await,
            "remove edge route",
            subdomain,
        );
    }
}

async fn remove_dns_records(ctx: &HandlerContext, bundle: &ServiceBundle) {
    let record_ids: Vec<&str> = bundle
        .dns_records
        .iter()
        .filter_map(|r| r.cloudflare_record_id.as_deref())
        .collect();
    if record_ids.is_empty() {
        return;
    }

    let Some(dns) = &ctx.dns else {
        warn!(service_id = %bundle.service.id, records = record_ids.len(), "No DNS provider configured; leaving DNS records");
        return;
    };
    let Some(domain) = &bundle.platform_domain else {
        warn!(service_id = %bundle.service.id, "No platform domain; cannot resolve DNS zone");
        return;
    };

    for record_id in record_ids {
        best_effort(
            dns.delete_record(&domain.cloudflare_zone_id, record_id)
                .await,
            "delete dns record",
            record_id,
        );
    }
}
