// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build handler: produce a service's app image without starting it.
//!
//! Git-sourced services are built on their VM; image-sourced services have
//! their image pulled there. The resulting reference is recorded on the
//! deployment, and a later deploy of the same deployment reuses it.

use digi_clients::BuildRequest;
use tracing::{error, info};

use super::HandlerContext;
use crate::error::{Error, Result};
use crate::persistence::{DeploymentRecord, DeploymentStatus, ServiceRecord, SourceType};

/// Tag of the image built for `deployment`: `{subdomain}:{first 8 chars of id}`.
pub fn image_tag(service: &ServiceRecord, deployment: &DeploymentRecord) -> String {
    let short: String = deployment
        .id
        .chars()
        .filter(|c| *c != '-')
        .take(8)
        .collect();
    format!("{}:{}", service.subdomain, short)
}

/// Build or pull the app image on the VM at `vm_ip` and record it on the
/// deployment. Returns the image reference.
pub(crate) async fn produce_image(
    ctx: &HandlerContext,
    service: &ServiceRecord,
    deployment: &DeploymentRecord,
    vm_ip: &str,
) -> Result<String> {
    match &service.source_type {
        SourceType::Github => {
            let repo_url = service.git_url.clone().ok_or_else(|| {
                Error::InvalidRequest(format!("service {} has no git URL", service.id))
            })?;
            let request = BuildRequest {
                vm_ip: vm_ip.to_string(),
                repo_url,
                branch: service.branch.clone(),
                image_name: image_tag(service, deployment),
                env: service.env_vars.0.clone(),
            };
            info!(service_id = %service.id, image = %request.image_name, "Building image");
            let built = ctx.builder.build(&request).await?;
            ctx.persistence
                .set_deployment_image(&deployment.id, &built.image, Some(&built.logs))
                .await?;
            Ok(built.image)
        }
        SourceType::Docker => {
            let image = service.docker_image.clone().ok_or_else(|| {
                Error::InvalidRequest(format!("service {} has no image reference", service.id))
            })?;
            info!(service_id = %service.id, image = %image, "Pulling image");
            ctx.engine
                .pull_image(&ctx.settings.engine_url(vm_ip), &image)
                .await?;
            ctx.persistence
                .set_deployment_image(&deployment.id, &image, None)
                .await?;
            Ok(image)
        }
        SourceType::Unknown(other) => Err(Error::InvalidRequest(format!(
            "unsupported source type {}",
            other
        ))),
    }
}

/// Handle a build job.
///
/// The service must already run on a VM with a known address. On success
/// the deployment returns to `queued` with its image recorded.
pub async fn handle(ctx: &HandlerContext, service_id: &str, deployment_id: &str) -> Result<()> {
    let result = run(ctx, service_id, deployment_id).await;
    if let Err(e) = &result {
        error!(service_id, deployment_id, error = %e, "Build failed");
        let message = e.to_string();
        if let Err(e) = ctx
            .advance_deployment(
                service_id,
                deployment_id,
                DeploymentStatus::Failed,
                Some(&message),
            )
            .await
        {
            error!(deployment_id, error = %e, "Failed to record build failure");
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
    let vm_ip = bundle
        .vm_ip()
        .ok_or_else(|| {
            Error::InvalidRequest(format!("service {} has no provisioned VM", service_id))
        })?
        .to_string();

    ctx.advance_deployment(service_id, deployment_id, DeploymentStatus::Building, None)
        .await?;
    let image = produce_image(ctx, &bundle.service, &deployment, &vm_ip).await?;
    ctx.advance_deployment(service_id, deployment_id, DeploymentStatus::Queued, None)
        .await?;

    info!(service_id, deployment_id, image = %image, "Build finished");
    Ok(())
}
