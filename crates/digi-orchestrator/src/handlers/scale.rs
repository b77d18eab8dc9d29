// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scale handler.
//!
//! Each service runs one instance per container, so scaling is on/off:
//! zero replicas stops every container and any positive count (re)starts
//! them.

use digi_clients::ContainerState;
use tracing::{info, warn};

use super::{HandlerContext, apply_container_state};
use crate::cache::CacheKeys;
use crate::error::{Error, Result};
use crate::persistence::ServiceStatus;

/// Container state matching a replica count.
pub fn target_state(replicas: u32) -> ContainerState {
    if replicas == 0 {
        ContainerState::Stopped
    } else {
        ContainerState::Running
    }
}

/// Handle a scale job.
pub async fn handle(ctx: &HandlerContext, service_id: &str, replicas: u32) -> Result<()> {
    let bundle = ctx
        .persistence
        .load_service_bundle(service_id)
        .await?
        .ok_or_else(|| Error::ServiceNotFound(service_id.to_string()))?;
    let vm_ip = bundle
        .vm_ip()
        .ok_or_else(|| {
            Error::InvalidRequest(format!("service {} has no provisioned VM", service_id))
        })?
        .to_string();

    if replicas > 1 {
        warn!(service_id, replicas, "Services run a single instance; scaling to 1");
    }
    let target = target_state(replicas);

    for container in &bundle.containers {
        apply_container_state(ctx, &vm_ip, container, target).await?;
    }

    let status = match target {
        ContainerState::Running => ServiceStatus::Running,
        ContainerState::Stopped => ServiceStatus::Stopped,
    };
    ctx.persistence.set_service_status(service_id, &status).await?;
    ctx.invalidate(&CacheKeys::user_services(&bundle.service.user_id))
        .await;

    info!(service_id, replicas, status = %status, "Service scaled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_state() {
        assert_eq!(target_state(0), ContainerState::Stopped);
        assert_eq!(target_state(1), ContainerState::Running);
        assert_eq!(target_state(5), ContainerState::Running);
    }
}
