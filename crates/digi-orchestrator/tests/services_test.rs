// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the mutation entry points and the embeddable runtime.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use digi_clients::mock::{
    MockContainerEngine, MockDnsProvider, MockHypervisor, MockImageBuilder, MockProxyAdmin,
};
use digi_clients::{ContainerState, DnsProvider, DnsRecordType, NewDnsRecord};
use digi_orchestrator::Error;
use digi_orchestrator::OrchestratorRuntime;
use digi_orchestrator::cache::{Cache, CacheKeys};
use digi_orchestrator::persistence::{
    ContainerStatus, ContainerType, CustomDomainRecord, DeploymentStatus, JobStatus,
    MemoryPersistence, Persistence, ServiceStatus, VmRecord, VmStatus,
};

use common::{Harness, NODE_NAME, ZONE_ID};

async fn seed_vm(h: &Harness, hypervisor_id: i32) -> VmRecord {
    let node = h.seed_node().await;
    let vm = VmRecord {
        id: uuid::Uuid::new_v4().to_string(),
        server_id: node.id,
        proxmox_vm_id: hypervisor_id,
        name: "digi-vm".to_string(),
        ip_address: Some(common::GUEST_IP.to_string()),
        status: VmStatus::Running,
        cpu_cores: 2,
        memory_mb: 2048,
        disk_gb: 20,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.persistence.insert_vm(&vm).await.unwrap();
    h.hypervisor
        .insert_vm(NODE_NAME, hypervisor_id as u32, "running")
        .await;
    vm
}

fn custom_domain(service_id: &str, token: Option<&str>) -> CustomDomainRecord {
    CustomDomainRecord {
        id: uuid::Uuid::new_v4().to_string(),
        service_id: service_id.to_string(),
        domain: "shop.acme.io".to_string(),
        verification_token: token.map(str::to_string),
        is_verified: false,
        ssl_status: "pending".to_string(),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_request_deploy_queues_deployment_and_job() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    h.cache
        .set(
            &CacheKeys::user_services("user-1"),
            &json!([]),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let deployment_id = h
        .commands()
        .request_deploy(&service.id, "user-1")
        .await
        .unwrap();

    let deployment = h
        .persistence
        .get_deployment(&deployment_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Queued);
    let jobs = h.persistence.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, "deploy");
    assert_eq!(jobs[0].payload["deploymentId"], deployment_id.as_str());
    assert!(
        h.cache
            .get(&CacheKeys::user_services("user-1"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_request_deploy_rejects_destroying_service() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    let commands = h.commands();
    commands.request_destroy(&service.id).await.unwrap();

    let err = commands
        .request_deploy(&service.id, "user-1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert_eq!(h.persistence.jobs().await.len(), 1);
}

#[tokio::test]
async fn test_request_destroy_marks_service() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;

    let job_id = h.commands().request_destroy(&service.id).await.unwrap();

    let stored = h.persistence.get_service(&service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Destroying);
    let job = h.queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "destroy");
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_requests_for_unknown_service() {
    let h = Harness::new();
    let commands = h.commands();

    assert!(matches!(
        commands.request_deploy("nope", "user-1").await,
        Err(Error::ServiceNotFound(_))
    ));
    assert!(matches!(
        commands.request_scale("nope", 1).await,
        Err(Error::ServiceNotFound(_))
    ));
    assert!(h.persistence.jobs().await.is_empty());
}

#[tokio::test]
async fn test_add_container_validation() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    let commands = h.commands();

    assert!(matches!(
        commands
            .add_container(&service.id, ContainerType::App, None)
            .await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(matches!(
        commands
            .add_container(&service.id, ContainerType::Docker, None)
            .await,
        Err(Error::InvalidRequest(_))
    ));
    assert!(h.persistence.containers(&service.id).await.is_empty());
}

#[tokio::test]
async fn test_add_addon_container() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;

    let container = h
        .commands()
        .add_container(&service.id, ContainerType::Redis, None)
        .await
        .unwrap();

    assert_eq!(container.name, "web-redis");
    assert_eq!(container.container_port, Some(6379));
    assert!(container.subdomain.is_none());
    assert_eq!(h.persistence.containers(&service.id).await.len(), 1);
}

#[tokio::test]
async fn test_add_public_docker_container_gets_subdomain() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;

    let container = h
        .commands()
        .add_container(
            &service.id,
            ContainerType::Docker,
            Some("grafana/grafana:latest".to_string()),
        )
        .await
        .unwrap();

    let subdomain = container.subdomain.unwrap();
    let suffix = subdomain.strip_prefix("web-").unwrap();
    assert_eq!(suffix.len(), 4);
    assert!(
        suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    );
    assert_eq!(container.image.as_deref(), Some("grafana/grafana:latest"));
}

#[tokio::test]
async fn test_set_container_state_stops_and_restarts() {
    let h = Harness::new();
    h.seed_node().await;
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    let commands = h.commands();
    commands.request_deploy(&service.id, "user-1").await.unwrap();
    assert_eq!(h.worker().drain().await, 1);

    let app = h.persistence.containers(&service.id).await.remove(0);
    let status = commands
        .set_container_state(&service.id, &app.id, ContainerState::Stopped)
        .await
        .unwrap();
    assert_eq!(status, ContainerStatus::Stopped);
    let engine_containers = h.engine.containers(&h.guest_engine_url()).await;
    assert_eq!(engine_containers[0].state, ContainerState::Stopped);

    let status = commands
        .set_container_state(&service.id, &app.id, ContainerState::Running)
        .await
        .unwrap();
    assert_eq!(status, ContainerStatus::Running);
    let stored = h.persistence.containers(&service.id).await.remove(0);
    assert_eq!(stored.status, ContainerStatus::Running);
}

#[tokio::test]
async fn test_set_container_state_requires_vm() {
    let h = Harness::new();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    let addon = h
        .commands()
        .add_container(&service.id, ContainerType::Postgres, None)
        .await
        .unwrap();

    let err = h
        .commands()
        .set_container_state(&service.id, &addon.id, ContainerState::Stopped)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_vm_stats_are_cached() {
    let h = Harness::new();
    let vm = seed_vm(&h, 300).await;
    let commands = h.commands();

    let first = commands.vm_stats(&vm.id).await.unwrap();
    assert_eq!(first.status, "running");
    assert!(
        h.cache
            .get(&CacheKeys::vm_stats(&vm.id))
            .await
            .unwrap()
            .is_some()
    );

    // The cached value wins until it expires.
    h.hypervisor.insert_vm(NODE_NAME, 300, "stopped").await;
    let second = commands.vm_stats(&vm.id).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_vm_stats_for_unknown_vm() {
    let h = Harness::new();
    let err = h.commands().vm_stats("nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_verify_custom_domain() {
    let h = Harness::new();
    let domain = h.seed_domain(0).await;
    let service = h.seed_docker_service("web", "nginx:latest", Some(&domain)).await;
    let custom = custom_domain(&service.id, Some("tok-123"));
    h.persistence.insert_custom_domain(&custom).await.unwrap();
    let commands = h.commands();

    assert!(!commands.verify_custom_domain(&custom.id).await.unwrap());

    h.dns
        .create_record(
            ZONE_ID,
            &NewDnsRecord {
                record_type: DnsRecordType::Txt,
                name: "_digi-verify.shop.acme.io".to_string(),
                content: "\"tok-123\"".to_string(),
                proxied: false,
            },
        )
        .await
        .unwrap();

    assert!(commands.verify_custom_domain(&custom.id).await.unwrap());
    let stored = h
        .persistence
        .get_custom_domain(&custom.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_verified);
}

#[tokio::test]
async fn test_verify_custom_domain_without_token() {
    let h = Harness::new();
    let domain = h.seed_domain(0).await;
    let service = h.seed_docker_service("web", "nginx:latest", Some(&domain)).await;
    let custom = custom_domain(&service.id, None);
    h.persistence.insert_custom_domain(&custom).await.unwrap();

    let err = h
        .commands()
        .verify_custom_domain(&custom.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_runtime_processes_jobs_until_shutdown() {
    let persistence = MemoryPersistence::new();
    let engine = Arc::new(MockContainerEngine::new());
    let runtime = OrchestratorRuntime::builder()
        .persistence(Arc::new(persistence.clone()))
        .hypervisor(Arc::new(MockHypervisor::new()))
        .proxy(Arc::new(MockProxyAdmin::new()))
        .dns(Arc::new(MockDnsProvider::new()))
        .engine(engine.clone())
        .image_builder(Arc::new(MockImageBuilder::new()))
        .settings(common::test_settings())
        .worker_config(common::test_worker_config())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let h = Harness::new();
    let node = h.seed_node().await;
    persistence.insert_node(&node).await.unwrap();
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    persistence.insert_service(&service).await.unwrap();

    let deployment_id = runtime
        .commands()
        .request_deploy(&service.id, "user-1")
        .await
        .unwrap();

    let mut live = false;
    for _ in 0..200 {
        let deployment = persistence
            .get_deployment(&deployment_id)
            .await
            .unwrap()
            .unwrap();
        if deployment.status == DeploymentStatus::Live {
            live = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(live);
    assert_eq!(engine.pulled_images().await.len(), 1);

    tokio::time::timeout(Duration::from_secs(1), runtime.shutdown())
        .await
        .unwrap()
        .unwrap();
}
