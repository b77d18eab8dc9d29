// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence tests.
//!
//! Run against a scratch database named by `TEST_DIGI_DATABASE_URL`; the
//! job table is cleared before each test.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use sqlx::PgPool;
use uuid::Uuid;

use digi_orchestrator::migrations::MIGRATOR;
use digi_orchestrator::persistence::{
    ContainerRecord, ContainerType, DeploymentRecord, JobStatus, Persistence,
    PlatformDomainRecord, PostgresPersistence, STALE_JOB_ERROR, ServiceRecord, SourceType,
};
use digi_orchestrator::pubsub::MemoryPubSub;
use digi_orchestrator::queue::{JobCommand, JobQueue};

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DIGI_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DIGI_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a migrated database pool with an empty job table.
async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DIGI_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    MIGRATOR.run(&pool).await.ok()?;
    sqlx::query("DELETE FROM jobs").execute(&pool).await.ok()?;
    Some(pool)
}

fn queue(pool: &PgPool) -> JobQueue {
    JobQueue::new(
        Arc::new(PostgresPersistence::new(pool.clone())),
        Arc::new(MemoryPubSub::new()),
    )
}

fn destroy(service_id: &str) -> JobCommand {
    JobCommand::Destroy {
        service_id: service_id.to_string(),
    }
}

async fn insert_service(store: &PostgresPersistence, domain_id: Option<&str>) -> ServiceRecord {
    let subdomain = format!("t{}", &Uuid::new_v4().simple().to_string()[..12]);
    let mut service = ServiceRecord::new("user-pg", &subdomain, &subdomain, SourceType::Docker);
    service.docker_image = Some("nginx:latest".to_string());
    service.platform_domain_id = domain_id.map(str::to_string);
    store.insert_service(&service).await.unwrap();
    service
}

#[tokio::test]
#[serial]
async fn test_claim_then_complete() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let queue = queue(&pool);

    let job_id = queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();
    let claim = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claim.id, job_id);
    assert_eq!(claim.status, JobStatus::Processing);
    assert_eq!(claim.attempts, 1);
    assert!(queue.claim_next().await.unwrap().is_none());

    assert!(queue.complete(&claim).await.unwrap());
    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
#[serial]
async fn test_one_processing_job_per_service() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let queue = queue(&pool);

    queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();
    queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();

    let first = queue.claim_next().await.unwrap().unwrap();
    assert!(queue.claim_next().await.unwrap().is_none());

    assert!(queue.complete(&first).await.unwrap());
    let second = queue.claim_next().await.unwrap().unwrap();
    assert_ne!(second.id, first.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_concurrent_claims_hand_out_a_job_once() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let queue = queue(&pool);
    let job_id = queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.claim_next().await.unwrap() }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed.push(job.id);
        }
    }
    assert_eq!(claimed, vec![job_id]);
}

#[tokio::test]
#[serial]
async fn test_stale_job_is_requeued_then_failed() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let queue = queue(&pool).with_max_attempts(2);
    let job_id = queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();
    let backdate = "UPDATE jobs SET started_at = NOW() - INTERVAL '1 hour' WHERE id = $1";

    queue.claim_next().await.unwrap().unwrap();
    sqlx::query(backdate).bind(&job_id).execute(&pool).await.unwrap();
    let outcome = queue.requeue_stale(Duration::from_secs(900)).await.unwrap();
    assert_eq!((outcome.requeued, outcome.failed), (1, 0));

    queue.claim_next().await.unwrap().unwrap();
    sqlx::query(backdate).bind(&job_id).execute(&pool).await.unwrap();
    let outcome = queue.requeue_stale(Duration::from_secs(900)).await.unwrap();
    assert_eq!((outcome.requeued, outcome.failed), (0, 1));

    let job = queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(STALE_JOB_ERROR));
}

#[tokio::test]
#[serial]
async fn test_stale_owner_cannot_settle_reclaimed_job() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let queue = queue(&pool);
    let job_a = queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();

    let slow = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(slow.id, job_a);
    sqlx::query("UPDATE jobs SET started_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(&job_a)
        .execute(&pool)
        .await
        .unwrap();
    queue.requeue_stale(Duration::from_secs(900)).await.unwrap();
    let job_b = queue.enqueue(&destroy("svc-pg-1"), None).await.unwrap();
    let current = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(current.id, job_a);

    assert!(!queue.complete(&slow).await.unwrap());
    assert!(!queue.mark_failed(&slow, "late").await.unwrap());
    assert!(
        !queue
            .retry_later(&slow, "late", Duration::ZERO)
            .await
            .unwrap()
    );
    let job = queue.get(&job_a).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(queue.claim_next().await.unwrap().is_none());

    assert!(queue.complete(&current).await.unwrap());
    assert_eq!(queue.claim_next().await.unwrap().unwrap().id, job_b);
}

#[tokio::test]
#[serial]
async fn test_delete_service_cascades() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let store = PostgresPersistence::new(pool.clone());
    let service = insert_service(&store, None).await;

    let container = ContainerRecord::new(&service.id, ContainerType::App, "app");
    store.insert_container(&container).await.unwrap();
    let deployment = DeploymentRecord::queued(&service.id, "user-pg");
    store.insert_deployment(&deployment).await.unwrap();

    let bundle = store.load_service_bundle(&service.id).await.unwrap().unwrap();
    assert_eq!(bundle.containers.len(), 1);

    assert!(store.delete_service(&service.id).await.unwrap());
    assert!(!store.delete_service(&service.id).await.unwrap());
    assert!(store.load_service_bundle(&service.id).await.unwrap().is_none());
    assert!(store.get_deployment(&deployment.id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_domain_service_count_floor() {
    skip_if_no_db!();
    let pool = get_test_pool().await.unwrap();
    let store = PostgresPersistence::new(pool.clone());
    let domain = PlatformDomainRecord {
        id: Uuid::new_v4().to_string(),
        domain: format!("{}.example.test", Uuid::new_v4().simple()),
        cloudflare_zone_id: "zone-pg".to_string(),
        is_default: false,
        service_count: 1,
    };
    store.insert_platform_domain(&domain).await.unwrap();

    store.decrement_domain_service_count(&domain.id).await.unwrap();
    store.decrement_domain_service_count(&domain.id).await.unwrap();

    let stored = store.get_platform_domain(&domain.id).await.unwrap().unwrap();
    assert_eq!(stored.service_count, 0);
}
