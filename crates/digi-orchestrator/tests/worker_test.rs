// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job worker tests: dispatch, failure policy and the run loop.

mod common;

use std::time::Duration;

use serde_json::json;

use digi_clients::mock::MockContainerEngine;
use digi_orchestrator::persistence::{JobStatus, Persistence, ServiceStatus};
use digi_orchestrator::queue::JobCommand;

use common::Harness;

async fn wait_for_job_status(h: &Harness, job_id: &str, status: JobStatus) {
    for _ in 0..200 {
        let job = h.queue.get(job_id).await.unwrap().unwrap();
        if job.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", job_id, status);
}

#[tokio::test]
async fn test_process_next_with_empty_queue() {
    let h = Harness::new();
    assert!(!h.worker().process_next().await.unwrap());
}

#[tokio::test]
async fn test_request_deploy_then_worker_runs_it() {
    let h = Harness::new();
    h.seed_node().await;
    let domain = h.seed_domain(1).await;
    let service = h.seed_docker_service("web", "nginx:latest", Some(&domain)).await;

    h.commands()
        .request_deploy(&service.id, "user-1")
        .await
        .unwrap();
    let stored = h.persistence.get_service(&service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Deploying);

    assert_eq!(h.worker().drain().await, 1);

    let stored = h.persistence.get_service(&service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Running);
    let jobs = h.persistence.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn test_deploy_then_destroy_in_order() {
    let h = Harness::new();
    h.seed_node().await;
    let domain = h.seed_domain(1).await;
    let service = h.seed_docker_service("web", "nginx:latest", Some(&domain)).await;
    let commands = h.commands();

    commands.request_deploy(&service.id, "user-1").await.unwrap();
    commands.request_destroy(&service.id).await.unwrap();

    assert_eq!(h.worker().drain().await, 2);

    assert!(h.persistence.get_service(&service.id).await.unwrap().is_none());
    assert_eq!(h.proxy.route_count().await, 0);
    assert!(
        h.persistence
            .jobs()
            .await
            .iter()
            .all(|j| j.status == JobStatus::Completed)
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_then_failed() {
    let h = Harness::with_engine(MockContainerEngine::failing());
    h.seed_node().await;
    let service = h.seed_docker_service("web", "nginx:latest", None).await;
    h.commands()
        .request_deploy(&service.id, "user-1")
        .await
        .unwrap();
    let worker = h.worker();

    // Zero backoff in tests, so each retry is claimable straight away.
    assert!(worker.process_next().await.unwrap());
    let job = &h.persistence.jobs().await[0];
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.is_some());

    assert!(worker.process_next().await.unwrap());
    assert!(worker.process_next().await.unwrap());
    let job = &h.persistence.jobs().await[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);

    assert!(!worker.process_next().await.unwrap());
    let stored = h.persistence.get_service(&service.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ServiceStatus::Error);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = Harness::new();
    h.queue
        .enqueue(
            &JobCommand::Scale {
                service_id: "missing".into(),
                replicas: 1,
            },
            None,
        )
        .await
        .unwrap();

    assert!(h.worker().process_next().await.unwrap());
    let job = &h.persistence.jobs().await[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_corrupt_payload_fails_job() {
    let h = Harness::new();
    let job = h
        .persistence
        .insert_job(&digi_orchestrator::persistence::NewJob {
            job_type: "deploy".into(),
            payload: json!({ "serviceId": "svc-1" }),
            service_id: Some("svc-1".into()),
            scheduled_at: chrono::Utc::now(),
            max_attempts: 3,
        })
        .await
        .unwrap();

    assert!(h.worker().process_next().await.unwrap());
    let job = h.queue.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_destroy_of_missing_service_completes() {
    let h = Harness::new();
    let job_id = h
        .queue
        .enqueue(
            &JobCommand::Destroy {
                service_id: "gone".into(),
            },
            None,
        )
        .await
        .unwrap();

    assert!(h.worker().process_next().await.unwrap());
    let job = h.queue.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_running_worker_wakes_on_announcement_and_shuts_down() {
    let h = Harness::new();
    let mut config = common::test_worker_config();
    config.poll_interval = Duration::from_secs(3600);
    let worker = digi_orchestrator::Worker::new(h.queue.clone(), h.ctx.clone(), config);
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(worker.run());

    // Let the worker subscribe and finish its first poll.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job_id = h
        .queue
        .enqueue(
            &JobCommand::Destroy {
                service_id: "gone".into(),
            },
            None,
        )
        .await
        .unwrap();
    wait_for_job_status(&h, &job_id, JobStatus::Completed).await;

    shutdown.notify_one();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
