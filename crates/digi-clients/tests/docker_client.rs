// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine client tests.

use std::collections::BTreeMap;

use digi_clients::{ContainerEngine, ContainerSpec, ContainerState, DockerConfig, DockerEngineClient};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> DockerEngineClient {
    DockerEngineClient::new(DockerConfig::default()).unwrap()
}

fn spec() -> ContainerSpec {
    ContainerSpec {
        name: "shop-app".to_string(),
        image: "nginx:latest".to_string(),
        env: BTreeMap::new(),
        container_port: 80,
        host_port: 10000,
        labels: BTreeMap::from([("digi.service".to_string(), "svc-1".to_string())]),
    }
}

#[tokio::test]
async fn test_pull_image_splits_reference() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/images/create"))
        .and(query_param("fromImage", "nginx"))
        .and(query_param("tag", "latest"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"status\":\"Pulling from library/nginx\"}\n{\"status\":\"Status: Downloaded newer image for nginx:latest\"}\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    client().pull_image(&server.uri(), "nginx:latest").await.unwrap();
}

#[tokio::test]
async fn test_pull_image_reports_stream_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/images/create"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"error\":\"pull access denied for nope, repository does not exist\"}\n",
        ))
        .mount(&server)
        .await;

    let err = client().pull_image(&server.uri(), "nope").await.unwrap_err();
    assert!(err.to_string().contains("pull access denied"));
}

#[tokio::test]
async fn test_run_container_creates_and_starts() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/containers/create"))
        .and(query_param("name", "shop-app"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"Id": "abc123", "Warnings": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/containers/abc123/start"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let id = client().run_container(&server.uri(), &spec()).await.unwrap();
    assert_eq!(id, "abc123");
}

#[tokio::test]
async fn test_run_container_replaces_name_conflict() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/containers/create"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"message": "Conflict"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/containers/create"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"Id": "def456"})))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/containers/shop-app"))
        .and(query_param("force", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/containers/def456/start"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let id = client().run_container(&server.uri(), &spec()).await.unwrap();
    assert_eq!(id, "def456");
}

#[tokio::test]
async fn test_remove_missing_container_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/containers/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "No such container: gone"})))
        .mount(&server)
        .await;

    let err = client().remove_container(&server.uri(), "gone").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_set_container_state_tolerates_not_modified() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/containers/abc123/stop"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/containers/abc123/restart"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let engine = client();
    engine
        .set_container_state(&server.uri(), "abc123", ContainerState::Stopped)
        .await
        .unwrap();
    engine
        .set_container_state(&server.uri(), "abc123", ContainerState::Running)
        .await
        .unwrap();
}
