// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container engine client for tenant VMs.
//!
//! Each VM exposes the engine API on a private port. Containers publish
//! their port on `127.0.0.1:<host_port>` only; the VM-local proxy is the
//! sole way in.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::error::{ClientError, Result};
use crate::http::{build_client, check, trim_base};

/// Lifecycle state a container can be driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Started (restarted if already running).
    Running,
    /// Stopped.
    Stopped,
}

/// Container to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name on the VM.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port the process listens on inside the container.
    pub container_port: u16,
    /// Loopback port on the VM the container port is published to.
    pub host_port: u16,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    fn to_create_body(&self) -> serde_json::Value {
        let port_key = format!("{}/tcp", self.container_port);
        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        json!({
            "Image": self.image,
            "Env": env,
            "Labels": self.labels,
            "ExposedPorts": { port_key.clone(): {} },
            "HostConfig": {
                "PortBindings": {
                    port_key: [{ "HostIp": "127.0.0.1", "HostPort": self.host_port.to_string() }]
                },
                "RestartPolicy": { "Name": "unless-stopped" }
            }
        })
    }
}

/// Split an image reference into repository and tag (default `latest`).
pub fn split_image_reference(image: &str) -> (&str, &str) {
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(idx) => {
            let split = last_segment_start + idx;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

/// Container operations on a VM's engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull `image` onto the VM.
    async fn pull_image(&self, engine_url: &str, image: &str) -> Result<()>;

    /// Create and start a container; returns its runtime id.
    async fn run_container(&self, engine_url: &str, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container. Absent containers yield
    /// [`ClientError::NotFound`].
    async fn remove_container(&self, engine_url: &str, container_id: &str) -> Result<()>;

    /// Drive a container to `target`.
    async fn set_container_state(
        &self,
        engine_url: &str,
        container_id: &str,
        target: ContainerState,
    ) -> Result<()>;
}

/// Configuration for [`DockerEngineClient`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Port the engine API listens on inside each VM.
    pub api_port: u16,
    /// Per-request timeout. Image pulls can be slow.
    pub request_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            api_port: 2375,
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl DockerConfig {
    /// Set the engine API port.
    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Engine base URL for a VM.
    pub fn engine_url(&self, vm_ip: &str) -> String {
        format!("http://{}:{}", vm_ip, self.api_port)
    }
}

#[derive(Deserialize)]
struct CreatedContainer {
    #[serde(rename = "Id")]
    id: String,
}

/// HTTP client for the container engine API.
pub struct DockerEngineClient {
    http: reqwest::Client,
}

impl DockerEngineClient {
    /// Create a client with the given configuration.
    pub fn new(config: DockerConfig) -> Result<Self> {
        let http = build_client(config.request_timeout, false)?;
        Ok(Self { http })
    }

    async fn create(&self, base: &str, spec: &ContainerSpec) -> Result<std::result::Result<String, StatusCode>> {
        let response = self
            .http
            .post(format!("{}/containers/create", base))
            .query(&[("name", spec.name.as_str())])
            .json(&spec.to_create_body())
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(Err(StatusCode::CONFLICT));
        }
        let created: CreatedContainer = check(response, "create container").await?.json().await?;
        Ok(Ok(created.id))
    }

    async fn post_lifecycle(&self, base: &str, container_id: &str, action: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/containers/{}/{}", base, container_id, action))
            .send()
            .await?;
        // 304: already in the requested state
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        check(response, action).await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngineClient {
    #[instrument(skip(self))]
    async fn pull_image(&self, engine_url: &str, image: &str) -> Result<()> {
        let (repository, tag) = split_image_reference(image);
        let response = self
            .http
            .post(format!("{}/images/create", trim_base(engine_url)))
            .query(&[("fromImage", repository), ("tag", tag)])
            .send()
            .await?;
        let response = check(response, "pull image").await?;

        // Progress stream; failures arrive as an `error` line with status 200.
        let body = response.text().await?;
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line)
                && let Some(error) = value.get("error").and_then(|e| e.as_str())
            {
                return Err(ClientError::Api {
                    status: 200,
                    body: error.to_string(),
                });
            }
        }
        debug!("Image pulled");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn run_container(&self, engine_url: &str, spec: &ContainerSpec) -> Result<String> {
        let base = trim_base(engine_url);

        let id = match self.create(base, spec).await? {
            Ok(id) => id,
            Err(_) => {
                warn!("Container name in use, replacing");
                match self.remove_container(engine_url, &spec.name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.create(base, spec).await?.map_err(|status| ClientError::Api {
                    status: status.as_u16(),
                    body: format!("container name {} still in use", spec.name),
                })?
            }
        };

        self.post_lifecycle(base, &id, "start").await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, engine_url: &str, container_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/containers/{}", trim_base(engine_url), container_id))
            .query(&[("force", "true")])
            .send()
            .await?;
        check(response, "remove container").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_container_state(
        &self,
        engine_url: &str,
        container_id: &str,
        target: ContainerState,
    ) -> Result<()> {
        let action = match target {
            ContainerState::Running => "restart",
            ContainerState::Stopped => "stop",
        };
        self.post_lifecycle(trim_base(engine_url), container_id, action)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image_reference() {
        assert_eq!(split_image_reference("nginx:latest"), ("nginx", "latest"));
        assert_eq!(split_image_reference("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_image_reference("registry.local:5000/team/app"),
            ("registry.local:5000/team/app", "latest")
        );
        assert_eq!(
            split_image_reference("registry.local:5000/team/app:v2"),
            ("registry.local:5000/team/app", "v2")
        );
    }

    #[test]
    fn test_create_body_binds_loopback() {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "3000".to_string());
        let spec = ContainerSpec {
            name: "svc-app".to_string(),
            image: "nginx:latest".to_string(),
            env,
            container_port: 3000,
            host_port: 10000,
            labels: BTreeMap::new(),
        };
        let body = spec.to_create_body();
        assert_eq!(body["Env"][0], "PORT=3000");
        let binding = &body["HostConfig"]["PortBindings"]["3000/tcp"][0];
        assert_eq!(binding["HostIp"], "127.0.0.1");
        assert_eq!(binding["HostPort"], "10000");
    }

    #[test]
    fn test_engine_url() {
        assert_eq!(
            DockerConfig::default().engine_url("10.0.0.21"),
            "http://10.0.0.21:2375"
        );
    }
}
