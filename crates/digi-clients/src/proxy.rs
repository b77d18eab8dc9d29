// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse-proxy admin client.
//!
//! Both proxy tiers (the shared edge proxy and the proxy inside each VM)
//! expose the same admin API, so a single client is addressed with the
//! admin base URL of whichever instance is being changed.
//!
//! Routes are keyed by a deterministic id derived from the subdomain
//! (`route-<subdomain>`). [`ProxyAdmin::upsert_route`] replaces the route
//! in place when the id already exists, so repeating it never adds a
//! second rule for the same host.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{ClientError, Result};
use crate::http::{build_client, check, trim_base};

/// Deterministic route id for a subdomain.
pub fn route_id(subdomain: &str) -> String {
    format!("route-{}", subdomain)
}

/// A host-matching reverse-proxy route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Stable route id (`route-<subdomain>`).
    pub id: String,
    /// Host header to match.
    pub host: String,
    /// Upstream address, `host:port`.
    pub upstream: String,
}

impl Route {
    /// Route matching `host`, keyed by `subdomain`, forwarding to `upstream`.
    pub fn new(subdomain: &str, host: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            id: route_id(subdomain),
            host: host.into(),
            upstream: upstream.into(),
        }
    }

    /// Route on a VM-local proxy forwarding to a container's local port.
    pub fn vm_local(subdomain: &str, host: &str, container_port: u16) -> Self {
        Self::new(subdomain, host, format!("127.0.0.1:{}", container_port))
    }

    /// Route on the edge proxy forwarding to a VM's HTTP port.
    pub fn edge(subdomain: &str, host: &str, vm_ip: &str, vm_http_port: u16) -> Self {
        Self::new(subdomain, host, format!("{}:{}", vm_ip, vm_http_port))
    }

    /// Admin-API JSON representation of the route.
    pub fn to_json(&self) -> Value {
        json!({
            "@id": self.id,
            "match": [{ "host": [self.host] }],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": self.upstream }],
            }],
        })
    }
}

/// Admin operations on a reverse-proxy instance.
#[async_trait]
pub trait ProxyAdmin: Send + Sync {
    /// Create or replace a route; returns its id.
    async fn upsert_route(&self, admin_url: &str, route: &Route) -> Result<String>;

    /// Remove the route for `subdomain`. Absent routes yield
    /// [`ClientError::NotFound`].
    async fn remove_route(&self, admin_url: &str, subdomain: &str) -> Result<()>;
}

/// Configuration for [`CaddyAdminClient`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Name of the HTTP server whose route list receives new routes.
    pub server_name: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server_name: "srv0".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    /// Set the HTTP server name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// HTTP client for the proxy admin API.
pub struct CaddyAdminClient {
    http: reqwest::Client,
    config: ProxyConfig,
}

impl CaddyAdminClient {
    /// Create a client with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let http = build_client(config.request_timeout, false)?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl ProxyAdmin for CaddyAdminClient {
    #[instrument(skip(self, route), fields(route_id = %route.id, upstream = %route.upstream))]
    async fn upsert_route(&self, admin_url: &str, route: &Route) -> Result<String> {
        let base = trim_base(admin_url);
        let body = route.to_json();

        let replaced = self
            .http
            .patch(format!("{}/id/{}", base, route.id))
            .json(&body)
            .send()
            .await?;
        match check(replaced, "replace route").await {
            Ok(_) => {
                debug!("Replaced existing route");
                return Ok(route.id.clone());
            }
            Err(ClientError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let created = self
            .http
            .post(format!(
                "{}/config/apps/http/servers/{}/routes",
                base, self.config.server_name
            ))
            .json(&body)
            .send()
            .await?;
        check(created, "add route").await?;
        debug!("Added new route");
        Ok(route.id.clone())
    }

    #[instrument(skip(self))]
    async fn remove_route(&self, admin_url: &str, subdomain: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/id/{}", trim_base(admin_url), route_id(subdomain)))
            .send()
            .await?;
        check(response, "remove route").await?;
        Ok(())
    }
}
