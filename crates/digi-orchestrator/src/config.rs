// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for digi-orchestrator.

use std::time::Duration;

use crate::handlers::OrchestratorSettings;
use crate::worker::WorkerConfig;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Redis connection string; in-memory cache and pub/sub when unset.
    pub redis_url: Option<String>,
    /// Admin API of the edge proxy.
    pub edge_proxy_url: String,
    /// Admin API port of the proxy inside each VM.
    pub vm_proxy_admin_port: u16,
    /// HTTP port of the proxy inside each VM.
    pub vm_proxy_http_port: u16,
    /// Container engine API port inside each VM.
    pub docker_api_port: u16,
    /// Hypervisor template cloned for new VMs.
    pub vm_template_id: u32,
    /// DNS provider API token.
    pub dns_api_token: Option<String>,
    /// DNS provider API base URL override.
    pub dns_api_url: Option<String>,
    /// Base URL of the user dashboard.
    pub dashboard_url: Option<String>,
    /// Worker poll interval.
    pub poll_interval: Duration,
    /// How long a job may stay `processing` before it is considered abandoned.
    pub stale_timeout: Duration,
    /// Base delay before a failed job is retried.
    pub retry_backoff: Duration,
    /// Platform name, used in the domain verification record.
    pub platform_name: String,
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Only `DIGI_DATABASE_URL` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DIGI_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DIGI_DATABASE_URL"))?;

        let platform_name = optional_env("DIGI_PLATFORM_NAME").unwrap_or_else(|| "digi".to_string());
        if !platform_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigError::InvalidValue {
                name: "DIGI_PLATFORM_NAME",
                value: platform_name,
            });
        }

        Ok(Self {
            database_url,
            redis_url: optional_env("DIGI_REDIS_URL"),
            edge_proxy_url: optional_env("DIGI_EDGE_PROXY_URL")
                .unwrap_or_else(|| "http://127.0.0.1:2019".to_string()),
            vm_proxy_admin_port: parse_env("DIGI_VM_PROXY_ADMIN_PORT", 2019),
            vm_proxy_http_port: parse_env("DIGI_VM_PROXY_HTTP_PORT", 80),
            docker_api_port: parse_env("DIGI_DOCKER_API_PORT", 2375),
            vm_template_id: parse_env("DIGI_VM_TEMPLATE_ID", 9000),
            dns_api_token: optional_env("DIGI_DNS_API_TOKEN"),
            dns_api_url: optional_env("DIGI_DNS_API_URL"),
            dashboard_url: optional_env("DIGI_DASHBOARD_URL"),
            poll_interval: Duration::from_secs(parse_env("DIGI_WORKER_POLL_INTERVAL_SECS", 5)),
            stale_timeout: Duration::from_secs(parse_env("DIGI_JOB_STALE_TIMEOUT_SECS", 900)),
            retry_backoff: Duration::from_secs(parse_env("DIGI_JOB_RETRY_BACKOFF_SECS", 30)),
            platform_name,
        })
    }

    /// Worker loop settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            stale_timeout: self.stale_timeout,
            retry_backoff: self.retry_backoff,
        }
    }

    /// Handler settings.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            edge_proxy_url: self.edge_proxy_url.clone(),
            vm_proxy_admin_port: self.vm_proxy_admin_port,
            vm_proxy_http_port: self.vm_proxy_http_port,
            docker_api_port: self.docker_api_port,
            vm_template_id: self.vm_template_id,
            dashboard_url: self.dashboard_url.clone(),
            platform_name: self.platform_name.clone(),
            ..OrchestratorSettings::default()
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {name}: {value}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DIGI_DATABASE_URL",
        "DIGI_REDIS_URL",
        "DIGI_EDGE_PROXY_URL",
        "DIGI_VM_TEMPLATE_ID",
        "DIGI_WORKER_POLL_INTERVAL_SECS",
        "DIGI_PLATFORM_NAME",
    ];

    fn clear() {
        for var in VARS {
            // SAFETY: tests touching the environment are serialized.
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("DIGI_DATABASE_URL")));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        unsafe { std::env::set_var("DIGI_DATABASE_URL", "postgres://localhost/digi") };

        let config = Config::from_env().unwrap();
        assert_eq!(config.redis_url, None);
        assert_eq!(config.edge_proxy_url, "http://127.0.0.1:2019");
        assert_eq!(config.vm_template_id, 9000);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.stale_timeout, Duration::from_secs(900));
        assert_eq!(config.platform_name, "digi");
        clear();
    }

    #[test]
    #[serial]
    fn test_overrides_and_unparseable_values() {
        clear();
        unsafe {
            std::env::set_var("DIGI_DATABASE_URL", "postgres://localhost/digi");
            std::env::set_var("DIGI_REDIS_URL", "redis://127.0.0.1:6379");
            std::env::set_var("DIGI_VM_TEMPLATE_ID", "not-a-number");
            std::env::set_var("DIGI_WORKER_POLL_INTERVAL_SECS", "1");
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.vm_template_id, 9000);
        assert_eq!(config.worker_config().poll_interval, Duration::from_secs(1));
        clear();
    }

    #[test]
    #[serial]
    fn test_rejects_platform_name_with_dots() {
        clear();
        unsafe {
            std::env::set_var("DIGI_DATABASE_URL", "postgres://localhost/digi");
            std::env::set_var("DIGI_PLATFORM_NAME", "di.gi");
        }
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::InvalidValue { name: "DIGI_PLATFORM_NAME", .. }
        ));
        clear();
    }
}
