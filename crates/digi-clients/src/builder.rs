// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source-to-image builds on a tenant VM.
//!
//! The repository is cloned onto the VM and built there with railpack,
//! so the resulting image lands directly in the VM's engine and never
//! needs a registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::error::{ClientError, Result};

/// Inputs for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Address of the VM to build on.
    pub vm_ip: String,
    /// Git repository URL.
    pub repo_url: String,
    /// Branch to build.
    pub branch: String,
    /// Name (and tag) of the produced image.
    pub image_name: String,
    /// Build-time environment variables.
    pub env: BTreeMap<String, String>,
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    /// Image reference, usable by the container engine on the same VM.
    pub image: String,
    /// Combined build output.
    pub logs: String,
}

/// Produces container images from source.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image described by `request`.
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage>;
}

/// Builds over ssh with `git` and `railpack` on the target VM.
#[derive(Debug, Clone)]
pub struct RailpackBuilder {
    ssh_user: String,
}

impl Default for RailpackBuilder {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
        }
    }
}

impl RailpackBuilder {
    /// Builder logging in as `ssh_user`.
    pub fn new(ssh_user: impl Into<String>) -> Self {
        Self {
            ssh_user: ssh_user.into(),
        }
    }

    async fn run_remote(&self, vm_ip: &str, script: &str) -> Result<String> {
        let output = Command::new("ssh")
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "BatchMode=yes",
                &format!("{}@{}", self.ssh_user, vm_ip),
                script,
            ])
            .output()
            .await?;

        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ClientError::Build(logs));
        }
        Ok(logs)
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

fn build_dir(image_name: &str) -> String {
    format!("/tmp/build-{}", image_name.replace([':', '/'], "-"))
}

fn clone_script(request: &BuildRequest) -> String {
    let dir = shell_quote(&build_dir(&request.image_name));
    format!(
        "rm -rf {dir} && git clone --branch {branch} --depth 1 {url} {dir}",
        dir = dir,
        branch = shell_quote(&request.branch),
        url = shell_quote(&request.repo_url),
    )
}

fn build_script(request: &BuildRequest) -> String {
    let env_flags: String = request
        .env
        .iter()
        .map(|(k, v)| format!(" --env {}", shell_quote(&format!("{}={}", k, v))))
        .collect();
    format!(
        "cd {dir} && railpack build --name {name}{env} .",
        dir = shell_quote(&build_dir(&request.image_name)),
        name = shell_quote(&request.image_name),
        env = env_flags,
    )
}

#[async_trait]
impl ImageBuilder for RailpackBuilder {
    #[instrument(skip(self, request), fields(vm_ip = %request.vm_ip, image = %request.image_name))]
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage> {
        if request.repo_url.is_empty() {
            return Err(ClientError::InvalidInput("repository URL is empty".to_string()));
        }

        let mut logs = self.run_remote(&request.vm_ip, &clone_script(request)).await?;
        logs.push_str(&self.run_remote(&request.vm_ip, &build_script(request)).await?);

        info!("Image built");
        Ok(BuiltImage {
            image: request.image_name.clone(),
            logs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BuildRequest {
        BuildRequest {
            vm_ip: "10.0.0.21".to_string(),
            repo_url: "https://github.com/acme/shop.git".to_string(),
            branch: "main".to_string(),
            image_name: "shop:abc123".to_string(),
            env: BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]),
        }
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn test_clone_script() {
        assert_eq!(
            clone_script(&request()),
            "rm -rf '/tmp/build-shop-abc123' && git clone --branch 'main' --depth 1 \
             'https://github.com/acme/shop.git' '/tmp/build-shop-abc123'"
        );
    }

    #[test]
    fn test_build_script_passes_env() {
        let script = build_script(&request());
        assert!(script.starts_with("cd '/tmp/build-shop-abc123' && railpack build --name 'shop:abc123'"));
        assert!(script.contains("--env 'NODE_ENV=production'"));
    }
}
