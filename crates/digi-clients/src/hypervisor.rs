// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor control-plane client.
//!
//! Long-running operations (clone, start, stop, delete) return a
//! [`TaskHandle`] that has to be polled with [`Hypervisor::task_status`]
//! until it stops. [`wait_for_task`] and [`wait_for_guest_ipv4`] wrap the
//! two polling loops the deploy path needs, each with a bounded budget.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::error::{ClientError, Result};
use crate::http::{build_client, check, trim_base};

/// Connection details for a single hypervisor node.
///
/// Every node carries its own API token pair.
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    /// Base URL of the JSON API, e.g. `https://pve1:8006/api2/json`.
    pub api_url: String,
    /// Node name as known to the hypervisor.
    pub node: String,
    /// API token id (`user@realm!name`).
    pub token_id: String,
    /// API token secret.
    pub token_secret: String,
}

impl NodeCredentials {
    /// Credentials for a node reachable at `hostname:port`.
    pub fn new(
        hostname: &str,
        port: u16,
        node: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            api_url: format!("https://{}:{}/api2/json", hostname, port),
            node: node.into(),
            token_id: token_id.into(),
            token_secret: token_secret.into(),
        }
    }

    /// Override the API base URL.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }

    fn qemu_url(&self, vm_id: u32) -> String {
        format!(
            "{}/nodes/{}/qemu/{}",
            trim_base(&self.api_url),
            self.node,
            vm_id
        )
    }
}

/// Handle of a long-running hypervisor task (a UPID).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a hypervisor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Still running.
    Running,
    /// Finished; `exit_status` is `"OK"` on success.
    Stopped {
        /// Exit status reported by the hypervisor.
        exit_status: String,
    },
}

/// Current runtime status of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmCurrentStatus {
    /// Power state (`running`, `stopped`, ...).
    pub status: String,
    /// CPU usage as a fraction of allotted cores.
    #[serde(default)]
    pub cpu: f64,
    /// Memory in use, bytes.
    #[serde(default)]
    pub mem: u64,
    /// Memory allotted, bytes.
    #[serde(default)]
    pub maxmem: u64,
}

/// A network interface reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestInterface {
    /// Interface name (`eth0`, `lo`, ...).
    pub name: String,
    /// MAC address.
    #[serde(rename = "hardware-address", default)]
    pub hardware_address: Option<String>,
    /// Addresses bound to the interface.
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

/// One address bound to a guest interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestIpAddress {
    /// `ipv4` or `ipv6`.
    #[serde(rename = "ip-address-type")]
    pub address_type: String,
    /// The address.
    #[serde(rename = "ip-address")]
    pub address: String,
    /// Prefix length.
    #[serde(default)]
    pub prefix: Option<u8>,
}

impl GuestInterface {
    /// First IPv4 address on a non-loopback interface, if any.
    pub fn first_ipv4(interfaces: &[GuestInterface]) -> Option<String> {
        interfaces
            .iter()
            .filter(|iface| iface.name != "lo")
            .flat_map(|iface| iface.ip_addresses.iter())
            .find(|addr| addr.address_type == "ipv4" && !addr.address.starts_with("127."))
            .map(|addr| addr.address.clone())
    }
}

/// Operations on the hypervisor control plane.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Full-clone `template_id` into a new VM `new_vm_id` named `name`.
    async fn clone_template(
        &self,
        node: &NodeCredentials,
        template_id: u32,
        new_vm_id: u32,
        name: &str,
    ) -> Result<TaskHandle>;

    /// Power on a VM.
    async fn start_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle>;

    /// Power off a VM.
    async fn stop_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle>;

    /// Delete a VM. Absent VMs yield [`ClientError::NotFound`].
    async fn delete_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle>;

    /// Poll a task's state.
    async fn task_status(&self, node: &NodeCredentials, task: &TaskHandle) -> Result<TaskState>;

    /// Read the VM's current runtime status.
    async fn current_status(&self, node: &NodeCredentials, vm_id: u32) -> Result<VmCurrentStatus>;

    /// List the guest's network interfaces via the guest agent.
    async fn network_interfaces(
        &self,
        node: &NodeCredentials,
        vm_id: u32,
    ) -> Result<Vec<GuestInterface>>;
}

/// Configuration for [`ProxmoxClient`].
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    /// Accept self-signed certificates (nodes ship with one by default).
    pub accept_invalid_certs: bool,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HypervisorConfig {
    /// Enable or disable acceptance of self-signed certificates.
    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Bounded polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Maximum number of polls.
    pub attempts: u32,
    /// Delay between polls.
    pub interval: Duration,
}

impl PollPolicy {
    /// A custom budget.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Budget for hypervisor tasks: 60 polls, 3 seconds apart.
    pub fn tasks() -> Self {
        Self::new(60, Duration::from_secs(3))
    }

    /// Budget for the guest agent to report an address: 40 polls, 5 seconds apart.
    pub fn guest_network() -> Self {
        Self::new(40, Duration::from_secs(5))
    }
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TaskStatusBody {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Deserialize)]
struct AgentResult<T> {
    result: T,
}

/// [`check`] plus the hypervisor's own way of reporting a missing guest.
///
/// An unknown VMID comes back as a 500 whose message says the guest's
/// configuration file "does not exist"; that is a [`ClientError::NotFound`].
async fn check_node(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    match check(response, what).await {
        Err(ClientError::Api { status: 500, body }) if body.contains("does not exist") => {
            Err(ClientError::NotFound(format!("{}: {}", what, body.trim())))
        }
        other => other,
    }
}

/// HTTP client for the hypervisor JSON API.
pub struct ProxmoxClient {
    http: reqwest::Client,
}

impl ProxmoxClient {
    /// Create a client with the given configuration.
    pub fn new(config: HypervisorConfig) -> Result<Self> {
        let http = build_client(config.request_timeout, config.accept_invalid_certs)?;
        Ok(Self { http })
    }

    async fn post_task(
        &self,
        node: &NodeCredentials,
        url: String,
        body: Option<serde_json::Value>,
        what: &str,
    ) -> Result<TaskHandle> {
        let mut request = self
            .http
            .post(&url)
            .header("Authorization", node.auth_header());
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = check_node(request.send().await?, what).await?;
        let envelope: DataEnvelope<String> = response.json().await?;
        Ok(TaskHandle(envelope.data))
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    #[instrument(skip(self, node), fields(node = %node.node))]
    async fn clone_template(
        &self,
        node: &NodeCredentials,
        template_id: u32,
        new_vm_id: u32,
        name: &str,
    ) -> Result<TaskHandle> {
        let url = format!("{}/clone", node.qemu_url(template_id));
        let body = json!({
            "newid": new_vm_id,
            "name": name,
            "full": true,
        });
        self.post_task(node, url, Some(body), "clone template").await
    }

    #[instrument(skip(self, node), fields(node = %node.node))]
    async fn start_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle> {
        let url = format!("{}/status/start", node.qemu_url(vm_id));
        self.post_task(node, url, None, "start vm").await
    }

    #[instrument(skip(self, node), fields(node = %node.node))]
    async fn stop_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle> {
        let url = format!("{}/status/stop", node.qemu_url(vm_id));
        self.post_task(node, url, None, "stop vm").await
    }

    #[instrument(skip(self, node), fields(node = %node.node))]
    async fn delete_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle> {
        let response = self
            .http
            .delete(node.qemu_url(vm_id))
            .header("Authorization", node.auth_header())
            .send()
            .await?;
        let response = check_node(response, "delete vm").await?;
        let envelope: DataEnvelope<String> = response.json().await?;
        Ok(TaskHandle(envelope.data))
    }

    #[instrument(skip(self, node, task), fields(node = %node.node, task = %task))]
    async fn task_status(&self, node: &NodeCredentials, task: &TaskHandle) -> Result<TaskState> {
        let url = format!(
            "{}/nodes/{}/tasks/{}/status",
            trim_base(&node.api_url),
            node.node,
            urlencoding::encode(&task.0)
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", node.auth_header())
            .send()
            .await?;
        let response = check_node(response, "task status").await?;
        let envelope: DataEnvelope<TaskStatusBody> = response.json().await?;

        match envelope.data.status.as_str() {
            "stopped" => Ok(TaskState::Stopped {
                exit_status: envelope.data.exitstatus.unwrap_or_default(),
            }),
            _ => Ok(TaskState::Running),
        }
    }

    #[instrument(skip(self, node), fields(node = %node.node))]
    async fn current_status(&self, node: &NodeCredentials, vm_id: u32) -> Result<VmCurrentStatus> {
        let url = format!("{}/status/current", node.qemu_url(vm_id));
        let response = self
            .http
            .get(&url)
            .header("Authorization", node.auth_header())
            .send()
            .await?;
        let response = check_node(response, "vm status").await?;
        let envelope: DataEnvelope<VmCurrentStatus> = response.json().await?;
        Ok(envelope.data)
    }

    #[instrument(skip(self, node), fields(node = %node.node))]
    async fn network_interfaces(
        &self,
        node: &NodeCredentials,
        vm_id: u32,
    ) -> Result<Vec<GuestInterface>> {
        let url = format!("{}/agent/network-get-interfaces", node.qemu_url(vm_id));
        let response = self
            .http
            .get(&url)
            .header("Authorization", node.auth_header())
            .send()
            .await?;
        let response = check_node(response, "guest network").await?;
        let envelope: DataEnvelope<AgentResult<Vec<GuestInterface>>> = response.json().await?;
        Ok(envelope.data.result)
    }
}

/// Poll `task` until it stops.
///
/// Returns `Ok(())` when the task exits with `OK`, [`ClientError::TaskFailed`]
/// for any other exit status and [`ClientError::Timeout`] when the budget
/// runs out.
pub async fn wait_for_task(
    hypervisor: &dyn Hypervisor,
    node: &NodeCredentials,
    task: &TaskHandle,
    policy: PollPolicy,
) -> Result<()> {
    for attempt in 1..=policy.attempts {
        match hypervisor.task_status(node, task).await? {
            TaskState::Stopped { exit_status } if exit_status == "OK" => return Ok(()),
            TaskState::Stopped { exit_status } => {
                return Err(ClientError::TaskFailed {
                    task: task.0.clone(),
                    exit_status,
                });
            }
            TaskState::Running => {
                debug!(task = %task, attempt, "Task still running");
                if attempt < policy.attempts {
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }

    Err(ClientError::Timeout {
        what: format!("task {}", task),
        attempts: policy.attempts,
    })
}

/// Poll the guest agent until the VM reports a non-loopback IPv4 address.
///
/// Errors from the agent (typically "agent not running" while the guest
/// boots) count as "not ready yet".
pub async fn wait_for_guest_ipv4(
    hypervisor: &dyn Hypervisor,
    node: &NodeCredentials,
    vm_id: u32,
    policy: PollPolicy,
) -> Result<String> {
    for attempt in 1..=policy.attempts {
        match hypervisor.network_interfaces(node, vm_id).await {
            Ok(interfaces) => {
                if let Some(ip) = GuestInterface::first_ipv4(&interfaces) {
                    return Ok(ip);
                }
                debug!(vm_id, attempt, "Guest has no IPv4 address yet");
            }
            Err(e) => {
                debug!(vm_id, attempt, error = %e, "Guest agent not ready");
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(ClientError::Timeout {
        what: format!("guest network of vm {}", vm_id),
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, addrs: &[(&str, &str)]) -> GuestInterface {
        GuestInterface {
            name: name.to_string(),
            hardware_address: None,
            ip_addresses: addrs
                .iter()
                .map(|(kind, addr)| GuestIpAddress {
                    address_type: kind.to_string(),
                    address: addr.to_string(),
                    prefix: Some(24),
                })
                .collect(),
        }
    }

    #[test]
    fn test_first_ipv4_skips_loopback() {
        let interfaces = vec![
            iface("lo", &[("ipv4", "127.0.0.1")]),
            iface("eth0", &[("ipv6", "fe80::1"), ("ipv4", "10.10.0.21")]),
        ];
        assert_eq!(
            GuestInterface::first_ipv4(&interfaces),
            Some("10.10.0.21".to_string())
        );
    }

    #[test]
    fn test_first_ipv4_none_when_only_ipv6() {
        let interfaces = vec![iface("eth0", &[("ipv6", "fe80::1")])];
        assert_eq!(GuestInterface::first_ipv4(&interfaces), None);
    }

    #[test]
    fn test_guest_interface_deserializes_agent_shape() {
        let raw = serde_json::json!({
            "name": "eth0",
            "hardware-address": "bc:24:11:00:00:01",
            "ip-addresses": [
                {"ip-address-type": "ipv4", "ip-address": "10.0.0.7", "prefix": 24}
            ]
        });
        let parsed: GuestInterface = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.ip_addresses[0].address, "10.0.0.7");
        assert_eq!(parsed.hardware_address.as_deref(), Some("bc:24:11:00:00:01"));
    }

    #[test]
    fn test_node_credentials_urls() {
        let creds = NodeCredentials::new("pve1.local", 8006, "pve1", "root@pam!digi", "s3cr3t");
        assert_eq!(creds.api_url, "https://pve1.local:8006/api2/json");
        assert_eq!(
            creds.qemu_url(9000),
            "https://pve1.local:8006/api2/json/nodes/pve1/qemu/9000"
        );
        assert_eq!(creds.auth_header(), "PVEAPIToken=root@pam!digi=s3cr3t");
    }

    #[test]
    fn test_task_policy_budget() {
        let policy = PollPolicy::tasks();
        assert_eq!(policy.attempts, 60);
        assert_eq!(policy.interval, Duration::from_secs(3));
    }
}
