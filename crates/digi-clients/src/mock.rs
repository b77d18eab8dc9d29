// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory clients for testing.
//!
//! Each mock keeps the resources it was asked to create, so tests can
//! assert on what exists after a handler ran. Deleting something that was
//! never created returns [`ClientError::NotFound`], which is how the HTTP
//! clients report a missing resource whatever status the remote API used.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::builder::{BuildRequest, BuiltImage, ImageBuilder};
use crate::dns::{DnsProvider, NewDnsRecord, ZoneRecord};
use crate::docker::{ContainerEngine, ContainerSpec, ContainerState};
use crate::error::{ClientError, Result};
use crate::hypervisor::{
    GuestInterface, GuestIpAddress, Hypervisor, NodeCredentials, TaskHandle, TaskState,
    VmCurrentStatus,
};
use crate::proxy::{ProxyAdmin, Route, route_id};

fn mock_failure(what: &str) -> ClientError {
    ClientError::Api {
        status: 500,
        body: format!("mock failure: {}", what),
    }
}

// ============================================================================
// Hypervisor
// ============================================================================

#[derive(Debug, Default)]
struct HypervisorState {
    next_task: u64,
    /// (node, vm id) -> power state
    vms: HashMap<(String, u32), String>,
    calls: Vec<String>,
}

/// Mock hypervisor. Tasks complete immediately.
pub struct MockHypervisor {
    state: Arc<Mutex<HypervisorState>>,
    guest_ip: Option<String>,
    /// If true, every operation fails.
    pub fail_by_default: bool,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// Hypervisor whose guests report `10.0.0.21` once started.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HypervisorState::default())),
            guest_ip: Some("10.0.0.21".to_string()),
            fail_by_default: false,
        }
    }

    /// Hypervisor whose operations all fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Guests report `ip` once started; `None` means they never get one.
    pub fn with_guest_ip(mut self, ip: Option<&str>) -> Self {
        self.guest_ip = ip.map(str::to_string);
        self
    }

    /// Register an existing VM.
    pub async fn insert_vm(&self, node: &str, vm_id: u32, status: &str) {
        let mut state = self.state.lock().await;
        state
            .vms
            .insert((node.to_string(), vm_id), status.to_string());
    }

    /// Power state of a VM, if it exists.
    pub async fn vm_status(&self, node: &str, vm_id: u32) -> Option<String> {
        let state = self.state.lock().await;
        state.vms.get(&(node.to_string(), vm_id)).cloned()
    }

    /// Operations performed, in order (`clone:9000->200`, `start:200`, ...).
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    async fn task(&self, call: String) -> TaskHandle {
        let mut state = self.state.lock().await;
        state.next_task += 1;
        state.calls.push(call);
        TaskHandle(format!("UPID:mock:{:08X}", state.next_task))
    }

    async fn set_status(&self, node: &NodeCredentials, vm_id: u32, status: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.vms.get_mut(&(node.node.clone(), vm_id)) {
            Some(current) => {
                *current = status.to_string();
                Ok(())
            }
            None => Err(ClientError::NotFound(format!("vm {}", vm_id))),
        }
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn clone_template(
        &self,
        node: &NodeCredentials,
        template_id: u32,
        new_vm_id: u32,
        _name: &str,
    ) -> Result<TaskHandle> {
        if self.fail_by_default {
            return Err(mock_failure("clone"));
        }
        {
            let mut state = self.state.lock().await;
            let key = (node.node.clone(), new_vm_id);
            if state.vms.contains_key(&key) {
                return Err(ClientError::Api {
                    status: 500,
                    body: format!("VM {} already exists", new_vm_id),
                });
            }
            state.vms.insert(key, "stopped".to_string());
        }
        Ok(self
            .task(format!("clone:{}->{}", template_id, new_vm_id))
            .await)
    }

    async fn start_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle> {
        if self.fail_by_default {
            return Err(mock_failure("start"));
        }
        self.set_status(node, vm_id, "running").await?;
        Ok(self.task(format!("start:{}", vm_id)).await)
    }

    async fn stop_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle> {
        if self.fail_by_default {
            return Err(mock_failure("stop"));
        }
        self.set_status(node, vm_id, "stopped").await?;
        Ok(self.task(format!("stop:{}", vm_id)).await)
    }

    async fn delete_vm(&self, node: &NodeCredentials, vm_id: u32) -> Result<TaskHandle> {
        if self.fail_by_default {
            return Err(mock_failure("delete"));
        }
        let removed = {
            let mut state = self.state.lock().await;
            state.vms.remove(&(node.node.clone(), vm_id))
        };
        if removed.is_none() {
            return Err(ClientError::NotFound(format!("vm {}", vm_id)));
        }
        Ok(self.task(format!("delete:{}", vm_id)).await)
    }

    async fn task_status(&self, _node: &NodeCredentials, _task: &TaskHandle) -> Result<TaskState> {
        if self.fail_by_default {
            return Err(mock_failure("task status"));
        }
        Ok(TaskState::Stopped {
            exit_status: "OK".to_string(),
        })
    }

    async fn current_status(&self, node: &NodeCredentials, vm_id: u32) -> Result<VmCurrentStatus> {
        if self.fail_by_default {
            return Err(mock_failure("status"));
        }
        let state = self.state.lock().await;
        let status = state
            .vms
            .get(&(node.node.clone(), vm_id))
            .ok_or_else(|| ClientError::NotFound(format!("vm {}", vm_id)))?;
        let running = status == "running";
        Ok(VmCurrentStatus {
            status: status.clone(),
            cpu: if running { 0.12 } else { 0.0 },
            mem: if running { 512 * 1024 * 1024 } else { 0 },
            maxmem: 2048 * 1024 * 1024,
        })
    }

    async fn network_interfaces(
        &self,
        node: &NodeCredentials,
        vm_id: u32,
    ) -> Result<Vec<GuestInterface>> {
        if self.fail_by_default {
            return Err(mock_failure("guest network"));
        }
        let state = self.state.lock().await;
        match state.vms.get(&(node.node.clone(), vm_id)).map(String::as_str) {
            Some("running") => {}
            Some(_) => {
                return Err(ClientError::Api {
                    status: 500,
                    body: "QEMU guest agent is not running".to_string(),
                });
            }
            None => return Err(ClientError::NotFound(format!("vm {}", vm_id))),
        }

        let mut interfaces = vec![GuestInterface {
            name: "lo".to_string(),
            hardware_address: None,
            ip_addresses: vec![GuestIpAddress {
                address_type: "ipv4".to_string(),
                address: "127.0.0.1".to_string(),
                prefix: Some(8),
            }],
        }];
        if let Some(ip) = &self.guest_ip {
            interfaces.push(GuestInterface {
                name: "eth0".to_string(),
                hardware_address: Some("bc:24:11:00:00:01".to_string()),
                ip_addresses: vec![GuestIpAddress {
                    address_type: "ipv4".to_string(),
                    address: ip.clone(),
                    prefix: Some(24),
                }],
            });
        }
        Ok(interfaces)
    }
}

// ============================================================================
// Reverse proxy
// ============================================================================

/// Mock proxy admin API holding routes per admin URL.
#[derive(Default)]
pub struct MockProxyAdmin {
    routes: Arc<Mutex<HashMap<String, Vec<Route>>>>,
    /// If true, every operation fails.
    pub fail_by_default: bool,
}

impl MockProxyAdmin {
    /// Empty proxy fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Proxy fleet whose operations all fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::default()
        }
    }

    /// Routes configured on the proxy at `admin_url`.
    pub async fn routes(&self, admin_url: &str) -> Vec<Route> {
        let routes = self.routes.lock().await;
        routes.get(admin_url).cloned().unwrap_or_default()
    }

    /// Total routes across all proxies.
    pub async fn route_count(&self) -> usize {
        self.routes.lock().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl ProxyAdmin for MockProxyAdmin {
    async fn upsert_route(&self, admin_url: &str, route: &Route) -> Result<String> {
        if self.fail_by_default {
            return Err(mock_failure("upsert route"));
        }
        let mut routes = self.routes.lock().await;
        let instance = routes.entry(admin_url.to_string()).or_default();
        match instance.iter_mut().find(|r| r.id == route.id) {
            Some(existing) => *existing = route.clone(),
            None => instance.push(route.clone()),
        }
        Ok(route.id.clone())
    }

    async fn remove_route(&self, admin_url: &str, subdomain: &str) -> Result<()> {
        if self.fail_by_default {
            return Err(mock_failure("remove route"));
        }
        let id = route_id(subdomain);
        let mut routes = self.routes.lock().await;
        let instance = routes.entry(admin_url.to_string()).or_default();
        let before = instance.len();
        instance.retain(|r| r.id != id);
        if instance.len() == before {
            return Err(ClientError::NotFound(id));
        }
        Ok(())
    }
}

// ============================================================================
// DNS
// ============================================================================

#[derive(Debug, Default)]
struct DnsState {
    next_id: u64,
    zones: HashMap<String, Vec<ZoneRecord>>,
}

/// Mock DNS provider holding records per zone.
#[derive(Default)]
pub struct MockDnsProvider {
    state: Arc<Mutex<DnsState>>,
    /// If true, every operation fails.
    pub fail_by_default: bool,
}

impl MockDnsProvider {
    /// Provider with no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose operations all fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::default()
        }
    }

    /// Records currently in `zone_id`.
    pub async fn records(&self, zone_id: &str) -> Vec<ZoneRecord> {
        let state = self.state.lock().await;
        state.zones.get(zone_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    async fn create_record(&self, zone_id: &str, record: &NewDnsRecord) -> Result<ZoneRecord> {
        if self.fail_by_default {
            return Err(mock_failure("create record"));
        }
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let created = ZoneRecord {
            id: format!("rec{:06}", state.next_id),
            record_type: record.record_type.as_str().to_string(),
            name: record.name.clone(),
            content: record.content.clone(),
            proxied: record.proxied,
        };
        state
            .zones
            .entry(zone_id.to_string())
            .or_default()
            .push(created.clone());
        Ok(created)
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        if self.fail_by_default {
            return Err(mock_failure("delete record"));
        }
        let mut state = self.state.lock().await;
        let records = state.zones.entry(zone_id.to_string()).or_default();
        let before = records.len();
        records.retain(|r| r.id != record_id);
        if records.len() == before {
            return Err(ClientError::NotFound(format!("dns record {}", record_id)));
        }
        Ok(())
    }

    async fn list_records(&self, zone_id: &str, name: Option<&str>) -> Result<Vec<ZoneRecord>> {
        if self.fail_by_default {
            return Err(mock_failure("list records"));
        }
        let state = self.state.lock().await;
        Ok(state
            .zones
            .get(zone_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| name.is_none_or(|n| r.name == n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// Container engine
// ============================================================================

/// A container held by [`MockContainerEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockContainer {
    /// Runtime id.
    pub id: String,
    /// Spec it was started with.
    pub spec: ContainerSpec,
    /// Current state.
    pub state: ContainerState,
}

#[derive(Debug, Default)]
struct EngineState {
    next_id: u64,
    /// engine url -> containers
    containers: HashMap<String, Vec<MockContainer>>,
    pulled: Vec<(String, String)>,
}

/// Mock container engine holding containers per engine URL.
#[derive(Default)]
pub struct MockContainerEngine {
    state: Arc<Mutex<EngineState>>,
    /// If true, every operation fails.
    pub fail_by_default: bool,
}

impl MockContainerEngine {
    /// Engine with no containers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose operations all fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::default()
        }
    }

    /// Containers on the engine at `engine_url`.
    pub async fn containers(&self, engine_url: &str) -> Vec<MockContainer> {
        let state = self.state.lock().await;
        state.containers.get(engine_url).cloned().unwrap_or_default()
    }

    /// `(engine url, image)` pairs pulled so far.
    pub async fn pulled_images(&self) -> Vec<(String, String)> {
        self.state.lock().await.pulled.clone()
    }
}

#[async_trait]
impl ContainerEngine for MockContainerEngine {
    async fn pull_image(&self, engine_url: &str, image: &str) -> Result<()> {
        if self.fail_by_default {
            return Err(mock_failure("pull"));
        }
        let mut state = self.state.lock().await;
        state
            .pulled
            .push((engine_url.to_string(), image.to_string()));
        Ok(())
    }

    async fn run_container(&self, engine_url: &str, spec: &ContainerSpec) -> Result<String> {
        if self.fail_by_default {
            return Err(mock_failure("run"));
        }
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("ctr{:012x}", state.next_id);
        let containers = state.containers.entry(engine_url.to_string()).or_default();
        containers.retain(|c| c.spec.name != spec.name);
        containers.push(MockContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Running,
        });
        Ok(id)
    }

    async fn remove_container(&self, engine_url: &str, container_id: &str) -> Result<()> {
        if self.fail_by_default {
            return Err(mock_failure("remove"));
        }
        let mut state = self.state.lock().await;
        let containers = state.containers.entry(engine_url.to_string()).or_default();
        let before = containers.len();
        containers.retain(|c| c.id != container_id && c.spec.name != container_id);
        if containers.len() == before {
            return Err(ClientError::NotFound(format!("container {}", container_id)));
        }
        Ok(())
    }

    async fn set_container_state(
        &self,
        engine_url: &str,
        container_id: &str,
        target: ContainerState,
    ) -> Result<()> {
        if self.fail_by_default {
            return Err(mock_failure("set state"));
        }
        let mut state = self.state.lock().await;
        let container = state
            .containers
            .get_mut(engine_url)
            .and_then(|containers| containers.iter_mut().find(|c| c.id == container_id))
            .ok_or_else(|| ClientError::NotFound(format!("container {}", container_id)))?;
        container.state = target;
        Ok(())
    }
}

// ============================================================================
// Image builder
// ============================================================================

/// Mock image builder recording requests.
#[derive(Default)]
pub struct MockImageBuilder {
    builds: Arc<Mutex<Vec<BuildRequest>>>,
    /// If true, every build fails.
    pub fail_by_default: bool,
}

impl MockImageBuilder {
    /// Builder that always succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder whose builds all fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::default()
        }
    }

    /// Requests received so far.
    pub async fn builds(&self) -> Vec<BuildRequest> {
        self.builds.lock().await.clone()
    }
}

#[async_trait]
impl ImageBuilder for MockImageBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage> {
        self.builds.lock().await.push(request.clone());
        if self.fail_by_default {
            return Err(ClientError::Build("mock build failure".to_string()));
        }
        Ok(BuiltImage {
            image: request.image_name.clone(),
            logs: format!("built {}\n", request.image_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{PollPolicy, wait_for_guest_ipv4, wait_for_task};
    use std::time::Duration;

    fn node() -> NodeCredentials {
        NodeCredentials::new("pve1.local", 8006, "pve1", "root@pam!digi", "secret")
    }

    #[tokio::test]
    async fn test_mock_hypervisor_provision_flow() {
        let hv = MockHypervisor::new();
        let policy = PollPolicy::new(3, Duration::from_millis(1));

        let task = hv.clone_template(&node(), 9000, 200, "vm-200").await.unwrap();
        wait_for_task(&hv, &node(), &task, policy).await.unwrap();
        let task = hv.start_vm(&node(), 200).await.unwrap();
        wait_for_task(&hv, &node(), &task, policy).await.unwrap();

        let ip = wait_for_guest_ipv4(&hv, &node(), 200, policy).await.unwrap();
        assert_eq!(ip, "10.0.0.21");
        assert_eq!(hv.calls().await, vec!["clone:9000->200", "start:200"]);
    }

    #[tokio::test]
    async fn test_mock_hypervisor_guest_without_ip_times_out() {
        let hv = MockHypervisor::new().with_guest_ip(None);
        hv.insert_vm("pve1", 201, "running").await;

        let err = wait_for_guest_ipv4(&hv, &node(), 201, PollPolicy::new(2, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_mock_proxy_remove_missing_is_not_found() {
        let proxy = MockProxyAdmin::new();
        let err = proxy
            .remove_route("http://10.0.0.21:2019", "ghost")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mock_dns_list_filters_by_name() {
        let dns = MockDnsProvider::new();
        dns.create_record("zone1", &NewDnsRecord::cname("a.digi.app", "digi.app"))
            .await
            .unwrap();
        dns.create_record("zone1", &NewDnsRecord::cname("b.digi.app", "digi.app"))
            .await
            .unwrap();

        let listed = dns.list_records("zone1", Some("b.digi.app")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "b.digi.app");
        assert_eq!(dns.list_records("zone1", None).await.unwrap().len(), 2);
    }
}
