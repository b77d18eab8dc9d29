// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Digi Clients - typed access to the systems a deployment touches.
//!
//! Every external collaborator of the orchestrator is expressed as a trait
//! with an HTTP implementation and an in-memory mock:
//!
//! | Trait | HTTP implementation | Talks to |
//! |-------|---------------------|----------|
//! | [`Hypervisor`] | [`ProxmoxClient`] | hypervisor control plane (per node) |
//! | [`ProxyAdmin`] | [`CaddyAdminClient`] | edge proxy and per-VM proxy admin API |
//! | [`DnsProvider`] | [`CloudflareClient`] | DNS provider zone API |
//! | [`ContainerEngine`] | [`DockerEngineClient`] | container engine on a tenant VM |
//! | [`ImageBuilder`] | [`RailpackBuilder`] | source-to-image build on a tenant VM |
//!
//! Clients hold no per-resource state. Every call is request/response,
//! with the exception of the bounded polling helpers in [`hypervisor`].
//!
//! Delete operations report an absent resource as
//! [`ClientError::NotFound`] so callers that tolerate "already gone" can
//! check [`ClientError::is_not_found`].

#![deny(missing_docs)]

/// Source-to-image builds executed on a tenant VM.
pub mod builder;

/// DNS provider zone API.
pub mod dns;

/// Container engine API on tenant VMs.
pub mod docker;

/// Client error types.
pub mod error;

/// Hypervisor control-plane API and task polling.
pub mod hypervisor;

/// In-memory implementations of every client trait.
pub mod mock;

/// Reverse-proxy admin API.
pub mod proxy;

mod http;

pub use builder::{BuildRequest, BuiltImage, ImageBuilder, RailpackBuilder};
pub use dns::{
    CloudflareClient, DnsConfig, DnsProvider, DnsRecordType, NewDnsRecord, ZoneRecord,
    verification_record_name, verify_domain_ownership,
};
pub use docker::{ContainerEngine, ContainerSpec, ContainerState, DockerConfig, DockerEngineClient};
pub use error::{ClientError, Result};
pub use hypervisor::{
    GuestInterface, Hypervisor, HypervisorConfig, NodeCredentials, PollPolicy, ProxmoxClient,
    TaskHandle, TaskState, VmCurrentStatus, wait_for_guest_ipv4, wait_for_task,
};
pub use proxy::{CaddyAdminClient, ProxyAdmin, ProxyConfig, Route, route_id};
