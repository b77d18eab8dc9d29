// Copyright (C) 2025 The digi authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS provider zone API client.
//!
//! Every response is wrapped in an envelope carrying a `success` flag and
//! an `errors` array; a 2xx status with `success: false` is still a
//! failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{ClientError, Result};
use crate::http::{build_client, trim_base};

/// Provider error code for "record does not exist".
const RECORD_NOT_FOUND_CODE: i64 = 81044;

/// DNS record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    /// IPv4 address record.
    A,
    /// Alias record.
    Cname,
    /// Text record.
    Txt,
}

impl DnsRecordType {
    /// Wire name of the record type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsRecordType::A => "A",
            DnsRecordType::Cname => "CNAME",
            DnsRecordType::Txt => "TXT",
        }
    }
}

/// A record to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewDnsRecord {
    /// Record type.
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    /// Fully qualified record name.
    pub name: String,
    /// Record content (address, target or text).
    pub content: String,
    /// Whether traffic is proxied through the provider.
    pub proxied: bool,
}

impl NewDnsRecord {
    /// Proxied CNAME `name -> target`.
    pub fn cname(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            record_type: DnsRecordType::Cname,
            name: name.into(),
            content: target.into(),
            proxied: true,
        }
    }
}

/// A record as stored by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    /// Provider-assigned record id.
    pub id: String,
    /// Record type, as the provider reports it.
    #[serde(rename = "type")]
    pub record_type: String,
    /// Fully qualified record name.
    pub name: String,
    /// Record content.
    pub content: String,
    /// Whether traffic is proxied.
    #[serde(default)]
    pub proxied: bool,
}

/// Zone-scoped DNS record operations.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a record in `zone_id`.
    async fn create_record(&self, zone_id: &str, record: &NewDnsRecord) -> Result<ZoneRecord>;

    /// Delete a record by provider id. Absent records yield
    /// [`ClientError::NotFound`].
    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()>;

    /// List records in `zone_id`, optionally filtered by exact name.
    async fn list_records(&self, zone_id: &str, name: Option<&str>) -> Result<Vec<ZoneRecord>>;
}

/// Name of the TXT record proving ownership of `domain`.
pub fn verification_record_name(platform: &str, domain: &str) -> String {
    format!("_{}-verify.{}", platform, domain)
}

/// Check that `_<platform>-verify.<domain>` holds `token` as a TXT record.
pub async fn verify_domain_ownership(
    provider: &dyn DnsProvider,
    zone_id: &str,
    platform: &str,
    domain: &str,
    token: &str,
) -> Result<bool> {
    let name = verification_record_name(platform, domain);
    let records = provider.list_records(zone_id, Some(&name)).await?;
    Ok(records.iter().any(|record| {
        record.record_type.eq_ignore_ascii_case("TXT") && record.content.trim_matches('"') == token
    }))
}

/// Configuration for [`CloudflareClient`].
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// API base URL.
    pub api_url: String,
    /// Bearer token.
    pub api_token: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.cloudflare.com/client/v4".to_string(),
            api_token: String::new(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl DnsConfig {
    /// Set the API base URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Set the bearer token.
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = token.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// HTTP client for the DNS provider API.
pub struct CloudflareClient {
    http: reqwest::Client,
    config: DnsConfig,
}

impl CloudflareClient {
    /// Create a client with the given configuration.
    pub fn new(config: DnsConfig) -> Result<Self> {
        if config.api_token.is_empty() {
            return Err(ClientError::InvalidInput(
                "DNS API token not configured".to_string(),
            ));
        }
        let http = build_client(config.request_timeout, false)?;
        Ok(Self { http, config })
    }

    fn records_url(&self, zone_id: &str) -> String {
        format!(
            "{}/zones/{}/dns_records",
            trim_base(&self.config.api_url),
            zone_id
        )
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if status == StatusCode::NOT_FOUND => {
                return Err(ClientError::NotFound(what.to_string()));
            }
            Err(_) if !status.is_success() => {
                return Err(ClientError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            Err(e) => return Err(ClientError::UnexpectedResponse(format!("{}: {}", what, e))),
        };

        if envelope.success && status.is_success() {
            return envelope
                .result
                .ok_or_else(|| ClientError::UnexpectedResponse(format!("{}: missing result", what)));
        }

        let message = envelope
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");

        if status == StatusCode::NOT_FOUND
            || envelope.errors.iter().any(|e| e.code == RECORD_NOT_FOUND_CODE)
        {
            return Err(ClientError::NotFound(format!("{}: {}", what, message)));
        }
        if status.is_success() {
            return Err(ClientError::Rejected(message));
        }
        Err(ClientError::Api {
            status: status.as_u16(),
            body: message,
        })
    }
}

#[async_trait]
impl DnsProvider for CloudflareClient {
    #[instrument(skip(self, record), fields(name = %record.name, record_type = record.record_type.as_str()))]
    async fn create_record(&self, zone_id: &str, record: &NewDnsRecord) -> Result<ZoneRecord> {
        let response = self
            .http
            .post(self.records_url(zone_id))
            .bearer_auth(&self.config.api_token)
            .json(record)
            .send()
            .await?;
        Self::decode(response, "create dns record").await
    }

    #[instrument(skip(self))]
    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/{}", self.records_url(zone_id), record_id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await?;
        let _: IgnoredAny = Self::decode(response, "delete dns record").await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_records(&self, zone_id: &str, name: Option<&str>) -> Result<Vec<ZoneRecord>> {
        let mut request = self
            .http
            .get(self.records_url(zone_id))
            .bearer_auth(&self.config.api_token);
        if let Some(name) = name {
            request = request.query(&[("name", name)]);
        }
        let response = request.send().await?;
        Self::decode(response, "list dns records").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_record_name() {
        assert_eq!(
            verification_record_name("digi", "shop.example.com"),
            "_digi-verify.shop.example.com"
        );
    }

    #[test]
    fn test_new_record_serializes_type_uppercase() {
        let record = NewDnsRecord::cname("api.digi.app", "digi.app");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "CNAME");
        assert_eq!(value["proxied"], true);
        assert_eq!(value["content"], "digi.app");
    }

    #[test]
    fn test_client_requires_token() {
        let err = CloudflareClient::new(DnsConfig::default()).err().unwrap();
        assert!(matches!(err, ClientError::InvalidInput(_)));
    }
}
