//! Greengrass core discovery
//!
//! This module handles:
//! - One-shot discovery requests against the cloud discovery service (mutual TLS)
//! - Bounded retries with progressive backoff
//! - Flattening the discovered groups into an ordered core list
//! - Persisting the group CA for the secure channel

use crate::config::{Credentials, DeviceIdentity, Endpoint};
use crate::error::{AttemptError, DiscoveryError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument, Span};

/// Port the discovery service listens on
pub const DISCOVERY_PORT: u16 = 8443;

/// Raw discovery response document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(rename = "GGGroups", default)]
    pub groups: Vec<GroupInfo>,
}

/// One Greengrass group as returned by discovery
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupInfo {
    #[serde(rename = "GGGroupId")]
    pub group_id: String,
    #[serde(rename = "Cores", default)]
    pub cores: Vec<CoreInfo>,
    #[serde(rename = "CAs", default)]
    pub cas: Vec<String>,
}

/// A candidate gateway core and the addresses it can be reached on
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoreInfo {
    #[serde(rename = "thingArn")]
    pub thing_arn: String,
    /// Owning group, filled in when the document is flattened
    #[serde(skip)]
    pub group_id: String,
    #[serde(rename = "Connectivity", default)]
    pub connectivity: Vec<ConnectivityInfo>,
}

impl std::fmt::Display for CoreInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.thing_arn)?;
        if let Some(first) = self.connectivity.first() {
            write!(f, " ({}:{})", first.host_address, first.port)?;
        }
        Ok(())
    }
}

/// One network address of a core
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectivityInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "HostAddress")]
    pub host_address: String,
    #[serde(rename = "PortNumber")]
    pub port: u16,
    #[serde(rename = "Metadata", default)]
    pub metadata: String,
}

/// Successful discovery. `cores` is never empty.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    groups: Vec<GroupInfo>,
    cores: Vec<CoreInfo>,
    group_ca_path: PathBuf,
    ca_list: Vec<(String, String)>,
}

impl DiscoveryResult {
    pub fn groups(&self) -> &[GroupInfo] {
        &self.groups
    }

    pub fn cores(&self) -> &[CoreInfo] {
        &self.cores
    }

    /// The candidate the channel connects to; no further selection happens
    pub fn first_core(&self) -> &CoreInfo {
        &self.cores[0]
    }

    /// Where the group CA was written
    pub fn group_ca_path(&self) -> &Path {
        &self.group_ca_path
    }

    /// `(group_id, pem)` for every discovered group CA
    pub fn ca_list(&self) -> &[(String, String)] {
        &self.ca_list
    }
}

/// A single discovery attempt against some discovery service
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn fetch(&self, thing_name: &str) -> Result<DiscoveryDocument, AttemptError>;
}

/// HTTPS discovery client authenticating with the device certificate
pub struct GreengrassDiscoveryClient {
    http: reqwest::Client,
    endpoint: Endpoint,
}

impl GreengrassDiscoveryClient {
    pub async fn new(
        endpoint: Endpoint,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, DiscoveryError> {
        let root_ca = tokio::fs::read(&credentials.root_ca).await.map_err(|e| {
            DiscoveryError::Credentials(format!("{}: {e}", credentials.root_ca.display()))
        })?;
        let client = credentials
            .load_client_identity()
            .await
            .map_err(|e| DiscoveryError::Credentials(e.to_string()))?;

        let root_ca = reqwest::Certificate::from_pem(&root_ca)
            .map_err(|e| DiscoveryError::Credentials(format!("root CA: {e}")))?;

        // rustls wants key and certificate chain in one PEM bundle
        let mut bundle = client.private_key;
        bundle.push(b'\n');
        bundle.extend_from_slice(&client.certificate);
        let identity = reqwest::Identity::from_pem(&bundle)
            .map_err(|e| DiscoveryError::Credentials(format!("client identity: {e}")))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root_ca)
            .identity(identity)
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Credentials(e.to_string()))?;

        Ok(Self { http, endpoint })
    }

    fn discovery_url(&self, thing_name: &str) -> String {
        discovery_url(&self.endpoint, thing_name)
    }
}

fn discovery_url(endpoint: &Endpoint, thing_name: &str) -> String {
    format!(
        "https://{}:{}/greengrass/discover/thing/{}",
        endpoint.host, DISCOVERY_PORT, thing_name
    )
}

#[async_trait]
impl DiscoveryProvider for GreengrassDiscoveryClient {
    async fn fetch(&self, thing_name: &str) -> Result<DiscoveryDocument, AttemptError> {
        let url = self.discovery_url(thing_name);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<DiscoveryDocument>()
                .await
                .map_err(|e| AttemptError::Retryable(format!("invalid discovery response: {e}")));
        }

        let message = response.text().await.unwrap_or_default();
        Err(classify(status, message))
    }
}

/// Server errors and throttling are worth retrying; any other failure status is final
fn classify(status: StatusCode, message: String) -> AttemptError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptError::Retryable(format!("HTTP {status}: {message}"))
    } else {
        AttemptError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

/// Progressive backoff between discovery attempts (doubling, capped)
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { max, current: initial }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(32))
    }
}

/// Discovery with bounded retries and group CA persistence
pub struct Discoverer<P> {
    provider: P,
    endpoint: Endpoint,
    group_ca_dir: PathBuf,
    retry_count: u32,
    max_groups: usize,
    backoff: Backoff,
    span: Span,
}

impl<P: DiscoveryProvider> Discoverer<P> {
    pub fn new(provider: P, endpoint: Endpoint, group_ca_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            endpoint,
            group_ca_dir: group_ca_dir.into(),
            retry_count: 10,
            max_groups: 1,
            backoff: Backoff::default(),
            span: tracing::info_span!("discovery"),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups = max_groups;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Log inside the given span instead of the default one
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Resolve the reachable cores for `identity`
    pub async fn discover(&self, identity: &DeviceIdentity) -> Result<DiscoveryResult, DiscoveryError> {
        self.discover_inner(identity)
            .instrument(self.span.clone())
            .await
    }

    async fn discover_inner(&self, identity: &DeviceIdentity) -> Result<DiscoveryResult, DiscoveryError> {
        let thing_name = &identity.thing_name;
        let mut backoff = self.backoff.clone();
        let mut document = None;

        for attempt in 1..=self.retry_count {
            let failure = match self.provider.fetch(thing_name).await {
                Ok(doc) => match self.check_document(&doc) {
                    Ok(()) => {
                        document = Some(doc);
                        break;
                    }
                    Err(reason) => reason,
                },
                Err(AttemptError::Rejected { status, message }) => {
                    warn!("Discovery request for {} rejected (HTTP {})", thing_name, status);
                    return Err(DiscoveryError::InvalidRequest { status, message });
                }
                Err(AttemptError::Retryable(reason)) => reason,
            };

            warn!(
                "Discovery attempt {}/{} for {} failed: {}",
                attempt, self.retry_count, thing_name, failure
            );
            if attempt < self.retry_count {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }

        let Some(document) = document else {
            return Err(DiscoveryError::Exhausted {
                thing_name: thing_name.clone(),
                endpoint: self.endpoint.host.clone(),
                attempts: self.retry_count,
            });
        };

        let result = self.accept(document).await?;
        info!(
            "Discovery found {} core(s) in {} group(s) for {}",
            result.cores.len(),
            result.groups.len(),
            thing_name
        );
        Ok(result)
    }

    /// Reject documents the agent cannot use; such attempts count as failures
    fn check_document(&self, doc: &DiscoveryDocument) -> Result<(), String> {
        if doc.groups.is_empty() {
            return Err("no groups discovered".to_string());
        }
        if doc.groups.len() > self.max_groups {
            return Err(format!(
                "discovered {} groups, expected at most {}",
                doc.groups.len(),
                self.max_groups
            ));
        }
        if doc.groups.iter().all(|g| g.cores.is_empty()) {
            return Err("no cores discovered".to_string());
        }
        if doc.groups.iter().all(|g| g.cas.is_empty()) {
            return Err("no group CA discovered".to_string());
        }
        Ok(())
    }

    async fn accept(&self, document: DiscoveryDocument) -> Result<DiscoveryResult, DiscoveryError> {
        let (cores, ca_list) = flatten(&document.groups);

        // check_document guarantees at least one CA
        let (group_id, pem) = &ca_list[0];
        let group_ca_path = persist_group_ca(&self.group_ca_dir, group_id, pem).await?;
        debug!("Group CA for {} written to {}", group_id, group_ca_path.display());

        Ok(DiscoveryResult {
            groups: document.groups,
            cores,
            group_ca_path,
            ca_list,
        })
    }
}

/// Ordered cores and `(group_id, pem)` CA pairs across all groups
fn flatten(groups: &[GroupInfo]) -> (Vec<CoreInfo>, Vec<(String, String)>) {
    let mut cores = Vec::new();
    let mut cas = Vec::new();
    for group in groups {
        for core in &group.cores {
            let mut core = core.clone();
            core.group_id = group.group_id.clone();
            cores.push(core);
        }
        for ca in &group.cas {
            cas.push((group.group_id.clone(), ca.clone()));
        }
    }
    (cores, cas)
}

/// Write a group CA under `dir` as `{group_id}_CA_{uuid}.crt`
pub async fn persist_group_ca(dir: &Path, group_id: &str, pem: &str) -> Result<PathBuf, DiscoveryError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| DiscoveryError::GroupCa {
            path: dir.to_path_buf(),
            source,
        })?;

    let path = dir.join(format!("{}_CA_{}.crt", group_id, uuid::Uuid::new_v4()));
    tokio::fs::write(&path, pem)
        .await
        .map_err(|source| DiscoveryError::GroupCa {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}
