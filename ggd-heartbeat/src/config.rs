//! Group configuration and device credentials
//!
//! Handles:
//! - Typed loading of the externally-owned group config file (JSON)
//! - Device identity and discovery endpoint resolution
//! - Credential file locations and PEM loading

use crate::channel::DropBehavior;
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identity of this device, resolved once from the group config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub thing_name: String,
}

/// Remote service address used for discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host)
    }
}

/// Validated view of the group config for one device
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub identity: DeviceIdentity,
    pub endpoint: Endpoint,
}

// Raw on-disk shape. Every field is optional so that validation can name the
// exact missing key instead of failing with a generic serde message.
#[derive(Debug, Default, Deserialize)]
struct RawGroupConfig {
    #[serde(default)]
    devices: HashMap<String, RawDevice>,
    misc: Option<RawMisc>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDevice {
    thing_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMisc {
    iot_endpoint: Option<String>,
}

impl GroupConfig {
    /// Load and validate the config file for `device_name`
    pub async fn load(path: impl AsRef<Path>, device_name: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let raw: RawGroupConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Self::validate(raw, device_name)
    }

    /// Parse config text directly (no file involved)
    pub fn from_json(content: &str, device_name: &str) -> Result<Self, ConfigError> {
        let raw: RawGroupConfig =
            serde_json::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::validate(raw, device_name)
    }

    fn validate(raw: RawGroupConfig, device_name: &str) -> Result<Self, ConfigError> {
        let device = raw
            .devices
            .get(device_name)
            .ok_or_else(|| ConfigError::MissingField(format!("devices.{device_name}")))?;

        let thing_name = non_empty(device.thing_name.as_deref())
            .ok_or_else(|| ConfigError::MissingField(format!("devices.{device_name}.thing_name")))?;

        let iot_endpoint = raw
            .misc
            .as_ref()
            .and_then(|m| non_empty(m.iot_endpoint.as_deref()))
            .ok_or_else(|| ConfigError::MissingField("misc.iot_endpoint".to_string()))?;

        Ok(GroupConfig {
            identity: DeviceIdentity {
                name: device_name.to_string(),
                thing_name,
            },
            endpoint: Endpoint { host: iot_endpoint },
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Locations of the device's TLS material
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Root CA of the discovery service's server certificate
    pub root_ca: PathBuf,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// PEM contents of the client certificate and key
#[derive(Clone)]
pub struct ClientIdentityPem {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl Credentials {
    /// Read client certificate and private key from disk
    pub async fn load_client_identity(&self) -> std::io::Result<ClientIdentityPem> {
        let certificate = tokio::fs::read(&self.certificate).await?;
        let private_key = tokio::fs::read(&self.private_key).await?;
        Ok(ClientIdentityPem {
            certificate,
            private_key,
        })
    }
}

/// Runtime tunables of the heartbeat agent
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub topic: String,
    pub retry_count: u32,
    pub max_groups: usize,
    /// Upper (exclusive) bound of the random inter-publish delay
    pub max_delay: Duration,
    /// Pause after disconnect so the network teardown can finish
    pub grace_delay: Duration,
    pub offline_queue_capacity: usize,
    /// What the offline queue evicts once it is full
    pub offline_drop_behavior: DropBehavior,
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
    pub keep_alive: Duration,
}

pub const DEFAULT_TOPIC: &str = "/heart/beat";

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            retry_count: 10,
            max_groups: 1,
            max_delay: Duration::from_secs(10),
            grace_delay: Duration::from_secs(2),
            offline_queue_capacity: 10,
            offline_drop_behavior: DropBehavior::Oldest,
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
        }
    }
}
