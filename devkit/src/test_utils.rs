/*!
Test harness for the heartbeat agent

Sets up a throwaway device environment:
- Group config file with device entries and the discovery endpoint
- Placeholder credential files
- Group CA output directory
- Heartbeat loop wiring with test-friendly settings
*/

use anyhow::Result;
use ggd_heartbeat::channel::Connector;
use ggd_heartbeat::config::{Credentials, Endpoint, GroupConfig, HeartbeatSettings};
use ggd_heartbeat::discovery::{Backoff, Discoverer, DiscoveryProvider};
use ggd_heartbeat::heartbeat::HeartbeatLoop;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_ENDPOINT: &str = "test-ats.iot.us-west-2.amazonaws.com";

/// Throwaway device environment backed by a temp directory
pub struct TestHarness {
    dir: TempDir,
    devices: Vec<(String, String)>,
}

impl TestHarness {
    /// Harness with no devices registered yet
    pub fn new() -> Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init()
            .ok();

        let dir = tempfile::tempdir()?;
        for name in ["root-ca.pem", "device.pem.crt", "device.pem.key"] {
            std::fs::write(dir.path().join(name), "placeholder")?;
        }

        Ok(Self {
            dir,
            devices: Vec::new(),
        })
    }

    /// Register a device and rewrite the config file
    pub fn with_device(mut self, device_name: &str, thing_name: &str) -> Result<Self> {
        self.devices.push((device_name.to_string(), thing_name.to_string()));
        self.write_config(self.config_json())?;
        Ok(self)
    }

    pub fn config_json(&self) -> Value {
        let devices: serde_json::Map<String, Value> = self
            .devices
            .iter()
            .map(|(name, thing)| (name.clone(), json!({ "thing_name": thing })))
            .collect();
        json!({
            "core": { "thing_name": "test-core" },
            "devices": devices,
            "misc": { "iot_endpoint": TEST_ENDPOINT }
        })
    }

    /// Overwrite the config file with arbitrary JSON
    pub fn write_config(&self, config: Value) -> Result<()> {
        std::fs::write(self.config_path(), serde_json::to_vec_pretty(&config)?)?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("group_config.json")
    }

    pub fn group_ca_dir(&self) -> PathBuf {
        self.dir.path().join("group-ca")
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            root_ca: self.dir.path().join("root-ca.pem"),
            certificate: self.dir.path().join("device.pem.crt"),
            private_key: self.dir.path().join("device.pem.key"),
        }
    }

    pub async fn load_config(&self, device_name: &str) -> Result<GroupConfig> {
        Ok(GroupConfig::load(self.config_path(), device_name).await?)
    }

    /// Default settings with a short grace delay
    pub fn settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            grace_delay: Duration::from_millis(10),
            ..HeartbeatSettings::default()
        }
    }

    /// Discoverer with millisecond backoff so retries stay quick on a real clock
    pub fn discoverer<P: DiscoveryProvider>(&self, provider: P, retry_count: u32) -> Discoverer<P> {
        Discoverer::new(
            provider,
            Endpoint {
                host: TEST_ENDPOINT.to_string(),
            },
            self.group_ca_dir(),
        )
        .with_retry_count(retry_count)
        .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(80)))
    }

    /// Heartbeat loop for `device_name` wired to the given doubles
    pub async fn heartbeat_loop<P, C>(
        &self,
        device_name: &str,
        provider: P,
        connector: C,
    ) -> Result<HeartbeatLoop<P, C>>
    where
        P: DiscoveryProvider,
        C: Connector,
    {
        let config = self.load_config(device_name).await?;
        let settings = self.settings();
        let discoverer = self.discoverer(provider, settings.retry_count);
        Ok(HeartbeatLoop::new(config.identity, discoverer, connector, settings))
    }

    /// Group CA files written by discovery so far
    pub fn group_ca_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.group_ca_dir())
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}
