//! Command line interface

use crate::config::{Credentials, HeartbeatSettings, DEFAULT_TOPIC};
use clap::Parser;
use std::path::PathBuf;

/// Greengrass device that generates heartbeat messages
#[derive(Debug, Parser)]
#[command(name = "ggd-heartbeat", version, about)]
pub struct Cli {
    /// The heartbeat's GGD device name
    pub device_name: String,

    /// The group config file
    pub config_file: PathBuf,

    /// Root CA file path of the discovery server certificate
    pub root_ca: PathBuf,

    /// File path of the GGD certificate
    pub certificate: PathBuf,

    /// File path of the GGD private key
    pub private_key: PathBuf,

    /// Directory where the discovered group CA will be saved
    pub group_ca_dir: PathBuf,

    /// Topic used to communicate heartbeat telemetry
    #[arg(long, default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Frequency in seconds to send heartbeat messages (currently ignored:
    /// the cadence is a random delay below ten seconds)
    #[arg(long)]
    pub frequency: Option<u64>,

    /// Discovery attempts before giving up
    #[arg(long, default_value_t = 10)]
    pub retry_count: u32,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            root_ca: self.root_ca.clone(),
            certificate: self.certificate.clone(),
            private_key: self.private_key.clone(),
        }
    }

    pub fn settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            topic: self.topic.clone(),
            retry_count: self.retry_count,
            ..HeartbeatSettings::default()
        }
    }
}
