//! GGD Heartbeat - Greengrass device agent emitting liveness telemetry
//!
//! The agent:
//! - Resolves its thing name and the discovery endpoint from the group config
//! - Discovers the Greengrass core(s) of its group (with bounded retries)
//! - Connects to the first discovered core over TLS MQTT
//! - Publishes a heartbeat record at random intervals until interrupted

pub mod channel;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;

pub use channel::{Channel, Connector, DropBehavior, MqttConnector, OfflineQueue, OutboundMessage};
pub use config::{Credentials, DeviceIdentity, Endpoint, GroupConfig, HeartbeatSettings};
pub use discovery::{
    CoreInfo, Discoverer, DiscoveryDocument, DiscoveryProvider, DiscoveryResult,
    GreengrassDiscoveryClient,
};
pub use error::{AttemptError, ChannelError, ConfigError, ConnectError, DiscoveryError, HeartbeatError};
pub use heartbeat::{HeartbeatLoop, HeartbeatRecord, LoopState, RunSummary};
