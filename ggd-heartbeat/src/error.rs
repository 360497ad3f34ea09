//! Error taxonomy for the heartbeat agent
//!
//! Discovery and connection failures are terminal for a run. Operator
//! cancellation is not an error and never shows up here.

use std::path::PathBuf;
use thiserror::Error;

/// Group config loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("config is missing required field `{0}`")]
    MissingField(String),
}

/// Gateway discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery failed for {thing_name} at {endpoint} after {attempts} attempts")]
    Exhausted {
        thing_name: String,
        endpoint: String,
        attempts: u32,
    },

    #[error("discovery request rejected with HTTP {status}: {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("failed to load discovery credentials: {0}")]
    Credentials(String),

    #[error("failed to persist group CA to {path}: {source}")]
    GroupCa {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a single discovery attempt, classified for the retry loop
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
    /// Worth another attempt after backing off
    #[error("{0}")]
    Retryable(String),

    /// The service rejected the request itself; retrying will not help
    #[error("HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Secure channel establishment errors
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to load channel credentials: {0}")]
    Credentials(String),

    #[error("could not connect to core {core} ({attempts} endpoints tried)")]
    Unreachable { core: String, attempts: usize },
}

/// Errors surfaced by an established channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("mqtt client error: {0}")]
    Client(String),
}

/// Terminal failure of a heartbeat run
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Connection(#[from] ConnectError),

    #[error("failed to serialize heartbeat record: {0}")]
    Serialize(#[from] serde_json::Error),
}
