//! Heartbeat lifecycle: discover, connect, then publish until cancelled
//!
//! `HeartbeatLoop` walks `Init → Discovering → Connecting → Publishing →
//! ShuttingDown → Terminated`. Discovery and connection failures end in
//! `Failed` without ever reaching `Publishing`.

use crate::channel::{Channel, Connector, QoS};
use crate::config::{DeviceIdentity, HeartbeatSettings};
use crate::discovery::{Discoverer, DiscoveryProvider};
use crate::error::HeartbeatError;
use chrono::{Local, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument, Span};

/// Payload schema version (YYYY-MM-DD)
pub const SCHEMA_VERSION: &str = "2017-07-05";
pub const HEARTBEAT_SENSOR_ID: &str = "heartbeat";

/// Heartbeat telemetry record as published on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub version: String,
    pub ggd_id: String,
    pub hostname: String,
    pub data: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub sensor_id: String,
    pub ts: String,
    pub duration: String,
}

impl HeartbeatRecord {
    pub fn new(ggd_id: &str, hostname: &str, now: NaiveDateTime, elapsed: Duration) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            ggd_id: ggd_id.to_string(),
            hostname: hostname.to_string(),
            data: vec![Sample {
                sensor_id: HEARTBEAT_SENSOR_ID.to_string(),
                ts: format_timestamp(now),
                duration: format_elapsed(elapsed),
            }],
        }
    }

    /// Compact JSON, fields in declaration order
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// ISO-8601 local time with microsecond precision
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// `[N day(s), ]H:MM:SS[.ffffff]`
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let micros = elapsed.subsec_micros();
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{} day{}, ", days, if days == 1 { "" } else { "s" });
    }
    let _ = write!(out, "{}:{:02}:{:02}", hours, minutes, seconds);
    if micros > 0 {
        let _ = write!(out, ".{:06}", micros);
    }
    out
}

/// Source of inter-publish delays
pub trait Cadence: Send {
    fn next_delay(&mut self) -> Duration;
}

/// Uniform random delay in `[0, max)`
pub struct RandomCadence {
    max: Duration,
    rng: StdRng,
}

impl RandomCadence {
    pub fn new(max: Duration) -> Self {
        Self {
            max,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(max: Duration, seed: u64) -> Self {
        Self {
            max,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Cadence for RandomCadence {
    fn next_delay(&mut self) -> Duration {
        let bound = u64::try_from(self.max.as_nanos()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.gen_range(0..bound))
    }
}

/// Constant delay
pub struct FixedCadence(pub Duration);

impl Cadence for FixedCadence {
    fn next_delay(&mut self) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Discovering,
    Connecting,
    Publishing,
    ShuttingDown,
    Terminated,
    Failed,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopState::Init => "init",
            LoopState::Discovering => "discovering",
            LoopState::Connecting => "connecting",
            LoopState::Publishing => "publishing",
            LoopState::ShuttingDown => "shutting-down",
            LoopState::Terminated => "terminated",
            LoopState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a completed run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub published: u64,
    pub failed_publishes: u64,
}

/// The orchestrating heartbeat control flow
pub struct HeartbeatLoop<P, C> {
    identity: DeviceIdentity,
    discoverer: Discoverer<P>,
    connector: C,
    settings: HeartbeatSettings,
    cadence: Box<dyn Cadence>,
    hostname: Option<String>,
    start_time: Option<NaiveDateTime>,
    state: LoopState,
    span: Span,
}

impl<P, C> HeartbeatLoop<P, C>
where
    P: DiscoveryProvider,
    C: Connector,
{
    pub fn new(
        identity: DeviceIdentity,
        discoverer: Discoverer<P>,
        connector: C,
        settings: HeartbeatSettings,
    ) -> Self {
        let span = tracing::info_span!("heartbeat", thing_name = %identity.thing_name);
        let cadence = Box::new(RandomCadence::new(settings.max_delay));
        Self {
            identity,
            discoverer,
            connector,
            settings,
            cadence,
            hostname: None,
            start_time: None,
            state: LoopState::Init,
            span,
        }
    }

    pub fn with_cadence(mut self, cadence: impl Cadence + 'static) -> Self {
        self.cadence = Box::new(cadence);
        self
    }

    /// Report this hostname instead of the local one
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Wall-clock time the publishing phase is anchored to
    pub fn with_start_time(mut self, start: NaiveDateTime) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run the whole lifecycle. Returns once `cancel` fires or a phase fails.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, HeartbeatError> {
        let span = self.span.clone();
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&mut self, cancel: CancellationToken) -> Result<RunSummary, HeartbeatError> {
        let thing_name = self.identity.thing_name.clone();

        self.transition(LoopState::Discovering);
        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.discoverer.discover(&self.identity) => Some(result),
        };
        let discovery = match discovered {
            None => return Ok(self.cancelled_early()),
            Some(Ok(discovery)) => discovery,
            Some(Err(e)) => {
                error!(
                    "Discovery failed for {} against service endpoint {}: {}",
                    thing_name,
                    self.discoverer.endpoint(),
                    e
                );
                self.transition(LoopState::Failed);
                return Err(e.into());
            }
        };

        info!(
            "Discovered {} core(s) in {} group(s) with {} group CA(s)",
            discovery.cores().len(),
            discovery.groups().len(),
            discovery.ca_list().len()
        );
        let core = discovery.first_core();
        info!("Discovery succeeded, using first core: {}", core);

        self.transition(LoopState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.connector.connect(&thing_name, discovery.group_ca_path(), core) => Some(result),
        };
        let mut channel = match connected {
            None => return Ok(self.cancelled_early()),
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                error!("Could not connect to {} via MQTT: {}", core, e);
                self.transition(LoopState::Failed);
                return Err(e.into());
            }
        };
        drop(discovery);

        self.transition(LoopState::Publishing);
        let outcome = self.publish_until_cancelled(&mut channel, &cancel).await;

        self.transition(LoopState::ShuttingDown);
        if let Err(e) = channel.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        tokio::time::sleep(self.settings.grace_delay).await;
        drop(channel);
        self.transition(LoopState::Terminated);

        if let Ok(summary) = &outcome {
            info!("Heartbeat stopped after {} message(s)", summary.published);
        }
        outcome
    }

    async fn publish_until_cancelled(
        &mut self,
        channel: &mut C::Channel,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, HeartbeatError> {
        let start = Instant::now();
        let start_wall = self
            .start_time
            .unwrap_or_else(|| Local::now().naive_local());
        let hostname = self.hostname.clone().unwrap_or_else(local_hostname);
        let mut summary = RunSummary::default();

        loop {
            if cancel.is_cancelled() {
                info!("Cancellation received, leaving publish loop");
                break;
            }

            let elapsed = start.elapsed();
            // anchored on the monotonic clock so `ts` never goes backwards
            let now = start_wall + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
            let record = HeartbeatRecord::new(&self.identity.thing_name, &hostname, now, elapsed);
            let payload = record.to_json()?;

            info!("Publishing heartbeat on {}: {}", self.settings.topic, payload);
            match channel
                .publish(&self.settings.topic, payload.into_bytes(), QoS::AtMostOnce)
                .await
            {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    summary.failed_publishes += 1;
                    warn!("Heartbeat publish failed: {}", e);
                }
            }

            let delay = self.cadence.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancellation received while waiting, leaving publish loop");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(summary)
    }

    fn cancelled_early(&mut self) -> RunSummary {
        info!("Cancelled during {}, nothing published", self.state);
        self.transition(LoopState::Terminated);
        RunSummary::default()
    }

    fn transition(&mut self, next: LoopState) {
        info!("State: {} -> {}", self.state, next);
        self.state = next;
    }
}

/// Hostname as reported by the OS
pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}
