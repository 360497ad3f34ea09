/*!
Mock MQTT channel and connector

Stand in for the TLS MQTT connector so the heartbeat loop can be driven
without a Greengrass core. Everything the loop does to the channel is
recorded for assertions.
*/

use anyhow::Result;
use async_trait::async_trait;
use ggd_heartbeat::channel::{Channel, Connector};
use ggd_heartbeat::discovery::CoreInfo;
use ggd_heartbeat::error::{ChannelError, ConnectError};
use ggd_heartbeat::heartbeat::HeartbeatRecord;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Ordered record of channel calls
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Publish(MockMessage),
    Disconnect,
}

#[derive(Default)]
struct ChannelState {
    events: Vec<ChannelEvent>,
    fail_publishes: bool,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Mock channel that records publishes and disconnects
#[derive(Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `token` once `count` messages have been published
    pub fn cancel_after(&self, count: usize, token: CancellationToken) {
        self.state.lock().cancel_after = Some((count, token));
    }

    /// Make every publish fail with a client error
    pub fn fail_publishes(&self) {
        self.state.lock().fail_publishes = true;
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.state.lock().events.clone()
    }

    pub fn published_messages(&self) -> Vec<MockMessage> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                ChannelEvent::Publish(message) => Some(message.clone()),
                ChannelEvent::Disconnect => None,
            })
            .collect()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages()
            .into_iter()
            .filter(|msg| msg.topic == topic)
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| matches!(event, ChannelEvent::Disconnect))
            .count()
    }

    /// Parse every published payload as a heartbeat record
    pub fn records(&self) -> Result<Vec<HeartbeatRecord>> {
        self.published_messages()
            .iter()
            .map(|msg| serde_json::from_slice(&msg.payload).map_err(anyhow::Error::from))
            .collect()
    }

    /// Raw payload text of the published messages
    pub fn payloads(&self) -> Vec<String> {
        self.published_messages()
            .iter()
            .map(|msg| String::from_utf8_lossy(&msg.payload).to_string())
            .collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.fail_publishes {
            return Err(ChannelError::Client("mock publish failure".to_string()));
        }

        state.events.push(ChannelEvent::Publish(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
        }));
        tracing::info!("[MOCK] Published to {}", topic);

        let published = state
            .events
            .iter()
            .filter(|event| matches!(event, ChannelEvent::Publish(_)))
            .count();
        if let Some((count, token)) = &state.cancel_after {
            if published >= *count {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        self.state.lock().events.push(ChannelEvent::Disconnect);
        tracing::info!("[MOCK] Disconnected");
        Ok(())
    }
}

/// One recorded `connect` call
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub client_id: String,
    pub group_ca: PathBuf,
    pub core: CoreInfo,
}

#[derive(Default)]
struct ConnectorState {
    attempts: Vec<ConnectAttempt>,
    refuse: bool,
}

/// Mock connector handing out a shared `MockChannel`
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    channel: MockChannel,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose every connect attempt is refused
    pub fn refusing() -> Self {
        let connector = Self::default();
        connector.state.lock().refuse = true;
        connector
    }

    pub fn channel(&self) -> MockChannel {
        self.channel.clone()
    }

    pub fn attempts(&self) -> Vec<ConnectAttempt> {
        self.state.lock().attempts.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().attempts.len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Channel = MockChannel;

    async fn connect(
        &self,
        client_id: &str,
        group_ca: &Path,
        core: &CoreInfo,
    ) -> Result<MockChannel, ConnectError> {
        let refuse = {
            let mut state = self.state.lock();
            state.attempts.push(ConnectAttempt {
                client_id: client_id.to_string(),
                group_ca: group_ca.to_path_buf(),
                core: core.clone(),
            });
            state.refuse
        };

        if refuse {
            tracing::info!("[MOCK] Refusing connection to {}", core);
            return Err(ConnectError::Unreachable {
                core: core.to_string(),
                attempts: core.connectivity.len(),
            });
        }

        tracing::info!("[MOCK] Connected to {}", core);
        Ok(self.channel.clone())
    }
}
