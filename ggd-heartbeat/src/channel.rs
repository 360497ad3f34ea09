//! Secure MQTT channel to a discovered core
//!
//! The channel:
//! - Tries each connectivity entry of the chosen core in order (TLS, client cert auth)
//! - Publishes at QoS 0 without waiting for acknowledgement
//! - Buffers publishes made while the link is down in a bounded offline queue
//! - Drives the MQTT event loop in a background task (reconnects, queue flush)

use crate::config::{ClientIdentityPem, Credentials, HeartbeatSettings};
use crate::discovery::{ConnectivityInfo, CoreInfo};
use crate::error::{ChannelError, ConnectError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, Outgoing, Request, TlsConfiguration,
    Transport,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

pub use rumqttc::QoS;

/// What to evict when the offline queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropBehavior {
    Oldest,
    Newest,
}

/// A publish waiting for the link to come back
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Bounded FIFO of publishes made while offline
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<OutboundMessage>,
    capacity: usize,
    behavior: DropBehavior,
    dropped: u64,
}

impl OfflineQueue {
    /// A capacity of zero disables queuing entirely
    pub fn new(capacity: usize, behavior: DropBehavior) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            behavior,
            dropped: 0,
        }
    }

    /// Enqueue a message, returning whichever message had to be evicted
    pub fn push(&mut self, message: OutboundMessage) -> Option<OutboundMessage> {
        if self.capacity == 0 {
            self.dropped += 1;
            return Some(message);
        }

        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            match self.behavior {
                DropBehavior::Oldest => self.items.pop_front(),
                DropBehavior::Newest => return Some(message),
            }
        } else {
            None
        };

        self.items.push_back(message);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.items.pop_front()
    }

    /// Put a message the client refused back at the head of the queue
    fn restore_front(&mut self, message: OutboundMessage) {
        self.items.push_front(message);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of messages discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// An established session able to publish telemetry
#[async_trait]
pub trait Channel: Send {
    /// Fire-and-forget publish; a queued message counts as published
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ChannelError>;

    /// Request session teardown
    async fn disconnect(&mut self) -> Result<(), ChannelError>;
}

/// Opens channels to discovered cores
#[async_trait]
pub trait Connector: Send + Sync {
    type Channel: Channel;

    async fn connect(
        &self,
        client_id: &str,
        group_ca: &Path,
        core: &CoreInfo,
    ) -> Result<Self::Channel, ConnectError>;
}

/// TLS MQTT connector authenticating with the device certificate
pub struct MqttConnector {
    credentials: Credentials,
    keep_alive: Duration,
    connect_timeout: Duration,
    queue_capacity: usize,
    drop_behavior: DropBehavior,
    span: Span,
}

impl MqttConnector {
    pub fn new(credentials: Credentials, settings: &HeartbeatSettings) -> Self {
        Self {
            credentials,
            keep_alive: settings.keep_alive,
            connect_timeout: settings.connect_timeout,
            queue_capacity: settings.offline_queue_capacity,
            drop_behavior: settings.offline_drop_behavior,
            span: tracing::info_span!("channel"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn options(
        &self,
        client_id: &str,
        target: &ConnectivityInfo,
        group_ca: &[u8],
        identity: &ClientIdentityPem,
    ) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &target.host_address, target.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: group_ca.to_vec(),
            alpn: None,
            client_auth: Some((identity.certificate.clone(), identity.private_key.clone())),
        }));
        options
    }

    /// Run the CONNECT/CONNACK exchange against one address
    async fn handshake(
        &self,
        client_id: &str,
        target: &ConnectivityInfo,
        group_ca: &[u8],
        identity: &ClientIdentityPem,
    ) -> Result<(AsyncClient, EventLoop), String> {
        let options = self.options(client_id, target, group_ca, identity);
        let (client, mut eventloop) = AsyncClient::new(options, self.queue_capacity.max(1));

        let connack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        debug!("CONNACK: {:?}", ack.code);
                        return Ok(());
                    }
                    Ok(event) => debug!("MQTT event during connect: {:?}", event),
                    Err(e) => return Err(e.to_string()),
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, connack).await {
            Ok(Ok(())) => Ok((client, eventloop)),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(format!("no CONNACK within {:?}", self.connect_timeout)),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Channel = MqttChannel;

    async fn connect(
        &self,
        client_id: &str,
        group_ca: &Path,
        core: &CoreInfo,
    ) -> Result<MqttChannel, ConnectError> {
        let span = self.span.clone();
        async {
            let ca = tokio::fs::read(group_ca)
                .await
                .map_err(|e| ConnectError::Credentials(format!("{}: {e}", group_ca.display())))?;
            let identity = self
                .credentials
                .load_client_identity()
                .await
                .map_err(|e| ConnectError::Credentials(e.to_string()))?;

            for target in &core.connectivity {
                info!(
                    "Connecting to core {} at {}:{} (id {})",
                    core.thing_arn, target.host_address, target.port, target.id
                );
                match self.handshake(client_id, target, &ca, &identity).await {
                    Ok((client, eventloop)) => {
                        info!("Connected to {}:{}", target.host_address, target.port);
                        return Ok(MqttChannel::start(
                            client,
                            eventloop,
                            OfflineQueue::new(self.queue_capacity, self.drop_behavior),
                            Span::current(),
                        ));
                    }
                    Err(reason) => warn!(
                        "Connection to {}:{} failed: {}",
                        target.host_address, target.port, reason
                    ),
                }
            }

            Err(ConnectError::Unreachable {
                core: core.to_string(),
                attempts: core.connectivity.len(),
            })
        }
        .instrument(span)
        .await
    }
}

/// Live MQTT session backed by a background event loop task
pub struct MqttChannel {
    client: AsyncClient,
    link_up: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    queue: Arc<Mutex<OfflineQueue>>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttChannel {
    fn start(client: AsyncClient, eventloop: EventLoop, queue: OfflineQueue, span: Span) -> Self {
        let link_up = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(Mutex::new(queue));

        let task = tokio::spawn(
            drive_event_loop(
                eventloop,
                client.clone(),
                link_up.clone(),
                closing.clone(),
                queue.clone(),
            )
            .instrument(span),
        );

        Self {
            client,
            link_up,
            closing,
            queue,
            event_loop: Some(task),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ChannelError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }

        let mut message = OutboundMessage {
            topic: topic.to_string(),
            payload,
            qos,
        };

        if self.is_connected() {
            // keep FIFO order: anything buffered goes out first
            flush_offline(&self.client, &self.queue);
            if self.queue.lock().is_empty() {
                match try_send(&self.client, message) {
                    None => return Ok(()),
                    Some(refused) => {
                        debug!("MQTT request queue busy, buffering");
                        message = refused;
                    }
                }
            }
        }

        let mut queue = self.queue.lock();
        if let Some(dropped) = queue.push(message) {
            warn!(
                "Offline queue full, dropped a message for {} ({} dropped so far)",
                dropped.topic,
                queue.dropped()
            );
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pending = self.queue.lock().len();
        if pending > 0 {
            warn!("Disconnecting with {} queued message(s) undelivered", pending);
        }
        self.client
            .disconnect()
            .await
            .map_err(|e| ChannelError::Client(e.to_string()))
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.take() {
            task.abort();
        }
    }
}

/// Hand a message to the client without blocking.
///
/// The client gives a refused publish back inside its error, so the payload
/// is moved rather than copied on the happy path.
fn try_send(client: &AsyncClient, message: OutboundMessage) -> Option<OutboundMessage> {
    let OutboundMessage { topic, payload, qos } = message;
    match client.try_publish(topic, qos, false, payload) {
        Ok(()) => None,
        Err(ClientError::Request(request) | ClientError::TryRequest(request)) => match request {
            Request::Publish(publish) => Some(OutboundMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
                qos,
            }),
            other => {
                warn!("MQTT client refused unexpected request: {:?}", other);
                None
            }
        },
    }
}

/// Hand buffered messages to the client until it pushes back
fn flush_offline(client: &AsyncClient, queue: &Mutex<OfflineQueue>) {
    let mut queue = queue.lock();
    while let Some(message) = queue.pop_front() {
        if let Some(refused) = try_send(client, message) {
            queue.restore_front(refused);
            break;
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    link_up: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    queue: Arc<Mutex<OfflineQueue>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                link_up.store(true, Ordering::Release);
                let pending = queue.lock().len();
                info!("MQTT link re-established, flushing {} queued message(s)", pending);
                flush_offline(&client, &queue);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                link_up.store(false, Ordering::Release);
                break;
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                link_up.store(false, Ordering::Release);
                if closing.load(Ordering::Acquire) {
                    break;
                }
                error!("MQTT connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    fn message(n: u8) -> OutboundMessage {
        OutboundMessage {
            topic: "/heart/beat".to_string(),
            payload: vec![n],
            qos: QoS::AtMostOnce,
        }
    }

    #[test]
    fn test_drop_oldest_keeps_latest_ten() {
        let mut queue = OfflineQueue::new(10, DropBehavior::Oldest);
        let mut evicted = Vec::new();
        for n in 0..13 {
            if let Some(old) = queue.push(message(n)) {
                evicted.push(old.payload[0]);
            }
        }

        assert_eq!(queue.len(), 10);
        assert_eq!(evicted, vec![0, 1, 2]);
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.pop_front().unwrap().payload, vec![3]);
    }

    #[test]
    fn test_drop_newest_rejects_incoming() {
        let mut queue = OfflineQueue::new(2, DropBehavior::Newest);
        assert!(queue.push(message(0)).is_none());
        assert!(queue.push(message(1)).is_none());
        let rejected = queue.push(message(2)).unwrap();

        assert_eq!(rejected.payload, vec![2]);
        assert_eq!(queue.pop_front().unwrap().payload, vec![0]);
        assert_eq!(queue.pop_front().unwrap().payload, vec![1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_disables_queue() {
        let mut queue = OfflineQueue::new(0, DropBehavior::Oldest);
        assert!(queue.push(message(7)).is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 1);
    }

    fn credentials(dir: &Path) -> Credentials {
        std::fs::write(dir.join("cert.pem"), "not a cert").unwrap();
        std::fs::write(dir.join("key.pem"), "not a key").unwrap();
        Credentials {
            root_ca: dir.join("root.pem"),
            certificate: dir.join("cert.pem"),
            private_key: dir.join("key.pem"),
        }
    }

    fn core(connectivity: Vec<ConnectivityInfo>) -> CoreInfo {
        CoreInfo {
            thing_arn: "arn:core-a".to_string(),
            group_id: "group-1".to_string(),
            connectivity,
        }
    }

    #[tokio::test]
    async fn test_missing_group_ca_is_credentials_error() {
        let dir = tempfile::tempdir().unwrap();
        let connector = MqttConnector::new(credentials(dir.path()), &HeartbeatSettings::default());

        let err = connector
            .connect("greengrass-hb1", &dir.path().join("missing.crt"), &core(vec![]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Credentials(_)));
    }

    #[tokio::test]
    async fn test_core_without_addresses_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("group.crt"), "ca").unwrap();
        let connector = MqttConnector::new(credentials(dir.path()), &HeartbeatSettings::default());

        let err = connector
            .connect("greengrass-hb1", &dir.path().join("group.crt"), &core(vec![]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Unreachable { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_addresses_are_all_tried() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("group.crt"), "ca").unwrap();
        let settings = HeartbeatSettings {
            connect_timeout: Duration::from_secs(2),
            ..HeartbeatSettings::default()
        };
        let connector = MqttConnector::new(credentials(dir.path()), &settings);

        // grab a free port, then close it so connects are refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let target = |id: &str| ConnectivityInfo {
            id: id.to_string(),
            host_address: "127.0.0.1".to_string(),
            port,
            metadata: String::new(),
        };

        let err = connector
            .connect("greengrass-hb1", &dir.path().join("group.crt"), &core(vec![target("a"), target("b")]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::Unreachable { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_refused_publish_hands_message_back() {
        let options = MqttOptions::new("greengrass-hb1", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(options, 1);

        assert!(try_send(&client, message(1)).is_none());
        let refused = try_send(&client, message(2)).unwrap();
        assert_eq!(refused, message(2));
    }

    /// Read one MQTT packet: fixed header byte and body
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accept a client, read its CONNECT and acknowledge it
    async fn accept_session(listener: &TcpListener) -> std::io::Result<TcpStream> {
        let (mut stream, _) = listener.accept().await?;
        let (header, _) = read_packet(&mut stream).await?;
        assert_eq!(header >> 4, 1, "expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await?;
        Ok(stream)
    }

    #[tokio::test]
    async fn test_offline_publishes_flush_in_order_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (drop_link, link_dropped) = oneshot::channel::<()>();
        let (resume, resumed) = oneshot::channel::<()>();

        let broker = tokio::spawn(async move {
            let first = accept_session(&listener).await.unwrap();
            link_dropped.await.unwrap();
            drop(first);

            resumed.await.unwrap();
            let mut second = accept_session(&listener).await.unwrap();
            let mut delivered = Vec::new();
            while delivered.len() < 10 {
                let (header, body) = read_packet(&mut second).await.unwrap();
                if header >> 4 == 3 {
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    delivered.push(String::from_utf8(body[2 + topic_len..].to_vec()).unwrap());
                }
            }
            delivered
        });

        let options = MqttOptions::new("greengrass-hb1", "127.0.0.1", port);
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        loop {
            if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await.unwrap() {
                break;
            }
        }

        let mut channel = MqttChannel::start(
            client,
            eventloop,
            OfflineQueue::new(10, DropBehavior::Oldest),
            Span::current(),
        );
        assert!(channel.is_connected());

        drop_link.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        for n in 0..12 {
            channel
                .publish("/heart/beat", format!("msg-{n:02}").into_bytes(), QoS::AtMostOnce)
                .await
                .unwrap();
        }
        assert_eq!(channel.queued(), 10);
        assert_eq!(channel.queue.lock().dropped(), 2);

        resume.send(()).unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(10), broker)
            .await
            .unwrap()
            .unwrap();

        let expected: Vec<String> = (2..12).map(|n| format!("msg-{n:02}")).collect();
        assert_eq!(delivered, expected);
        assert!(channel.is_connected());
        assert_eq!(channel.queued(), 0);
    }
}
