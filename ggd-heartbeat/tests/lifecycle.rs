//! End-to-end lifecycle tests: discovery, connection, publishing, shutdown

use chrono::{NaiveDate, NaiveDateTime};
use ggd_devkit::discovery_stub::{core, document, group, TEST_GROUP_CA};
use ggd_devkit::{ChannelEvent, MockConnector, ScriptedProvider, Step, TestHarness};
use ggd_heartbeat::discovery::DiscoveryDocument;
use ggd_heartbeat::error::{ConfigError, DiscoveryError, HeartbeatError};
use ggd_heartbeat::heartbeat::{FixedCadence, RandomCadence, HEARTBEAT_SENSOR_ID};
use ggd_heartbeat::LoopState;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn new_year() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn two_cores() -> DiscoveryDocument {
    document(
        "group-1",
        vec![
            core("arn:core-a", &[("10.0.0.1", 8883)]),
            core("arn:core-b", &[("10.0.0.2", 8883)]),
        ],
    )
}

fn harness() -> TestHarness {
    TestHarness::new()
        .unwrap()
        .with_device("hb1", "greengrass-hb1")
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_publishes_heartbeat_to_first_core() {
    let harness = harness();
    let connector = MockConnector::new();
    let channel = connector.channel();
    let cancel = CancellationToken::new();
    channel.cancel_after(2, cancel.clone());

    let mut heartbeat = harness
        .heartbeat_loop("hb1", ScriptedProvider::always(two_cores()), connector.clone())
        .await
        .unwrap()
        .with_cadence(FixedCadence(Duration::from_secs(3)))
        .with_hostname("edge-01")
        .with_start_time(new_year());

    let summary = heartbeat.run(cancel).await.unwrap();
    assert_eq!(summary.published, 2);
    assert_eq!(heartbeat.state(), LoopState::Terminated);

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].client_id, "greengrass-hb1");
    assert_eq!(attempts[0].core.thing_arn, "arn:core-a");
    assert_eq!(std::fs::read_to_string(&attempts[0].group_ca).unwrap(), TEST_GROUP_CA);

    let payloads = channel.payloads();
    assert_eq!(
        payloads[0],
        r#"{"version":"2017-07-05","ggd_id":"greengrass-hb1","hostname":"edge-01","data":[{"sensor_id":"heartbeat","ts":"2024-01-01T00:00:00.000000","duration":"0:00:00"}]}"#
    );
    assert_eq!(
        payloads[1],
        r#"{"version":"2017-07-05","ggd_id":"greengrass-hb1","hostname":"edge-01","data":[{"sensor_id":"heartbeat","ts":"2024-01-01T00:00:03.000000","duration":"0:00:03"}]}"#
    );
    assert!(channel
        .published_messages()
        .iter()
        .all(|m| m.topic == "/heart/beat" && m.qos == rumqttc::QoS::AtMostOnce));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_discovery_never_connects() {
    let harness = harness();
    let provider = ScriptedProvider::never();
    let connector = MockConnector::new();

    let mut heartbeat = harness
        .heartbeat_loop("hb1", provider.clone(), connector.clone())
        .await
        .unwrap();

    let err = heartbeat.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        HeartbeatError::Discovery(DiscoveryError::Exhausted { attempts: 10, ref thing_name, .. })
            if thing_name == "greengrass-hb1"
    ));
    assert_eq!(provider.attempts(), 10);
    assert_eq!(connector.connect_count(), 0);
    assert!(connector.channel().events().is_empty());
    assert!(harness.group_ca_files().is_empty());
    assert_eq!(heartbeat.state(), LoopState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_discovery_stops_retrying() {
    let harness = harness();
    let provider = ScriptedProvider::new(vec![Step::Reject(403)], Step::Found(two_cores()));
    let connector = MockConnector::new();

    let mut heartbeat = harness
        .heartbeat_loop("hb1", provider.clone(), connector.clone())
        .await
        .unwrap();

    let err = heartbeat.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        HeartbeatError::Discovery(DiscoveryError::InvalidRequest { status: 403, .. })
    ));
    assert_eq!(provider.attempts(), 1);
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_recovers_after_transient_failures() {
    let harness = harness();
    let provider = ScriptedProvider::new(
        vec![Step::Fail("timeout".into()), Step::Fail("timeout".into())],
        Step::Found(two_cores()),
    );
    let connector = MockConnector::new();
    let cancel = CancellationToken::new();
    connector.channel().cancel_after(1, cancel.clone());

    let mut heartbeat = harness
        .heartbeat_loop("hb1", provider.clone(), connector.clone())
        .await
        .unwrap();

    heartbeat.run(cancel).await.unwrap();
    assert_eq!(provider.attempts(), 3);
    assert_eq!(connector.connect_count(), 1);
    assert_eq!(harness.group_ca_files().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_too_many_groups_counts_as_failed_attempt() {
    let harness = harness();
    let crowded = DiscoveryDocument {
        groups: vec![
            group("group-1", vec![core("arn:core-a", &[("10.0.0.1", 8883)])]),
            group("group-2", vec![core("arn:core-x", &[("10.0.1.1", 8883)])]),
        ],
    };
    let provider = ScriptedProvider::new(vec![Step::Found(crowded)], Step::Found(two_cores()));
    let connector = MockConnector::new();
    let cancel = CancellationToken::new();
    connector.channel().cancel_after(1, cancel.clone());

    let mut heartbeat = harness
        .heartbeat_loop("hb1", provider.clone(), connector.clone())
        .await
        .unwrap();

    heartbeat.run(cancel).await.unwrap();
    assert_eq!(provider.attempts(), 2);
    assert_eq!(connector.attempts()[0].core.thing_arn, "arn:core-a");
}

#[tokio::test(start_paused = true)]
async fn test_always_targets_first_core() {
    for count in 1..=5 {
        let harness = harness();
        let cores = (0..count)
            .map(|i| core(&format!("arn:core-{i}"), &[("10.0.0.1", 8883)]))
            .collect();
        let connector = MockConnector::new();
        let cancel = CancellationToken::new();
        connector.channel().cancel_after(1, cancel.clone());

        let mut heartbeat = harness
            .heartbeat_loop("hb1", ScriptedProvider::always(document("group-1", cores)), connector.clone())
            .await
            .unwrap();
        heartbeat.run(cancel).await.unwrap();

        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].core.thing_arn, "arn:core-0");
        assert_eq!(attempts[0].core.group_id, "group-1");
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_failure_publishes_nothing() {
    let harness = harness();
    let connector = MockConnector::refusing();

    let mut heartbeat = harness
        .heartbeat_loop("hb1", ScriptedProvider::always(two_cores()), connector.clone())
        .await
        .unwrap();

    let err = heartbeat.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HeartbeatError::Connection(_)));
    assert_eq!(connector.connect_count(), 1);
    assert!(connector.channel().events().is_empty());
    assert_eq!(heartbeat.state(), LoopState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_timestamps_never_decrease() {
    let harness = harness();
    let connector = MockConnector::new();
    let channel = connector.channel();
    let cancel = CancellationToken::new();
    channel.cancel_after(25, cancel.clone());

    let mut heartbeat = harness
        .heartbeat_loop("hb1", ScriptedProvider::always(two_cores()), connector)
        .await
        .unwrap()
        .with_cadence(RandomCadence::seeded(Duration::from_secs(10), 42));

    heartbeat.run(cancel).await.unwrap();

    let records = channel.records().unwrap();
    assert_eq!(records.len(), 25);

    let mut previous: Option<NaiveDateTime> = None;
    for record in records {
        assert_eq!(record.data.len(), 1);
        assert_eq!(record.data[0].sensor_id, HEARTBEAT_SENSOR_ID);
        let ts = NaiveDateTime::parse_from_str(&record.data[0].ts, "%Y-%m-%dT%H:%M:%S%.f").unwrap();
        if let Some(prev) = previous {
            assert!(ts >= prev, "{ts} went backwards from {prev}");
        }
        previous = Some(ts);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_sleep_disconnects_once() {
    let harness = harness();
    let connector = MockConnector::new();
    let channel = connector.channel();
    let cancel = CancellationToken::new();

    let mut heartbeat = harness
        .heartbeat_loop("hb1", ScriptedProvider::always(two_cores()), connector)
        .await
        .unwrap()
        .with_cadence(FixedCadence(Duration::from_secs(5)));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        trigger.cancel();
    });

    let summary = heartbeat.run(cancel).await.unwrap();
    assert_eq!(summary.published, 2);

    let events = channel.events();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[2], ChannelEvent::Disconnect));
    assert_eq!(channel.disconnect_count(), 1);
    assert_eq!(heartbeat.state(), LoopState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_publishing_skips_connect() {
    let harness = harness();
    let connector = MockConnector::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut heartbeat = harness
        .heartbeat_loop("hb1", ScriptedProvider::always(two_cores()), connector.clone())
        .await
        .unwrap();

    let summary = heartbeat.run(cancel).await.unwrap();
    assert_eq!(summary.published, 0);
    assert_eq!(connector.connect_count(), 0);
    assert_eq!(heartbeat.state(), LoopState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_failed_publishes_keep_loop_running() {
    let harness = harness();
    let connector = MockConnector::new();
    let channel = connector.channel();
    channel.fail_publishes();
    let cancel = CancellationToken::new();

    let mut heartbeat = harness
        .heartbeat_loop("hb1", ScriptedProvider::always(two_cores()), connector)
        .await
        .unwrap()
        .with_cadence(FixedCadence(Duration::from_secs(3)));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let summary = heartbeat.run(cancel).await.unwrap();
    assert_eq!(summary.published, 0);
    assert_eq!(summary.failed_publishes, 4);
    assert_eq!(channel.disconnect_count(), 1);
}

#[tokio::test]
async fn test_missing_thing_name_fails_fast() {
    let harness = harness();
    harness
        .write_config(serde_json::json!({
            "devices": { "hb1": { "cert_arn": "arn:aws:iot:cert" } },
            "misc": { "iot_endpoint": "test-ats.iot.us-west-2.amazonaws.com" }
        }))
        .unwrap();

    let err = harness
        .heartbeat_loop("hb1", ScriptedProvider::never(), MockConnector::new())
        .await
        .err()
        .unwrap();
    let config_err = err.downcast_ref::<ConfigError>().unwrap();
    assert!(matches!(config_err, ConfigError::MissingField(f) if f == "devices.hb1.thing_name"));
}
