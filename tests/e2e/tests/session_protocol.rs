//! Command channel session behaviour against a running publisher

use std::time::Duration;

use data_publisher::{DataPublisher, PublisherEvent};
use gateway_codec::{
    DataPacket, Measurement, MetadataSet, OperationalModes, ServerCommand, ServerResponse,
    SignalIndexCache, TextEncoding,
};
use gateway_e2e_tests::client::{COMPACT, SYNCHRONIZED};
use gateway_e2e_tests::*;
use tokio::sync::broadcast;

const T0: i64 = 638_500_000_000_000_000;

fn utf8_modes() -> OperationalModes {
    OperationalModes::default().with_encoding(TextEncoding::Utf8)
}

async fn next_client_connected(events: &mut broadcast::Receiver<PublisherEvent>) -> PublisherEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for publisher event")
            .expect("event channel closed");
        if matches!(event, PublisherEvent::ClientConnected { .. }) {
            return event;
        }
    }
}

async fn open_publisher() -> (DataPublisher, std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, addr) = start_publisher(open_config(dir.path()), catalog()).await.unwrap();
    (publisher, addr, dir)
}

#[tokio::test]
async fn test_subscribe_sends_status_then_signal_index_cache() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut events = publisher.subscribe_events();
    let mut client = TestSubscriber::connect(addr).await.unwrap();

    client.define_modes(utf8_modes()).await.unwrap();
    client
        .subscribe(COMPACT, "inputMeasurementKeys={PPA:1;PPA:2}; assemblyInfo={version=1.0}")
        .await
        .unwrap();

    let status = client.next_response().await.unwrap();
    assert_eq!(status.response, ServerResponse::Succeeded);
    assert_eq!(status.in_response_to, ServerCommand::Subscribe);
    assert_eq!(
        client.text(&status).unwrap(),
        "Client subscribed as compact unsynchronized with 2 signals."
    );

    let update = client.next_response().await.unwrap();
    assert_eq!(update.response, ServerResponse::UpdateSignalIndexCache);
    let cache = SignalIndexCache::from_native(&update.payload).unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.index_of(&SIGNAL_A), Some(0));
    assert_eq!(cache.index_of(&SIGNAL_B), Some(1));
    assert!(cache.unauthorized_signal_ids.is_empty());

    match next_client_connected(&mut events).await {
        PublisherEvent::ClientConnected { subscriber_info, .. } => {
            assert_eq!(subscriber_info.as_deref(), Some("version=1.0"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(publisher.client_count(), 1);
    assert_eq!(publisher.get_subscriber_info(0).as_deref(), Some("version=1.0"));
    publisher.stop();
}

#[tokio::test]
async fn test_published_measurements_arrive_as_compact_packets() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut events = publisher.subscribe_events();
    let mut client = TestSubscriber::connect(addr).await.unwrap();

    client.define_modes(utf8_modes()).await.unwrap();
    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1;PPA:2}").await.unwrap();
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    next_client_connected(&mut events).await;

    let queued = publisher.publish(&[
        Measurement::new(SIGNAL_B, 120.5, T0),
        Measurement::new(SIGNAL_C, 7.0, T0),
    ]);
    assert_eq!(queued, 1, "unsubscribed signals are not routed");

    let start = client.expect(ServerResponse::DataStartTime).await.unwrap();
    assert_eq!(i64::from_be_bytes(start.payload[..8].try_into().unwrap()), T0);

    let frame = client.expect(ServerResponse::DataPacket).await.unwrap();
    let packet = DataPacket::parse(&frame.payload).unwrap();
    let measurements = packet.compact_measurements(None).unwrap();
    assert_eq!(measurements.len(), 1);
    assert_eq!(measurements[0].runtime_index, 1);
    assert_eq!(measurements[0].value, 120.5);
    assert_eq!(measurements[0].timestamp, T0);

    assert_eq!(publisher.lifetime_counters().measurements, 1);
    publisher.stop();
}

#[tokio::test]
async fn test_unknown_command_fails_and_connection_stays_usable() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.send_raw(0xEE, &[]).await.unwrap();
    let frame = client.next_response().await.unwrap();
    assert_eq!(frame.response, ServerResponse::Failed);
    assert_eq!(frame.in_response_to, ServerCommand::Unknown(0xEE));
    assert_eq!(
        client.text(&frame).unwrap(),
        "Client sent an unrecognized server command: 0xEE"
    );

    client.send(ServerCommand::Unsubscribe, &[]).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Unsubscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
    assert_eq!(message, "Client unsubscribed.");
    publisher.stop();
}

#[tokio::test]
async fn test_bad_payload_marker_closes_connection() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client
        .write_raw(&[0x01, 0x02, 0x03, 0x04, 4, 0, 0, 0, 1, 2, 3, 4])
        .await
        .unwrap();
    assert!(client.closed_within(Duration::from_secs(5)).await);
    publisher.stop();
}

#[tokio::test]
async fn test_subscribe_without_keys_explains_missing_setting() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.subscribe(0, "processingInterval=-1").await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
    assert_eq!(
        message,
        "Client subscribed as full unsynchronized, but no signals were specified. Make sure \"inputMeasurementKeys\" setting is properly defined."
    );
    let update = client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    assert!(SignalIndexCache::from_native(&update.payload).unwrap().is_empty());
    publisher.stop();
}

#[tokio::test]
async fn test_malformed_subscriptions_are_refused() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.send(ServerCommand::Subscribe, &[COMPACT, 0, 0]).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert_eq!(message, "Not enough buffer was provided to parse client data subscription.");

    client.subscribe(COMPACT, "").await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert_eq!(message, "Cannot initialize client data subscription without a connection string.");
    publisher.stop();
}

#[tokio::test]
async fn test_synchronized_subscription_can_be_denied() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = open_config(dir.path());
    config.allow_synchronized_subscription = false;
    let (publisher, addr) = start_publisher(config, catalog()).await.unwrap();

    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();
    client
        .subscribe(SYNCHRONIZED | COMPACT, "inputMeasurementKeys={PPA:1}")
        .await
        .unwrap();
    let (response, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert!(message.starts_with("Client request for remotely synchronized data subscription was denied."));
    publisher.stop();
}

#[tokio::test]
async fn test_switching_to_synchronized_mode_emits_frames() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut events = publisher.subscribe_events();
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1}").await.unwrap();
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    next_client_connected(&mut events).await;

    client
        .subscribe(SYNCHRONIZED, "inputMeasurementKeys={PPA:1;PPA:2}")
        .await
        .unwrap();
    let (_, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(message, "Client subscribed as full synchronized with 2 signals.");
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    next_client_connected(&mut events).await;

    publisher.publish(&[
        Measurement::new(SIGNAL_A, 1.0, T0 + 10),
        Measurement::new(SIGNAL_B, 2.0, T0),
        Measurement::new(SIGNAL_A, 3.0, T0),
    ]);

    let first = client.expect(ServerResponse::DataPacket).await.unwrap();
    let first = DataPacket::parse(&first.payload).unwrap();
    assert_eq!(first.frame_timestamp, Some(T0));
    assert_eq!(first.full_measurements().unwrap().len(), 2);

    let second = client.expect(ServerResponse::DataPacket).await.unwrap();
    let second = DataPacket::parse(&second.payload).unwrap();
    assert_eq!(second.frame_timestamp, Some(T0 + 10));
    let measurements = second.full_measurements().unwrap();
    assert_eq!(measurements[0].signal_id, SIGNAL_A);
    assert_eq!(measurements[0].value, 1.0);
    publisher.stop();
}

#[tokio::test]
async fn test_processing_interval_requires_subscription() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client
        .send(ServerCommand::UpdateProcessingInterval, &250i32.to_be_bytes())
        .await
        .unwrap();
    let (response, message) = client
        .expect_status(ServerCommand::UpdateProcessingInterval)
        .await
        .unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert_eq!(
        message,
        "Client subscription was not available, could not update processing interval."
    );

    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1}").await.unwrap();
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    client
        .send(ServerCommand::UpdateProcessingInterval, &250i32.to_be_bytes())
        .await
        .unwrap();
    let (response, message) = client
        .expect_status(ServerCommand::UpdateProcessingInterval)
        .await
        .unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
    assert_eq!(message, "New processing interval of 250 assigned.");
    publisher.stop();
}

#[tokio::test]
async fn test_metadata_refresh_returns_local_tables() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.send(ServerCommand::MetadataRefresh, &[]).await.unwrap();
    let frame = client.next_response().await.unwrap();
    assert_eq!(frame.response, ServerResponse::Succeeded);
    assert_eq!(frame.in_response_to, ServerCommand::MetadataRefresh);

    let set = MetadataSet::from_native(&frame.payload).unwrap();
    let names: Vec<&str> = set.tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["DeviceDetail", "MeasurementDetail", "PhasorDetail"]);
    assert_eq!(set.table("MeasurementDetail").unwrap().rows.len(), 3);
    assert_eq!(set.table("DeviceDetail").unwrap().rows.len(), 1);
    publisher.stop();
}

#[tokio::test]
async fn test_metadata_uses_common_format_and_gzip_when_negotiated() {
    let (publisher, addr, _dir) = open_publisher().await;
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    let modes = utf8_modes()
        .with_gzip()
        .union(OperationalModes::USE_COMMON_SERIALIZATION_FORMAT)
        .union(OperationalModes::COMPRESS_METADATA);
    client.define_modes(modes).await.unwrap();

    client.send(ServerCommand::MetadataRefresh, &[]).await.unwrap();
    let frame = client.expect(ServerResponse::Succeeded).await.unwrap();
    let image = gateway_codec::compression::gunzip(&frame.payload).unwrap();
    let set = MetadataSet::from_binary_image(&image, TextEncoding::Utf8).unwrap();
    assert_eq!(set.tables.len(), 3);
    publisher.stop();
}

#[tokio::test]
async fn test_clients_are_served_independently() {
    let (publisher, addr, _dir) = open_publisher().await;

    let sessions = (0..4).map(|n| async move {
        let mut client = TestSubscriber::connect(addr).await.unwrap();
        client.define_modes(utf8_modes()).await.unwrap();
        let keys = if n % 2 == 0 { "PPA:1" } else { "PPA:1;PPA:2" };
        client
            .subscribe(COMPACT, &format!("inputMeasurementKeys={{{keys}}}"))
            .await
            .unwrap();
        let update = client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
        let signals = SignalIndexCache::from_native(&update.payload).unwrap().len();
        (client, signals)
    });
    let sessions = futures::future::join_all(sessions).await;

    let counts: Vec<usize> = sessions.iter().map(|(_, signals)| *signals).collect();
    assert_eq!(counts, [1, 2, 1, 2]);
    assert_eq!(publisher.client_count(), 4);
    assert!(publisher.enumerate_clients().contains("subscribed to 2 signals"));
    publisher.stop();
}
