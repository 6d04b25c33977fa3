//! Shared-secret authentication, rights filtering and payload encryption

use std::time::Duration;

use data_publisher::cipher::{create_auth_token, open_with_secret};
use data_publisher::{CipherKeys, PublisherEvent, SecurityCatalog};
use gateway_codec::{
    DataPacket, DataPacketFlags, Measurement, OperationalModes, ServerCommand, ServerResponse,
    SignalIndexCache, TextEncoding,
};
use gateway_e2e_tests::client::COMPACT;
use gateway_e2e_tests::*;
use tokio::sync::broadcast;

const T0: i64 = 638_500_000_000_000_000;

fn utf8_modes() -> OperationalModes {
    OperationalModes::default().with_encoding(TextEncoding::Utf8)
}

async fn wait_for_subscription(events: &mut broadcast::Receiver<PublisherEvent>) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for publisher event")
            .expect("event channel closed");
        if matches!(event, PublisherEvent::ClientConnected { .. }) {
            return;
        }
    }
}

async fn authenticated_client(addr: std::net::SocketAddr) -> TestSubscriber {
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();
    let token = create_auth_token(SHARED_SECRET, AUTH_KEY, client.encoding()).unwrap();
    client.authenticate(&token).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Authenticate).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded, "{message}");
    assert!(message.starts_with("Registered subscriber \"End To End\""));
    assert!(message.ends_with("was successfully authenticated."));
    client
}

#[tokio::test]
async fn test_commands_are_refused_before_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, addr) = start_publisher(gateway_config(dir.path()), catalog()).await.unwrap();
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1}").await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert_eq!(message, "Subscriber not authenticated - Subscribe request denied.");

    client.send(ServerCommand::MetadataRefresh, &[]).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::MetadataRefresh).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert_eq!(message, "Subscriber not authenticated - MetaDataRefresh request denied.");
    publisher.stop();
}

#[tokio::test]
async fn test_bad_tokens_are_denied() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, addr) = start_publisher(gateway_config(dir.path()), catalog()).await.unwrap();
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();

    client.authenticate(&[0x42; 48]).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Authenticate).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert_eq!(message, "Subscriber authentication failed - Authenticate request denied.");

    let wrong = create_auth_token(SHARED_SECRET, "not-the-key", client.encoding()).unwrap();
    client.authenticate(&wrong).await.unwrap();
    let (response, _) = client.expect_status(ServerCommand::Authenticate).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);

    client.authenticate(&[0x42; 4]).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Authenticate).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert!(message.starts_with("Received request packet with an unexpected size from"));
    publisher.stop();
}

#[tokio::test]
async fn test_unknown_address_cannot_authenticate() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = catalog();
    catalog.subscribers[0].valid_ip_addresses = "10.99.0.1".to_string();
    let (publisher, addr) = start_publisher(gateway_config(dir.path()), catalog).await.unwrap();

    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();
    let token = create_auth_token(SHARED_SECRET, AUTH_KEY, client.encoding()).unwrap();
    client.authenticate(&token).await.unwrap();
    let (response, message) = client.expect_status(ServerCommand::Authenticate).await.unwrap();
    assert_eq!(response, ServerResponse::Failed);
    assert!(message.starts_with("No subscriber is registered for 127.0.0.1:"));
    publisher.stop();
}

#[tokio::test]
async fn test_authorized_subset_and_encrypted_data_packets() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, addr) = start_publisher(gateway_config(dir.path()), catalog()).await.unwrap();
    let mut events = publisher.subscribe_events();
    let mut client = authenticated_client(addr).await;

    client
        .subscribe(COMPACT, "inputMeasurementKeys={PPA:1;PPA:2;PPA:3}")
        .await
        .unwrap();
    let (response, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
    assert_eq!(message, "Client subscribed as compact unsynchronized with 2 signals.");

    let update = client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    let cache = SignalIndexCache::from_native(&update.payload).unwrap();
    assert_eq!(cache.subscriber_id, SUBSCRIBER_ID);
    assert_eq!(cache.len(), 2);
    assert!(cache.index_of(&SIGNAL_C).is_none());
    assert_eq!(cache.unauthorized_signal_ids, vec![SIGNAL_C]);

    let keys = client.expect(ServerResponse::UpdateCipherKeys).await.unwrap();
    let keys = CipherKeys::decode_update(&open_with_secret(SHARED_SECRET, &keys.payload).unwrap()).unwrap();
    wait_for_subscription(&mut events).await;

    publisher.publish(&[Measurement::new(SIGNAL_A, 59.95, T0)]);
    let frame = client.expect(ServerResponse::DataPacket).await.unwrap();
    let flags = DataPacketFlags::from_bits_retain(frame.payload[0]);
    let plaintext = keys.pair(flags.cipher_index()).decrypt(&frame.payload[1..]).unwrap();

    let mut packet = vec![frame.payload[0]];
    packet.extend_from_slice(&plaintext);
    let measurements = DataPacket::parse(&packet).unwrap().compact_measurements(None).unwrap();
    assert_eq!(measurements.len(), 1);
    assert_eq!(measurements[0].runtime_index, cache.index_of(&SIGNAL_A).unwrap());
    assert_eq!(measurements[0].value, 59.95f32);
    publisher.stop();
}

#[tokio::test]
async fn test_requested_rotation_switches_active_pair() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, addr) = start_publisher(gateway_config(dir.path()), catalog()).await.unwrap();
    let mut client = authenticated_client(addr).await;

    client.send(ServerCommand::RotateCipherKeys, &[]).await.unwrap();
    let first = client.expect(ServerResponse::UpdateCipherKeys).await.unwrap();
    let first = CipherKeys::decode_update(&open_with_secret(SHARED_SECRET, &first.payload).unwrap()).unwrap();
    let (response, message) = client.expect_status(ServerCommand::RotateCipherKeys).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
    assert_eq!(message, "New cipher keys rotated.");

    client.send(ServerCommand::RotateCipherKeys, &[]).await.unwrap();
    let second = client.expect(ServerResponse::UpdateCipherKeys).await.unwrap();
    let second = CipherKeys::decode_update(&open_with_secret(SHARED_SECRET, &second.payload).unwrap()).unwrap();
    assert_ne!(first.index(), second.index());
    assert_eq!(
        first.pair(first.index()).key(),
        second.pair(first.index()).key(),
        "the previously active pair stays available for in-flight packets"
    );
    publisher.stop();
}

#[tokio::test]
async fn test_requested_rotation_without_payload_encryption() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = gateway_config(dir.path());
    config.encrypt_payload = false;
    let (publisher, addr) = start_publisher(config, catalog()).await.unwrap();
    let mut events = publisher.subscribe_events();
    let mut client = authenticated_client(addr).await;

    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1}").await.unwrap();
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    wait_for_subscription(&mut events).await;

    client.send(ServerCommand::RotateCipherKeys, &[]).await.unwrap();
    let update = client.expect(ServerResponse::UpdateCipherKeys).await.unwrap();
    let keys = CipherKeys::decode_update(&open_with_secret(SHARED_SECRET, &update.payload).unwrap()).unwrap();
    let (response, message) = client.expect_status(ServerCommand::RotateCipherKeys).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
    assert_eq!(message, "New cipher keys rotated.");

    // Keys pushed on request are used for subsequent data packets
    publisher.publish(&[Measurement::new(SIGNAL_A, 1.5, T0)]);
    let frame = client.expect(ServerResponse::DataPacket).await.unwrap();
    let flags = DataPacketFlags::from_bits_retain(frame.payload[0]);
    assert_eq!(flags.cipher_index(), keys.index());
    assert!(keys.pair(flags.cipher_index()).decrypt(&frame.payload[1..]).is_ok());
    publisher.stop();
}

#[tokio::test]
async fn test_revoked_rights_shrink_live_subscription() {
    let dir = tempfile::tempdir().unwrap();
    let (publisher, addr) = start_publisher(gateway_config(dir.path()), catalog()).await.unwrap();
    let mut events = publisher.subscribe_events();
    let mut client = authenticated_client(addr).await;

    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1;PPA:2}").await.unwrap();
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    wait_for_subscription(&mut events).await;

    let mut revoked: SecurityCatalog = catalog();
    revoked.rules.retain(|rule| rule.signal_id != SIGNAL_B);
    publisher.update_catalog(revoked).await;

    let update = client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    let cache = SignalIndexCache::from_native(&update.payload).unwrap();
    assert_eq!(cache.len(), 1);
    assert!(cache.index_of(&SIGNAL_B).is_none());

    let (_, message) = client.expect_status(ServerCommand::Subscribe).await.unwrap();
    assert_eq!(
        message,
        "Update to authorized signals caused subscription to change. Now subscribed to 1 signals."
    );
    assert_eq!(publisher.publish(&[Measurement::new(SIGNAL_B, 1.0, T0)]), 0);
    publisher.stop();
}
