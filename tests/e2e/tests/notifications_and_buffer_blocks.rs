//! Notification delivery and buffer block confirmation

use std::time::Duration;

use bytes::Buf;
use data_publisher::cipher::create_auth_token;
use data_publisher::PublisherEvent;
use gateway_codec::{OperationalModes, ServerCommand, ServerResponse, TextEncoding};
use gateway_e2e_tests::client::COMPACT;
use gateway_e2e_tests::*;

fn utf8_modes() -> OperationalModes {
    OperationalModes::default().with_encoding(TextEncoding::Utf8)
}

async fn authenticate(client: &mut TestSubscriber) {
    client.define_modes(utf8_modes()).await.unwrap();
    let token = create_auth_token(SHARED_SECRET, AUTH_KEY, client.encoding()).unwrap();
    client.authenticate(&token).await.unwrap();
    let (response, _) = client.expect_status(ServerCommand::Authenticate).await.unwrap();
    assert_eq!(response, ServerResponse::Succeeded);
}

#[tokio::test]
async fn test_notifications_persist_until_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = gateway_config(dir.path());
    config.encrypt_payload = false;
    let (publisher, addr) = start_publisher(config, catalog()).await.unwrap();

    let mut client = TestSubscriber::connect(addr).await.unwrap();
    authenticate(&mut client).await;

    let hash = publisher.send_notification("Scheduled maintenance").unwrap();
    let frame = client.expect(ServerResponse::Notify).await.unwrap();
    let mut payload = &frame.payload[..];
    assert_eq!(payload.get_i32(), hash);
    let text = client.encoding().decode(payload).unwrap();
    assert!(text.starts_with('['));
    assert!(text.ends_with("] Scheduled maintenance"));

    let stored = std::fs::read_to_string(dir.path().join("E2ENotifications.txt")).unwrap();
    assert!(stored.contains("Scheduled maintenance"));

    // Unconfirmed notifications are replayed on the next authentication
    drop(client);
    let mut client = TestSubscriber::connect(addr).await.unwrap();
    authenticate(&mut client).await;
    let replayed = client.expect(ServerResponse::Notify).await.unwrap();
    assert_eq!((&replayed.payload[..4]).get_i32(), hash);

    client
        .send(ServerCommand::ConfirmNotification, &hash.to_be_bytes())
        .await
        .unwrap();
    // Confirmation has no response; a follow-up command proves it was processed
    client.send(ServerCommand::Unsubscribe, &[]).await.unwrap();
    client.expect_status(ServerCommand::Unsubscribe).await.unwrap();

    let stored = std::fs::read_to_string(dir.path().join("E2ENotifications.txt")).unwrap();
    assert!(!stored.contains("Scheduled maintenance"));
    publisher.stop();
}

#[tokio::test]
async fn test_unconfirmed_buffer_blocks_are_retransmitted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = open_config(dir.path());
    config.buffer_block_retransmission_timeout_ms = 200;
    let (publisher, addr) = start_publisher(config, catalog()).await.unwrap();
    let mut events = publisher.subscribe_events();

    let mut client = TestSubscriber::connect(addr).await.unwrap();
    client.define_modes(utf8_modes()).await.unwrap();
    client.subscribe(COMPACT, "inputMeasurementKeys={PPA:1}").await.unwrap();
    client.expect(ServerResponse::UpdateSignalIndexCache).await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, PublisherEvent::ClientConnected { .. }) {
            break;
        }
    }

    assert_eq!(publisher.publish_buffer_block(SIGNAL_A, b"waveform").unwrap(), 1);
    let first = client.expect(ServerResponse::BufferBlock).await.unwrap();
    let sequence = (&first.payload[..4]).get_u32();

    let resent = client.expect(ServerResponse::BufferBlock).await.unwrap();
    assert_eq!((&resent.payload[..4]).get_u32(), sequence);
    assert!(resent.payload.ends_with(b"waveform"));

    client
        .send(ServerCommand::ConfirmBufferBlock, &sequence.to_be_bytes())
        .await
        .unwrap();
    client.send(ServerCommand::Unsubscribe, &[]).await.unwrap();
    client.expect_status(ServerCommand::Unsubscribe).await.unwrap();
    assert!(publisher.lifetime_counters().buffer_block_retransmissions >= 1);
    publisher.stop();
}
