//! Reconnect behavior of the broker client against a real broker.
//!
//! Covers the two transport guarantees the replay engine leans on: a new
//! socket re-emits `watch` for every subscribed room before any user action,
//! and posts made while disconnected are flushed in call order on reconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tickline_broker::{Broker, BrokerConfig};
use tickline_codec::{Packed, Value};
use tickline_net::{BrokerClient, BrokerLink, ClientOptions, LinkEvent};

fn payload_schema() -> Packed {
    Packed::UInt(16)
}

async fn start_broker_at(bind_addr: &str) -> (Arc<Broker>, SocketAddr, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let config = BrokerConfig {
        bind_addr: bind_addr.to_string(),
        data_dir: dir.path().to_path_buf(),
    };
    // The port may linger briefly after the previous endpoint closed.
    let broker = {
        let mut attempt = 0;
        loop {
            match Broker::bind(&config) {
                Ok(broker) => break Arc::new(broker),
                Err(e) if attempt < 20 => {
                    attempt += 1;
                    let _ = e;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => panic!("failed to bind broker: {e}"),
            }
        }
    };
    let addr = broker.local_addr().expect("local addr");
    let runner = Arc::clone(&broker);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (broker, addr, dir)
}

async fn wait_synced(client: &BrokerClient) {
    for _ in 0..200 {
        if client.synced() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("client never synced");
}

async fn next_post(client: &mut BrokerClient, window: Duration) -> Option<(u64, String)> {
    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        if let Some(event) = client.poll_event() {
            if let LinkEvent::Post(record) = event {
                return Some((record.index, record.name));
            }
            continue;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    None
}

#[tokio::test]
async fn test_reconnect_rewatches_without_user_action() {
    let (broker, addr, _dir) = start_broker_at("127.0.0.1:0").await;
    let bind_addr = format!("127.0.0.1:{}", addr.port());

    let mut client = BrokerClient::connect(ClientOptions::new(bind_addr.clone())).expect("client");
    client.watch("room-a", &payload_schema()).expect("watch");
    wait_synced(&client).await;

    // Kill the broker out from under the client: non-clean close.
    broker.close();
    drop(broker);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A new broker comes up on the same port with an empty log.
    let (_broker2, _, _dir2) = start_broker_at(&bind_addr).await;

    // Someone else posts into the room on the new broker. The only way the
    // original client can see it is if its new socket re-sent the watch.
    let mut poster = BrokerClient::connect(ClientOptions::new(bind_addr)).expect("poster");
    poster.watch("room-a", &payload_schema()).expect("watch");
    wait_synced(&poster).await;
    poster.post("room-a", &Value::UInt(42)).expect("post");

    let received = next_post(&mut client, Duration::from_secs(15)).await;
    assert_eq!(received.map(|(index, _)| index), Some(0));
}

#[tokio::test]
async fn test_offline_posts_flush_in_call_order() {
    let (broker, addr, _dir) = start_broker_at("127.0.0.1:0").await;
    let bind_addr = format!("127.0.0.1:{}", addr.port());

    let mut client = BrokerClient::connect(ClientOptions::new(bind_addr.clone())).expect("client");
    client.watch("room-c", &payload_schema()).expect("watch");
    wait_synced(&client).await;

    // Take the broker away; the clock estimate survives disconnection.
    broker.close();
    drop(broker);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut names = Vec::new();
    for value in [1u64, 2, 3] {
        names.push(client.post("room-c", &Value::UInt(value)).expect("post"));
    }

    // Bring the broker back; the queue flushes on reconnect.
    let (_broker2, _, _dir2) = start_broker_at(&bind_addr).await;

    // The client also re-watches room-c, so it receives its own three posts
    // back with broker-assigned indices in call order.
    for (expected_index, expected_name) in names.iter().enumerate() {
        let (index, name) = next_post(&mut client, Duration::from_secs(15))
            .await
            .expect("queued post delivered");
        assert_eq!(index, expected_index as u64);
        assert_eq!(&name, expected_name);
    }

    // Exactly three: nothing duplicated, nothing reordered.
    assert!(next_post(&mut client, Duration::from_millis(500)).await.is_none());
}
