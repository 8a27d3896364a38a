//! Two engines, one real broker: both must converge on identical state.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tickline_broker::{Broker, BrokerConfig};
use tickline_codec::{Packed, Value};
use tickline_engine::{EngineOptions, Post, ReplayEngine};
use tickline_net::{BrokerClient, ClientOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Tally {
    ticks: u64,
    sum: u64,
}

fn tally_options(room: &str) -> EngineOptions<Tally> {
    EngineOptions::new(
        room,
        Tally::default(),
        Box::new(|s: &Tally| Tally {
            ticks: s.ticks + 1,
            sum: s.sum,
        }),
        Box::new(|p: &Post, s: &Tally| {
            let Value::UInt(v) = p.data else { panic!("uint payload") };
            Tally {
                ticks: s.ticks,
                sum: s.sum + v,
            }
        }),
        Packed::UInt(16),
        24,
        300,
    )
}

#[tokio::test]
async fn test_two_engines_converge_via_broker() {
    let dir = TempDir::new().expect("tempdir");
    let config = BrokerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        data_dir: dir.path().to_path_buf(),
    };
    let broker = Arc::new(Broker::bind(&config).expect("bind"));
    let addr = broker.local_addr().expect("addr");
    let runner = Arc::clone(&broker);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let connect = || {
        BrokerClient::connect(ClientOptions::new(format!("127.0.0.1:{}", addr.port())))
            .expect("client")
    };
    let mut alpha = ReplayEngine::with_link(tally_options("match-1"), connect());
    let mut beta = ReplayEngine::with_link(tally_options("match-1"), connect());

    // Pump until both clocks sync and the watches go out.
    for _ in 0..200 {
        let _ = alpha.pump();
        let _ = beta.pump();
        if alpha.server_time().is_ok() && beta.server_time().is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    alpha.server_time().expect("alpha synced");
    beta.server_time().expect("beta synced");

    alpha.post(Value::UInt(5)).expect("post");
    alpha.post(Value::UInt(7)).expect("post");
    beta.post(Value::UInt(11)).expect("post");

    // Wait for all three authoritative echoes to reach both engines.
    for _ in 0..200 {
        alpha.pump().expect("pump");
        beta.pump().expect("pump");
        if alpha.post_count() == 3 && beta.post_count() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(alpha.post_count(), 3);
    assert_eq!(beta.post_count(), 3);

    // A common tick comfortably after every post's official tick.
    let tick = alpha.server_tick().expect("tick") + 24;
    let state_a = alpha.compute_state_at(tick);
    let state_b = beta.compute_state_at(tick);
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.sum, 23);

    assert_eq!(alpha.initial_tick(), beta.initial_tick());

    alpha.close();
    beta.close();
    broker.close();
}
