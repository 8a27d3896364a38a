//! End-to-end replay scenarios over the in-memory link.

use std::collections::BTreeSet;
use std::sync::Arc;

use tickline_codec::{Packed, Value};
use tickline_engine::{CoreConfig, EngineOptions, Post, ReplayCore, ReplayEngine};
use tickline_net::{MemoryLink, PostRecord};

/// Player roster world: spawn payloads add a character, zero is a no-op.
type Players = BTreeSet<char>;

fn roster_options(room: &str) -> EngineOptions<Players> {
    EngineOptions::new(
        room,
        Players::new(),
        Box::new(|s: &Players| s.clone()),
        Box::new(apply_spawn),
        Packed::UInt(8),
        24,
        300,
    )
}

fn apply_spawn(post: &Post, state: &Players) -> Players {
    let Value::UInt(code) = post.data else {
        panic!("spawn payload is a uint");
    };
    let mut next = state.clone();
    if code != 0 {
        next.insert(code as u8 as char);
    }
    next
}

fn roster_core(cache: bool) -> ReplayCore<Players> {
    let mut config = CoreConfig::new(24, 300);
    config.cache = cache;
    ReplayCore::new(
        config,
        Players::new(),
        Box::new(|s: &Players| s.clone()),
        Box::new(apply_spawn),
    )
}

/// 1,500 historical posts at 100 ms spacing with five spawns sprinkled in.
fn backlog(base_ms: i64) -> Vec<PostRecord> {
    let spawn_at = |i: u64| -> u64 {
        match i {
            0 => 'x' as u64,
            10 => 'y' as u64,
            20 => 'l' as u64,
            1200 => 'f' as u64,
            1300 => 'j' as u64,
            _ => 0,
        }
    };
    (0..1500)
        .map(|i| {
            let time = base_ms + i as i64 * 100;
            PostRecord {
                room: "arena".to_string(),
                index: i,
                server_time: time,
                client_time: time,
                name: format!("seed{i:04}"),
                data: Value::UInt(spawn_at(i)),
            }
        })
        .collect()
}

#[test]
fn test_long_backlog_join_without_desync() {
    let base = 1_000_000i64;
    // The room has been running for 150 s when this client joins.
    let join_time = base + 150_000;

    let mut engine = ReplayEngine::with_link(roster_options("arena"), MemoryLink::new());
    engine.link_mut().sync_at(join_time);
    engine.pump().unwrap();

    // The broker drains the whole backlog to the new watcher.
    for record in backlog(base) {
        engine.link_mut().deliver_post(record);
    }
    engine.link_mut().deliver_latest_index("arena", 1499, join_time);
    engine.pump().unwrap();

    // Render for 90 s of simulated time at 2 Hz frames; the latest-index
    // poll keeps answering along the way.
    for frame in 1..=180 {
        engine.link_mut().advance(500);
        engine
            .link_mut()
            .deliver_latest_index("arena", 1499, join_time + frame * 500);
        engine.pump().unwrap();
        engine.compute_render_state().unwrap();
    }

    let final_tick = engine.server_tick().unwrap();
    let state = engine.compute_state_at(final_tick);
    let expected: Players = ['x', 'y', 'l', 'f', 'j'].into_iter().collect();
    assert_eq!(*state, expected);

    // Identical to a fully uncached replay over all posts.
    let mut plain = roster_core(false);
    for record in backlog(base) {
        plain.admit_remote(Post {
            index: record.index as i64,
            server_time: record.server_time,
            client_time: record.client_time,
            name: record.name,
            data: record.data,
        });
    }
    plain.note_latest_index(1499, join_time + 90_000);
    assert_eq!(state, plain.compute_state_at(final_tick));

    assert_eq!(engine.diagnostics().cache_drop_guard_hits, 0);
    assert_eq!(engine.post_count(), 1500);
}

#[test]
fn test_backlog_redelivery_after_reconnect_changes_nothing() {
    let base = 1_000_000i64;
    let mut engine = ReplayEngine::with_link(roster_options("arena"), MemoryLink::new());
    engine.link_mut().sync_at(base + 150_000);
    engine.pump().unwrap();

    for record in backlog(base) {
        engine.link_mut().deliver_post(record);
    }
    engine.pump().unwrap();
    let tick = engine.server_tick().unwrap();
    let before = engine.compute_state_at(tick);

    // A reconnect re-watches from scratch and the broker replays the whole
    // room; the engine must shrug it off.
    for record in backlog(base) {
        engine.link_mut().deliver_post(record);
    }
    engine.pump().unwrap();

    assert_eq!(engine.post_count(), 1500);
    assert_eq!(before, engine.compute_state_at(tick));
}

#[test]
fn test_interleaved_engines_agree() {
    let base = 2_000_000i64;
    let records = backlog(base);

    let compute_all = |order: &[usize]| -> Vec<Arc<Players>> {
        let mut engine = ReplayEngine::with_link(roster_options("arena"), MemoryLink::new());
        engine.link_mut().sync_at(base + 160_000);
        engine.pump().unwrap();
        for &i in order {
            engine.link_mut().deliver_post(records[i].clone());
        }
        engine.pump().unwrap();
        let last = engine.server_tick().unwrap();
        // Sample the full history at a coarse stride.
        (0..=last)
            .step_by(97)
            .map(|t| engine.compute_state_at(t))
            .collect()
    };

    let in_order: Vec<usize> = (0..1500).collect();
    // Delivery is index-ordered per connection, but a load answer and the
    // live stream can interleave duplicated prefixes.
    let mut with_replay: Vec<usize> = (0..750).collect();
    with_replay.extend(0..1500);

    assert_eq!(compute_all(&in_order), compute_all(&with_replay));
}
