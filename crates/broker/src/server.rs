//! Connection handling and gap-free fan-out.
//!
//! Per connection and room the broker keeps a `next_to_send` cursor and a
//! `watching` flag; delivery always goes through [`drain`], which walks the
//! room log from the cursor, so every connection sees a room's posts in
//! strictly ascending index order with no gaps and no repeats. Posts are
//! never pushed directly to a socket — a post wakes the room's watchers and
//! each watcher drains from its own cursor.

use anyhow::{Context, Result};
use quinn::{Connection, SendStream};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use tickline_net::frame::{read_frame, write_frame};
use tickline_net::wire::{
    decode_client_message, encode_broker_message, BrokerMessage, ClientMessage,
};
use tickline_net::{endpoint, unix_millis};

use crate::config::BrokerConfig;
use crate::log::{RoomStore, StoredPost};

/// Wakes a connection task to drain one room.
type DrainSender = UnboundedSender<String>;

struct Shared {
    store: Mutex<RoomStore>,
    /// room → (connection id → drain wake-up channel).
    watchers: Mutex<HashMap<String, HashMap<u64, DrainSender>>>,
}

/// The broker server: owns the QUIC endpoint and the shared room state.
pub struct Broker {
    endpoint: quinn::Endpoint,
    shared: Arc<Shared>,
}

impl Broker {
    /// Bind the endpoint and open the room store.
    pub fn bind(config: &BrokerConfig) -> Result<Self> {
        let addr: SocketAddr = config
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address `{}`", config.bind_addr))?;
        let endpoint = endpoint::listen(addr)?;
        let store = RoomStore::open(&config.data_dir)?;
        Ok(Self {
            endpoint,
            shared: Arc::new(Shared {
                store: Mutex::new(store),
                watchers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Address the broker actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("endpoint has no local address")
    }

    /// Accept connections until the endpoint closes.
    pub async fn run(&self) -> Result<()> {
        let mut next_conn_id = 0u64;
        while let Some(incoming) = self.endpoint.accept().await {
            let conn_id = next_conn_id;
            next_conn_id += 1;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let remote = incoming.remote_address();
                match incoming.await {
                    Ok(conn) => {
                        info!(conn_id, %remote, "connection established");
                        if let Err(e) = serve_connection(&shared, conn_id, conn).await {
                            debug!(conn_id, error = %e, "connection ended with error");
                        }
                        remove_watcher(&shared, conn_id);
                        info!(conn_id, "connection closed");
                    }
                    Err(e) => warn!(%remote, error = %e, "handshake failed"),
                }
            });
        }
        Ok(())
    }

    /// Stop accepting and tear down every connection.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"broker shutting down");
    }
}

/// Per-room delivery state of one connection.
#[derive(Debug, Default)]
struct RoomCursor {
    /// Smallest index not yet sent to this connection.
    next_to_send: u64,
    watching: bool,
}

async fn serve_connection(shared: &Shared, conn_id: u64, conn: Connection) -> Result<()> {
    let (mut send, recv) = conn
        .accept_bi()
        .await
        .context("client never opened its stream")?;

    // Frame reads are multi-step and must not be cancelled mid-frame by the
    // select below, so a dedicated task owns the receive half and forwards
    // whole frames over a channel.
    let (frame_tx, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();
    let reader = tokio::spawn(async move {
        let mut recv = recv;
        loop {
            match read_frame(&mut recv).await {
                Ok(Some(bytes)) => {
                    if frame_tx.send(bytes).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "stream read failed");
                    break;
                }
            }
        }
    });

    let (drain_tx, mut drain_rx) = mpsc::unbounded_channel::<String>();
    let mut cursors: HashMap<String, RoomCursor> = HashMap::new();

    let result = loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) =
                        handle_message(shared, conn_id, &drain_tx, &mut cursors, &mut send, &bytes)
                            .await
                    {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            Some(room) = drain_rx.recv() => {
                if let Err(e) = drain(shared, &mut cursors, &mut send, &room, None).await {
                    break Err(e);
                }
            }
        }
    };
    reader.abort();
    result
}

async fn handle_message(
    shared: &Shared,
    conn_id: u64,
    drain_tx: &DrainSender,
    cursors: &mut HashMap<String, RoomCursor>,
    send: &mut SendStream,
    bytes: &[u8],
) -> Result<()> {
    let msg = decode_client_message(bytes)?;
    match msg {
        ClientMessage::GetTime => {
            reply(
                send,
                &BrokerMessage::InfoTime {
                    time: unix_millis() as u64,
                },
            )
            .await
        }
        ClientMessage::Post {
            room,
            time,
            name,
            payload,
        } => {
            let post = StoredPost {
                server_time: unix_millis() as u64,
                client_time: time,
                name,
                payload,
            };
            let index = shared.store.lock().unwrap().append(&room, &post)?;
            debug!(conn_id, %room, index, "post appended");

            // Never send directly: wake every watcher (possibly including
            // this connection) and let each drain from its own cursor.
            let watchers = shared.watchers.lock().unwrap();
            if let Some(room_watchers) = watchers.get(&room) {
                for tx in room_watchers.values() {
                    let _ = tx.send(room.clone());
                }
            }
            Ok(())
        }
        ClientMessage::Load { room, from } => {
            let cursor = cursors.entry(room.clone()).or_default();
            // The cursor never rewinds: a load below it is a no-op.
            cursor.next_to_send = cursor.next_to_send.max(from);
            let cap = if cursor.watching {
                None
            } else {
                // One-shot: deliver what exists right now, nothing after.
                Some(shared.store.lock().unwrap().count(&room)?)
            };
            drain(shared, cursors, send, &room, cap).await
        }
        ClientMessage::Watch { room } => {
            cursors.entry(room.clone()).or_default().watching = true;
            shared
                .watchers
                .lock()
                .unwrap()
                .entry(room.clone())
                .or_default()
                .insert(conn_id, drain_tx.clone());
            debug!(conn_id, %room, "watching");
            drain(shared, cursors, send, &room, None).await
        }
        ClientMessage::Unwatch { room } => {
            if let Some(cursor) = cursors.get_mut(&room) {
                cursor.watching = false;
            }
            let mut watchers = shared.watchers.lock().unwrap();
            if let Some(room_watchers) = watchers.get_mut(&room) {
                room_watchers.remove(&conn_id);
                if room_watchers.is_empty() {
                    watchers.remove(&room);
                }
            }
            debug!(conn_id, %room, "unwatched");
            Ok(())
        }
        ClientMessage::GetLatestPostIndex { room } => {
            let count = shared.store.lock().unwrap().count(&room)?;
            reply(
                send,
                &BrokerMessage::InfoLatestPostIndex {
                    room,
                    latest_index: count as i64 - 1,
                    server_time: unix_millis() as u64,
                },
            )
            .await
        }
    }
}

/// Stream records from the connection's cursor up to the room size (or the
/// one-shot cap). The connection task runs drains serially, so two drains of
/// the same room can never interleave; the cursor alone guarantees gap-free,
/// repeat-free delivery.
async fn drain(
    shared: &Shared,
    cursors: &mut HashMap<String, RoomCursor>,
    send: &mut SendStream,
    room: &str,
    cap: Option<u64>,
) -> Result<()> {
    loop {
        let next = cursors.entry(room.to_string()).or_default().next_to_send;
        let count = shared.store.lock().unwrap().count(room)?;
        let limit = cap.map_or(count, |cap| cap.min(count));
        if next >= limit {
            return Ok(());
        }

        let post = shared
            .store
            .lock()
            .unwrap()
            .get(room, next)?
            .context("offset table references a missing record")?;

        reply(
            send,
            &BrokerMessage::InfoPost {
                room: room.to_string(),
                index: next,
                server_time: post.server_time,
                client_time: post.client_time,
                name: post.name,
                payload: post.payload,
            },
        )
        .await?;

        cursors
            .get_mut(room)
            .expect("cursor created above")
            .next_to_send = next + 1;
    }
}

async fn reply(send: &mut SendStream, msg: &BrokerMessage) -> Result<()> {
    let frame = encode_broker_message(msg)?;
    write_frame(send, &frame).await
}

/// Drop a closed connection from every watcher set.
fn remove_watcher(shared: &Shared, conn_id: u64) {
    let mut watchers = shared.watchers.lock().unwrap();
    watchers.retain(|_, room_watchers| {
        room_watchers.remove(&conn_id);
        !room_watchers.is_empty()
    });
}
