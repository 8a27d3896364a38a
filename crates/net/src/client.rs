//! The reconnecting broker client.
//!
//! [`BrokerClient`] is a cheap handle; the work happens in a driver task that
//! owns the QUIC connection. The handle and driver share only the clock
//! state and the room registry, so every [`BrokerLink`] call stays
//! non-blocking and the consumer keeps all of its own mutation on one task.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quinn::{Connection, Endpoint, SendStream};
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tickline_codec::{Packed, Value};

use crate::endpoint;
use crate::error::LinkError;
use crate::frame::{read_frame, write_frame};
use crate::link::{BrokerLink, LinkEvent, PostRecord, NAME_ALPHABET, NAME_LEN};
use crate::unix_millis;
use crate::wire::{self, BrokerMessage, ClientMessage};

/// Default broker address used when the caller provides none.
pub const DEFAULT_BROKER_ADDR: &str = "play.tickline.dev:8080";

/// Interval between `get_time` probes.
const HEARTBEAT: Duration = Duration::from_secs(2);

/// Reconnect backoff base, cap and jitter.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const BACKOFF_JITTER_MS: u64 = 250;

/// Cap on a single dial attempt, so a dead broker address cannot stall the
/// reconnect loop for a full idle timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// Where and how to reach the broker.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Broker address as `host:port`, resolved on every connect attempt.
    pub addr: String,
    /// TLS server name; defaults to the host part of `addr`.
    pub server_name: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: DEFAULT_BROKER_ADDR.to_string(),
            server_name: None,
        }
    }
}

impl ClientOptions {
    /// Point the client at a specific broker.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: None,
        }
    }

    fn host(&self) -> String {
        let host = self
            .addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.addr);
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }
}

/// Clock reconciliation state shared between handle and driver.
#[derive(Debug, Default)]
struct ClockState {
    synced: bool,
    offset_ms: i64,
    lowest_ping_ms: Option<i64>,
    last_ping_ms: Option<i64>,
}

struct Shared {
    clock: Mutex<ClockState>,
    /// Payload schema per registered room.
    schemas: Mutex<HashMap<String, Packed>>,
    /// Rooms to re-`watch` after every (re)connect.
    watched: Mutex<BTreeSet<String>>,
}

enum Command {
    /// A post frame: queued while offline, flushed FIFO on reconnect.
    Queueable(Vec<u8>),
    /// Any other frame: sent if connected, dropped otherwise (subscriptions
    /// are re-derived from the watch set on reconnect).
    Fire(Vec<u8>),
    Close,
}

/// Handle to one logical broker connection.
pub struct BrokerClient {
    cmd_tx: UnboundedSender<Command>,
    event_rx: UnboundedReceiver<LinkEvent>,
    shared: Arc<Shared>,
    closed: bool,
}

impl BrokerClient {
    /// Spawn the driver task and return the handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(options: ClientOptions) -> Result<Self, LinkError> {
        let endpoint = endpoint::dialer().map_err(|e| LinkError::Setup(e.to_string()))?;
        let shared = Arc::new(Shared {
            clock: Mutex::new(ClockState::default()),
            schemas: Mutex::new(HashMap::new()),
            watched: Mutex::new(BTreeSet::new()),
        });
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            options,
            endpoint,
            shared: Arc::clone(&shared),
            cmd_rx,
            event_tx,
            queued: VecDeque::new(),
            backoff: Backoff::default(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            cmd_tx,
            event_rx,
            shared,
            closed: false,
        })
    }

    fn check_open(&self) -> Result<(), LinkError> {
        if self.closed {
            Err(LinkError::Closed)
        } else {
            Ok(())
        }
    }

    fn register(&self, room: &str, schema: &Packed) -> Result<(), LinkError> {
        let mut schemas = self.shared.schemas.lock().unwrap();
        match schemas.get(room) {
            Some(existing) if existing != schema => Err(LinkError::SchemaMismatch(room.to_string())),
            Some(_) => Ok(()),
            None => {
                schemas.insert(room.to_string(), schema.clone());
                Ok(())
            }
        }
    }

    fn fire(&self, msg: &ClientMessage) -> Result<(), LinkError> {
        let frame = wire::encode_client_message(msg).map_err(|e| LinkError::Wire(e.to_string()))?;
        let _ = self.cmd_tx.send(Command::Fire(frame));
        Ok(())
    }
}

impl BrokerLink for BrokerClient {
    fn watch(&mut self, room: &str, schema: &Packed) -> Result<(), LinkError> {
        self.check_open()?;
        self.register(room, schema)?;
        self.shared.watched.lock().unwrap().insert(room.to_string());
        self.fire(&ClientMessage::Watch {
            room: room.to_string(),
        })
    }

    fn load(&mut self, room: &str, from: u64, schema: &Packed) -> Result<(), LinkError> {
        self.check_open()?;
        self.register(room, schema)?;
        self.fire(&ClientMessage::Load {
            room: room.to_string(),
            from,
        })
    }

    fn post(&mut self, room: &str, data: &Value) -> Result<String, LinkError> {
        self.check_open()?;
        let time = self.server_time()?;
        let schema = {
            let schemas = self.shared.schemas.lock().unwrap();
            schemas
                .get(room)
                .cloned()
                .ok_or_else(|| LinkError::UnregisteredRoom(room.to_string()))?
        };
        let payload = tickline_codec::encode(&schema, data)?;
        let name = generate_name();
        let frame = wire::encode_client_message(&ClientMessage::Post {
            room: room.to_string(),
            time: time.max(0) as u64,
            name: name.clone(),
            payload,
        })
        .map_err(|e| LinkError::Wire(e.to_string()))?;
        let _ = self.cmd_tx.send(Command::Queueable(frame));
        Ok(name)
    }

    fn request_latest_index(&mut self, room: &str) -> Result<(), LinkError> {
        self.check_open()?;
        self.fire(&ClientMessage::GetLatestPostIndex {
            room: room.to_string(),
        })
    }

    fn synced(&self) -> bool {
        !self.closed && self.shared.clock.lock().unwrap().synced
    }

    fn server_time(&self) -> Result<i64, LinkError> {
        self.check_open()?;
        let clock = self.shared.clock.lock().unwrap();
        if !clock.synced {
            return Err(LinkError::NotSynced);
        }
        Ok(unix_millis() + clock.offset_ms)
    }

    fn ping(&self) -> Option<i64> {
        self.shared.clock.lock().unwrap().last_ping_ms
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        if self.closed {
            return None;
        }
        self.event_rx.try_recv().ok()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.cmd_tx.send(Command::Close);
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// 8 characters from the 64-symbol name alphabet, drawn from the OS RNG.
fn generate_name() -> String {
    let mut rng = rand::rngs::OsRng;
    (0..NAME_LEN)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Default)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE
            .saturating_mul(1u32 << self.attempt.min(4))
            .min(BACKOFF_CAP);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
        exp + Duration::from_millis(jitter)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum SessionEnd {
    /// The user closed the handle.
    Closed,
    /// The connection died; reconnect.
    Lost,
}

struct Driver {
    options: ClientOptions,
    endpoint: Endpoint,
    shared: Arc<Shared>,
    cmd_rx: UnboundedReceiver<Command>,
    event_tx: UnboundedSender<LinkEvent>,
    queued: VecDeque<Vec<u8>>,
    backoff: Backoff,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let Some(conn) = self.connect_phase().await else {
                break;
            };
            self.backoff.reset();
            match self.session(conn).await {
                SessionEnd::Closed => break,
                SessionEnd::Lost => continue,
            }
        }
        self.endpoint.close(0u32.into(), b"client closed");
    }

    /// Dial until a connection lands or the handle is closed.
    async fn connect_phase(&mut self) -> Option<Connection> {
        loop {
            match self.try_connect().await {
                Ok(conn) => {
                    info!(addr = %self.options.addr, "connected to broker");
                    return Some(conn);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    debug!(error = %e, ?delay, "broker connect failed, backing off");
                    if !self.wait_offline(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> anyhow::Result<Connection> {
        use anyhow::Context;
        let addr = tokio::net::lookup_host(&self.options.addr)
            .await
            .context("broker address did not resolve")?
            .next()
            .context("broker address resolved to nothing")?;
        let server_name = self
            .options
            .server_name
            .clone()
            .unwrap_or_else(|| self.options.host());
        let connecting = self
            .endpoint
            .connect(addr, &server_name)
            .context("connect setup failed")?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .context("connect timed out")?
            .context("connect failed")?;
        Ok(conn)
    }

    /// Sleep out a backoff delay while still queueing posts.
    ///
    /// Returns false when the handle was closed.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => return false,
                    Some(Command::Queueable(frame)) => self.queued.push_back(frame),
                    // Subscriptions are re-derived from the watch set on
                    // reconnect; anything else is safe to drop while offline.
                    Some(Command::Fire(_)) => {}
                },
            }
        }
    }

    async fn session(&mut self, conn: Connection) -> SessionEnd {
        let (mut send, recv) = match conn.open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                debug!(error = %e, "failed to open broker stream");
                return SessionEnd::Lost;
            }
        };

        // Frame reads are multi-step and must not be cancelled mid-frame by
        // a select, so a dedicated task owns the receive half and the
        // session selects on a channel instead.
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
                    Ok(None) | Err(_) => break,
                }
            }
        });

        let end = self.session_loop(&conn, &mut send, &mut frames).await;
        reader.abort();
        end
    }

    async fn session_loop(
        &mut self,
        conn: &Connection,
        send: &mut SendStream,
        frames: &mut UnboundedReceiver<Vec<u8>>,
    ) -> SessionEnd {
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        let cmd_rx = &mut self.cmd_rx;
        let queued = &mut self.queued;

        // Re-subscribe before anything else so the broker's drain cursor
        // starts streaming, then flush posts queued while offline in
        // submission order.
        let rooms: Vec<String> = shared.watched.lock().unwrap().iter().cloned().collect();
        for room in rooms {
            match wire::encode_client_message(&ClientMessage::Watch { room }) {
                Ok(frame) => {
                    if write_frame(send, &frame).await.is_err() {
                        return SessionEnd::Lost;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode watch"),
            }
        }
        while let Some(frame) = queued.pop_front() {
            if write_frame(send, &frame).await.is_err() {
                queued.push_front(frame);
                return SessionEnd::Lost;
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Local send time of the get_time probe awaiting its reply.
        let mut pending_probe: Option<i64> = None;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    pending_probe = Some(unix_millis());
                    match wire::encode_client_message(&ClientMessage::GetTime) {
                        Ok(frame) => {
                            if write_frame(send, &frame).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode get_time"),
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Close) => {
                        farewell(&shared, send).await;
                        conn.close(0u32.into(), b"closed by user");
                        return SessionEnd::Closed;
                    }
                    Some(Command::Queueable(frame)) => {
                        if write_frame(send, &frame).await.is_err() {
                            queued.push_back(frame);
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Command::Fire(frame)) => {
                        if write_frame(send, &frame).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                },
                frame = frames.recv() => match frame {
                    Some(bytes) => handle_frame(&shared, &event_tx, &bytes, &mut pending_probe),
                    None => {
                        debug!("broker stream ended");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }
}

/// Best-effort unwatch of every room before a user-requested close.
async fn farewell(shared: &Shared, send: &mut SendStream) {
    let rooms: Vec<String> = shared.watched.lock().unwrap().iter().cloned().collect();
    for room in rooms {
        if let Ok(frame) = wire::encode_client_message(&ClientMessage::Unwatch { room }) {
            let _ = write_frame(send, &frame).await;
        }
    }
    let _ = send.finish();
}

fn handle_frame(
    shared: &Shared,
    event_tx: &UnboundedSender<LinkEvent>,
    bytes: &[u8],
    pending_probe: &mut Option<i64>,
) {
    let msg = match wire::decode_broker_message(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "dropping undecodable broker frame");
            return;
        }
    };

    match msg {
        BrokerMessage::InfoTime { time } => {
            let Some(t0) = pending_probe.take() else {
                return;
            };
            let t1 = unix_millis();
            let rtt = t1 - t0;
            let mut clock = shared.clock.lock().unwrap();
            // The lowest round trip gives the tightest offset estimate;
            // keep it until something beats it.
            if clock.lowest_ping_ms.map_or(true, |lowest| rtt < lowest) {
                clock.offset_ms = time as i64 - (t0 + t1) / 2;
                clock.lowest_ping_ms = Some(rtt);
            }
            clock.last_ping_ms = Some(rtt);
            let first = !clock.synced;
            clock.synced = true;
            drop(clock);
            if first {
                let _ = event_tx.send(LinkEvent::Synced);
            }
        }
        BrokerMessage::InfoPost {
            room,
            index,
            server_time,
            client_time,
            name,
            payload,
        } => {
            let schema = shared.schemas.lock().unwrap().get(&room).cloned();
            let Some(schema) = schema else {
                warn!(%room, index, "post for unregistered room");
                return;
            };
            match tickline_codec::decode(&schema, &payload) {
                Ok(data) => {
                    let _ = event_tx.send(LinkEvent::Post(PostRecord {
                        room,
                        index,
                        server_time: server_time as i64,
                        client_time: client_time as i64,
                        name,
                        data,
                    }));
                }
                Err(e) => warn!(%room, index, error = %e, "failed to decode post payload"),
            }
        }
        BrokerMessage::InfoLatestPostIndex {
            room,
            latest_index,
            server_time,
        } => {
            let _ = event_tx.send(LinkEvent::LatestIndex {
                room,
                latest_index,
                server_time: server_time as i64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_names_use_the_alphabet() {
        for _ in 0..32 {
            let name = generate_name();
            assert_eq!(name.len(), NAME_LEN);
            assert!(name.bytes().all(|b| NAME_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = Backoff::default();
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= BACKOFF_BASE);
            assert!(delay <= BACKOFF_CAP + Duration::from_millis(BACKOFF_JITTER_MS));
            last = delay;
        }
        assert!(last >= BACKOFF_CAP);
    }

    #[test]
    fn test_options_host_extraction() {
        assert_eq!(ClientOptions::new("example.com:8080").host(), "example.com");
        assert_eq!(ClientOptions::new("127.0.0.1:9000").host(), "127.0.0.1");
        assert_eq!(ClientOptions::new("[::1]:9000").host(), "::1");
    }
}
