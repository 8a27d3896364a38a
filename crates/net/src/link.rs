//! The link abstraction between the replay engine and a broker.
//!
//! [`BrokerLink`] is the narrow surface the engine drives; the production
//! implementation is [`crate::BrokerClient`], and [`MemoryLink`] is an
//! in-process double for deterministic tests.

use std::collections::{HashMap, VecDeque};

use tickline_codec::{Packed, Value};

use crate::error::LinkError;

/// One authoritative post as handed to the engine: broker metadata plus the
/// payload already decoded with the room's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    /// Source room.
    pub room: String,
    /// Broker-assigned index.
    pub index: u64,
    /// Broker-assigned timestamp, milliseconds.
    pub server_time: i64,
    /// Poster's clock at send time, milliseconds.
    pub client_time: i64,
    /// Poster-chosen name.
    pub name: String,
    /// Decoded payload.
    pub data: Value,
}

/// Events a link surfaces to its consumer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The clock is synced for the first time; `server_time` now works.
    Synced,
    /// An authoritative post arrived.
    Post(PostRecord),
    /// Answer to a latest-index request.
    LatestIndex {
        /// Queried room.
        room: String,
        /// Highest assigned index, `-1` when the room is empty.
        latest_index: i64,
        /// Broker clock at reply.
        server_time: i64,
    },
}

/// Alphabet for generated post names: 64 symbols so every character carries
/// six bits.
pub(crate) const NAME_ALPHABET: &[u8; 64] =
    b"_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-";

/// Length of generated post names.
pub(crate) const NAME_LEN: usize = 8;

/// One logical connection to a broker, as seen by the engine.
///
/// Implementations deliver [`LinkEvent`]s in a total order consistent with
/// the broker's per-room index order; the engine polls rather than being
/// called back, which keeps all engine mutation on the caller's task.
pub trait BrokerLink {
    /// Subscribe to live posts, registering the room's payload schema.
    fn watch(&mut self, room: &str, schema: &Packed) -> Result<(), LinkError>;

    /// Request the room's backlog starting at `from`, registering the
    /// room's payload schema.
    fn load(&mut self, room: &str, from: u64, schema: &Packed) -> Result<(), LinkError>;

    /// Submit a payload; returns the generated post name used to match the
    /// authoritative echo.
    fn post(&mut self, room: &str, data: &Value) -> Result<String, LinkError>;

    /// Ask the broker for the room's highest assigned index.
    fn request_latest_index(&mut self, room: &str) -> Result<(), LinkError>;

    /// Whether the clock has synced at least once.
    fn synced(&self) -> bool;

    /// Current estimate of the broker clock, milliseconds.
    fn server_time(&self) -> Result<i64, LinkError>;

    /// Most recent round-trip time, milliseconds, if any.
    fn ping(&self) -> Option<i64>;

    /// Next pending event, if any. Never blocks.
    fn poll_event(&mut self) -> Option<LinkEvent>;

    /// Tear the link down; all further operations fail with
    /// [`LinkError::Closed`].
    fn close(&mut self);
}

/// Deterministic in-process link for tests.
///
/// Time only moves when the test advances it, posts are captured instead of
/// sent, and incoming events are whatever the test scripts via
/// [`MemoryLink::deliver_post`] and friends.
pub struct MemoryLink {
    now_ms: i64,
    synced: bool,
    ping_ms: Option<i64>,
    closed: bool,
    next_name: u64,
    schemas: HashMap<String, Packed>,
    events: VecDeque<LinkEvent>,
    /// Posts submitted through the link: `(room, name, data)`.
    pub sent_posts: Vec<(String, String, Value)>,
    /// Rooms watched, in call order.
    pub watched: Vec<String>,
    /// Backlog requests issued, in call order.
    pub loads: Vec<(String, u64)>,
    /// Latest-index requests issued, in call order.
    pub latest_requests: Vec<String>,
}

impl MemoryLink {
    /// A fresh, unsynced link at time zero.
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            synced: false,
            ping_ms: None,
            closed: false,
            next_name: 0,
            schemas: HashMap::new(),
            events: VecDeque::new(),
            sent_posts: Vec::new(),
            watched: Vec::new(),
            loads: Vec::new(),
            latest_requests: Vec::new(),
        }
    }

    /// Mark the clock synced at `now_ms` and queue the sync event.
    pub fn sync_at(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
        if !self.synced {
            self.synced = true;
            self.events.push_back(LinkEvent::Synced);
        }
    }

    /// Move the scripted clock forward.
    pub fn advance(&mut self, delta_ms: i64) {
        self.now_ms += delta_ms;
    }

    /// Override the reported round-trip time.
    pub fn set_ping(&mut self, ping_ms: Option<i64>) {
        self.ping_ms = ping_ms;
    }

    /// Queue an authoritative post for the consumer.
    pub fn deliver_post(&mut self, record: PostRecord) {
        self.events.push_back(LinkEvent::Post(record));
    }

    /// Queue a latest-index answer for the consumer.
    pub fn deliver_latest_index(&mut self, room: &str, latest_index: i64, server_time: i64) {
        self.events.push_back(LinkEvent::LatestIndex {
            room: room.to_string(),
            latest_index,
            server_time,
        });
    }

    fn register(&mut self, room: &str, schema: &Packed) -> Result<(), LinkError> {
        match self.schemas.get(room) {
            Some(existing) if existing != schema => {
                Err(LinkError::SchemaMismatch(room.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                self.schemas.insert(room.to_string(), schema.clone());
                Ok(())
            }
        }
    }

    fn check_open(&self) -> Result<(), LinkError> {
        if self.closed {
            Err(LinkError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerLink for MemoryLink {
    fn watch(&mut self, room: &str, schema: &Packed) -> Result<(), LinkError> {
        self.check_open()?;
        self.register(room, schema)?;
        self.watched.push(room.to_string());
        Ok(())
    }

    fn load(&mut self, room: &str, from: u64, schema: &Packed) -> Result<(), LinkError> {
        self.check_open()?;
        self.register(room, schema)?;
        self.loads.push((room.to_string(), from));
        Ok(())
    }

    fn post(&mut self, room: &str, data: &Value) -> Result<String, LinkError> {
        self.check_open()?;
        if !self.synced {
            return Err(LinkError::NotSynced);
        }
        if !self.schemas.contains_key(room) {
            return Err(LinkError::UnregisteredRoom(room.to_string()));
        }
        // Deterministic names: the counter rendered in the name alphabet.
        let mut name = String::with_capacity(NAME_LEN);
        let mut n = self.next_name;
        self.next_name += 1;
        for _ in 0..NAME_LEN {
            name.push(NAME_ALPHABET[(n % 64) as usize] as char);
            n /= 64;
        }
        self.sent_posts
            .push((room.to_string(), name.clone(), data.clone()));
        Ok(name)
    }

    fn request_latest_index(&mut self, room: &str) -> Result<(), LinkError> {
        self.check_open()?;
        self.latest_requests.push(room.to_string());
        Ok(())
    }

    fn synced(&self) -> bool {
        self.synced && !self.closed
    }

    fn server_time(&self) -> Result<i64, LinkError> {
        self.check_open()?;
        if !self.synced {
            return Err(LinkError::NotSynced);
        }
        Ok(self.now_ms)
    }

    fn ping(&self) -> Option<i64> {
        self.ping_ms
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        if self.closed {
            return None;
        }
        self.events.pop_front()
    }

    fn close(&mut self) {
        self.closed = true;
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reregistering_a_room_with_another_schema_is_an_error() {
        let mut link = MemoryLink::new();
        link.watch("arena", &Packed::UInt(8)).unwrap();
        link.load("arena", 0, &Packed::UInt(8)).unwrap();
        assert!(matches!(
            link.watch("arena", &Packed::UInt(16)),
            Err(LinkError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_time_operations_fail_before_sync() {
        let mut link = MemoryLink::new();
        link.watch("arena", &Packed::UInt(8)).unwrap();
        assert!(matches!(link.server_time(), Err(LinkError::NotSynced)));
        assert!(matches!(
            link.post("arena", &tickline_codec::Value::UInt(1)),
            Err(LinkError::NotSynced)
        ));

        link.sync_at(10_000);
        assert_eq!(link.poll_event(), Some(LinkEvent::Synced));
        assert_eq!(link.server_time().unwrap(), 10_000);
    }

    #[test]
    fn test_posting_needs_a_registered_room() {
        let mut link = MemoryLink::new();
        link.sync_at(10_000);
        assert!(matches!(
            link.post("arena", &tickline_codec::Value::UInt(1)),
            Err(LinkError::UnregisteredRoom(_))
        ));
    }

    #[test]
    fn test_closed_link_rejects_everything() {
        let mut link = MemoryLink::new();
        link.sync_at(10_000);
        link.close();
        assert!(matches!(
            link.watch("arena", &Packed::UInt(8)),
            Err(LinkError::Closed)
        ));
        assert!(matches!(link.server_time(), Err(LinkError::Closed)));
        assert!(!link.synced());
        assert_eq!(link.poll_event(), None);
    }

    #[test]
    fn test_generated_names_are_distinct() {
        let mut link = MemoryLink::new();
        link.sync_at(0);
        link.watch("arena", &Packed::UInt(8)).unwrap();
        let a = link.post("arena", &tickline_codec::Value::UInt(1)).unwrap();
        let b = link.post("arena", &tickline_codec::Value::UInt(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), NAME_LEN);
    }
}
