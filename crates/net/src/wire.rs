//! Broker wire messages and their fixed schemas.
//!
//! Every message is one codec-encoded union value. The variant names below
//! are the wire tags; their *alphabetical* order assigns the tag ordinals, so
//! renaming or adding a message is a wire-breaking change.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{anyhow, Context, Result};
use tickline_codec::{decode, encode, Packed, Value};

/// Messages sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Ask for the broker clock; answered with `info_time`.
    GetTime,
    /// Submit an input event to a room.
    Post {
        /// Target room.
        room: String,
        /// Poster's estimate of broker time, milliseconds.
        time: u64,
        /// Client-unique name used to match the authoritative echo.
        name: String,
        /// Codec-encoded payload, opaque to the broker.
        payload: Vec<u8>,
    },
    /// Ask for the room's backlog starting at `from`.
    Load {
        /// Target room.
        room: String,
        /// First index wanted; the broker never rewinds its cursor.
        from: u64,
    },
    /// Subscribe to live posts for a room.
    Watch {
        /// Target room.
        room: String,
    },
    /// Drop the live subscription for a room.
    Unwatch {
        /// Target room.
        room: String,
    },
    /// Ask for the highest assigned index in a room.
    GetLatestPostIndex {
        /// Target room.
        room: String,
    },
}

/// Messages sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    /// Broker clock at the moment of reply, milliseconds.
    InfoTime {
        /// Broker wall clock.
        time: u64,
    },
    /// One post out of a room, delivered in index order per connection.
    InfoPost {
        /// Source room.
        room: String,
        /// Broker-assigned index.
        index: u64,
        /// Broker-assigned timestamp.
        server_time: u64,
        /// Poster's clock at send time.
        client_time: u64,
        /// Poster-chosen name.
        name: String,
        /// Codec-encoded payload.
        payload: Vec<u8>,
    },
    /// Answer to `get_latest_post_index`.
    InfoLatestPostIndex {
        /// Queried room.
        room: String,
        /// Highest assigned index, `-1` when the room is empty.
        latest_index: i64,
        /// Broker wall clock at reply.
        server_time: u64,
    },
}

static CLIENT_SCHEMA: LazyLock<Packed> = LazyLock::new(|| {
    Packed::union([
        ("get_time", Packed::Struct(Vec::new())),
        (
            "post",
            Packed::structure([
                ("room", Packed::Str),
                ("time", Packed::UInt(64)),
                ("name", Packed::Str),
                ("payload", Packed::bytes()),
            ]),
        ),
        (
            "load",
            Packed::structure([("room", Packed::Str), ("from", Packed::UInt(64))]),
        ),
        ("watch", Packed::structure([("room", Packed::Str)])),
        ("unwatch", Packed::structure([("room", Packed::Str)])),
        (
            "get_latest_post_index",
            Packed::structure([("room", Packed::Str)]),
        ),
    ])
});

static BROKER_SCHEMA: LazyLock<Packed> = LazyLock::new(|| {
    Packed::union([
        ("info_time", Packed::structure([("time", Packed::UInt(64))])),
        (
            "info_post",
            Packed::structure([
                ("room", Packed::Str),
                ("index", Packed::UInt(64)),
                ("server_time", Packed::UInt(64)),
                ("client_time", Packed::UInt(64)),
                ("name", Packed::Str),
                ("payload", Packed::bytes()),
            ]),
        ),
        (
            "info_latest_post_index",
            Packed::structure([
                ("room", Packed::Str),
                ("latest_index", Packed::Int(64)),
                ("server_time", Packed::UInt(64)),
            ]),
        ),
    ])
});

/// Encode a client message into its wire bytes.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>> {
    encode(&CLIENT_SCHEMA, &msg.to_value()).context("failed to encode client message")
}

/// Decode a client message from wire bytes.
pub fn decode_client_message(bytes: &[u8]) -> Result<ClientMessage> {
    let value = decode(&CLIENT_SCHEMA, bytes).context("failed to decode client message")?;
    ClientMessage::from_value(value)
}

/// Encode a broker message into its wire bytes.
pub fn encode_broker_message(msg: &BrokerMessage) -> Result<Vec<u8>> {
    encode(&BROKER_SCHEMA, &msg.to_value()).context("failed to encode broker message")
}

/// Decode a broker message from wire bytes.
pub fn decode_broker_message(bytes: &[u8]) -> Result<BrokerMessage> {
    let value = decode(&BROKER_SCHEMA, bytes).context("failed to decode broker message")?;
    BrokerMessage::from_value(value)
}

impl ClientMessage {
    fn to_value(&self) -> Value {
        match self {
            ClientMessage::GetTime => Value::record([("$", Value::Str("get_time".into()))]),
            ClientMessage::Post {
                room,
                time,
                name,
                payload,
            } => Value::record([
                ("$", Value::Str("post".into())),
                ("room", Value::Str(room.clone())),
                ("time", Value::UInt(*time)),
                ("name", Value::Str(name.clone())),
                ("payload", bytes_value(payload)),
            ]),
            ClientMessage::Load { room, from } => Value::record([
                ("$", Value::Str("load".into())),
                ("room", Value::Str(room.clone())),
                ("from", Value::UInt(*from)),
            ]),
            ClientMessage::Watch { room } => Value::record([
                ("$", Value::Str("watch".into())),
                ("room", Value::Str(room.clone())),
            ]),
            ClientMessage::Unwatch { room } => Value::record([
                ("$", Value::Str("unwatch".into())),
                ("room", Value::Str(room.clone())),
            ]),
            ClientMessage::GetLatestPostIndex { room } => Value::record([
                ("$", Value::Str("get_latest_post_index".into())),
                ("room", Value::Str(room.clone())),
            ]),
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        let record = expect_record(value)?;
        match tag(&record)? {
            "get_time" => Ok(ClientMessage::GetTime),
            "post" => Ok(ClientMessage::Post {
                room: str_field(&record, "room")?,
                time: uint_field(&record, "time")?,
                name: str_field(&record, "name")?,
                payload: bytes_field(&record, "payload")?,
            }),
            "load" => Ok(ClientMessage::Load {
                room: str_field(&record, "room")?,
                from: uint_field(&record, "from")?,
            }),
            "watch" => Ok(ClientMessage::Watch {
                room: str_field(&record, "room")?,
            }),
            "unwatch" => Ok(ClientMessage::Unwatch {
                room: str_field(&record, "room")?,
            }),
            "get_latest_post_index" => Ok(ClientMessage::GetLatestPostIndex {
                room: str_field(&record, "room")?,
            }),
            other => Err(anyhow!("unrecognized client message tag `{other}`")),
        }
    }
}

impl BrokerMessage {
    fn to_value(&self) -> Value {
        match self {
            BrokerMessage::InfoTime { time } => Value::record([
                ("$", Value::Str("info_time".into())),
                ("time", Value::UInt(*time)),
            ]),
            BrokerMessage::InfoPost {
                room,
                index,
                server_time,
                client_time,
                name,
                payload,
            } => Value::record([
                ("$", Value::Str("info_post".into())),
                ("room", Value::Str(room.clone())),
                ("index", Value::UInt(*index)),
                ("server_time", Value::UInt(*server_time)),
                ("client_time", Value::UInt(*client_time)),
                ("name", Value::Str(name.clone())),
                ("payload", bytes_value(payload)),
            ]),
            BrokerMessage::InfoLatestPostIndex {
                room,
                latest_index,
                server_time,
            } => Value::record([
                ("$", Value::Str("info_latest_post_index".into())),
                ("room", Value::Str(room.clone())),
                ("latest_index", Value::Int(*latest_index)),
                ("server_time", Value::UInt(*server_time)),
            ]),
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        let record = expect_record(value)?;
        match tag(&record)? {
            "info_time" => Ok(BrokerMessage::InfoTime {
                time: uint_field(&record, "time")?,
            }),
            "info_post" => Ok(BrokerMessage::InfoPost {
                room: str_field(&record, "room")?,
                index: uint_field(&record, "index")?,
                server_time: uint_field(&record, "server_time")?,
                client_time: uint_field(&record, "client_time")?,
                name: str_field(&record, "name")?,
                payload: bytes_field(&record, "payload")?,
            }),
            "info_latest_post_index" => Ok(BrokerMessage::InfoLatestPostIndex {
                room: str_field(&record, "room")?,
                latest_index: int_field(&record, "latest_index")?,
                server_time: uint_field(&record, "server_time")?,
            }),
            other => Err(anyhow!("unrecognized broker message tag `{other}`")),
        }
    }
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::Seq(bytes.iter().map(|b| Value::UInt(u64::from(*b))).collect())
}

fn expect_record(value: Value) -> Result<BTreeMap<String, Value>> {
    match value {
        Value::Record(record) => Ok(record),
        other => Err(anyhow!("message is not a record: {other:?}")),
    }
}

fn tag(record: &BTreeMap<String, Value>) -> Result<&str> {
    match record.get("$") {
        Some(Value::Str(tag)) => Ok(tag),
        _ => Err(anyhow!("message record has no string tag")),
    }
}

fn field<'a>(record: &'a BTreeMap<String, Value>, name: &str) -> Result<&'a Value> {
    record
        .get(name)
        .ok_or_else(|| anyhow!("message is missing field `{name}`"))
}

fn str_field(record: &BTreeMap<String, Value>, name: &str) -> Result<String> {
    match field(record, name)? {
        Value::Str(s) => Ok(s.clone()),
        other => Err(anyhow!("field `{name}` is not a string: {other:?}")),
    }
}

fn uint_field(record: &BTreeMap<String, Value>, name: &str) -> Result<u64> {
    match field(record, name)? {
        Value::UInt(v) => Ok(*v),
        other => Err(anyhow!("field `{name}` is not an unsigned integer: {other:?}")),
    }
}

fn int_field(record: &BTreeMap<String, Value>, name: &str) -> Result<i64> {
    match field(record, name)? {
        Value::Int(v) => Ok(*v),
        other => Err(anyhow!("field `{name}` is not a signed integer: {other:?}")),
    }
}

fn bytes_field(record: &BTreeMap<String, Value>, name: &str) -> Result<Vec<u8>> {
    let Value::Seq(items) = field(record, name)? else {
        return Err(anyhow!("field `{name}` is not a byte sequence"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::UInt(b) if *b <= 0xFF => Ok(*b as u8),
            other => Err(anyhow!("field `{name}` holds a non-byte element: {other:?}")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_roundtrip() {
        let messages = [
            ClientMessage::GetTime,
            ClientMessage::Post {
                room: "arena".into(),
                time: 1_700_000_000_123,
                name: "a1b2c3d4".into(),
                payload: vec![0x00, 0xFF, 0x42],
            },
            ClientMessage::Load {
                room: "arena".into(),
                from: 17,
            },
            ClientMessage::Watch {
                room: "arena".into(),
            },
            ClientMessage::Unwatch {
                room: "arena".into(),
            },
            ClientMessage::GetLatestPostIndex {
                room: "arena".into(),
            },
        ];

        for msg in messages {
            let bytes = encode_client_message(&msg).unwrap();
            let back = decode_client_message(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_broker_messages_roundtrip() {
        let messages = [
            BrokerMessage::InfoTime { time: 12345 },
            BrokerMessage::InfoPost {
                room: "arena".into(),
                index: 9,
                server_time: 1000,
                client_time: 970,
                name: "a1b2c3d4".into(),
                payload: vec![1, 2, 3],
            },
            BrokerMessage::InfoLatestPostIndex {
                room: "arena".into(),
                latest_index: -1,
                server_time: 1000,
            },
        ];

        for msg in messages {
            let bytes = encode_broker_message(&msg).unwrap();
            let back = decode_broker_message(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_tag_ordinals_are_alphabetical() {
        // Six client variants need a 3-bit tag; the low three bits of the
        // first byte are the ordinal. Alphabetically:
        // get_latest_post_index=0, get_time=1, load=2, post=3, unwatch=4,
        // watch=5. Locked here because it is the wire contract.
        let watch = encode_client_message(&ClientMessage::Watch { room: "r".into() }).unwrap();
        assert_eq!(watch[0] & 0b111, 5);

        let get_time = encode_client_message(&ClientMessage::GetTime).unwrap();
        assert_eq!(get_time[0] & 0b111, 1);

        // Broker side uses a 2-bit tag: info_latest_post_index=0,
        // info_post=1, info_time=2.
        let info_time = encode_broker_message(&BrokerMessage::InfoTime { time: 0 }).unwrap();
        assert_eq!(info_time[0] & 0b11, 2);
    }

    #[test]
    fn test_empty_payload_allowed() {
        let msg = ClientMessage::Post {
            room: "r".into(),
            time: 0,
            name: "n".into(),
            payload: Vec::new(),
        };
        let bytes = encode_client_message(&msg).unwrap();
        assert_eq!(decode_client_message(&bytes).unwrap(), msg);
    }
}
