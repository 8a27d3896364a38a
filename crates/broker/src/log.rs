//! Per-room append-only record logs.
//!
//! Each room `R` persists as two files under the data directory:
//! `R.dat`, the length-prefixed records, and `R.idx`, a flat array of `u64`
//! byte offsets into `R.dat`, one per record in index order.
//!
//! Record layout in `R.dat`, little-endian:
//! `[u32 record_len][u64 server_time][u64 client_time][u32 name_len]
//! [name bytes][u32 payload_len][payload bytes]` — `record_len` covers every
//! byte after itself.
//!
//! A record's index is its position in the offset table, so indices are
//! `0, 1, 2, …` with no gaps by construction. Appends write `.dat` before
//! `.idx`: on a clean shutdown a record is indexed iff it is fully on disk,
//! and after a crash the orphan tail of `.dat` is truncated on open.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fixed part of a record after the length prefix: two `u64` timestamps and
/// two `u32` lengths.
const RECORD_FIXED_LEN: usize = 8 + 8 + 4 + 4;

/// Longest accepted room name.
const MAX_ROOM_NAME_LEN: usize = 64;

/// One persisted post, minus the room and index (the file and the offset
/// table carry those).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPost {
    /// Broker-assigned timestamp, milliseconds.
    pub server_time: u64,
    /// Poster's clock at send time, milliseconds.
    pub client_time: u64,
    /// Poster-chosen name.
    pub name: String,
    /// Codec-encoded payload, opaque to the broker.
    pub payload: Vec<u8>,
}

/// All room logs under one data directory, opened lazily and cached with
/// their offset tables.
pub struct RoomStore {
    dir: PathBuf,
    rooms: HashMap<String, RoomLog>,
}

impl RoomStore {
    /// Open (creating if needed) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data directory {dir:?}"))?;
        Ok(Self {
            dir,
            rooms: HashMap::new(),
        })
    }

    /// Append a post to a room; returns the assigned index.
    pub fn append(&mut self, room: &str, post: &StoredPost) -> Result<u64> {
        self.room(room)?.append(post)
    }

    /// Random-access read of one record.
    pub fn get(&mut self, room: &str, index: u64) -> Result<Option<StoredPost>> {
        self.room(room)?.get(index)
    }

    /// Number of records in a room.
    pub fn count(&mut self, room: &str) -> Result<u64> {
        Ok(self.room(room)?.count())
    }

    fn room(&mut self, room: &str) -> Result<&mut RoomLog> {
        validate_room_name(room)?;
        if !self.rooms.contains_key(room) {
            let log = RoomLog::open(&self.dir, room)?;
            self.rooms.insert(room.to_string(), log);
        }
        Ok(self.rooms.get_mut(room).expect("room cached above"))
    }
}

/// Reject room names that could escape the data directory or collide with
/// log file suffixes.
pub fn validate_room_name(room: &str) -> Result<()> {
    if room.is_empty() || room.len() > MAX_ROOM_NAME_LEN {
        bail!("room name must be 1..={MAX_ROOM_NAME_LEN} bytes");
    }
    if !room
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        bail!("room name may only contain [A-Za-z0-9_-]");
    }
    Ok(())
}

struct RoomLog {
    dat: File,
    idx: File,
    offsets: Vec<u64>,
    dat_len: u64,
}

impl RoomLog {
    fn open(dir: &Path, room: &str) -> Result<Self> {
        let dat_path = dir.join(format!("{room}.dat"));
        let idx_path = dir.join(format!("{room}.idx"));

        let dat_exists = dat_path.exists();
        let idx_exists = idx_path.exists();

        let mut dat = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&dat_path)
            .with_context(|| format!("failed to open {dat_path:?}"))?;

        let offsets = if idx_exists {
            read_index(&idx_path)?
        } else if dat_exists {
            warn!(room, "index file missing, rebuilding from data file");
            let offsets = rebuild_index(&mut dat)?;
            write_index(&idx_path, &offsets)?;
            offsets
        } else {
            Vec::new()
        };

        let idx = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&idx_path)
            .with_context(|| format!("failed to open {idx_path:?}"))?;

        // Trim any orphan tail past the last indexed record (crash between
        // the .dat write and the .idx write).
        let indexed_end = match offsets.last() {
            Some(&last) => {
                let len = read_record_len(&mut dat, last)?;
                last + 4 + u64::from(len)
            }
            None => 0,
        };
        let dat_len = dat.metadata()?.len();
        if dat_len > indexed_end {
            warn!(
                room,
                orphan_bytes = dat_len - indexed_end,
                "truncating unindexed tail"
            );
            dat.set_len(indexed_end)?;
        } else if dat_len < indexed_end {
            bail!("room `{room}`: index references {indexed_end} bytes but data file has {dat_len}");
        }

        debug!(room, records = offsets.len(), "room log opened");
        Ok(Self {
            dat,
            idx,
            offsets,
            dat_len: indexed_end,
        })
    }

    fn append(&mut self, post: &StoredPost) -> Result<u64> {
        let index = self.offsets.len() as u64;
        let offset = self.dat_len;

        let body_len = RECORD_FIXED_LEN + post.name.len() + post.payload.len();
        let mut record = Vec::with_capacity(4 + body_len);
        record.extend_from_slice(&(body_len as u32).to_le_bytes());
        record.extend_from_slice(&post.server_time.to_le_bytes());
        record.extend_from_slice(&post.client_time.to_le_bytes());
        record.extend_from_slice(&(post.name.len() as u32).to_le_bytes());
        record.extend_from_slice(post.name.as_bytes());
        record.extend_from_slice(&(post.payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&post.payload);

        // Data first, index second: a record exists iff it is indexed.
        self.dat.seek(SeekFrom::Start(offset))?;
        self.dat.write_all(&record).context("failed to append record")?;
        self.idx
            .write_all(&offset.to_le_bytes())
            .context("failed to append index entry")?;

        self.offsets.push(offset);
        self.dat_len = offset + record.len() as u64;
        Ok(index)
    }

    fn get(&mut self, index: u64) -> Result<Option<StoredPost>> {
        let Some(&offset) = self.offsets.get(index as usize) else {
            return Ok(None);
        };
        let len = read_record_len(&mut self.dat, offset)?;
        let mut body = vec![0u8; len as usize];
        self.dat.read_exact(&mut body).context("record body truncated")?;
        parse_record(&body).map(Some)
    }

    fn count(&self) -> u64 {
        self.offsets.len() as u64
    }
}

fn read_record_len(dat: &mut File, offset: u64) -> Result<u32> {
    let mut len_bytes = [0u8; 4];
    dat.seek(SeekFrom::Start(offset))?;
    dat.read_exact(&mut len_bytes).context("record length truncated")?;
    Ok(u32::from_le_bytes(len_bytes))
}

fn parse_record(body: &[u8]) -> Result<StoredPost> {
    if body.len() < RECORD_FIXED_LEN {
        bail!("record body of {} bytes is shorter than the fixed header", body.len());
    }
    let server_time = u64::from_le_bytes(body[0..8].try_into().expect("sliced"));
    let client_time = u64::from_le_bytes(body[8..16].try_into().expect("sliced"));
    let name_len = u32::from_le_bytes(body[16..20].try_into().expect("sliced")) as usize;

    let name_end = 20 + name_len;
    if body.len() < name_end + 4 {
        bail!("record name overruns the record body");
    }
    let name = std::str::from_utf8(&body[20..name_end])
        .context("record name is not UTF-8")?
        .to_string();

    let payload_len =
        u32::from_le_bytes(body[name_end..name_end + 4].try_into().expect("sliced")) as usize;
    let payload_end = name_end + 4 + payload_len;
    if body.len() != payload_end {
        bail!(
            "record payload length disagrees with record length ({} != {})",
            body.len(),
            payload_end
        );
    }
    let payload = body[name_end + 4..payload_end].to_vec();

    Ok(StoredPost {
        server_time,
        client_time,
        name,
        payload,
    })
}

fn read_index(path: &Path) -> Result<Vec<u64>> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
    if bytes.len() % 8 != 0 {
        bail!("corrupt index {path:?}: {} bytes is not a multiple of 8", bytes.len());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("chunked")))
        .collect())
}

fn write_index(path: &Path, offsets: &[u64]) -> Result<()> {
    let mut bytes = Vec::with_capacity(offsets.len() * 8);
    for offset in offsets {
        bytes.extend_from_slice(&offset.to_le_bytes());
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {path:?}"))
}

/// Scan a data file record by record, dropping a trailing partial record.
fn rebuild_index(dat: &mut File) -> Result<Vec<u64>> {
    let size = dat.metadata()?.len();
    let mut offsets = Vec::new();
    let mut offset = 0u64;

    while offset + 4 <= size {
        let len = u64::from(read_record_len(dat, offset)?);
        if offset + 4 + len > size {
            break;
        }
        offsets.push(offset);
        offset += 4 + len;
    }

    if offset < size {
        warn!(
            partial_bytes = size - offset,
            "dropping trailing partial record"
        );
        dat.set_len(offset)?;
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn post(n: u64) -> StoredPost {
        StoredPost {
            server_time: 1000 + n,
            client_time: 990 + n,
            name: format!("name-{n:03}"),
            payload: vec![n as u8; (n % 7) as usize + 1],
        }
    }

    #[test]
    fn test_appends_assign_contiguous_indices() {
        let dir = tempdir().unwrap();
        let mut store = RoomStore::open(dir.path()).unwrap();

        for n in 0..25 {
            assert_eq!(store.append("arena", &post(n)).unwrap(), n);
        }
        assert_eq!(store.count("arena").unwrap(), 25);
    }

    #[test]
    fn test_get_roundtrips_records() {
        let dir = tempdir().unwrap();
        let mut store = RoomStore::open(dir.path()).unwrap();

        for n in 0..10 {
            store.append("arena", &post(n)).unwrap();
        }
        for n in (0..10).rev() {
            assert_eq!(store.get("arena", n).unwrap().unwrap(), post(n));
        }
        assert_eq!(store.get("arena", 10).unwrap(), None);
    }

    #[test]
    fn test_rooms_are_independent() {
        let dir = tempdir().unwrap();
        let mut store = RoomStore::open(dir.path()).unwrap();

        store.append("alpha", &post(0)).unwrap();
        store.append("beta", &post(1)).unwrap();
        assert_eq!(store.append("alpha", &post(2)).unwrap(), 1);
        assert_eq!(store.count("beta").unwrap(), 1);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempdir().unwrap();
        {
            let mut store = RoomStore::open(dir.path()).unwrap();
            for n in 0..5 {
                store.append("arena", &post(n)).unwrap();
            }
        }
        let mut store = RoomStore::open(dir.path()).unwrap();
        assert_eq!(store.count("arena").unwrap(), 5);
        assert_eq!(store.get("arena", 3).unwrap().unwrap(), post(3));
        assert_eq!(store.append("arena", &post(5)).unwrap(), 5);
    }

    #[test]
    fn test_missing_index_is_rebuilt() {
        let dir = tempdir().unwrap();
        {
            let mut store = RoomStore::open(dir.path()).unwrap();
            for n in 0..4 {
                store.append("arena", &post(n)).unwrap();
            }
        }
        fs::remove_file(dir.path().join("arena.idx")).unwrap();

        let mut store = RoomStore::open(dir.path()).unwrap();
        assert_eq!(store.count("arena").unwrap(), 4);
        assert_eq!(store.get("arena", 2).unwrap().unwrap(), post(2));
    }

    #[test]
    fn test_rebuild_truncates_partial_record() {
        let dir = tempdir().unwrap();
        {
            let mut store = RoomStore::open(dir.path()).unwrap();
            for n in 0..3 {
                store.append("arena", &post(n)).unwrap();
            }
        }
        fs::remove_file(dir.path().join("arena.idx")).unwrap();

        // Simulate a crash mid-append: a record length promising more bytes
        // than the file holds.
        let dat_path = dir.path().join("arena.dat");
        let mut dat = OpenOptions::new().append(true).open(&dat_path).unwrap();
        dat.write_all(&100u32.to_le_bytes()).unwrap();
        dat.write_all(&[0xAB; 10]).unwrap();
        drop(dat);

        let mut store = RoomStore::open(dir.path()).unwrap();
        assert_eq!(store.count("arena").unwrap(), 3);
        assert_eq!(store.get("arena", 2).unwrap().unwrap(), post(2));
        // The partial tail is gone; appending continues cleanly.
        assert_eq!(store.append("arena", &post(3)).unwrap(), 3);
        assert_eq!(store.get("arena", 3).unwrap().unwrap(), post(3));
    }

    #[test]
    fn test_unindexed_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut store = RoomStore::open(dir.path()).unwrap();
            for n in 0..3 {
                store.append("arena", &post(n)).unwrap();
            }
        }
        // A fully written record that never made it into the index.
        let dat_path = dir.path().join("arena.dat");
        let mut dat = OpenOptions::new().append(true).open(&dat_path).unwrap();
        dat.write_all(&24u32.to_le_bytes()).unwrap();
        dat.write_all(&[0u8; 24]).unwrap();
        drop(dat);

        let mut store = RoomStore::open(dir.path()).unwrap();
        assert_eq!(store.count("arena").unwrap(), 3);
        assert_eq!(store.append("arena", &post(3)).unwrap(), 3);
        assert_eq!(store.get("arena", 3).unwrap().unwrap(), post(3));
    }

    #[test]
    fn test_corrupt_index_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let mut store = RoomStore::open(dir.path()).unwrap();
            store.append("arena", &post(0)).unwrap();
        }
        let idx_path = dir.path().join("arena.idx");
        let mut idx = OpenOptions::new().append(true).open(&idx_path).unwrap();
        idx.write_all(&[0xFF; 3]).unwrap();
        drop(idx);

        let mut store = RoomStore::open(dir.path()).unwrap();
        let err = store.count("arena").unwrap_err();
        assert!(err.to_string().contains("corrupt index"));
    }

    #[test]
    fn test_room_names_are_validated() {
        let dir = tempdir().unwrap();
        let mut store = RoomStore::open(dir.path()).unwrap();

        assert!(store.count("room-a_1").is_ok());
        assert!(store.count("").is_err());
        assert!(store.count("../escape").is_err());
        assert!(store.count("white space").is_err());
        assert!(store.count(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_empty_payload_and_name_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = RoomStore::open(dir.path()).unwrap();

        let empty = StoredPost {
            server_time: 7,
            client_time: 7,
            name: String::new(),
            payload: Vec::new(),
        };
        store.append("arena", &empty).unwrap();
        assert_eq!(store.get("arena", 0).unwrap().unwrap(), empty);
    }
}
