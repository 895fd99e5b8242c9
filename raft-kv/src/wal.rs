//! Write-ahead log.
//!
//! Everything a node must not forget lives here: the current term, the vote
//! cast in that term, and every log entry. Records are appended to
//! `wal.log` and fsynced before the caller acts on them, so a node never
//! acknowledges an entry or a vote that a crash could take back.
//!
//! # On-disk layout
//!
//! ```text
//! <wal_path>/
//!   wal.log        record stream: [len: u32 BE][crc32: u32 BE][bincode(WalRecord)] ...
//!   snapshot.bin   bincode(Snapshot), replaced atomically via rename
//! ```
//!
//! Replay applies records in order: `HardState` overwrites the term/vote,
//! `Entry` appends (or overwrites the tail from its index on), `Truncate`
//! drops a suffix. Entries already covered by the snapshot are skipped.
//!
//! Only the last frame may be incomplete: a crash mid-append leaves it
//! shorter than its header announces, and recovery trims it. A length over
//! [`MAX_RECORD_LEN`], a checksum mismatch, or an undecodable payload is
//! corruption wherever it occurs, and recovery refuses to continue.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::NodeId;
use crate::log::LogEntry;

const LOG_FILE: &str = "wal.log";
const LOG_TMP_FILE: &str = "wal.log.tmp";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_TMP_FILE: &str = "snapshot.bin.tmp";
const HEADER_LEN: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_RECORD_LEN: usize = 16 << 20;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("wal codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("wal corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("wal record of {0} bytes exceeds the frame limit")]
    RecordTooLarge(usize),
    #[error("wal is closed")]
    Closed,
}

/// Term and vote, which must survive restarts together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
}

/// State machine image covering the log prefix up to `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
enum WalRecord {
    HardState(HardState),
    Entry(LogEntry),
    Truncate { from_index: u64 },
}

/// Everything `recover` reconstructs from disk.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    /// Entries after the snapshot, contiguous.
    pub entries: Vec<LogEntry>,
}

#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    file: Option<File>,
}

impl Wal {
    /// Opens (creating if needed) the WAL directory. Call `recover` before
    /// appending so a torn tail is trimmed first.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, WalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let file = open_append(&dir.join(LOG_FILE))?;
        Ok(Self {
            dir,
            file: Some(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists entries in index order behind a single fsync.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<(), WalError> {
        if entries.is_empty() {
            return Ok(());
        }
        debug_assert!(entries.windows(2).all(|w| w[1].index == w[0].index + 1));
        let mut buf = Vec::new();
        for entry in entries {
            encode_record(&mut buf, &WalRecord::Entry(entry.clone()))?;
        }
        self.write_synced(&buf)
    }

    /// Drops every entry from `from_index` onward.
    pub fn truncate(&mut self, from_index: u64) -> Result<(), WalError> {
        let mut buf = Vec::new();
        encode_record(&mut buf, &WalRecord::Truncate { from_index })?;
        self.write_synced(&buf)
    }

    pub fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), WalError> {
        let mut buf = Vec::new();
        encode_record(&mut buf, &WalRecord::HardState(hard_state))?;
        self.write_synced(&buf)
    }

    /// Installs a snapshot and rewrites the record stream so it only holds
    /// the hard state and the entries after the snapshot.
    ///
    /// The snapshot file is renamed into place before the log is rewritten;
    /// a crash between the two leaves an old log whose covered entries are
    /// skipped on replay.
    pub fn save_snapshot(
        &mut self,
        snapshot: &Snapshot,
        hard_state: HardState,
        retained: &[LogEntry],
    ) -> Result<(), WalError> {
        if self.file.is_none() {
            return Err(WalError::Closed);
        }

        let bytes = bincode::serialize(snapshot)?;
        write_atomically(
            &self.dir,
            &self.dir.join(SNAPSHOT_TMP_FILE),
            &self.dir.join(SNAPSHOT_FILE),
            &bytes,
        )?;

        let mut buf = Vec::new();
        encode_record(&mut buf, &WalRecord::HardState(hard_state))?;
        for entry in retained {
            encode_record(&mut buf, &WalRecord::Entry(entry.clone()))?;
        }
        // Drop the old handle before the rename replaces the file under it.
        self.file = None;
        let log_path = self.dir.join(LOG_FILE);
        write_atomically(&self.dir, &self.dir.join(LOG_TMP_FILE), &log_path, &buf)?;
        self.file = Some(open_append(&log_path)?);

        debug!(
            index = snapshot.last_included_index,
            retained = retained.len(),
            "wal compacted"
        );
        Ok(())
    }

    /// Replays the snapshot and record stream into memory.
    pub fn recover(&mut self) -> Result<RecoveredState, WalError> {
        if self.file.is_none() {
            return Err(WalError::Closed);
        }

        let snapshot = match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(bytes) => Some(bincode::deserialize::<Snapshot>(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.last_included_index);

        let log_path = self.dir.join(LOG_FILE);
        let bytes = fs::read(&log_path)?;
        let mut state = RecoveredState {
            snapshot,
            ..RecoveredState::default()
        };

        let mut offset = 0usize;
        while offset < bytes.len() {
            let Some((record, used)) = decode_frame(&bytes[offset..], offset)? else {
                // A crash only ever tears the last frame; intact records
                // after a short frame mean its length field is damaged.
                if let Some(next) = find_intact_frame(&bytes[offset + 1..]) {
                    let reason = format!(
                        "frame is cut short but an intact record follows at {}",
                        offset + 1 + next
                    );
                    return Err(corrupt(offset, reason));
                }
                warn!(
                    path = %log_path.display(),
                    offset,
                    dropped = bytes.len() - offset,
                    "discarding torn record at wal tail"
                );
                if let Some(file) = self.file.as_mut() {
                    file.set_len(offset as u64)?;
                    file.sync_all()?;
                }
                break;
            };
            replay(&mut state, snapshot_index, offset, record)?;
            offset += used;
        }

        debug!(
            term = state.hard_state.term,
            snapshot_index,
            entries = state.entries.len(),
            "wal recovered"
        );
        Ok(state)
    }

    /// Flushes and releases the file. Further writes fail with `Closed`.
    pub fn close(&mut self) -> Result<(), WalError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn write_synced(&mut self, buf: &[u8]) -> Result<(), WalError> {
        let file = self.file.as_mut().ok_or(WalError::Closed)?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }
}

fn replay(
    state: &mut RecoveredState,
    snapshot_index: u64,
    offset: usize,
    record: WalRecord,
) -> Result<(), WalError> {
    match record {
        WalRecord::HardState(hard_state) => state.hard_state = hard_state,
        WalRecord::Entry(entry) => {
            if entry.index <= snapshot_index {
                return Ok(());
            }
            let next = snapshot_index + state.entries.len() as u64 + 1;
            if entry.index > next {
                return Err(WalError::Corrupt {
                    offset: offset as u64,
                    reason: format!("gap in log: expected index {next}, found {}", entry.index),
                });
            }
            state
                .entries
                .truncate((entry.index - snapshot_index - 1) as usize);
            state.entries.push(entry);
        }
        WalRecord::Truncate { from_index } => {
            let keep = from_index.saturating_sub(snapshot_index + 1) as usize;
            state.entries.truncate(keep);
        }
    }
    Ok(())
}

fn encode_record(buf: &mut Vec<u8>, record: &WalRecord) -> Result<(), WalError> {
    let payload = bincode::serialize(record)?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(WalError::RecordTooLarge(payload.len()));
    }
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

fn corrupt(offset: usize, reason: impl Into<String>) -> WalError {
    WalError::Corrupt {
        offset: offset as u64,
        reason: reason.into(),
    }
}

/// Decodes the frame at the start of `bytes`, which runs to the end of the
/// file. `Ok(None)` means the frame is cut short, so it is the torn tail.
fn decode_frame(bytes: &[u8], offset: usize) -> Result<Option<(WalRecord, usize)>, WalError> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(corrupt(offset, format!("frame length {len} exceeds the limit")));
    }
    let total = HEADER_LEN + len;
    if bytes.len() < total {
        return Ok(None);
    }
    let checksum = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let payload = &bytes[HEADER_LEN..total];
    if crc32fast::hash(payload) != checksum {
        return Err(corrupt(offset, "checksum mismatch"));
    }
    let record = bincode::deserialize(payload).map_err(|err| corrupt(offset, err.to_string()))?;
    Ok(Some((record, total)))
}

/// Offset of the first position in `bytes` holding a complete frame with a
/// matching checksum and a decodable record.
fn find_intact_frame(bytes: &[u8]) -> Option<usize> {
    (0..(bytes.len() + 1).saturating_sub(HEADER_LEN)).find(|&start| {
        let rest = &bytes[start..];
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len == 0 || len > MAX_RECORD_LEN || HEADER_LEN + len > rest.len() {
            return false;
        }
        let checksum = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let payload = &rest[HEADER_LEN..HEADER_LEN + len];
        crc32fast::hash(payload) == checksum
            && bincode::deserialize::<WalRecord>(payload).is_ok()
    })
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_atomically(dir: &Path, tmp: &Path, dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, dest)?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
