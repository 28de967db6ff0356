//! Durable append-only log storage
//!
//! Records are newline-delimited JSON. Appends flush and fsync before
//! returning; an append failure is fatal to the daemon, which cannot make
//! further progress durable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::Job;

use super::record::{WalEvent, WalRecord};

/// Failures writing or encoding the log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only log handle. Owns the sequence counter; callers serialize
/// access through the queue core's critical section.
pub struct WalStore {
    path: PathBuf,
    file: File,
    next_seq: u64,
    bytes: u64,
}

impl WalStore {
    /// Open (or create) the log, returning the handle and the records that
    /// survived from a previous run. A truncated or corrupt tail is cut off
    /// so new appends land after the last trusted record.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<WalRecord>), WalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (records, valid_bytes) = if path.exists() {
            read_records(&path)?
        } else {
            (Vec::new(), 0)
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let actual_len = file.metadata()?.len();
        if actual_len > valid_bytes {
            warn!(
                path = %path.display(),
                discarded = actual_len - valid_bytes,
                "Discarding truncated WAL tail"
            );
            file.set_len(valid_bytes)?;
        }

        let next_seq = records.last().map(|r| r.seq + 1).unwrap_or(1);
        debug!(path = %path.display(), records = records.len(), next_seq, "WAL opened");

        Ok((
            Self {
                path,
                file,
                next_seq,
                bytes: valid_bytes,
            },
            records,
        ))
    }

    /// Append one event, assigning the next sequence number. The record is
    /// flushed and fsynced before this returns.
    pub fn append(&mut self, event: WalEvent) -> Result<u64, WalError> {
        let seq = self.next_seq;
        let record = WalRecord::new(seq, event);
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;

        self.next_seq += 1;
        self.bytes += line.len() as u64;
        Ok(seq)
    }

    /// Whether the log has grown past the compaction threshold.
    pub fn should_checkpoint(&self, threshold_bytes: u64) -> bool {
        self.bytes >= threshold_bytes
    }

    /// Current log size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.bytes
    }

    /// Next sequence number to be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Compact the log: write a fresh file whose first record snapshots the
    /// given (non-terminal) jobs, then atomically swap it in. Sequence
    /// numbers keep counting across the swap.
    pub fn checkpoint(&mut self, jobs: Vec<Job>) -> Result<(), WalError> {
        let seq = self.next_seq;
        let record = WalRecord::new(seq, WalEvent::Checkpoint { jobs });
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(line.as_bytes())?;
            tmp.flush()?;
            tmp.sync_data()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.next_seq += 1;
        self.bytes = line.len() as u64;
        debug!(path = %self.path.display(), seq, "WAL checkpointed");
        Ok(())
    }
}

/// Read all trusted records from a log file.
///
/// Parsing stops at the first unparseable or out-of-sequence line: a partial
/// write at crash time is detectable (the JSON line is cut short) and
/// everything after it is discarded. Returns the records plus the byte
/// length of the trusted prefix.
fn read_records(path: &Path) -> Result<(Vec<WalRecord>, u64), WalError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut records: Vec<WalRecord> = Vec::new();
    let mut valid_bytes: u64 = 0;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if !line.ends_with('\n') {
            // Partial final line from an interrupted write
            debug!(path = %path.display(), "WAL ends mid-record, discarding tail");
            break;
        }
        let record: WalRecord = match serde_json::from_str(line.trim_end()) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unparseable WAL record, discarding tail");
                break;
            }
        };
        if let Some(last) = records.last()
            && record.seq != last.seq + 1
        {
            warn!(
                path = %path.display(),
                expected = last.seq + 1,
                found = record.seq,
                "WAL sequence gap, discarding tail"
            );
            break;
        }
        valid_bytes += n as u64;
        records.push(record);
    }

    Ok((records, valid_bytes))
}
