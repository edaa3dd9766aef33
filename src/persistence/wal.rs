//! Write-Ahead Log
//!
//! A committed transaction is durable once its `Commit` record is appended
//! (and synced, when sync mode is on). Records are length-prefixed bincode
//! with a SHA-256 derived checksum. Segments are named after the sequence
//! number preceding their first record: `wal-{seq:016x}.log`.

use crate::graph::Mutation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// WAL errors
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("WAL corruption detected at sequence {0}")]
    Corruption(u64),

    #[error("Invalid WAL entry: {0}")]
    InvalidEntry(String),

    #[error("WAL is unusable after a failed write could not be undone; reopen the database")]
    Broken,
}

pub type WalResult<T> = Result<T, WalError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// All mutations of one committed write transaction
    Commit {
        txid: u64,
        timestamp: i64,
        mutations: Vec<Mutation>,
    },
    /// Everything up to `sequence` is reflected in the storage image
    Checkpoint { sequence: u64, timestamp: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalRecord {
    sequence: u64,
    entry: WalEntry,
    checksum: u32,
}

impl WalRecord {
    fn new(sequence: u64, entry: WalEntry) -> WalResult<Self> {
        let checksum = Self::checksum_of(sequence, &entry)?;
        Ok(Self { sequence, entry, checksum })
    }

    fn checksum_of(sequence: u64, entry: &WalEntry) -> WalResult<u32> {
        let mut hasher = Sha256::new();
        hasher.update(sequence.to_le_bytes());
        hasher.update(bincode::serialize(entry)?);
        let digest = hasher.finalize();
        Ok(u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    fn verify(&self) -> bool {
        Self::checksum_of(self.sequence, &self.entry).is_ok_and(|c| c == self.checksum)
    }
}

/// Write-Ahead Log manager
pub struct Wal {
    path: PathBuf,
    current_file: Option<BufWriter<File>>,
    /// Bytes of the current segment holding complete records
    segment_len: u64,
    /// Sequence of the last record written
    sequence: u64,
    /// fsync after every append
    sync_mode: bool,
    broken: bool,
}

impl Wal {
    /// Open the log directory, creating it if needed, and position after the
    /// last intact record.
    pub fn open(path: impl AsRef<Path>, sync_mode: bool) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let mut wal = Self {
            path,
            current_file: None,
            segment_len: 0,
            sequence: 0,
            sync_mode,
            broken: false,
        };

        let mut last = Self::latest_segment_start(&wal.path)?;
        last = last.max(wal.replay(0, |_, _| Ok(()))?);
        wal.sequence = last;

        info!("Opened WAL at {:?}, sequence: {}", wal.path, wal.sequence);
        Ok(wal)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Never hand out a sequence at or below `sequence`
    pub fn advance_to(&mut self, sequence: u64) {
        if sequence > self.sequence {
            debug!("Advancing WAL sequence from {} to {}", self.sequence, sequence);
            self.sequence = sequence;
        }
    }

    /// Append an entry, returning its sequence number. On error the record
    /// is not in the log.
    pub fn append(&mut self, entry: WalEntry) -> WalResult<u64> {
        if self.broken {
            return Err(WalError::Broken);
        }
        let sequence = self.sequence + 1;
        let record = WalRecord::new(sequence, entry)?;
        let data = bincode::serialize(&record)?;
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(&data);

        if self.current_file.is_none() {
            self.open_new_file()?;
        }

        if let Err(e) = self.write_frame(&frame) {
            if let Err(cleanup) = self.discard_tail() {
                warn!("Could not remove partial WAL record {}: {}", sequence, cleanup);
                self.broken = true;
            }
            return Err(e);
        }

        self.segment_len += frame.len() as u64;
        self.sequence = sequence;
        Ok(sequence)
    }

    fn write_frame(&mut self, frame: &[u8]) -> WalResult<()> {
        let file = self.current_file.as_mut().ok_or(WalError::Broken)?;
        file.write_all(frame)?;
        file.flush()?;
        if self.sync_mode {
            file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Cut whatever part of a failed record reached the segment, so the
    /// next append does not land behind a torn record
    fn discard_tail(&mut self) -> WalResult<()> {
        let Some(writer) = self.current_file.take() else {
            return Ok(());
        };
        let (file, _unwritten) = writer.into_parts();
        if file.metadata()?.len() > self.segment_len {
            file.set_len(self.segment_len)?;
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> WalResult<()> {
        if let Some(ref mut file) = self.current_file {
            file.flush()?;
            file.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Feed every intact record with sequence >= `from_sequence` to
    /// `callback`. A torn record at the end of the log (interrupted write)
    /// ends the replay. Returns the last sequence seen.
    pub fn replay<F>(&self, from_sequence: u64, mut callback: F) -> WalResult<u64>
    where
        F: FnMut(u64, &WalEntry) -> WalResult<()>,
    {
        let files = self.wal_files()?;
        let mut last_sequence = 0u64;
        let mut replayed = 0u64;

        for file_path in files {
            let mut reader = BufReader::new(File::open(&file_path)?);
            let mut buf = Vec::new();

            loop {
                let mut len_bytes = [0u8; 4];
                match reader.read_exact(&mut len_bytes) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }

                let len = u32::from_le_bytes(len_bytes) as usize;
                buf.resize(len, 0);
                match reader.read_exact(&mut buf) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        warn!("Torn WAL record after sequence {} in {:?}", last_sequence, file_path);
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }

                let record: WalRecord = bincode::deserialize(&buf)
                    .map_err(|_| WalError::Corruption(last_sequence + 1))?;
                if !record.verify() {
                    warn!("WAL checksum mismatch at sequence {}", record.sequence);
                    return Err(WalError::Corruption(record.sequence));
                }

                last_sequence = record.sequence;
                if record.sequence < from_sequence {
                    continue;
                }
                callback(record.sequence, &record.entry)?;
                replayed += 1;
            }
        }

        debug!("Replayed {} WAL records, last sequence: {}", replayed, last_sequence);
        Ok(last_sequence)
    }

    /// Record that storage reflects everything up to `sequence` and drop the
    /// segments that are no longer needed for recovery.
    pub fn checkpoint(&mut self, sequence: u64) -> WalResult<()> {
        info!("Creating WAL checkpoint at sequence {}", sequence);

        self.flush()?;
        self.current_file = None;
        let old_files = self.wal_files()?;

        self.open_new_file()?;
        let timestamp = chrono::Utc::now().timestamp();
        self.append(WalEntry::Checkpoint { sequence, timestamp })?;
        self.flush()?;

        let current = self.segment_path(self.sequence - 1);
        for file in old_files.into_iter().filter(|f| *f != current) {
            debug!("Removing WAL segment {:?}", file);
            std::fs::remove_file(file)?;
        }
        Ok(())
    }

    fn segment_path(&self, start: u64) -> PathBuf {
        self.path.join(format!("wal-{:016x}.log", start))
    }

    fn open_new_file(&mut self) -> WalResult<()> {
        let file_path = self.segment_path(self.sequence);
        debug!("Opening WAL segment: {:?}", file_path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        self.segment_len = file.metadata()?.len();
        self.current_file = Some(BufWriter::new(file));
        Ok(())
    }

    fn parse_segment_name(name: &str) -> Option<u64> {
        let hex = name.strip_prefix("wal-")?.strip_suffix(".log")?;
        u64::from_str_radix(hex, 16).ok()
    }

    fn latest_segment_start(path: &Path) -> WalResult<u64> {
        let mut max_sequence = 0u64;
        for entry in std::fs::read_dir(path)?.flatten() {
            if let Some(seq) = entry.file_name().to_str().and_then(Self::parse_segment_name) {
                max_sequence = max_sequence.max(seq);
            }
        }
        Ok(max_sequence)
    }

    /// Segment files ordered by starting sequence
    fn wal_files(&self) -> WalResult<Vec<PathBuf>> {
        let mut files: Vec<(u64, PathBuf)> = std::fs::read_dir(&self.path)?
            .flatten()
            .filter_map(|entry| {
                let seq = entry.file_name().to_str().and_then(Self::parse_segment_name)?;
                Some((seq, entry.path()))
            })
            .collect();
        files.sort();
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeId, PropertyMap};
    use tempfile::TempDir;

    fn commit(txid: u64) -> WalEntry {
        WalEntry::Commit {
            txid,
            timestamp: 0,
            mutations: vec![Mutation::CreateNode {
                id: NodeId::new(txid),
                labels: vec![],
                properties: PropertyMap::new(),
            }],
        }
    }

    #[test]
    fn test_wal_append_and_replay() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = Wal::open(temp_dir.path(), false).unwrap();
        assert_eq!(wal.sequence(), 0);

        for i in 1..=5 {
            assert_eq!(wal.append(commit(i)).unwrap(), i);
        }
        wal.flush().unwrap();

        let mut seen = Vec::new();
        let last = wal
            .replay(3, |seq, _| {
                seen.push(seq);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![3, 4, 5]);
        assert_eq!(last, 5);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(temp_dir.path(), true).unwrap();
            wal.append(commit(1)).unwrap();
            wal.append(commit(2)).unwrap();
        }
        let mut wal = Wal::open(temp_dir.path(), true).unwrap();
        assert_eq!(wal.sequence(), 2);
        assert_eq!(wal.append(commit(3)).unwrap(), 3);
    }

    #[test]
    fn test_checkpoint_truncates_old_segments() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = Wal::open(temp_dir.path(), false).unwrap();
        for i in 1..=10 {
            wal.append(commit(i)).unwrap();
        }
        wal.checkpoint(10).unwrap();

        let mut commits = 0;
        let mut checkpoints = 0;
        wal.replay(0, |_, entry| {
            match entry {
                WalEntry::Commit { .. } => commits += 1,
                WalEntry::Checkpoint { .. } => checkpoints += 1,
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(commits, 0);
        assert_eq!(checkpoints, 1);

        drop(wal);
        let wal = Wal::open(temp_dir.path(), false).unwrap();
        assert_eq!(wal.sequence(), 11);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut wal = Wal::open(temp_dir.path(), true).unwrap();
            wal.append(commit(1)).unwrap();
        }
        let segment = temp_dir.path().join(format!("wal-{:016x}.log", 0));
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let wal = Wal::open(temp_dir.path(), true).unwrap();
        assert_eq!(wal.sequence(), 1);
    }

    #[test]
    fn test_partial_record_is_cut_before_next_append() {
        let temp_dir = TempDir::new().unwrap();
        let mut wal = Wal::open(temp_dir.path(), true).unwrap();
        wal.append(commit(1)).unwrap();

        // A write that died halfway through a frame
        if let Some(file) = wal.current_file.as_mut() {
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3]).unwrap();
            file.flush().unwrap();
        }
        wal.discard_tail().unwrap();
        assert_eq!(wal.append(commit(2)).unwrap(), 2);
        drop(wal);

        let wal = Wal::open(temp_dir.path(), true).unwrap();
        let mut seen = Vec::new();
        wal.replay(0, |seq, _| {
            seen.push(seq);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
