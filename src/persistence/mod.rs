//! Durable storage for committed transactions
//!
//! A database directory holds two parts:
//! - `data/`: RocksDB image of the committed graph and vectors
//! - `wal/`: write-ahead log of committed mutation batches
//!
//! Commit appends the batch to the WAL first, then rewrites the touched
//! entities in RocksDB. Recovery loads the image and replays WAL commits
//! newer than the image's applied sequence.
//!
//! The WAL append is the commit point. If the RocksDB write after it fails,
//! the commit still stands: its mutations stay in a backlog that is written
//! together with the next commit, and the WAL is not truncated past them.

pub mod storage;
pub mod wal;

pub use storage::{LoadedImage, PersistentStorage, StorageError, StorageResult};
pub use wal::{Wal, WalEntry, WalError, WalResult};

use crate::config::DbOptions;
use crate::graph::{GraphStore, Mutation, Touched};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recovery failed at WAL sequence {sequence}: {reason}")]
    Recovery { sequence: u64, reason: String },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

impl PersistenceError {
    /// True when the on-disk data was written by an incompatible version
    pub fn is_format_mismatch(&self) -> bool {
        matches!(self, PersistenceError::Storage(StorageError::FormatMismatch { .. }))
    }
}

/// WAL plus RocksDB image for one database directory
pub struct PersistenceManager {
    base_path: PathBuf,
    storage: PersistentStorage,
    wal: Wal,
    applied_sequence: u64,
    /// Committed to the WAL but not yet reflected in the storage image
    backlog: Vec<Mutation>,
    commits_since_checkpoint: usize,
    checkpoint_interval: usize,
    #[cfg(test)]
    fail_storage_writes: bool,
}

impl PersistenceManager {
    /// Open (or create) the database directory and recover the committed graph
    pub fn open(base_path: impl AsRef<Path>, options: &DbOptions) -> PersistenceResult<(Self, GraphStore)> {
        let base_path = base_path.as_ref().to_path_buf();
        let storage_path = base_path.join("data");
        let wal_path = base_path.join("wal");
        std::fs::create_dir_all(&storage_path)?;
        std::fs::create_dir_all(&wal_path)?;

        info!("Opening database at {:?}", base_path);

        let storage = PersistentStorage::open(&storage_path)?;
        let LoadedImage { mut graph, applied_sequence } = storage.load_graph(options.vector_metric)?;

        let mut wal = Wal::open(&wal_path, options.sync_wal)?;
        wal.advance_to(applied_sequence);

        let mut replayed: Vec<Mutation> = Vec::new();
        let mut last_replayed = applied_sequence;
        wal.replay(applied_sequence + 1, |sequence, entry| {
            if let WalEntry::Commit { mutations, .. } = entry {
                for mutation in mutations {
                    graph.apply(mutation).map_err(|e| WalError::InvalidEntry(format!("sequence {}: {}", sequence, e)))?;
                }
                replayed.extend(mutations.iter().cloned());
            }
            last_replayed = sequence;
            Ok(())
        })
        .map_err(|e| match e {
            WalError::InvalidEntry(reason) => PersistenceError::Recovery { sequence: last_replayed, reason },
            other => other.into(),
        })?;

        if last_replayed > applied_sequence {
            let touched = Touched::from_mutations(&replayed);
            storage.write_commit(&graph, &touched, last_replayed)?;
            info!(
                "Recovered {} mutations from WAL (sequence {} to {})",
                replayed.len(),
                applied_sequence + 1,
                last_replayed
            );
        }

        let manager = Self {
            base_path,
            storage,
            wal,
            applied_sequence: last_replayed,
            backlog: Vec::new(),
            commits_since_checkpoint: 0,
            checkpoint_interval: options.checkpoint_interval,
            #[cfg(test)]
            fail_storage_writes: false,
        };
        Ok((manager, graph))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn applied_sequence(&self) -> u64 {
        self.applied_sequence
    }

    /// True while some committed mutations exist only in the WAL
    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Make a transaction durable. `graph` is the post-commit image the
    /// mutations produced. An error means nothing was committed; once the
    /// WAL append succeeds this returns `Ok`.
    pub fn commit(&mut self, txid: u64, mutations: &[Mutation], graph: &GraphStore) -> PersistenceResult<u64> {
        let sequence = self.wal.append(WalEntry::Commit {
            txid,
            timestamp: chrono::Utc::now().timestamp_millis(),
            mutations: mutations.to_vec(),
        })?;
        debug!("Committed txn {} as WAL sequence {} ({} mutations)", txid, sequence, mutations.len());

        let touched = Touched::from_mutations(self.backlog.iter().chain(mutations));
        match self.write_image(graph, &touched, sequence) {
            Ok(()) => {
                self.backlog.clear();
                self.applied_sequence = sequence;
            }
            Err(e) => {
                warn!("Storage write for WAL sequence {} failed, keeping it in the WAL: {}", sequence, e);
                self.backlog.extend(mutations.iter().cloned());
            }
        }

        self.commits_since_checkpoint += 1;
        if self.checkpoint_interval > 0 && self.commits_since_checkpoint >= self.checkpoint_interval {
            if let Err(e) = self.checkpoint() {
                warn!("Checkpoint after WAL sequence {} failed: {}", sequence, e);
            }
        }
        Ok(sequence)
    }

    fn write_image(&self, graph: &GraphStore, touched: &Touched, sequence: u64) -> StorageResult<()> {
        #[cfg(test)]
        if self.fail_storage_writes {
            return Err(StorageError::ColumnFamily("injected write failure".to_string()));
        }
        self.storage.write_commit(graph, touched, sequence)
    }

    #[cfg(test)]
    pub(crate) fn fail_storage_writes(&mut self, fail: bool) {
        self.fail_storage_writes = fail;
    }

    /// Flush the image and truncate the WAL. While a backlog exists the WAL
    /// still holds the only copy of those commits, so it is kept whole.
    pub fn checkpoint(&mut self) -> PersistenceResult<()> {
        self.storage.flush()?;
        if self.has_backlog() {
            warn!(
                "Skipping WAL truncation: {} mutations are not yet in storage",
                self.backlog.len()
            );
            return Ok(());
        }
        self.wal.checkpoint(self.applied_sequence)?;
        self.commits_since_checkpoint = 0;
        Ok(())
    }

    pub fn flush(&mut self) -> PersistenceResult<()> {
        self.wal.flush()?;
        self.storage.flush()?;
        Ok(())
    }

    /// Checkpoint and release the directory
    pub fn close(mut self) -> PersistenceResult<()> {
        self.checkpoint()?;
        info!("Closed database at {:?}", self.base_path);
        Ok(())
    }
}
