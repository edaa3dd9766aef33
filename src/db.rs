//! Database handle
//!
//! `Db` owns the committed graph image and its persistence. Reads run
//! against an `Arc` snapshot of the committed graph, so they never wait on
//! a write transaction or on commit I/O; a commit only takes the snapshot
//! lock to swap in the new image. Exactly one write transaction may be
//! active: `begin_write` fails immediately while another one is open.
//!
//! The writer works on its own image rather than a fresh copy per
//! transaction. After a commit the image readers were using becomes the
//! next writer image once they let go of it, brought up to date by
//! replaying that commit's mutations.

use crate::config::DbOptions;
use crate::error::{Error, Result};
use crate::graph::{GraphStore, Mutation, NodeId, StagedGraph};
use crate::persistence::PersistenceManager;
use crate::query::{Params, QueryEngine, QueryResult, Row};
use crate::txn::WriteTxn;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Image the next write transaction starts from
enum WriterImage {
    /// Same content as the published graph
    Ready(GraphStore),
    /// The graph published before the last commit, plus that commit's mutations
    Behind(Arc<GraphStore>, Vec<Mutation>),
}

impl WriterImage {
    /// The image brought up to date, or `None` while readers still hold it
    fn into_current(self) -> Option<GraphStore> {
        match self {
            WriterImage::Ready(graph) => Some(graph),
            WriterImage::Behind(previous, mutations) => {
                let mut graph = Arc::try_unwrap(previous).ok()?;
                for mutation in &mutations {
                    if let Err(e) = graph.apply(mutation) {
                        warn!("Dropping stale writer image: {}", e);
                        return None;
                    }
                }
                Some(graph)
            }
        }
    }
}

/// An embedded graph database rooted at one directory
pub struct Db {
    path: PathBuf,
    options: DbOptions,
    /// Committed graph served to readers; `None` once closed
    published: RwLock<Option<Arc<GraphStore>>>,
    persistence: Mutex<Option<PersistenceManager>>,
    writer_image: Mutex<Option<WriterImage>>,
    queries: QueryEngine,
    writer_active: AtomicBool,
    next_txid: AtomicU64,
}

impl Db {
    /// Open (or create) a database with default options
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, DbOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (persistence, graph) = PersistenceManager::open(&path, &options)?;
        info!(
            "Opened database at {:?}: {} nodes, {} relationships, {} vectors",
            path,
            graph.node_count(),
            graph.edge_count(),
            graph.vectors().len()
        );
        let queries = QueryEngine::new(options.query_cache_capacity, options.limits.clone());
        let writer_image = WriterImage::Ready(graph.clone());
        Ok(Self {
            path,
            options,
            published: RwLock::new(Some(Arc::new(graph))),
            persistence: Mutex::new(Some(persistence)),
            writer_image: Mutex::new(Some(writer_image)),
            queries,
            writer_active: AtomicBool::new(false),
            next_txid: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    /// Checkpoint and release the storage. Closing twice is a no-op;
    /// closing with an active write transaction fails.
    pub fn close(&self) -> Result<()> {
        {
            let mut published = self.published.write();
            if published.is_none() {
                return Ok(());
            }
            if self.writer_active.load(Ordering::Acquire) {
                return Err(Error::WriteTxnActive);
            }
            *published = None;
        }
        self.writer_image.lock().take();
        if let Some(persistence) = self.persistence.lock().take() {
            persistence.close()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.published.read().is_none()
    }

    /// The latest committed graph
    pub fn snapshot(&self) -> Result<Arc<GraphStore>> {
        self.published.read().as_ref().map(Arc::clone).ok_or(Error::Closed)
    }

    /// Run a read-only statement against the committed graph
    pub fn query(&self, text: &str) -> Result<QueryResult> {
        self.query_with_params(text, &Params::new())
    }

    pub fn query_with_params(&self, text: &str, params: &Params) -> Result<QueryResult> {
        let graph = self.snapshot()?;
        let query = self.queries.parse(text)?;
        Ok(self.queries.execute(&query, &graph, params)?)
    }

    /// Run a read-only statement, returning its rows as an iterator
    pub fn query_stream(&self, text: &str) -> Result<QueryStream> {
        self.query_stream_with_params(text, &Params::new())
    }

    pub fn query_stream_with_params(&self, text: &str, params: &Params) -> Result<QueryStream> {
        let result = self.query_with_params(text, params)?;
        Ok(QueryStream { columns: result.columns, rows: result.rows.into_iter() })
    }

    /// Run one statement in its own write transaction and commit it.
    /// Returns the number of entities affected.
    pub fn execute_write(&self, text: &str) -> Result<usize> {
        self.execute_write_with_params(text, &Params::new())
    }

    pub fn execute_write_with_params(&self, text: &str, params: &Params) -> Result<usize> {
        let mut txn = self.begin_write()?;
        txn.query_with_params(text, params)?;
        let stats = txn.stats();
        txn.commit()?;
        Ok(stats.total())
    }

    /// Start the write transaction. Fails with `Error::WriterBusy` while
    /// another one is active.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        let published = {
            let guard = self.published.read();
            let graph = guard.as_ref().ok_or(Error::Closed)?;
            if self
                .writer_active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(Error::WriterBusy);
            }
            Arc::clone(graph)
        };
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        debug!("Begin write txn {}", txid);

        let reused = self.writer_image.lock().take().and_then(WriterImage::into_current);
        let base = reused.unwrap_or_else(|| {
            debug!("Txn {} copying the committed graph", txid);
            GraphStore::clone(&published)
        });
        Ok(WriteTxn::new(self, txid, StagedGraph::new(base)))
    }

    /// Nearest stored vectors to `query`, closest first
    pub fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        let graph = self.snapshot()?;
        Ok(graph.vectors().search(query, k)?)
    }

    /// Flush the committed image and truncate the WAL
    pub fn checkpoint(&self) -> Result<()> {
        let mut persistence = self.persistence.lock();
        let manager = persistence.as_mut().ok_or(Error::Closed)?;
        manager.checkpoint()?;
        info!("Checkpointed database at {:?}", self.path);
        Ok(())
    }

    pub(crate) fn query_engine(&self) -> &QueryEngine {
        &self.queries
    }

    /// Make a finished transaction durable and publish its graph. On error
    /// nothing was committed.
    pub(crate) fn commit_staged(&self, txid: u64, staged: StagedGraph) -> Result<()> {
        if !staged.is_dirty() {
            debug!("Txn {} made no changes", txid);
            self.recycle_staged(staged);
            return Ok(());
        }

        let durable = match self.persistence.lock().as_mut() {
            Some(manager) => manager.commit(txid, staged.log(), staged.graph()).map_err(Error::from),
            None => Err(Error::Closed),
        };
        if let Err(e) = durable {
            self.recycle_staged(staged);
            return Err(e);
        }

        let (graph, mutations) = staged.into_parts();
        let previous = self
            .published
            .write()
            .as_mut()
            .map(|slot| std::mem::replace(slot, Arc::new(graph)));
        *self.writer_image.lock() = previous.map(|previous| WriterImage::Behind(previous, mutations));
        Ok(())
    }

    /// Undo a transaction's writes and keep its image for the next writer
    pub(crate) fn recycle_staged(&self, staged: StagedGraph) {
        match staged.discard() {
            Ok(graph) => *self.writer_image.lock() = Some(WriterImage::Ready(graph)),
            Err(e) => warn!("Dropping writer image that could not be rolled back: {}", e),
        }
    }

    pub(crate) fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Some(persistence) = self.persistence.get_mut().take() {
            if let Err(e) = persistence.close() {
                warn!("Failed to close database at {:?}: {}", self.path, e);
            }
        }
    }
}

/// Rows of a read query, yielded in order. The row count is known up front.
#[derive(Debug)]
pub struct QueryStream {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl QueryStream {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for QueryStream {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for QueryStream {}
