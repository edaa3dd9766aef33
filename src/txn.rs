//! Write transactions
//!
//! A `WriteTxn` works on a private image of the committed graph. Statements
//! see the transaction's own earlier writes; nothing is visible to `Db`
//! readers until `commit`. A statement that fails is undone back to the
//! savepoint taken before it, and the transaction stays active.

use crate::db::Db;
use crate::error::{Error, Result};
use crate::graph::{NodeId, StagedGraph, WriteStats};
use crate::query::{ExecutionError, Params, QueryResult, QueryExecutor};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

pub struct WriteTxn<'db> {
    db: &'db Db,
    txid: u64,
    staged: Option<StagedGraph>,
    stats: WriteStats,
    state: TxnState,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(db: &'db Db, txid: u64, staged: StagedGraph) -> Self {
        Self { db, txid, staged: Some(staged), stats: WriteStats::default(), state: TxnState::Active }
    }

    pub fn id(&self) -> u64 {
        self.txid
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Counters accumulated by the statements run so far
    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    fn staged_mut(&mut self) -> Result<&mut StagedGraph> {
        match (self.state, self.staged.as_mut()) {
            (TxnState::Active, Some(staged)) => Ok(staged),
            _ => Err(Error::TxnFinished),
        }
    }

    /// Run a statement inside the transaction
    pub fn query(&mut self, text: &str) -> Result<QueryResult> {
        self.query_with_params(text, &Params::new())
    }

    pub fn query_with_params(&mut self, text: &str, params: &Params) -> Result<QueryResult> {
        let db = self.db;
        let engine = db.query_engine();
        let staged = self.staged_mut()?;
        let query = engine.parse(text)?;

        if query.is_read_only() {
            let limits = engine.limits();
            return Ok(QueryExecutor::new(staged.graph(), params, limits).execute(&query)?);
        }

        let savepoint = staged.savepoint();
        match engine.execute_mut(&query, staged, params) {
            Ok(result) => {
                let stats = staged.take_stats();
                self.stats.merge(&stats);
                Ok(result)
            }
            Err(e) => {
                if let Err(undo) = staged.rollback_to(savepoint) {
                    warn!("Txn {} could not undo a failed statement, rolling back: {}", self.txid, undo);
                    self.abandon();
                }
                Err(e.into())
            }
        }
    }

    /// Attach a vector to a node
    pub fn set_vector(&mut self, node_id: NodeId, vector: Vec<f32>) -> Result<()> {
        let staged = self.staged_mut()?;
        staged.set_vector(node_id, vector).map_err(ExecutionError::from)?;
        let stats = staged.take_stats();
        self.stats.merge(&stats);
        Ok(())
    }

    /// Make the transaction's writes durable and visible
    pub fn commit(&mut self) -> Result<()> {
        self.staged_mut()?;
        let staged = self.staged.take().ok_or(Error::TxnFinished)?;
        let outcome = self.db.commit_staged(self.txid, staged);
        self.state = if outcome.is_ok() { TxnState::Committed } else { TxnState::RolledBack };
        self.db.release_writer();
        debug!("Txn {} finished: {:?}", self.txid, self.state);
        outcome
    }

    /// Discard every write made by the transaction
    pub fn rollback(&mut self) -> Result<()> {
        self.staged_mut()?;
        self.abandon();
        debug!("Txn {} rolled back", self.txid);
        Ok(())
    }

    /// Hand the image back for reuse and release the writer slot
    fn abandon(&mut self) {
        if let Some(staged) = self.staged.take() {
            self.db.recycle_staged(staged);
        }
        self.state = TxnState::RolledBack;
        self.db.release_writer();
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.abandon();
            debug!("Txn {} dropped while active, rolled back", self.txid);
        }
    }
}
