//! Query processing module
//!
//! Implements the Cypher subset NervusDB accepts:
//! - `parser`: pest grammar to AST
//! - `executor::planner`: AST to a tree of physical operators
//! - `executor`: Volcano-style execution against a committed graph or a
//!   write transaction's staged copy
//!
//! `QueryEngine` is the entry point the database uses. It caches parsed
//! statements by their text.

pub mod ast;
pub mod executor;
pub mod parser;

// Re-export main types
pub use ast::Query;
pub use executor::{
    params_from_json, ExecutionError, ExecutionResult, MutQueryExecutor, Params, PathValue, QueryExecutor,
    QueryResult, Record, Row, Value,
};
pub use parser::{parse_query, parse_standalone_expression, ParseError, ParseResult};

use crate::config::QueryLimits;
use crate::graph::{GraphStore, StagedGraph};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

/// Query engine - parses (with caching) and executes statements
pub struct QueryEngine {
    cache: Option<Mutex<LruCache<String, Arc<Query>>>>,
    limits: QueryLimits,
}

impl QueryEngine {
    /// Create a query engine caching up to `cache_capacity` parsed
    /// statements; 0 disables the cache
    pub fn new(cache_capacity: usize, limits: QueryLimits) -> Self {
        Self {
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            limits,
        }
    }

    /// Parse `text`, reusing a cached AST when the same text was seen before
    pub fn parse(&self, text: &str) -> ParseResult<Arc<Query>> {
        let Some(cache) = &self.cache else {
            return Ok(Arc::new(parse_query(text)?));
        };
        if let Some(query) = cache.lock().get(text) {
            trace!("Query cache hit");
            return Ok(Arc::clone(query));
        }
        let query = Arc::new(parse_query(text)?);
        cache.lock().put(text.to_string(), Arc::clone(&query));
        Ok(query)
    }

    /// Parse a query and check if it requires mutation (CREATE, DELETE, etc.)
    pub fn needs_mutation(&self, text: &str) -> ParseResult<bool> {
        Ok(!self.parse(text)?.is_read_only())
    }

    /// Execute a read-only statement against a committed graph
    pub fn execute(&self, query: &Query, store: &GraphStore, params: &Params) -> ExecutionResult<QueryResult> {
        QueryExecutor::new(store, params, &self.limits).execute(query)
    }

    /// Execute any statement against a write transaction's staged graph
    pub fn execute_mut(
        &self,
        query: &Query,
        staged: &mut StagedGraph,
        params: &Params,
    ) -> ExecutionResult<QueryResult> {
        MutQueryExecutor::new(staged, params, &self.limits).execute(query)
    }

    pub fn limits(&self) -> &QueryLimits {
        &self.limits
    }
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(128, QueryLimits::default())
    }
}
