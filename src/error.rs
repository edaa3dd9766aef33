//! Crate-level error type
//!
//! Every module has its own `thiserror` enum; `Error` wraps them for the
//! `Db` / `WriteTxn` surface and classifies each into one of four kinds so
//! callers can branch on the category without matching every variant.

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use crate::query::executor::ExecutionError;
use crate::query::parser::ParseError;
use crate::vector::VectorError;
use thiserror::Error;

/// Broad error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The query text did not parse
    Syntax,
    /// The query parsed but failed while planning or running
    Execution,
    /// The database is closed or the storage layer failed
    Storage,
    /// Recognised but not supported by this engine version
    Compatibility,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Syntax error: {0}")]
    Syntax(#[from] ParseError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database is closed")]
    Closed,

    #[error("Cannot close database while a write transaction is active")]
    WriteTxnActive,

    #[error("A write transaction is already active")]
    WriterBusy,

    #[error("Transaction already finished")]
    TxnFinished,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Syntax(ParseError::UnsupportedFeature(_)) => ErrorKind::Compatibility,
            Error::Syntax(_) => ErrorKind::Syntax,
            Error::Execution(ExecutionError::Unsupported(_)) => ErrorKind::Compatibility,
            Error::Execution(_) | Error::Vector(_) | Error::WriterBusy | Error::TxnFinished => ErrorKind::Execution,
            Error::Persistence(e) if e.is_format_mismatch() => ErrorKind::Compatibility,
            Error::Persistence(_) | Error::Config(_) | Error::Closed | Error::WriteTxnActive => ErrorKind::Storage,
        }
    }

    pub fn is_syntax(&self) -> bool {
        self.kind() == ErrorKind::Syntax
    }

    pub fn is_execution(&self) -> bool {
        self.kind() == ErrorKind::Execution
    }

    pub fn is_storage(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }

    pub fn is_compatibility(&self) -> bool {
        self.kind() == ErrorKind::Compatibility
    }
}
