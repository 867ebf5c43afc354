//! Link error types.

use thiserror::Error;

use crate::sql::{EvalError, ParseError};

/// Result type for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors raised while running a physical statement.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// The statement text could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// An expression in the statement could not be evaluated.
    #[error("evaluation error: {0}")]
    Eval(#[from] EvalError),

    /// The referenced table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// CREATE TABLE on an existing table.
    #[error("table already exists: {0}")]
    TableExists(String),

    /// A write was attempted in a read-only transaction.
    #[error("cannot execute {0} in a read-only transaction")]
    ReadOnly(String),

    /// The session already committed or rolled back.
    #[error("session is closed")]
    SessionClosed,

    /// ROLLBACK TO / RELEASE named a savepoint the session does not hold.
    #[error("savepoint does not exist: {0}")]
    UnknownSavepoint(String),

    /// The statement is valid SQL but not allowed here.
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// The server refused the statement.
    #[error("statement failed: {0}")]
    Rejected(String),
}
