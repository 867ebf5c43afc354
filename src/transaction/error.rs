//! Transaction error types.

use thiserror::Error;

use super::Propagation;
use crate::link::LinkError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Savepoint misuse, detected before anything reaches the link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SavepointError {
    /// A live savepoint already uses this name.
    #[error("savepoint {name} already exists in transaction {tx_id}")]
    Duplicate { name: String, tx_id: String },

    /// No live savepoint has this name.
    #[error("savepoint {name} does not exist in transaction {tx_id}")]
    Unknown { name: String, tx_id: String },

    /// Names must be plain identifiers.
    #[error("invalid savepoint name: {0:?}")]
    InvalidName(String),
}

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The propagation policy forbids running in the current context.
    #[error("propagation {propagation} violated: {reason}")]
    PropagationViolation {
        propagation: Propagation,
        reason: String,
    },

    /// A hook handler refused the operation.
    #[error("hook failed: {0}")]
    Hook(String),

    /// The link failed to run a statement.
    #[error("execution failed: {0}")]
    Execution(#[from] LinkError),

    #[error(transparent)]
    Savepoint(#[from] SavepointError),

    /// Transaction was already committed or rolled back.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive { tx_id: String, state: String },

    /// The transaction is suspended by a REQUIRES_NEW or NOT_SUPPORTED call.
    #[error("transaction {0} is suspended")]
    Suspended(String),

    /// The context was cancelled or its deadline passed.
    #[error("context cancelled")]
    Cancelled,

    /// The unit of work panicked; the transaction was cleaned up.
    #[error("unit of work panicked: {message}")]
    Panicked { message: String },

    /// Invalid operation for current transaction state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// An error raised by the caller's own code.
    #[error(transparent)]
    Application(Box<dyn std::error::Error + Send + Sync>),
}

impl TransactionError {
    /// Create a hook error.
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook(message.into())
    }

    /// Wrap any caller error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Application(err.into())
    }

    pub(crate) fn violation(propagation: Propagation, reason: impl Into<String>) -> Self {
        Self::PropagationViolation {
            propagation,
            reason: reason.into(),
        }
    }

    /// Check if this is a propagation violation.
    pub fn is_violation(&self) -> bool {
        matches!(self, TransactionError::PropagationViolation { .. })
    }

    /// Build a [`TransactionError::Panicked`] from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { message }
    }
}
