//! Inputs handed to each kind of hook.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::link::Record;
use crate::model::Condition;
use crate::transaction::IsolationLevel;

/// Input of a Begin hook. Calling `next` issues the physical BEGIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginInput {
    pub transaction_id: String,
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

/// Which way a transaction is being finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalizeKind {
    Commit,
    Rollback,
}

impl fmt::Display for FinalizeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeKind::Commit => write!(f, "COMMIT"),
            FinalizeKind::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

/// Input of Commit and Rollback hooks. Calling `next` issues the physical
/// COMMIT or ROLLBACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeInput {
    pub transaction_id: String,
    pub kind: FinalizeKind,
    /// NESTED scopes still open on the handle.
    pub nesting_level: usize,
}

/// Input of a Select hook.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectInput {
    pub table: String,
    pub condition: Condition,
    pub limit: Option<usize>,
    /// Ambient transaction the query runs in, if any.
    pub transaction_id: Option<String>,
}

/// Input of an Insert hook. Rewriting `data` changes what gets inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertInput {
    pub table: String,
    pub data: Vec<Record>,
    pub transaction_id: Option<String>,
}

/// Input of an Update hook.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInput {
    pub table: String,
    pub data: Record,
    pub condition: Condition,
    pub transaction_id: Option<String>,
}

/// Input of a Delete hook.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteInput {
    pub table: String,
    pub condition: Condition,
    pub transaction_id: Option<String>,
}
