//! WHERE conditions for model calls.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sql::is_identifier;

/// Comparison operator of one clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

/// `column op value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

/// A conjunction of clauses. Empty matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub clauses: Vec<Clause>,
}

impl Condition {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add `column op value`.
    pub fn and(mut self, column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, CompareOp::Eq, value)
    }

    pub fn ne(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, CompareOp::NotEq, value)
    }

    pub fn lt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, CompareOp::Lt, value)
    }

    pub fn le(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, CompareOp::LtEq, value)
    }

    pub fn gt(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, CompareOp::Gt, value)
    }

    pub fn ge(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(column, CompareOp::GtEq, value)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// First column that is not a plain identifier.
    pub(crate) fn invalid_column(&self) -> Option<&str> {
        self.clauses
            .iter()
            .map(|c| c.column.as_str())
            .find(|c| !is_identifier(c))
    }

    /// ` WHERE a = ? AND b > ?` (or nothing) plus the bound values.
    pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
        if self.clauses.is_empty() {
            return (String::new(), Vec::new());
        }
        let sql = self
            .clauses
            .iter()
            .map(|c| format!("{} {} ?", c.column, c.op.as_sql()))
            .collect::<Vec<_>>()
            .join(" AND ");
        let args = self.clauses.iter().map(|c| c.value.clone()).collect();
        (format!(" WHERE {}", sql), args)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "(all)");
        }
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|c| format!("{} {} {}", c.column, c.op.as_sql(), c.value))
            .collect();
        write!(f, "{}", parts.join(" AND "))
    }
}
