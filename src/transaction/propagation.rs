//! Propagation policies and per-call transaction options.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::IsolationLevel;

/// How a unit of work relates to the transaction already bound to its
/// context, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the current transaction, or start one.
    #[default]
    Required,
    /// Always start an independent transaction, suspending the current one.
    RequiresNew,
    /// Run inside a savepoint of the current transaction, or start one.
    Nested,
    /// Join the current transaction, or run without one.
    Supports,
    /// Suspend the current transaction and run without one.
    NotSupported,
    /// Join the current transaction; fail if there is none.
    Mandatory,
    /// Run without a transaction; fail if there is one.
    Never,
}

impl Propagation {
    /// All policies, in declaration order.
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::RequiresNew,
        Propagation::Nested,
        Propagation::Supports,
        Propagation::NotSupported,
        Propagation::Mandatory,
        Propagation::Never,
    ];

    /// Upper-case name, as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Nested => "NESTED",
            Propagation::Supports => "SUPPORTS",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Mandatory => "MANDATORY",
            Propagation::Never => "NEVER",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_uppercase().replace([' ', '-'], "_");
        Propagation::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| format!("unknown propagation: {}", s))
    }
}

/// Options for one managed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    pub propagation: Propagation,
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

impl TxOptions {
    /// Options with the given propagation and driver defaults otherwise.
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    /// Set the isolation level used if a transaction is started.
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Start read-only transactions.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl From<Propagation> for TxOptions {
    fn from(propagation: Propagation) -> Self {
        TxOptions::new(propagation)
    }
}
