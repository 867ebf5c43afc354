//! The database link consumed by the transaction engine.
//!
//! A [`Link`] is a pooled connection that runs statements in autocommit mode
//! and hands out [`Session`]s, one per physical transaction. The engine never
//! quotes identifiers, builds DSNs or routes between replicas; that belongs to
//! whatever implements these traits.
//!
//! [`MemoryLink`] is a complete in-memory implementation used by the CLI and
//! the test suite.

mod error;
mod memory;
mod result;

use serde_json::Value;

use crate::transaction::IsolationLevel;

pub use error::{LinkError, LinkResult};
pub use memory::{LinkStats, MemoryLink, MemorySession};
pub use result::{ExecResult, Record, Rows};

/// A pooled connection able to run statements and open transactions.
pub trait Link: Send + Sync {
    /// Run a query outside of any transaction.
    fn query(&self, sql: &str, args: &[Value]) -> LinkResult<Rows>;

    /// Run a non-query statement outside of any transaction.
    fn exec(&self, sql: &str, args: &[Value]) -> LinkResult<ExecResult>;

    /// Issue a physical BEGIN and return the session bound to it.
    fn begin(&self) -> LinkResult<Box<dyn Session>>;
}

/// One physical transaction on a dedicated connection.
///
/// Sessions are serial: callers must not issue statements concurrently.
pub trait Session: Send {
    /// Configure isolation and access mode. Called right after BEGIN.
    fn set_isolation(&mut self, isolation: IsolationLevel, read_only: bool) -> LinkResult<()>;

    /// Run a query inside the transaction.
    fn query(&mut self, sql: &str, args: &[Value]) -> LinkResult<Rows>;

    /// Run a non-query statement inside the transaction.
    fn exec(&mut self, sql: &str, args: &[Value]) -> LinkResult<ExecResult>;

    /// Issue the physical COMMIT.
    fn commit(&mut self) -> LinkResult<()>;

    /// Issue the physical ROLLBACK.
    fn rollback(&mut self) -> LinkResult<()>;
}
