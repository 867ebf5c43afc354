//! High-level Database API and REPL interface.
//!
//! [`Database`] bundles a link, its [`EngineConfig`], the connection-scope
//! hooks and the transaction manager behind one cloneable handle.

mod api;
mod repl;

pub use api::{Database, DatabaseError, DatabaseResult, EngineConfig};
pub use repl::{format_value, render_rows, Output, Repl, ReplConfig};
