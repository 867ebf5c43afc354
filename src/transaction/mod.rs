//! Transaction management.
//!
//! A [`TransactionManager`] drives one connection group. Each call states a
//! [`Propagation`] policy; the manager looks at the transaction bound to the
//! caller's [`TxContext`] and starts, joins, suspends, nests or refuses.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │   (propagation matrix, owned commit/rollback, panics)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  TxContext  │       │ Transaction │       │  Savepoint  │
//!  │  (binding)  │       │   Handle    │       │ Coordinator │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::transaction::{Propagation, TxContext, TxOptions};
//!
//! let ctx = TxContext::new();
//! manager.transaction(&ctx, None, |ctx| {
//!     let tx = ctx.transaction(manager.group()).unwrap();
//!     tx.exec(ctx, "INSERT INTO users (id) VALUES (?)", &[json!(1)])?;
//!
//!     // Runs in its own transaction; the outer one is suspended meanwhile.
//!     manager.execute(ctx, Propagation::RequiresNew.into(), None, |ctx| {
//!         audit(ctx)
//!     })
//! })?;
//! ```

mod context;
mod error;
mod handle;
mod isolation;
mod manager;
mod propagation;
mod savepoint;

pub use context::{CancelHandle, TxContext};
pub use error::{SavepointError, TransactionError, TransactionResult};
pub use handle::{TransactionHandle, TransactionInfo, TxState};
pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use propagation::{Propagation, TxOptions};
pub use savepoint::{SavepointCoordinator, SavepointMarker};
