//! The context value threaded through every managed call.
//!
//! A [`TxContext`] is immutable: binding or unbinding a transaction returns a
//! new context and leaves the caller's untouched, so "restoring" an outer
//! binding is just going back to the context you already had.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::{TransactionError, TransactionResult};
use super::handle::TransactionHandle;

/// Ambient transactions per connection group, plus cancellation.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    bindings: Arc<BTreeMap<String, TransactionHandle>>,
    cancel_flags: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl TxContext {
    /// An empty context: no transaction, never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context with `handle` bound for its group.
    pub fn with_transaction(&self, handle: TransactionHandle) -> Self {
        let mut bindings = (*self.bindings).clone();
        bindings.insert(handle.group().to_string(), handle);
        Self {
            bindings: Arc::new(bindings),
            ..self.clone()
        }
    }

    /// Derive a context with no transaction bound for `group`.
    pub fn without_transaction(&self, group: &str) -> Self {
        if !self.bindings.contains_key(group) {
            return self.clone();
        }
        let mut bindings = (*self.bindings).clone();
        bindings.remove(group);
        Self {
            bindings: Arc::new(bindings),
            ..self.clone()
        }
    }

    /// The open transaction bound for `group`, if any.
    ///
    /// Finalized handles are treated as absent.
    pub fn transaction(&self, group: &str) -> Option<TransactionHandle> {
        self.bindings
            .get(group)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Derive a cancellable context.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx = self.clone();
        ctx.cancel_flags.push(flag.clone());
        (ctx, CancelHandle { flag })
    }

    /// Derive a context that expires after `timeout`. An earlier deadline
    /// inherited from this context still applies.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flags.iter().any(|f| f.load(Ordering::SeqCst))
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Fail with [`TransactionError::Cancelled`] once cancelled or expired.
    pub fn ensure_active(&self) -> TransactionResult<()> {
        if self.is_cancelled() {
            return Err(TransactionError::Cancelled);
        }
        Ok(())
    }
}

/// Marks a handle suspended while alive.
///
/// Dropping the guard (including while unwinding) resumes the handle.
#[derive(Debug)]
pub(crate) struct Suspension {
    handle: Option<TransactionHandle>,
}

impl Suspension {
    pub(crate) fn new(handle: Option<TransactionHandle>) -> Self {
        if let Some(h) = &handle {
            h.suspend();
        }
        Self { handle }
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        if let Some(h) = &self.handle {
            h.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::transaction::TransactionManager;
    use crate::EngineConfig;

    fn manager() -> TransactionManager {
        TransactionManager::new(Arc::new(MemoryLink::new()), EngineConfig::default())
    }

    #[test]
    fn test_binding_does_not_touch_parent() {
        let mgr = manager();
        let root = TxContext::new();
        let handle = mgr.begin(&root, None).unwrap();
        let bound = root.with_transaction(handle.clone());

        assert!(root.transaction(mgr.group()).is_none());
        assert_eq!(bound.transaction(mgr.group()).unwrap().id(), handle.id());
        assert!(bound.without_transaction(mgr.group()).transaction(mgr.group()).is_none());
        handle.rollback().unwrap();
    }

    #[test]
    fn test_closed_handle_is_not_ambient() {
        let mgr = manager();
        let handle = mgr.begin(&TxContext::new(), None).unwrap();
        let bound = TxContext::new().with_transaction(handle.clone());
        handle.commit().unwrap();
        assert!(bound.transaction(mgr.group()).is_none());
    }

    #[test]
    fn test_groups_are_independent() {
        let mgr = manager();
        let handle = mgr.begin(&TxContext::new(), None).unwrap();
        let bound = TxContext::new().with_transaction(handle.clone());
        assert!(bound.transaction("other").is_none());
        handle.rollback().unwrap();
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let (ctx, cancel) = TxContext::new().with_cancel();
        let (child, _) = ctx.with_cancel();
        assert!(child.ensure_active().is_ok());
        cancel.cancel();
        assert!(cancel.is_cancelled());
        assert!(matches!(child.ensure_active(), Err(TransactionError::Cancelled)));
    }

    #[test]
    fn test_timeout_keeps_earliest_deadline() {
        let ctx = TxContext::new().with_timeout(Duration::from_secs(0));
        assert!(ctx.is_cancelled());
        let later = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(later.deadline(), ctx.deadline());
        assert!(later.is_cancelled());
    }

    #[test]
    fn test_suspension_guard_resumes_on_drop() {
        let mgr = manager();
        let handle = mgr.begin(&TxContext::new(), None).unwrap();
        {
            let _guard = Suspension::new(Some(handle.clone()));
            assert!(handle.is_suspended());
        }
        assert!(!handle.is_suspended());
        handle.rollback().unwrap();
    }
}
