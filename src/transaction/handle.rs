//! A live transaction and everything hanging off it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::TxContext;
use super::error::{TransactionError, TransactionResult};
use super::isolation::IsolationLevel;
use super::savepoint::SavepointCoordinator;
use crate::hook::{self, BeginInput, FinalizeInput, FinalizeKind, HookHandler, HookRegistry};
use crate::link::{ExecResult, Link, LinkError, Rows, Session};

/// Lifecycle of a handle. Only `Open` accepts statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Open => write!(f, "open"),
            TxState::Committed => write!(f, "committed"),
            TxState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// How a handle is opened.
#[derive(Debug, Clone)]
pub(crate) struct HandleSettings {
    pub group: String,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Number of transactions suspended beneath this one.
    pub depth: usize,
    pub parent_id: Option<String>,
    pub debug: bool,
}

/// Point-in-time description of a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    pub group: String,
    pub state: TxState,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub depth: usize,
    pub parent_id: Option<String>,
    pub nesting_level: usize,
    pub suspended: bool,
    pub savepoints: Vec<String>,
    pub started_at: DateTime<Utc>,
}

struct HandleInner {
    id: String,
    group: String,
    isolation: IsolationLevel,
    read_only: bool,
    depth: usize,
    parent_id: Option<String>,
    started_at: DateTime<Utc>,
    debug: bool,
    session: Mutex<Box<dyn Session>>,
    state: Mutex<TxState>,
    finalizing: AtomicBool,
    savepoints: Mutex<SavepointCoordinator>,
    nesting_level: AtomicUsize,
    suspended: AtomicUsize,
    hooks: HookRegistry,
    connection_hooks: HookRegistry,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state == TxState::Open {
            warn!("transaction {} dropped while open; rolling back", self.id);
            if let Err(err) = self.session.get_mut().rollback() {
                warn!("rollback of dropped transaction {} failed: {}", self.id, err);
            }
        }
    }
}

/// Shared handle to one open (or finalized) transaction.
///
/// Cloning is cheap; all clones see the same state. The session is used by
/// one statement at a time.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<HandleInner>,
}

/// Non-owning reference to a handle.
#[derive(Clone)]
pub(crate) struct WeakHandle(Weak<HandleInner>);

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<TransactionHandle> {
        self.0.upgrade().map(|inner| TransactionHandle { inner })
    }
}

impl TransactionHandle {
    /// Run the Begin chain and open a session on `link`.
    ///
    /// `hooks` join the handle's own scope before the chain runs, so their
    /// Begin callback fires too.
    pub(crate) fn begin(
        ctx: &TxContext,
        link: &dyn Link,
        settings: HandleSettings,
        connection_hooks: HookRegistry,
        hooks: Option<HookHandler>,
    ) -> TransactionResult<Self> {
        ctx.ensure_active()?;
        let id = ulid::Ulid::new().to_string().to_lowercase();
        let handle_hooks = HookRegistry::new();
        if let Some(handler) = hooks {
            handle_hooks.register(handler);
        }

        let handlers = hook::collect(
            &[connection_hooks.snapshot(), handle_hooks.snapshot()],
            |h| h.begin.as_ref(),
        );
        let input = BeginInput {
            transaction_id: id.clone(),
            isolation: settings.isolation,
            read_only: settings.read_only,
        };

        let mut opened: Option<(Box<dyn Session>, IsolationLevel, bool)> = None;
        let mut open = |_: &TxContext, input: BeginInput| -> TransactionResult<()> {
            let session = open_session(link, input.isolation, input.read_only)?;
            opened = Some((session, input.isolation, input.read_only));
            Ok(())
        };
        let outcome = hook::run(ctx, &handlers, input, &mut open);

        if let Err(err) = outcome {
            if let Some((mut session, _, _)) = opened.take() {
                debug!("begin of {} failed after BEGIN; discarding session", id);
                if let Err(rb) = session.rollback() {
                    warn!("discarding session of {} failed: {}", id, rb);
                }
            }
            return Err(err);
        }

        let (session, isolation, read_only) = match opened {
            Some(opened) => opened,
            None => (
                open_session(link, settings.isolation, settings.read_only)?,
                settings.isolation,
                settings.read_only,
            ),
        };

        debug!(
            "began transaction {} (group {}, isolation {}, depth {})",
            id, settings.group, isolation, settings.depth
        );

        Ok(Self {
            inner: Arc::new(HandleInner {
                id,
                group: settings.group,
                isolation,
                read_only,
                depth: settings.depth,
                parent_id: settings.parent_id,
                started_at: Utc::now(),
                debug: settings.debug,
                session: Mutex::new(session),
                state: Mutex::new(TxState::Open),
                finalizing: AtomicBool::new(false),
                savepoints: Mutex::new(SavepointCoordinator::new()),
                nesting_level: AtomicUsize::new(0),
                suspended: AtomicUsize::new(0),
                hooks: handle_hooks,
                connection_hooks,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle(Arc::downgrade(&self.inner))
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    pub fn read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    /// Id of the transaction this one suspended, if any. Informational only.
    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent_id.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn state(&self) -> TxState {
        *self.inner.state.lock()
    }

    /// True once committed or rolled back, whatever the hooks returned.
    pub fn is_closed(&self) -> bool {
        self.state() != TxState::Open
    }

    /// NESTED scopes currently open on this handle.
    pub fn nesting_level(&self) -> usize {
        self.inner.nesting_level.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::SeqCst) > 0
    }

    /// Names of live savepoints, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.inner.savepoints.lock().names()
    }

    /// Handle-scope hooks.
    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    /// Attach a handler to this transaction. It applies to CRUD calls made
    /// inside it from now on and to its Commit/Rollback.
    pub fn hook(&self, handler: HookHandler) {
        self.inner.hooks.register(handler);
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.inner.id.clone(),
            group: self.inner.group.clone(),
            state: self.state(),
            isolation: self.inner.isolation,
            read_only: self.inner.read_only,
            depth: self.inner.depth,
            parent_id: self.inner.parent_id.clone(),
            nesting_level: self.nesting_level(),
            suspended: self.is_suspended(),
            savepoints: self.savepoints(),
            started_at: self.inner.started_at,
        }
    }

    /// Run a query inside this transaction.
    pub fn query(&self, ctx: &TxContext, sql: &str, args: &[Value]) -> TransactionResult<Rows> {
        self.ensure_usable(ctx)?;
        self.log_sql(sql, args);
        let rows = self.inner.session.lock().query(sql, args)?;
        Ok(rows)
    }

    /// Run a statement inside this transaction.
    pub fn exec(&self, ctx: &TxContext, sql: &str, args: &[Value]) -> TransactionResult<ExecResult> {
        self.ensure_usable(ctx)?;
        self.log_sql(sql, args);
        let result = self.inner.session.lock().exec(sql, args)?;
        Ok(result)
    }

    /// Commit, running the Commit chain around the physical COMMIT.
    ///
    /// A hook failing before `next` vetoes the commit: the session is rolled
    /// back (Rollback hooks do not fire) and the hook's error is returned. A
    /// hook failing after `next` cannot undo anything; the transaction stays
    /// committed and the error is returned. A failed physical COMMIT is
    /// returned even when the chain drops it.
    pub fn commit(&self) -> TransactionResult<()> {
        self.claim_finalize()?;
        let ctx = TxContext::new().with_transaction(self.clone());
        let handlers = self.finalize_chain(FinalizeKind::Commit);
        let input = self.finalize_input(FinalizeKind::Commit);

        let mut reached = false;
        let mut failure: Option<LinkError> = None;
        let mut physical = |_: &TxContext, _: FinalizeInput| -> TransactionResult<()> {
            reached = true;
            let result = self.physical_commit();
            if let Err(TransactionError::Execution(err)) = &result {
                failure = Some(err.clone());
            }
            result
        };
        let outcome = hook::run(&ctx, &handlers, input, &mut physical);
        if reached {
            // A chain that swallows a failed COMMIT must not report success.
            return match outcome {
                Ok(()) if self.state() != TxState::Committed => Err(failure
                    .map(TransactionError::from)
                    .unwrap_or_else(|| self.not_active())),
                outcome => outcome,
            };
        }

        match outcome {
            Ok(()) => self.physical_commit(),
            Err(err) => {
                debug!("commit of {} vetoed by hook: {}", self.inner.id, err);
                if let Err(rb) = self.physical_rollback() {
                    warn!("rollback after vetoed commit of {} failed: {}", self.inner.id, rb);
                }
                Err(err)
            }
        }
    }

    /// Roll back, running the Rollback chain around the physical ROLLBACK.
    ///
    /// The physical rollback always happens; the handle is rolled back even
    /// when a hook fails.
    pub fn rollback(&self) -> TransactionResult<()> {
        self.claim_finalize()?;
        let ctx = TxContext::new().with_transaction(self.clone());
        let handlers = self.finalize_chain(FinalizeKind::Rollback);
        let input = self.finalize_input(FinalizeKind::Rollback);

        let mut reached = false;
        let mut physical = |_: &TxContext, _: FinalizeInput| -> TransactionResult<()> {
            reached = true;
            self.physical_rollback()
        };
        let outcome = hook::run(&ctx, &handlers, input, &mut physical);
        if reached {
            return outcome;
        }
        let physical = self.physical_rollback();
        outcome.and(physical)
    }

    /// Create a named savepoint.
    pub fn save_point(&self, name: &str) -> TransactionResult<()> {
        self.ensure_open()?;
        let mut savepoints = self.inner.savepoints.lock();
        savepoints.check_available(name, &self.inner.id)?;
        self.raw_exec(&format!("SAVEPOINT {}", name))?;
        savepoints.register(name, &self.inner.id);
        debug!("savepoint {} in {}", name, self.inner.id);
        Ok(())
    }

    /// Undo everything since savepoint `name`. The savepoint stays usable;
    /// savepoints created after it are gone.
    pub fn rollback_to(&self, name: &str) -> TransactionResult<()> {
        self.ensure_open()?;
        let mut savepoints = self.inner.savepoints.lock();
        savepoints.lookup(name, &self.inner.id)?;
        self.raw_exec(&format!("ROLLBACK TO SAVEPOINT {}", name))?;
        savepoints.rollback_to(name, &self.inner.id)?;
        debug!("rolled back {} to savepoint {}", self.inner.id, name);
        Ok(())
    }

    /// Forget savepoint `name` and those created after it, keeping the work.
    pub fn release_savepoint(&self, name: &str) -> TransactionResult<()> {
        self.ensure_open()?;
        let mut savepoints = self.inner.savepoints.lock();
        savepoints.lookup(name, &self.inner.id)?;
        self.raw_exec(&format!("RELEASE SAVEPOINT {}", name))?;
        savepoints.release(name, &self.inner.id)?;
        Ok(())
    }

    /// Open an implicit savepoint for a NESTED scope.
    pub(crate) fn begin_nested(&self, ctx: &TxContext) -> TransactionResult<String> {
        self.ensure_usable(ctx)?;
        let mut savepoints = self.inner.savepoints.lock();
        let name = savepoints.generate_name();
        self.raw_exec(&format!("SAVEPOINT {}", name))?;
        savepoints.register(&name, &self.inner.id);
        let level = self.inner.nesting_level.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("nested scope {} in {} (level {})", name, self.inner.id, level);
        Ok(name)
    }

    /// Close a NESTED scope, keeping its work on success and undoing it
    /// otherwise. The handle stays open either way.
    pub(crate) fn end_nested(&self, name: &str, success: bool) -> TransactionResult<()> {
        let outcome = if success {
            self.release_savepoint(name)
        } else {
            self.rollback_to(name)
                .and_then(|_| self.release_savepoint(name))
        };
        let _ = self
            .inner
            .nesting_level
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        outcome
    }

    pub(crate) fn suspend(&self) {
        self.inner.suspended.fetch_add(1, Ordering::SeqCst);
        debug!("suspended transaction {}", self.inner.id);
    }

    pub(crate) fn resume(&self) {
        let _ = self
            .inner
            .suspended
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        debug!("resumed transaction {}", self.inner.id);
    }

    fn claim_finalize(&self) -> TransactionResult<()> {
        if self.is_suspended() {
            return Err(TransactionError::Suspended(self.inner.id.clone()));
        }
        if self
            .inner
            .finalizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(self.not_active());
        }
        Ok(())
    }

    fn finalize_chain(&self, kind: FinalizeKind) -> Vec<hook::HookFn<FinalizeInput, ()>> {
        hook::collect(
            &[self.inner.connection_hooks.snapshot(), self.inner.hooks.snapshot()],
            |h| match kind {
                FinalizeKind::Commit => h.commit.as_ref(),
                FinalizeKind::Rollback => h.rollback.as_ref(),
            },
        )
    }

    fn finalize_input(&self, kind: FinalizeKind) -> FinalizeInput {
        FinalizeInput {
            transaction_id: self.inner.id.clone(),
            kind,
            nesting_level: self.nesting_level(),
        }
    }

    fn physical_commit(&self) -> TransactionResult<()> {
        let result = self.inner.session.lock().commit();
        match result {
            Ok(()) => {
                self.close(TxState::Committed);
                debug!("committed transaction {}", self.inner.id);
                Ok(())
            }
            Err(err) => {
                warn!("commit of {} failed: {}; rolling back", self.inner.id, err);
                let rollback = self.inner.session.lock().rollback();
                if let Err(rb) = rollback {
                    warn!("rollback after failed commit of {} failed: {}", self.inner.id, rb);
                }
                self.close(TxState::RolledBack);
                Err(err.into())
            }
        }
    }

    fn physical_rollback(&self) -> TransactionResult<()> {
        let result = self.inner.session.lock().rollback();
        self.close(TxState::RolledBack);
        debug!("rolled back transaction {}", self.inner.id);
        Ok(result?)
    }

    fn close(&self, state: TxState) {
        *self.inner.state.lock() = state;
        self.inner.savepoints.lock().clear();
        self.inner.nesting_level.store(0, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> TransactionResult<()> {
        if self.is_closed() {
            return Err(self.not_active());
        }
        if self.is_suspended() {
            return Err(TransactionError::Suspended(self.inner.id.clone()));
        }
        Ok(())
    }

    fn ensure_usable(&self, ctx: &TxContext) -> TransactionResult<()> {
        ctx.ensure_active()?;
        self.ensure_open()
    }

    fn not_active(&self) -> TransactionError {
        TransactionError::NotActive {
            tx_id: self.inner.id.clone(),
            state: self.state().to_string(),
        }
    }

    fn raw_exec(&self, sql: &str) -> TransactionResult<()> {
        self.log_sql(sql, &[]);
        self.inner.session.lock().exec(sql, &[])?;
        Ok(())
    }

    fn log_sql(&self, sql: &str, args: &[Value]) {
        if self.inner.debug {
            debug!("[{}] {} {:?}", self.inner.id, sql, args);
        }
    }
}

fn open_session(
    link: &dyn Link,
    isolation: IsolationLevel,
    read_only: bool,
) -> TransactionResult<Box<dyn Session>> {
    let mut session = link.begin()?;
    if let Err(err) = session.set_isolation(isolation, read_only) {
        if let Err(rb) = session.rollback() {
            warn!("rollback after failed isolation setup failed: {}", rb);
        }
        return Err(err.into());
    }
    Ok(session)
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.inner.id)
            .field("group", &self.inner.group)
            .field("state", &self.state())
            .field("depth", &self.inner.depth)
            .field("nesting_level", &self.nesting_level())
            .finish()
    }
}
