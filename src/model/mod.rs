//! Minimal CRUD entry point.
//!
//! A [`Model`] targets one table. Every call builds an input, runs the
//! matching hook chain (connection, then transaction, then model scope) and
//! finally renders SQL from the possibly rewritten input. Statements go to
//! the transaction bound to the model's context, or straight to the link.

mod condition;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

pub use condition::{Clause, CompareOp, Condition};

use crate::hook::{
    self, DeleteInput, HookHandler, HookRegistry, InsertInput, SelectInput, UpdateInput,
};
use crate::link::{ExecResult, Link, Record, Rows};
use crate::sql::is_identifier;
use crate::transaction::{TransactionError, TransactionHandle, TransactionResult, TxContext};

/// CRUD access to one table.
#[derive(Clone)]
pub struct Model {
    table: String,
    link: Arc<dyn Link>,
    group: String,
    debug: bool,
    connection_hooks: HookRegistry,
    hooks: HookRegistry,
    ctx: TxContext,
}

impl Model {
    pub(crate) fn new(
        table: impl Into<String>,
        link: Arc<dyn Link>,
        group: impl Into<String>,
        debug: bool,
        connection_hooks: HookRegistry,
    ) -> Self {
        Self {
            table: table.into(),
            link,
            group: group.into(),
            debug,
            connection_hooks,
            hooks: HookRegistry::new(),
            ctx: TxContext::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Use `ctx` for every later call: its transaction, its cancellation.
    pub fn ctx(mut self, ctx: &TxContext) -> Self {
        self.ctx = ctx.clone();
        self
    }

    /// Add a model-scope handler. Other clones of this model are unaffected.
    pub fn hook(mut self, handler: HookHandler) -> Self {
        self.hooks = self.hooks.with(handler);
        self
    }

    /// All rows matching `condition`.
    pub fn all(&self, condition: Condition) -> TransactionResult<Rows> {
        self.select(condition, None)
    }

    /// The first row matching `condition`.
    pub fn one(&self, condition: Condition) -> TransactionResult<Option<Record>> {
        Ok(self.select(condition, Some(1))?.into_iter().next())
    }

    pub fn count(&self, condition: Condition) -> TransactionResult<u64> {
        Ok(self.select(condition, None)?.len() as u64)
    }

    pub fn insert(&self, record: Record) -> TransactionResult<ExecResult> {
        self.insert_batch(vec![record])
    }

    pub fn insert_batch(&self, records: Vec<Record>) -> TransactionResult<ExecResult> {
        self.ctx.ensure_active()?;
        let handle = self.ctx.transaction(&self.group);
        let handlers = hook::collect(&self.scopes(handle.as_ref()), |h| h.insert.as_ref());
        let input = InsertInput {
            table: self.table.clone(),
            data: records,
            transaction_id: handle.as_ref().map(|h| h.id().to_string()),
        };
        let mut terminal = |ctx: &TxContext, input: InsertInput| -> TransactionResult<ExecResult> {
            if input.data.is_empty() {
                return Ok(ExecResult::default());
            }
            let (sql, args) = insert_sql(&input)?;
            self.run_exec(ctx, &sql, &args)
        };
        hook::run(&self.ctx, &handlers, input, &mut terminal)
    }

    pub fn update(&self, data: Record, condition: Condition) -> TransactionResult<ExecResult> {
        self.ctx.ensure_active()?;
        let handle = self.ctx.transaction(&self.group);
        let handlers = hook::collect(&self.scopes(handle.as_ref()), |h| h.update.as_ref());
        let input = UpdateInput {
            table: self.table.clone(),
            data,
            condition,
            transaction_id: handle.as_ref().map(|h| h.id().to_string()),
        };
        let mut terminal = |ctx: &TxContext, input: UpdateInput| -> TransactionResult<ExecResult> {
            let (sql, args) = update_sql(&input)?;
            self.run_exec(ctx, &sql, &args)
        };
        hook::run(&self.ctx, &handlers, input, &mut terminal)
    }

    pub fn delete(&self, condition: Condition) -> TransactionResult<ExecResult> {
        self.ctx.ensure_active()?;
        let handle = self.ctx.transaction(&self.group);
        let handlers = hook::collect(&self.scopes(handle.as_ref()), |h| h.delete.as_ref());
        let input = DeleteInput {
            table: self.table.clone(),
            condition,
            transaction_id: handle.as_ref().map(|h| h.id().to_string()),
        };
        let mut terminal = |ctx: &TxContext, input: DeleteInput| -> TransactionResult<ExecResult> {
            check_identifier(&input.table)?;
            check_condition(&input.condition)?;
            let (filter, args) = input.condition.to_sql();
            let sql = format!("DELETE FROM {}{}", input.table, filter);
            self.run_exec(ctx, &sql, &args)
        };
        hook::run(&self.ctx, &handlers, input, &mut terminal)
    }

    fn select(&self, condition: Condition, limit: Option<usize>) -> TransactionResult<Rows> {
        self.ctx.ensure_active()?;
        let handle = self.ctx.transaction(&self.group);
        let handlers = hook::collect(&self.scopes(handle.as_ref()), |h| h.select.as_ref());
        let input = SelectInput {
            table: self.table.clone(),
            condition,
            limit,
            transaction_id: handle.as_ref().map(|h| h.id().to_string()),
        };
        let mut terminal = |ctx: &TxContext, input: SelectInput| -> TransactionResult<Rows> {
            check_identifier(&input.table)?;
            check_condition(&input.condition)?;
            let (filter, args) = input.condition.to_sql();
            let mut sql = format!("SELECT * FROM {}{}", input.table, filter);
            if let Some(limit) = input.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }
            self.run_query(ctx, &sql, &args)
        };
        hook::run(&self.ctx, &handlers, input, &mut terminal)
    }

    fn scopes(&self, handle: Option<&TransactionHandle>) -> Vec<Arc<Vec<HookHandler>>> {
        let mut scopes = vec![self.connection_hooks.snapshot()];
        if let Some(handle) = handle {
            scopes.push(handle.hooks().snapshot());
        }
        scopes.push(self.hooks.snapshot());
        scopes
    }

    fn run_query(&self, ctx: &TxContext, sql: &str, args: &[Value]) -> TransactionResult<Rows> {
        ctx.ensure_active()?;
        match ctx.transaction(&self.group) {
            Some(handle) => handle.query(ctx, sql, args),
            None => {
                self.log_sql(sql, args);
                Ok(self.link.query(sql, args)?)
            }
        }
    }

    fn run_exec(&self, ctx: &TxContext, sql: &str, args: &[Value]) -> TransactionResult<ExecResult> {
        ctx.ensure_active()?;
        match ctx.transaction(&self.group) {
            Some(handle) => handle.exec(ctx, sql, args),
            None => {
                self.log_sql(sql, args);
                Ok(self.link.exec(sql, args)?)
            }
        }
    }

    fn log_sql(&self, sql: &str, args: &[Value]) {
        if self.debug {
            debug!("[{}] {} {:?}", self.group, sql, args);
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("table", &self.table)
            .field("group", &self.group)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

fn check_identifier(name: &str) -> TransactionResult<()> {
    if !is_identifier(name) {
        return Err(TransactionError::InvalidOperation(format!(
            "invalid identifier: {:?}",
            name
        )));
    }
    Ok(())
}

fn check_condition(condition: &Condition) -> TransactionResult<()> {
    match condition.invalid_column() {
        Some(column) => check_identifier(column),
        None => Ok(()),
    }
}

fn insert_sql(input: &InsertInput) -> TransactionResult<(String, Vec<Value>)> {
    check_identifier(&input.table)?;
    let columns: BTreeSet<&String> = input.data.iter().flat_map(|r| r.keys()).collect();
    if columns.is_empty() {
        return Err(TransactionError::InvalidOperation(
            "insert without columns".into(),
        ));
    }
    for column in &columns {
        check_identifier(column)?;
    }

    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
    let mut args = Vec::with_capacity(columns.len() * input.data.len());
    for record in &input.data {
        for column in &columns {
            args.push(record.get(*column).cloned().unwrap_or(Value::Null));
        }
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        input.table,
        columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", "),
        vec![placeholders; input.data.len()].join(", ")
    );
    Ok((sql, args))
}

fn update_sql(input: &UpdateInput) -> TransactionResult<(String, Vec<Value>)> {
    check_identifier(&input.table)?;
    check_condition(&input.condition)?;
    if input.data.is_empty() {
        return Err(TransactionError::InvalidOperation(
            "update without data".into(),
        ));
    }
    let mut sets = Vec::with_capacity(input.data.len());
    let mut args = Vec::with_capacity(input.data.len() + input.condition.clauses.len());
    for (column, value) in &input.data {
        check_identifier(column)?;
        sets.push(format!("{} = ?", column));
        args.push(value.clone());
    }
    let (filter, filter_args) = input.condition.to_sql();
    args.extend(filter_args);
    Ok((format!("UPDATE {} SET {}{}", input.table, sets.join(", "), filter), args))
}
