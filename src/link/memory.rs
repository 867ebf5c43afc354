//! In-memory link backed by a shared table store.
//!
//! Writes land in the shared store immediately. Every session keeps an undo
//! journal of what it changed, so ROLLBACK (and ROLLBACK TO SAVEPOINT) replays
//! the journal backwards. Two sessions touching different rows never clobber
//! each other's work on commit.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::error::{LinkError, LinkResult};
use super::result::{ExecResult, Record, Rows};
use super::{Link, Session};
use crate::sql::{
    evaluate, matches_where, CreateTable, Delete, DropTable, Insert, Parser, Select,
    SelectColumn, Statement, Update,
};
use crate::transaction::IsolationLevel;

/// Row ids are assigned from a single counter per link.
type RowId = u64;

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<RowId, Record>,
}

/// One reversible change made by a session.
#[derive(Debug)]
enum Undo {
    Inserted { table: String, rowid: RowId },
    Deleted { table: String, rowid: RowId, record: Record },
    Updated { table: String, rowid: RowId, before: Record },
    CreatedTable(String),
    DroppedTable { name: String, table: Table },
}

/// Counters of physical transaction boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<HashMap<String, Table>>,
    next_rowid: AtomicU64,
    next_session: AtomicU64,
    statements: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// A thread-safe in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    inner: Arc<Inner>,
}

impl MemoryLink {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement issued so far, including BEGIN/COMMIT/ROLLBACK.
    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock().clone()
    }

    /// Forget the statement log.
    pub fn clear_statements(&self) {
        self.inner.statements.lock().clear();
    }

    /// How many times the log contains `statement`, compared case-insensitively.
    pub fn count_statements(&self, statement: &str) -> usize {
        self.inner
            .statements
            .lock()
            .iter()
            .filter(|s| s.eq_ignore_ascii_case(statement))
            .count()
    }

    /// Physical begin/commit/rollback counters.
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            begins: self.inner.begins.load(Ordering::SeqCst),
            commits: self.inner.commits.load(Ordering::SeqCst),
            rollbacks: self.inner.rollbacks.load(Ordering::SeqCst),
        }
    }

    /// Make every later statement starting with `prefix` fail with
    /// [`LinkError::Rejected`]. `"COMMIT"` and `"ROLLBACK"` cover the
    /// session boundaries.
    pub fn fail_on(&self, prefix: impl Into<String>) {
        self.inner.failures.lock().push(prefix.into().to_uppercase());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.inner.failures.lock().clear();
    }

    /// Names of all tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Inner {
    fn record(&self, sql: &str) -> LinkResult<()> {
        let sql = sql.trim().trim_end_matches(';').to_string();
        trace!("memory link: {}", sql);
        let upper = sql.to_uppercase();
        if self.failures.lock().iter().any(|p| upper.starts_with(p.as_str())) {
            self.statements.lock().push(sql.clone());
            return Err(LinkError::Rejected(sql));
        }
        self.statements.lock().push(sql);
        Ok(())
    }

    fn select(&self, select: &Select, params: &[Value]) -> LinkResult<Rows> {
        let tables = self.tables.read();
        let table = tables
            .get(&select.from)
            .ok_or_else(|| LinkError::TableNotFound(select.from.clone()))?;

        let mut rows = Vec::new();
        for record in table.rows.values() {
            let keep = match &select.where_clause {
                Some(w) => matches_where(w, record, params)?,
                None => true,
            };
            if keep {
                rows.push(record.clone());
            }
        }
        drop(tables);

        if let Some(SelectColumn::CountAll { alias }) = select.columns.first() {
            let name = alias.clone().unwrap_or_else(|| "COUNT(*)".to_string());
            let mut row = Record::new();
            row.insert(name.clone(), Value::from(rows.len() as u64));
            let mut result = Rows::new(vec![name]);
            result.push(row);
            return Ok(result);
        }

        for key in select.order_by.iter().rev() {
            rows.sort_by(|a, b| {
                let ord = compare_column(a, b, &key.column);
                if key.ascending { ord } else { ord.reverse() }
            });
        }

        let offset = select.offset.unwrap_or(0);
        let limit = select.limit.unwrap_or(usize::MAX);
        let rows: Vec<Record> = rows.into_iter().skip(offset).take(limit).collect();

        if select.columns.iter().any(|c| matches!(c, SelectColumn::Wildcard)) {
            return Ok(Rows::from_rows(rows));
        }

        let columns: Vec<String> = select
            .columns
            .iter()
            .filter_map(|c| match c {
                SelectColumn::Column(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        let mut result = Rows::new(columns.clone());
        for row in rows {
            let projected = columns
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect();
            result.push(projected);
        }
        Ok(result)
    }

    fn write(&self, stmt: &Statement, params: &[Value], journal: &mut Vec<Undo>) -> LinkResult<ExecResult> {
        match stmt {
            Statement::CreateTable(ct) => self.create_table(ct, journal),
            Statement::DropTable(dt) => self.drop_table(dt, journal),
            Statement::Insert(i) => self.insert(i, params, journal),
            Statement::Update(u) => self.update(u, params, journal),
            Statement::Delete(d) => self.delete(d, params, journal),
            other => Err(LinkError::Unsupported(format!("{:?}", other))),
        }
    }

    fn create_table(&self, ct: &CreateTable, journal: &mut Vec<Undo>) -> LinkResult<ExecResult> {
        let mut tables = self.tables.write();
        if tables.contains_key(&ct.name) {
            if ct.if_not_exists {
                return Ok(ExecResult::default());
            }
            return Err(LinkError::TableExists(ct.name.clone()));
        }
        tables.insert(ct.name.clone(), Table::default());
        journal.push(Undo::CreatedTable(ct.name.clone()));
        Ok(ExecResult::default())
    }

    fn drop_table(&self, dt: &DropTable, journal: &mut Vec<Undo>) -> LinkResult<ExecResult> {
        let mut tables = self.tables.write();
        match tables.remove(&dt.name) {
            Some(table) => {
                journal.push(Undo::DroppedTable { name: dt.name.clone(), table });
                Ok(ExecResult::default())
            }
            None if dt.if_exists => Ok(ExecResult::default()),
            None => Err(LinkError::TableNotFound(dt.name.clone())),
        }
    }

    fn insert(&self, insert: &Insert, params: &[Value], journal: &mut Vec<Undo>) -> LinkResult<ExecResult> {
        let empty = Record::new();
        let mut records = Vec::with_capacity(insert.values.len());
        for row in &insert.values {
            let mut record = Record::new();
            for (column, expr) in insert.columns.iter().zip(row) {
                record.insert(column.clone(), evaluate(expr, &empty, params)?);
            }
            records.push(record);
        }

        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&insert.table)
            .ok_or_else(|| LinkError::TableNotFound(insert.table.clone()))?;

        let mut result = ExecResult::default();
        for record in records {
            let rowid = self.next_rowid.fetch_add(1, Ordering::SeqCst) + 1;
            let id = record.get("id").and_then(Value::as_i64).unwrap_or(rowid as i64);
            table.rows.insert(rowid, record);
            journal.push(Undo::Inserted { table: insert.table.clone(), rowid });
            result.rows_affected += 1;
            result.last_insert_id = Some(id);
        }
        Ok(result)
    }

    fn update(&self, update: &Update, params: &[Value], journal: &mut Vec<Undo>) -> LinkResult<ExecResult> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&update.table)
            .ok_or_else(|| LinkError::TableNotFound(update.table.clone()))?;

        let mut changed = Vec::new();
        for (rowid, record) in &table.rows {
            let matches = match &update.where_clause {
                Some(w) => matches_where(w, record, params)?,
                None => true,
            };
            if !matches {
                continue;
            }
            let mut next = record.clone();
            for assignment in &update.assignments {
                next.insert(assignment.column.clone(), evaluate(&assignment.value, record, params)?);
            }
            changed.push((*rowid, next));
        }

        let affected = changed.len() as u64;
        for (rowid, next) in changed {
            if let Some(before) = table.rows.insert(rowid, next) {
                journal.push(Undo::Updated { table: update.table.clone(), rowid, before });
            }
        }
        Ok(ExecResult::affected(affected))
    }

    fn delete(&self, delete: &Delete, params: &[Value], journal: &mut Vec<Undo>) -> LinkResult<ExecResult> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&delete.table)
            .ok_or_else(|| LinkError::TableNotFound(delete.table.clone()))?;

        let mut doomed = Vec::new();
        for (rowid, record) in &table.rows {
            let matches = match &delete.where_clause {
                Some(w) => matches_where(w, record, params)?,
                None => true,
            };
            if matches {
                doomed.push(*rowid);
            }
        }

        let affected = doomed.len() as u64;
        for rowid in doomed {
            if let Some(record) = table.rows.remove(&rowid) {
                journal.push(Undo::Deleted { table: delete.table.clone(), rowid, record });
            }
        }
        Ok(ExecResult::affected(affected))
    }

    /// Revert journal entries past `mark`, newest first.
    fn undo(&self, journal: &mut Vec<Undo>, mark: usize) {
        let mut tables = self.tables.write();
        while journal.len() > mark {
            let Some(entry) = journal.pop() else { break };
            match entry {
                Undo::Inserted { table, rowid } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.rows.remove(&rowid);
                    }
                }
                Undo::Deleted { table, rowid, record } | Undo::Updated { table, rowid, before: record } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.rows.insert(rowid, record);
                    }
                }
                Undo::CreatedTable(name) => {
                    tables.remove(&name);
                }
                Undo::DroppedTable { name, table } => {
                    tables.insert(name, table);
                }
            }
        }
    }
}

fn compare_column(a: &Record, b: &Record, column: &str) -> CmpOrdering {
    let left = a.get(column).unwrap_or(&Value::Null);
    let right = b.get(column).unwrap_or(&Value::Null);
    match (left.is_null(), right.is_null()) {
        (true, true) => CmpOrdering::Equal,
        (true, false) => CmpOrdering::Less,
        (false, true) => CmpOrdering::Greater,
        _ => crate::sql::compare_values(left, right)
            .map(|c| c.cmp(&0))
            .unwrap_or(CmpOrdering::Equal),
    }
}

fn reject_control(stmt: &Statement) -> LinkResult<()> {
    match stmt {
        Statement::Begin
        | Statement::Commit
        | Statement::Rollback
        | Statement::Savepoint(_)
        | Statement::RollbackTo(_)
        | Statement::ReleaseSavepoint(_) => Err(LinkError::Unsupported(
            "transaction control outside of a session".into(),
        )),
        _ => Ok(()),
    }
}

impl Link for MemoryLink {
    fn query(&self, sql: &str, args: &[Value]) -> LinkResult<Rows> {
        let stmt = Parser::parse(sql)?;
        reject_control(&stmt)?;
        self.inner.record(sql)?;
        match stmt {
            Statement::Select(select) => self.inner.select(&select, args),
            _ => Err(LinkError::Unsupported("query expects a SELECT".into())),
        }
    }

    fn exec(&self, sql: &str, args: &[Value]) -> LinkResult<ExecResult> {
        let stmt = Parser::parse(sql)?;
        reject_control(&stmt)?;
        self.inner.record(sql)?;
        // Autocommit: nothing to undo later.
        let mut journal = Vec::new();
        self.inner.write(&stmt, args, &mut journal)
    }

    fn begin(&self) -> LinkResult<Box<dyn Session>> {
        self.inner.record("BEGIN")?;
        self.inner.begins.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("memory link: session {} started", id);
        Ok(Box::new(MemorySession {
            link: self.inner.clone(),
            id,
            journal: Vec::new(),
            savepoints: Vec::new(),
            read_only: false,
            closed: false,
        }))
    }
}

/// A transaction on a [`MemoryLink`]. Rolls back when dropped while open.
#[derive(Debug)]
pub struct MemorySession {
    link: Arc<Inner>,
    id: u64,
    journal: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    read_only: bool,
    closed: bool,
}

impl MemorySession {
    /// Session number, unique per link.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> LinkResult<()> {
        if self.closed {
            return Err(LinkError::SessionClosed);
        }
        Ok(())
    }

    fn savepoint_index(&self, name: &str) -> LinkResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| LinkError::UnknownSavepoint(name.to_string()))
    }

    fn finish(&mut self, undo: bool) {
        if undo {
            self.link.undo(&mut self.journal, 0);
        }
        self.journal.clear();
        self.savepoints.clear();
        self.closed = true;
    }
}

impl Session for MemorySession {
    fn set_isolation(&mut self, isolation: IsolationLevel, read_only: bool) -> LinkResult<()> {
        self.ensure_open()?;
        if let Some(level) = isolation.as_sql() {
            self.link
                .record(&format!("SET TRANSACTION ISOLATION LEVEL {}", level))?;
        }
        if read_only {
            self.link.record("SET TRANSACTION READ ONLY")?;
        }
        self.read_only = read_only;
        Ok(())
    }

    fn query(&mut self, sql: &str, args: &[Value]) -> LinkResult<Rows> {
        self.ensure_open()?;
        let stmt = Parser::parse(sql)?;
        self.link.record(sql)?;
        match stmt {
            Statement::Select(select) => self.link.select(&select, args),
            _ => Err(LinkError::Unsupported("query expects a SELECT".into())),
        }
    }

    fn exec(&mut self, sql: &str, args: &[Value]) -> LinkResult<ExecResult> {
        self.ensure_open()?;
        let stmt = Parser::parse(sql)?;
        if self.read_only && stmt.is_write() {
            return Err(LinkError::ReadOnly(sql.trim().to_string()));
        }
        self.link.record(sql)?;
        match stmt {
            Statement::Savepoint(name) => {
                self.savepoints.push((name, self.journal.len()));
                Ok(ExecResult::default())
            }
            Statement::RollbackTo(name) => {
                let index = self.savepoint_index(&name)?;
                let mark = self.savepoints[index].1;
                self.link.undo(&mut self.journal, mark);
                self.savepoints.truncate(index + 1);
                Ok(ExecResult::default())
            }
            Statement::ReleaseSavepoint(name) => {
                let index = self.savepoint_index(&name)?;
                self.savepoints.truncate(index);
                Ok(ExecResult::default())
            }
            Statement::Begin | Statement::Commit | Statement::Rollback => Err(
                LinkError::Unsupported("use the session's commit/rollback".into()),
            ),
            Statement::Select(select) => {
                let rows = self.link.select(&select, args)?;
                Ok(ExecResult::affected(rows.len() as u64))
            }
            write => self.link.write(&write, args, &mut self.journal),
        }
    }

    fn commit(&mut self) -> LinkResult<()> {
        self.ensure_open()?;
        self.link.record("COMMIT")?;
        self.link.commits.fetch_add(1, Ordering::SeqCst);
        self.finish(false);
        debug!("memory link: session {} committed", self.id);
        Ok(())
    }

    fn rollback(&mut self) -> LinkResult<()> {
        self.ensure_open()?;
        let outcome = self.link.record("ROLLBACK");
        // A failed ROLLBACK still loses the connection, which aborts the work.
        self.link.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.finish(true);
        debug!("memory link: session {} rolled back", self.id);
        outcome
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            debug!("memory link: session {} dropped while open", self.id);
            self.link.statements.lock().push("ROLLBACK".to_string());
            self.link.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.finish(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> MemoryLink {
        let link = MemoryLink::new();
        link.exec("CREATE TABLE users (id INTEGER, name TEXT)", &[]).unwrap();
        link
    }

    fn ids(link: &MemoryLink) -> Vec<Value> {
        link.query("SELECT id FROM users ORDER BY id", &[]).unwrap().column("id")
    }

    #[test]
    fn test_autocommit_insert_and_select() {
        let link = setup();
        let res = link
            .exec("INSERT INTO users (id, name) VALUES (?, ?)", &[json!(1), json!("Alice")])
            .unwrap();
        assert_eq!(res.rows_affected, 1);
        assert_eq!(res.last_insert_id, Some(1));

        let rows = link.query("SELECT * FROM users WHERE name = ?", &[json!("Alice")]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0).unwrap().get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_session_rollback_undoes_writes() {
        let link = setup();
        link.exec("INSERT INTO users (id, name) VALUES (1, 'a')", &[]).unwrap();

        let mut session = link.begin().unwrap();
        session.exec("INSERT INTO users (id, name) VALUES (2, 'b')", &[]).unwrap();
        session.exec("UPDATE users SET name = 'z' WHERE id = 1", &[]).unwrap();
        session.exec("DELETE FROM users WHERE id = 1", &[]).unwrap();
        assert_eq!(ids(&link), vec![json!(2)]);

        session.rollback().unwrap();
        let rows = link.query("SELECT * FROM users", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.get(0).unwrap().get("name"), Some(&json!("a")));
    }

    #[test]
    fn test_savepoint_partial_rollback() {
        let link = setup();
        let mut session = link.begin().unwrap();
        session.exec("INSERT INTO users (id) VALUES (5)", &[]).unwrap();
        session.exec("SAVEPOINT sp1", &[]).unwrap();
        session.exec("INSERT INTO users (id) VALUES (6)", &[]).unwrap();
        session.exec("ROLLBACK TO SAVEPOINT sp1", &[]).unwrap();
        session.exec("INSERT INTO users (id) VALUES (7)", &[]).unwrap();
        // marker survives ROLLBACK TO
        session.exec("ROLLBACK TO sp1", &[]).unwrap();
        session.exec("INSERT INTO users (id) VALUES (7)", &[]).unwrap();
        session.exec("RELEASE SAVEPOINT sp1", &[]).unwrap();
        session.commit().unwrap();
        assert_eq!(ids(&link), vec![json!(5), json!(7)]);
    }

    #[test]
    fn test_unknown_savepoint() {
        let link = setup();
        let mut session = link.begin().unwrap();
        let err = session.exec("ROLLBACK TO missing", &[]).unwrap_err();
        assert!(matches!(err, LinkError::UnknownSavepoint(name) if name == "missing"));
    }

    #[test]
    fn test_read_only_session_rejects_writes() {
        let link = setup();
        let mut session = link.begin().unwrap();
        session.set_isolation(IsolationLevel::Serializable, true).unwrap();
        let err = session.exec("INSERT INTO users (id) VALUES (1)", &[]).unwrap_err();
        assert!(matches!(err, LinkError::ReadOnly(_)));
        assert!(session.query("SELECT * FROM users", &[]).is_ok());
        assert!(link
            .statements()
            .contains(&"SET TRANSACTION ISOLATION LEVEL SERIALIZABLE".to_string()));
    }

    #[test]
    fn test_drop_rolls_back_open_session() {
        let link = setup();
        {
            let mut session = link.begin().unwrap();
            session.exec("INSERT INTO users (id) VALUES (1)", &[]).unwrap();
        }
        assert!(ids(&link).is_empty());
        assert_eq!(link.stats().rollbacks, 1);
    }

    #[test]
    fn test_closed_session() {
        let link = setup();
        let mut session = link.begin().unwrap();
        session.commit().unwrap();
        assert!(matches!(session.commit(), Err(LinkError::SessionClosed)));
        assert!(matches!(session.exec("SELECT * FROM users", &[]), Err(LinkError::SessionClosed)));
    }

    #[test]
    fn test_injected_failure() {
        let link = setup();
        link.fail_on("commit");
        let mut session = link.begin().unwrap();
        session.exec("INSERT INTO users (id) VALUES (1)", &[]).unwrap();
        assert!(matches!(session.commit(), Err(LinkError::Rejected(_))));
        // still open, so the caller can roll back
        session.rollback().unwrap();
        assert!(ids(&link).is_empty());
    }

    #[test]
    fn test_control_statements_need_a_session() {
        let link = setup();
        assert!(matches!(link.exec("BEGIN", &[]), Err(LinkError::Unsupported(_))));
        assert!(matches!(link.exec("SAVEPOINT a", &[]), Err(LinkError::Unsupported(_))));
    }

    #[test]
    fn test_count_and_statement_log() {
        let link = setup();
        link.exec("INSERT INTO users (id) VALUES (1), (2), (3)", &[]).unwrap();
        let rows = link
            .query("SELECT COUNT(*) AS total FROM users WHERE id > ?", &[json!(1)])
            .unwrap();
        assert_eq!(rows.get(0).unwrap().get("total"), Some(&json!(2)));

        let mut session = link.begin().unwrap();
        session.commit().unwrap();
        assert_eq!(link.count_statements("BEGIN"), 1);
        assert_eq!(link.count_statements("commit"), 1);
        assert_eq!(link.stats(), LinkStats { begins: 1, commits: 1, rollbacks: 0 });
    }
}
