//! SQL parser implementation.
//!
//! Converts SQL strings to the internal AST using sqlparser. Transaction
//! control statements are recognised before handing the text to sqlparser.

use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use super::ast::*;
use super::error::{ParseError, ParseResult};

/// SQL parser for the in-memory link.
///
/// Holds the running placeholder counter for one statement.
pub struct Parser {
    next_param: usize,
}

/// Whether `name` is a plain unquoted identifier: a letter or underscore
/// followed by letters, digits or underscores.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Parser {
    /// Parse a SQL string into a statement.
    pub fn parse(sql: &str) -> ParseResult<Statement> {
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(ParseError::Empty);
        }

        if let Some(stmt) = Self::parse_transaction_control(sql)? {
            return Ok(stmt);
        }

        let dialect = GenericDialect {};
        let statements = SqlParser::parse_sql(&dialect, sql)?;

        if statements.is_empty() {
            return Err(ParseError::Empty);
        }
        if statements.len() > 1 {
            return Err(ParseError::MultipleStatements);
        }

        Parser { next_param: 0 }.convert_statement(&statements[0])
    }

    fn parse_transaction_control(sql: &str) -> ParseResult<Option<Statement>> {
        let upper = sql.to_uppercase();
        let words: Vec<&str> = upper.split_whitespace().collect();
        let original: Vec<&str> = sql.split_whitespace().collect();

        let stmt = match words.as_slice() {
            ["BEGIN"] | ["BEGIN", "TRANSACTION"] | ["START", "TRANSACTION"] => Statement::Begin,
            ["COMMIT"] | ["COMMIT", "TRANSACTION"] => Statement::Commit,
            ["ROLLBACK"] | ["ROLLBACK", "TRANSACTION"] => Statement::Rollback,
            ["SAVEPOINT", _] => Statement::Savepoint(Self::savepoint_name(original[1])?),
            ["ROLLBACK", "TO", "SAVEPOINT", _] => {
                Statement::RollbackTo(Self::savepoint_name(original[3])?)
            }
            ["ROLLBACK", "TO", _] => Statement::RollbackTo(Self::savepoint_name(original[2])?),
            ["RELEASE", "SAVEPOINT", _] => {
                Statement::ReleaseSavepoint(Self::savepoint_name(original[2])?)
            }
            ["RELEASE", _] => Statement::ReleaseSavepoint(Self::savepoint_name(original[1])?),
            [first, ..] if *first == "SAVEPOINT" || *first == "RELEASE" => {
                return Err(ParseError::Expected("savepoint name".into()));
            }
            _ => return Ok(None),
        };
        Ok(Some(stmt))
    }

    fn savepoint_name(raw: &str) -> ParseResult<String> {
        let name = raw.trim_matches(|c| c == '`' || c == '"');
        if !is_identifier(name) {
            return Err(ParseError::InvalidIdentifier(raw.to_string()));
        }
        Ok(name.to_string())
    }

    fn convert_statement(&mut self, stmt: &sp::Statement) -> ParseResult<Statement> {
        match stmt {
            sp::Statement::CreateTable(create) => Ok(Statement::CreateTable(CreateTable {
                name: Self::object_name(&create.name)?,
                if_not_exists: create.if_not_exists,
            })),
            sp::Statement::Drop { object_type, names, if_exists, .. } => {
                Self::convert_drop(object_type, names, *if_exists)
            }
            sp::Statement::Query(query) => self.convert_query(query),
            sp::Statement::Insert(insert) => self.convert_insert(insert),
            sp::Statement::Update { table, assignments, selection, .. } => {
                self.convert_update(table, assignments, selection)
            }
            sp::Statement::Delete(delete) => self.convert_delete(delete),
            sp::Statement::StartTransaction { .. } => Ok(Statement::Begin),
            sp::Statement::Commit { .. } => Ok(Statement::Commit),
            other => Err(ParseError::statement(format!("{:?}", other))),
        }
    }

    fn convert_drop(
        object_type: &sp::ObjectType,
        names: &[sp::ObjectName],
        if_exists: bool,
    ) -> ParseResult<Statement> {
        match object_type {
            sp::ObjectType::Table => {
                if names.len() != 1 {
                    return Err(ParseError::statement("DROP of several tables"));
                }
                let name = Self::object_name(&names[0])?;
                Ok(Statement::DropTable(DropTable { name, if_exists }))
            }
            other => Err(ParseError::statement(format!(
                "DROP {:?}",
                other
            ))),
        }
    }

    fn convert_query(&mut self, query: &sp::Query) -> ParseResult<Statement> {
        let select = match query.body.as_ref() {
            sp::SetExpr::Select(s) => s,
            other => {
                return Err(ParseError::statement(format!(
                    "query body {:?}",
                    other
                )))
            }
        };

        let from = if select.from.len() != 1 {
            return Err(ParseError::statement("SELECT needs exactly one table"));
        } else {
            Self::single_table(&select.from[0])?
        };

        let columns = Self::projection(&select.projection)?;

        let where_clause = select
            .selection
            .as_ref()
            .map(|e| self.convert_expr(e))
            .transpose()?;

        let order_by = query
            .order_by
            .as_ref()
            .map(Self::order_by_items)
            .transpose()?
            .unwrap_or_default();

        let limit = query.limit.as_ref().and_then(Self::usize_literal);
        let offset = query.offset.as_ref().and_then(|o| Self::usize_literal(&o.value));

        Ok(Statement::Select(Select {
            columns,
            from,
            where_clause,
            order_by,
            limit,
            offset,
        }))
    }

    fn projection(items: &[sp::SelectItem]) -> ParseResult<Vec<SelectColumn>> {
        items
            .iter()
            .map(|item| match item {
                sp::SelectItem::Wildcard(_) => Ok(SelectColumn::Wildcard),
                sp::SelectItem::UnnamedExpr(sp::Expr::Identifier(ident)) => {
                    Ok(SelectColumn::Column(ident.value.clone()))
                }
                sp::SelectItem::UnnamedExpr(sp::Expr::Function(f)) if Self::is_count(f) => {
                    Ok(SelectColumn::CountAll { alias: None })
                }
                sp::SelectItem::ExprWithAlias { expr: sp::Expr::Function(f), alias }
                    if Self::is_count(f) =>
                {
                    Ok(SelectColumn::CountAll { alias: Some(alias.value.clone()) })
                }
                other => Err(ParseError::expression(format!(
                    "projection: {:?}",
                    other
                ))),
            })
            .collect()
    }

    fn is_count(f: &sp::Function) -> bool {
        f.name.to_string().eq_ignore_ascii_case("count")
    }

    fn order_by_items(ob: &sp::OrderBy) -> ParseResult<Vec<OrderBy>> {
        match &ob.kind {
            sp::OrderByKind::All(_) => Ok(vec![]),
            sp::OrderByKind::Expressions(exprs) => {
                exprs.iter().map(Self::order_by_item).collect()
            }
        }
    }

    fn order_by_item(expr: &sp::OrderByExpr) -> ParseResult<OrderBy> {
        let column = match &expr.expr {
            sp::Expr::Identifier(id) => id.value.clone(),
            other => {
                return Err(ParseError::expression(format!(
                    "ORDER BY expression: {:?}",
                    other
                )))
            }
        };
        let ascending = expr.options.asc.unwrap_or(true);
        Ok(OrderBy { column, ascending })
    }

    fn convert_insert(&mut self, insert: &sp::Insert) -> ParseResult<Statement> {
        let table = Self::insert_target(&insert.table)?;
        let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();
        if columns.is_empty() {
            return Err(ParseError::Expected("INSERT column list".into()));
        }

        let values = match insert.source.as_ref().map(|s| s.body.as_ref()) {
            Some(sp::SetExpr::Values(sp::Values { rows, .. })) => {
                let mut converted = Vec::with_capacity(rows.len());
                for row in rows {
                    if row.len() != columns.len() {
                        return Err(ParseError::Syntax(format!(
                            "expected {} values, found {}",
                            columns.len(),
                            row.len()
                        )));
                    }
                    let exprs = row
                        .iter()
                        .map(|e| self.convert_expr(e))
                        .collect::<ParseResult<Vec<_>>>()?;
                    converted.push(exprs);
                }
                converted
            }
            _ => {
                return Err(ParseError::statement("INSERT ... SELECT"))
            }
        };

        Ok(Statement::Insert(Insert { table, columns, values }))
    }

    fn convert_update(
        &mut self,
        table: &sp::TableWithJoins,
        assignments: &[sp::Assignment],
        selection: &Option<sp::Expr>,
    ) -> ParseResult<Statement> {
        let table_name = Self::single_table(table)?;

        let mut assigns = Vec::with_capacity(assignments.len());
        for a in assignments {
            let column = Self::assignment_column(&a.target)?;
            let value = self.convert_expr(&a.value)?;
            assigns.push(Assignment { column, value });
        }

        let where_clause = selection.as_ref().map(|e| self.convert_expr(e)).transpose()?;

        Ok(Statement::Update(Update {
            table: table_name,
            assignments: assigns,
            where_clause,
        }))
    }

    fn assignment_column(target: &sp::AssignmentTarget) -> ParseResult<String> {
        match target {
            sp::AssignmentTarget::ColumnName(parts) => parts
                .0
                .last()
                .map(|p| p.as_ident().map(|id| id.value.clone()).unwrap_or_else(|| p.to_string()))
                .ok_or_else(|| ParseError::InvalidIdentifier("empty column name".into())),
            sp::AssignmentTarget::Tuple(_) => Err(ParseError::expression("tuple assignment")),
        }
    }

    fn convert_delete(&mut self, delete: &sp::Delete) -> ParseResult<Statement> {
        let tables = match &delete.from {
            sp::FromTable::WithFromKeyword(tables) => tables,
            sp::FromTable::WithoutKeyword(tables) => tables,
        };

        if tables.len() != 1 {
            return Err(ParseError::statement("DELETE from several tables"));
        }

        let table = Self::single_table(&tables[0])?;
        let where_clause = delete
            .selection
            .as_ref()
            .map(|e| self.convert_expr(e))
            .transpose()?;

        Ok(Statement::Delete(Delete { table, where_clause }))
    }

    fn convert_expr(&mut self, expr: &sp::Expr) -> ParseResult<Expr> {
        match expr {
            sp::Expr::Identifier(id) => Ok(Expr::Column(id.value.clone())),

            sp::Expr::CompoundIdentifier(parts) => {
                let col = parts
                    .last()
                    .map(|p| p.value.clone())
                    .ok_or_else(|| ParseError::InvalidIdentifier("empty compound identifier".into()))?;
                Ok(Expr::Column(col))
            }

            sp::Expr::Value(v) => match &v.value {
                sp::Value::Placeholder(_) => {
                    let index = self.next_param;
                    self.next_param += 1;
                    Ok(Expr::Param(index))
                }
                _ => Ok(Expr::Literal(Self::literal(v)?)),
            },

            sp::Expr::BinaryOp { left, op, right } => {
                let l = self.convert_expr(left)?;
                let r = self.convert_expr(right)?;
                let o = Self::binary_op(op)?;
                Ok(Expr::BinaryOp {
                    left: Box::new(l),
                    op: o,
                    right: Box::new(r),
                })
            }

            sp::Expr::UnaryOp { op, expr } => {
                let e = self.convert_expr(expr)?;
                let o = Self::unary_op(op)?;
                Ok(Expr::UnaryOp {
                    op: o,
                    expr: Box::new(e),
                })
            }

            sp::Expr::IsNull(e) => Ok(Expr::IsNull {
                expr: Box::new(self.convert_expr(e)?),
                negated: false,
            }),

            sp::Expr::IsNotNull(e) => Ok(Expr::IsNull {
                expr: Box::new(self.convert_expr(e)?),
                negated: true,
            }),

            sp::Expr::InList { expr, list, negated } => {
                let e = self.convert_expr(expr)?;
                let items = list
                    .iter()
                    .map(|item| self.convert_expr(item))
                    .collect::<ParseResult<Vec<_>>>()?;
                Ok(Expr::InList {
                    expr: Box::new(e),
                    list: items,
                    negated: *negated,
                })
            }

            sp::Expr::Between { expr, low, high, negated } => {
                let e = self.convert_expr(expr)?;
                let l = self.convert_expr(low)?;
                let h = self.convert_expr(high)?;
                Ok(Expr::Between {
                    expr: Box::new(e),
                    low: Box::new(l),
                    high: Box::new(h),
                    negated: *negated,
                })
            }

            sp::Expr::Like { expr, pattern, negated, .. } => {
                let e = self.convert_expr(expr)?;
                let pat = Self::string_literal(pattern)?;
                Ok(Expr::Like {
                    expr: Box::new(e),
                    pattern: pat,
                    negated: *negated,
                })
            }

            sp::Expr::Nested(inner) => Ok(Expr::Nested(Box::new(self.convert_expr(inner)?))),

            other => Err(ParseError::expression(format!("{:?}", other))),
        }
    }

    fn literal(v: &sp::ValueWithSpan) -> ParseResult<LiteralValue> {
        match &v.value {
            sp::Value::Null => Ok(LiteralValue::Null),
            sp::Value::Boolean(b) => Ok(LiteralValue::Boolean(*b)),
            sp::Value::Number(s, _) => {
                if let Ok(i) = s.parse::<i64>() {
                    Ok(LiteralValue::Integer(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    Ok(LiteralValue::Float(f))
                } else {
                    Err(ParseError::expression(format!("number literal {}", s)))
                }
            }
            sp::Value::SingleQuotedString(s) => Ok(LiteralValue::String(s.clone())),
            sp::Value::DoubleQuotedString(s) => Ok(LiteralValue::String(s.clone())),
            other => Err(ParseError::expression(format!(
                "value {:?}",
                other
            ))),
        }
    }

    fn string_literal(expr: &sp::Expr) -> ParseResult<String> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::SingleQuotedString(s) => Ok(s.clone()),
                sp::Value::DoubleQuotedString(s) => Ok(s.clone()),
                _ => Err(ParseError::expression("expected string")),
            },
            _ => Err(ParseError::expression("expected string literal")),
        }
    }

    fn binary_op(op: &sp::BinaryOperator) -> ParseResult<BinaryOperator> {
        match op {
            sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
            sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
            sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
            sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
            sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
            sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
            sp::BinaryOperator::And => Ok(BinaryOperator::And),
            sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
            sp::BinaryOperator::Plus => Ok(BinaryOperator::Plus),
            sp::BinaryOperator::Minus => Ok(BinaryOperator::Minus),
            sp::BinaryOperator::Multiply => Ok(BinaryOperator::Multiply),
            sp::BinaryOperator::Divide => Ok(BinaryOperator::Divide),
            sp::BinaryOperator::Modulo => Ok(BinaryOperator::Modulo),
            other => Err(ParseError::expression(format!(
                "operator {:?}",
                other
            ))),
        }
    }

    fn unary_op(op: &sp::UnaryOperator) -> ParseResult<UnaryOperator> {
        match op {
            sp::UnaryOperator::Not => Ok(UnaryOperator::Not),
            sp::UnaryOperator::Minus => Ok(UnaryOperator::Minus),
            sp::UnaryOperator::Plus => Ok(UnaryOperator::Plus),
            other => Err(ParseError::expression(format!(
                "unary operator {:?}",
                other
            ))),
        }
    }

    fn object_name(name: &sp::ObjectName) -> ParseResult<String> {
        // schema.table resolves to table
        name.0
            .last()
            .map(|i| i.as_ident().map(|id| id.value.clone()).unwrap_or_else(|| i.to_string()))
            .ok_or_else(|| ParseError::InvalidIdentifier("empty table name".into()))
    }

    fn insert_target(table: &sp::TableObject) -> ParseResult<String> {
        match table {
            sp::TableObject::TableName(name) => Self::object_name(name),
            sp::TableObject::TableFunction(_) => {
                Err(ParseError::statement("table function"))
            }
        }
    }

    fn single_table(from: &sp::TableWithJoins) -> ParseResult<String> {
        match &from.relation {
            sp::TableFactor::Table { name, .. } => Self::object_name(name),
            other => Err(ParseError::statement(format!(
                "FROM clause {:?}",
                other
            ))),
        }
    }

    fn usize_literal(expr: &sp::Expr) -> Option<usize> {
        match expr {
            sp::Expr::Value(v) => match &v.value {
                sp::Value::Number(s, _) => s.parse().ok(),
                _ => None,
            },
            _ => None,
        }
    }
}
