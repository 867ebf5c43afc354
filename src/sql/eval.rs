//! Expression evaluation against a single row.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use super::ast::{BinaryOperator, Expr, UnaryOperator};

/// Errors raised while evaluating an expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("missing value for placeholder #{0}")]
    MissingParam(usize),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,
}

type EvalResult<T> = Result<T, EvalError>;

/// Evaluate an expression against a row. Unknown columns read as NULL.
pub fn evaluate(
    expr: &Expr,
    row: &BTreeMap<String, Value>,
    params: &[Value],
) -> EvalResult<Value> {
    match expr {
        Expr::Column(name) => Ok(row.get(name).cloned().unwrap_or(Value::Null)),

        Expr::Literal(lit) => Ok(lit.to_json()),

        Expr::Param(index) => params
            .get(*index)
            .cloned()
            .ok_or(EvalError::MissingParam(*index)),

        Expr::BinaryOp { left, op, right } => {
            let l = evaluate(left, row, params)?;
            let r = evaluate(right, row, params)?;
            eval_binary_op(&l, *op, &r)
        }

        Expr::UnaryOp { op, expr } => {
            let v = evaluate(expr, row, params)?;
            eval_unary_op(*op, &v)
        }

        Expr::IsNull { expr, negated } => {
            let is_null = evaluate(expr, row, params)?.is_null();
            Ok(Value::Bool(is_null != *negated))
        }

        Expr::InList { expr, list, negated } => {
            let v = evaluate(expr, row, params)?;
            let mut in_list = false;
            for item in list {
                if values_equal(&v, &evaluate(item, row, params)?) {
                    in_list = true;
                    break;
                }
            }
            Ok(Value::Bool(in_list != *negated))
        }

        Expr::Between { expr, low, high, negated } => {
            let v = evaluate(expr, row, params)?;
            let l = evaluate(low, row, params)?;
            let h = evaluate(high, row, params)?;
            let in_range = compare_values(&v, &l).map(|c| c >= 0).unwrap_or(false)
                && compare_values(&v, &h).map(|c| c <= 0).unwrap_or(false);
            Ok(Value::Bool(in_range != *negated))
        }

        Expr::Like { expr, pattern, negated } => {
            let v = evaluate(expr, row, params)?;
            let s = v.as_str().unwrap_or("");
            Ok(Value::Bool(like_match(s, pattern) != *negated))
        }

        Expr::Nested(inner) => evaluate(inner, row, params),
    }
}

/// Evaluate a WHERE clause, returning true if row matches.
pub fn matches_where(
    expr: &Expr,
    row: &BTreeMap<String, Value>,
    params: &[Value],
) -> EvalResult<bool> {
    Ok(value_to_bool(&evaluate(expr, row, params)?))
}

fn eval_binary_op(left: &Value, op: BinaryOperator, right: &Value) -> EvalResult<Value> {
    match op {
        BinaryOperator::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOperator::NotEq => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOperator::Lt => Ok(Value::Bool(compare_values(left, right).map(|c| c < 0).unwrap_or(false))),
        BinaryOperator::LtEq => Ok(Value::Bool(compare_values(left, right).map(|c| c <= 0).unwrap_or(false))),
        BinaryOperator::Gt => Ok(Value::Bool(compare_values(left, right).map(|c| c > 0).unwrap_or(false))),
        BinaryOperator::GtEq => Ok(Value::Bool(compare_values(left, right).map(|c| c >= 0).unwrap_or(false))),

        BinaryOperator::And => Ok(Value::Bool(value_to_bool(left) && value_to_bool(right))),
        BinaryOperator::Or => Ok(Value::Bool(value_to_bool(left) || value_to_bool(right))),

        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => eval_arithmetic(left, op, right),
    }
}

fn eval_unary_op(op: UnaryOperator, value: &Value) -> EvalResult<Value> {
    match op {
        UnaryOperator::Not => Ok(Value::Bool(!value_to_bool(value))),
        UnaryOperator::Minus => match value.as_i64() {
            Some(n) => n
                .checked_neg()
                .map(|n| Value::Number(n.into()))
                .ok_or(EvalError::Overflow),
            None => Ok(float_value(-value_to_f64(value))),
        },
        UnaryOperator::Plus => Ok(value.clone()),
    }
}

/// Integer operands stay integral with checked arithmetic; anything else
/// goes through `f64`. Inexact integer division yields a float.
fn eval_arithmetic(left: &Value, op: BinaryOperator, right: &Value) -> EvalResult<Value> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            BinaryOperator::Plus => a.checked_add(b),
            BinaryOperator::Minus => a.checked_sub(b),
            BinaryOperator::Multiply => a.checked_mul(b),
            BinaryOperator::Divide | BinaryOperator::Modulo if b == 0 => {
                return Err(EvalError::DivisionByZero)
            }
            BinaryOperator::Divide if a % b != 0 => {
                return Ok(float_value(a as f64 / b as f64));
            }
            BinaryOperator::Divide => a.checked_div(b),
            BinaryOperator::Modulo => a.checked_rem(b),
            _ => return Ok(Value::Null),
        };
        return result
            .map(|n| Value::Number(n.into()))
            .ok_or(EvalError::Overflow);
    }

    let (a, b) = (value_to_f64(left), value_to_f64(right));
    let result = match op {
        BinaryOperator::Plus => a + b,
        BinaryOperator::Minus => a - b,
        BinaryOperator::Multiply => a * b,
        BinaryOperator::Divide | BinaryOperator::Modulo if b == 0.0 => {
            return Err(EvalError::DivisionByZero)
        }
        BinaryOperator::Divide => a / b,
        BinaryOperator::Modulo => a % b,
        _ => return Ok(Value::Null),
    };
    Ok(float_value(result))
}

fn float_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Check if two JSON values are equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(x, y)| (x - y).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Compare two JSON values, returning ordering.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<i32> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            Some(a.partial_cmp(&b).map(|o| o as i32).unwrap_or(0))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b) as i32),
        (Value::Bool(a), Value::Bool(b)) => Some((*a as i32) - (*b as i32)),
        _ => None,
    }
}

fn value_to_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Bool(b) => if *b { 1.0 } else { 0.0 },
        _ => 0.0,
    }
}

/// LIKE matching: `%` is any sequence, `_` a single character.
fn like_match(s: &str, pattern: &str) -> bool {
    let s_chars: Vec<char> = s.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    match_like(&s_chars, &p_chars, 0, 0)
}

fn match_like(s: &[char], p: &[char], si: usize, pi: usize) -> bool {
    if pi >= p.len() {
        return si >= s.len();
    }

    match p[pi] {
        '%' => (si..=s.len()).any(|i| match_like(s, p, i, pi + 1)),
        '_' => si < s.len() && match_like(s, p, si + 1, pi + 1),
        c => {
            si < s.len()
                && s[si].to_lowercase().eq(c.to_lowercase())
                && match_like(s, p, si + 1, pi + 1)
        }
    }
}
