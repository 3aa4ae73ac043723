//! Expression evaluation
//!
//! Evaluates an [`Expr`] against one row of a part. Column references are
//! resolved by name against the part's column list.

use crate::sql::{BinaryOp, Expr, UnaryOp};

use super::datum::Datum;
use super::error::{PartError, PartResult};

/// Evaluate an expression against a row
pub fn eval(expr: &Expr, columns: &[String], row: &[Datum]) -> PartResult<Datum> {
    match expr {
        Expr::Column(name) => {
            let idx = columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| PartError::ColumnNotFound(name.clone()))?;
            Ok(row.get(idx).cloned().unwrap_or_default())
        }

        Expr::Literal(lit) => Ok(Datum::from_literal(lit)),

        Expr::BinaryOp { left, op, right } => {
            let lval = eval(left, columns, row)?;
            let rval = eval(right, columns, row)?;
            eval_binary_op(*op, &lval, &rval)
        }

        Expr::UnaryOp { op, expr } => {
            let val = eval(expr, columns, row)?;
            let result = match op {
                UnaryOp::Not => val.not(),
                UnaryOp::Neg => val.negate(),
            };
            result.ok_or_else(|| PartError::Eval(format!("cannot apply {:?} to {:?}", op, val)))
        }
    }
}

/// Whether a filter selects the row; NULL does not
pub fn matches(filter: Option<&Expr>, columns: &[String], row: &[Datum]) -> PartResult<bool> {
    match filter {
        None => Ok(true),
        Some(expr) => Ok(eval(expr, columns, row)?.as_bool().unwrap_or(false)),
    }
}

/// Column names referenced by an expression
pub fn referenced_columns<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Column(name) => out.push(name),
        Expr::Literal(_) => {}
        Expr::BinaryOp { left, right, .. } => {
            referenced_columns(left, out);
            referenced_columns(right, out);
        }
        Expr::UnaryOp { expr, .. } => referenced_columns(expr, out),
    }
}

fn eval_binary_op(op: BinaryOp, left: &Datum, right: &Datum) -> PartResult<Datum> {
    match op {
        BinaryOp::And => Ok(eval_and(left, right)),
        BinaryOp::Or => Ok(eval_or(left, right)),
        // NULL propagates through everything else
        _ if left.is_null() || right.is_null() => Ok(Datum::Null),
        BinaryOp::Add => arithmetic(left, right, "add", i64::checked_add, |a, b| a + b),
        BinaryOp::Sub => arithmetic(left, right, "subtract", i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => arithmetic(left, right, "multiply", i64::checked_mul, |a, b| a * b),
        BinaryOp::Div => {
            if right.as_bool() == Some(false) {
                return Err(PartError::Eval("division by zero".to_string()));
            }
            arithmetic(left, right, "divide", i64::checked_div, |a, b| a / b)
        }
        BinaryOp::Eq => Ok(Datum::from_bool(left == right)),
        BinaryOp::NotEq => Ok(Datum::from_bool(left != right)),
        BinaryOp::Lt => Ok(Datum::from_bool(left < right)),
        BinaryOp::LtEq => Ok(Datum::from_bool(left <= right)),
        BinaryOp::Gt => Ok(Datum::from_bool(left > right)),
        BinaryOp::GtEq => Ok(Datum::from_bool(left >= right)),
    }
}

fn arithmetic(
    left: &Datum,
    right: &Datum,
    what: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> PartResult<Datum> {
    match (left, right) {
        (Datum::Int(a), Datum::Int(b)) => int_op(*a, *b)
            .map(Datum::Int)
            .ok_or_else(|| PartError::Eval(format!("integer overflow in {}", what))),
        (Datum::Int(a), Datum::Float(b)) => Ok(Datum::Float(float_op(*a as f64, *b))),
        (Datum::Float(a), Datum::Int(b)) => Ok(Datum::Float(float_op(*a, *b as f64))),
        (Datum::Float(a), Datum::Float(b)) => Ok(Datum::Float(float_op(*a, *b))),
        _ => Err(PartError::Eval(format!(
            "cannot {} {:?} and {:?}",
            what, left, right
        ))),
    }
}

/// AND with three-valued logic
fn eval_and(left: &Datum, right: &Datum) -> Datum {
    match (left.as_bool(), right.as_bool()) {
        (Some(false), _) | (_, Some(false)) => Datum::from_bool(false),
        (Some(true), Some(true)) => Datum::from_bool(true),
        _ => Datum::Null,
    }
}

/// OR with three-valued logic
fn eval_or(left: &Datum, right: &Datum) -> Datum {
    match (left.as_bool(), right.as_bool()) {
        (Some(true), _) | (_, Some(true)) => Datum::from_bool(true),
        (Some(false), Some(false)) => Datum::from_bool(false),
        _ => Datum::Null,
    }
}
