//! Lowering of sqlparser expressions
//!
//! WHERE predicates, UPDATE assignments and INSERT values are parsed by the
//! sqlparser expression grammar and then mapped onto the small [`Expr`] the
//! part evaluator understands.

use sqlparser::ast::{self as sp, BinaryOperator, UnaryOperator, Value};

use crate::sql::ast::{BinaryOp, Expr, Literal, UnaryOp};
use crate::sql::error::{SqlError, SqlResult};

/// Convert a sqlparser expression into an evaluable [`Expr`]
pub fn lower_expr(expr: &sp::Expr) -> SqlResult<Expr> {
    match expr {
        sp::Expr::Identifier(ident) => Ok(Expr::Column(ident.value.clone())),
        // Flattened Nested element, e.g. `NestedColumn.A`
        sp::Expr::CompoundIdentifier(parts) => Ok(Expr::Column(
            parts
                .iter()
                .map(|p| p.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        )),
        sp::Expr::Value(value) => lower_value(value).map(Expr::Literal),
        sp::Expr::Nested(inner) => lower_expr(inner),
        sp::Expr::BinaryOp { left, op, right } => Ok(Expr::BinaryOp {
            left: Box::new(lower_expr(left)?),
            op: lower_binary_op(op)?,
            right: Box::new(lower_expr(right)?),
        }),
        sp::Expr::UnaryOp { op, expr } => {
            let inner = lower_expr(expr)?;
            match op {
                UnaryOperator::Plus => Ok(inner),
                UnaryOperator::Minus => Ok(Expr::UnaryOp {
                    op: UnaryOp::Neg,
                    expr: Box::new(inner),
                }),
                UnaryOperator::Not => Ok(Expr::UnaryOp {
                    op: UnaryOp::Not,
                    expr: Box::new(inner),
                }),
                other => Err(SqlError::Unsupported(format!("operator {}", other))),
            }
        }
        sp::Expr::Function(func) => Err(SqlError::Unsupported(format!(
            "function call '{}'",
            func.name
        ))),
        other => Err(SqlError::Unsupported(format!("expression '{}'", other))),
    }
}

fn lower_binary_op(op: &BinaryOperator) -> SqlResult<BinaryOp> {
    Ok(match op {
        BinaryOperator::Plus => BinaryOp::Add,
        BinaryOperator::Minus => BinaryOp::Sub,
        BinaryOperator::Multiply => BinaryOp::Mul,
        BinaryOperator::Divide => BinaryOp::Div,
        BinaryOperator::Eq => BinaryOp::Eq,
        BinaryOperator::NotEq => BinaryOp::NotEq,
        BinaryOperator::Lt => BinaryOp::Lt,
        BinaryOperator::LtEq => BinaryOp::LtEq,
        BinaryOperator::Gt => BinaryOp::Gt,
        BinaryOperator::GtEq => BinaryOp::GtEq,
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
        other => return Err(SqlError::Unsupported(format!("operator {}", other))),
    })
}

fn lower_value(value: &Value) -> SqlResult<Literal> {
    match value {
        Value::Null => Ok(Literal::Null),
        Value::Boolean(b) => Ok(Literal::Integer(i64::from(*b))),
        Value::Number(text, _) => parse_number(text),
        Value::SingleQuotedString(s) => Ok(Literal::String(s.clone())),
        other => Err(SqlError::Unsupported(format!("literal {}", other))),
    }
}

/// Integer when it fits in `i64`, float otherwise
pub fn parse_number(text: &str) -> SqlResult<Literal> {
    let invalid = || SqlError::Parse(format!("invalid number '{}'", text));
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Literal::Integer(i));
        }
    }
    text.parse().map(Literal::Float).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::ClickHouseDialect;
    use sqlparser::parser::Parser as SqlParser;

    fn lower(sql: &str) -> SqlResult<Expr> {
        let dialect = ClickHouseDialect {};
        let expr = SqlParser::new(&dialect)
            .try_with_sql(sql)?
            .parse_expr()?;
        lower_expr(&expr)
    }

    fn col(name: &str) -> Box<Expr> {
        Box::new(Expr::Column(name.to_string()))
    }

    fn int(i: i64) -> Box<Expr> {
        Box::new(Expr::Literal(Literal::Integer(i)))
    }

    #[test]
    fn test_precedence_follows_sql() {
        assert_eq!(
            lower("a + 2 * 3 > 7 AND NOT b").unwrap(),
            Expr::BinaryOp {
                left: Box::new(Expr::BinaryOp {
                    left: Box::new(Expr::BinaryOp {
                        left: col("a"),
                        op: BinaryOp::Add,
                        right: Box::new(Expr::BinaryOp {
                            left: int(2),
                            op: BinaryOp::Mul,
                            right: int(3),
                        }),
                    }),
                    op: BinaryOp::Gt,
                    right: int(7),
                }),
                op: BinaryOp::And,
                right: Box::new(Expr::UnaryOp {
                    op: UnaryOp::Not,
                    expr: col("b"),
                }),
            }
        );
    }

    #[test]
    fn test_literals_and_names() {
        assert_eq!(lower("NULL").unwrap(), Expr::Literal(Literal::Null));
        assert_eq!(lower("true").unwrap(), Expr::Literal(Literal::Integer(1)));
        assert_eq!(lower("2.5").unwrap(), Expr::Literal(Literal::Float(2.5)));
        assert_eq!(
            lower("'x y'").unwrap(),
            Expr::Literal(Literal::String("x y".to_string()))
        );
        assert_eq!(
            lower("NestedColumn.A").unwrap(),
            Expr::Column("NestedColumn.A".to_string())
        );
        assert_eq!(
            lower("(-x)").unwrap(),
            Expr::UnaryOp {
                op: UnaryOp::Neg,
                expr: col("x"),
            }
        );
    }

    #[test]
    fn test_unsupported_forms() {
        assert!(matches!(lower("sleep(2)"), Err(SqlError::Unsupported(_))));
        assert!(matches!(lower("a LIKE 'x%'"), Err(SqlError::Unsupported(_))));
        assert!(matches!(lower("a % 2"), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42").unwrap(), Literal::Integer(42));
        assert_eq!(parse_number("1e3").unwrap(), Literal::Float(1000.0));
        assert_eq!(
            parse_number("99999999999999999999").unwrap(),
            Literal::Float(1e20)
        );
        assert!(parse_number("1.2.3").is_err());
    }
}
