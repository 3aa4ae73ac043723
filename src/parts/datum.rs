//! Values stored in part rows

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sql::Literal;

/// One cell of a part row
///
/// There is no boolean variant; predicates produce `Int(0)` or `Int(1)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Datum {
    #[default]
    Null,
    Int(i64),
    Float(f64),
    String(String),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int(i) => Some(*i as f64),
            Datum::Float(f) => Some(*f),
            Datum::Null | Datum::String(_) => None,
        }
    }

    /// Sort rank across kinds: NULL, numbers, strings
    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Int(_) | Datum::Float(_) => 1,
            Datum::String(_) => 2,
        }
    }

    /// Truth value of a number; NULL and strings have none
    pub fn as_bool(&self) -> Option<bool> {
        self.as_f64().map(|v| v != 0.0)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(i) => Some(*i),
            Datum::Float(f) => Some(*f as i64),
            Datum::Null | Datum::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Null => Datum::Null,
            Literal::Integer(i) => Datum::Int(*i),
            Literal::Float(f) => Datum::Float(*f),
            Literal::String(s) => Datum::String(s.clone()),
        }
    }

    pub fn from_bool(b: bool) -> Self {
        Datum::Int(i64::from(b))
    }

    /// Unary minus; `None` when the value has no negation
    pub fn negate(&self) -> Option<Datum> {
        match self {
            Datum::Null => Some(Datum::Null),
            Datum::Int(i) => i.checked_neg().map(Datum::Int),
            Datum::Float(f) => Some(Datum::Float(-f)),
            Datum::String(_) => None,
        }
    }

    /// Logical NOT; NULL stays NULL
    pub fn not(&self) -> Option<Datum> {
        if self.is_null() {
            return Some(Datum::Null);
        }
        self.as_bool().map(|b| Datum::from_bool(!b))
    }
}

/// Text form used in query results; NULL prints as `\N`
impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("\\N"),
            Datum::Int(i) => write!(f, "{}", i),
            Datum::Float(v) => write!(f, "{}", v),
            Datum::String(s) => f.write_str(s),
        }
    }
}

/// Integers and floats compare by value; other kinds by rank
impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}
