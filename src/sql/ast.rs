//! Internal AST types
//!
//! Statements are a tagged enum over the kinds the node understands. DDL
//! statements travel through a replicated database's log as text; mutation
//! commands travel through a replicated table's log serialized. The rest is
//! handled locally by the node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Literal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Scalar expression used by mutations, inserts and filters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference (flattened Nested names keep their dots)
    Column(String),
    /// Literal value
    Literal(Literal),
    /// Binary operation
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    /// Unary operation
    UnaryOp { op: UnaryOp, expr: Box<Expr> },
}

/// Possibly database-qualified object name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub database: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(database: Option<String>, name: impl Into<String>) -> Self {
        Self {
            database,
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(db) => write!(f, "{}.{}", db, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Column data type as written, e.g. `Array(Nullable(String))`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeName {
    pub name: String,
    pub args: Vec<TypeArg>,
}

/// One argument of a parameterized type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeArg {
    /// Nested type, e.g. the `String` in `Array(String)`
    Type(TypeName),
    /// Named element, e.g. `A UInt8` in `Nested(A UInt8, S String)`
    Field { name: String, ty: TypeName },
    /// Literal parameter, e.g. `16` in `FixedString(16)` or `'UTC'`
    Literal(String),
}

impl TypeName {
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Wrap in `Array(...)`
    pub fn array_of(inner: TypeName) -> Self {
        Self {
            name: "Array".to_string(),
            args: vec![TypeArg::Type(inner)],
        }
    }

    /// Whether this is a `Nested(...)` structure
    pub fn is_nested(&self) -> bool {
        self.name.eq_ignore_ascii_case("Nested")
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, "(")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl fmt::Display for TypeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeArg::Type(ty) => write!(f, "{}", ty),
            TypeArg::Field { name, ty } => write!(f, "{} {}", name, ty),
            TypeArg::Literal(text) => write!(f, "{}", text),
        }
    }
}

/// Kind of column default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultKind {
    Default,
    Materialized,
    Alias,
}

impl DefaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultKind::Default => "DEFAULT",
            DefaultKind::Materialized => "MATERIALIZED",
            DefaultKind::Alias => "ALIAS",
        }
    }
}

/// Column default clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefault {
    pub kind: DefaultKind,
    pub expression: String,
}

/// Column definition as written in CREATE TABLE / ADD COLUMN / MODIFY COLUMN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Always present for CREATE and ADD; optional for MODIFY
    pub data_type: Option<TypeName>,
    pub default: Option<ColumnDefault>,
    pub comment: Option<String>,
    /// Codec arguments without the surrounding `CODEC(...)`
    pub codec: Option<String>,
    pub ttl: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: TypeName) -> Self {
        Self {
            name: name.into(),
            data_type: Some(data_type),
            default: None,
            comment: None,
            codec: None,
            ttl: None,
        }
    }
}

/// Table engine clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    /// Engine name, e.g. `ReplicatedMergeTree`
    pub name: String,
    /// Raw argument texts
    pub args: Vec<String>,
    /// Everything from the engine name to the end of the statement
    pub full: String,
}

impl EngineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            full: name.clone(),
            name,
            args: Vec::new(),
        }
    }
}

/// Where ADD COLUMN places the new column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnPosition {
    Last,
    First,
    /// After the named column; a Nested name means after its last element
    After(String),
}

/// CREATE TABLE statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTableStatement {
    pub table: QualifiedName,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnSpec>,
    pub engine: EngineSpec,
}

/// Column-level ALTER command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterCommand {
    AddColumn {
        column: ColumnSpec,
        if_not_exists: bool,
        position: ColumnPosition,
    },
    DropColumn {
        name: String,
        if_exists: bool,
    },
    RenameColumn {
        from: String,
        to: String,
        if_exists: bool,
    },
    ModifyColumn {
        column: ColumnSpec,
        if_exists: bool,
    },
    CommentColumn {
        name: String,
        comment: String,
        if_exists: bool,
    },
}

/// Schema change carried by the replicated DDL log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlStatement {
    CreateTable(CreateTableStatement),
    DropTable {
        table: QualifiedName,
        if_exists: bool,
    },
    AlterTable {
        table: QualifiedName,
        commands: Vec<AlterCommand>,
    },
}

impl DdlStatement {
    /// The table the statement targets
    pub fn table(&self) -> &QualifiedName {
        match self {
            DdlStatement::CreateTable(create) => &create.table,
            DdlStatement::DropTable { table, .. } => table,
            DdlStatement::AlterTable { table, .. } => table,
        }
    }
}

/// Data mutation rewritten into new parts by the background scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationCommand {
    Update {
        assignments: Vec<(String, Expr)>,
        filter: Option<Expr>,
    },
    Delete {
        filter: Expr,
    },
}

/// SELECT projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Wildcard,
    Columns(Vec<String>),
}

/// Any statement accepted by the node query surface
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Replicated (or local) schema change
    Ddl(DdlStatement),
    CreateDatabase {
        name: String,
        if_not_exists: bool,
        engine: Option<EngineSpec>,
    },
    DropDatabase {
        name: String,
        if_exists: bool,
    },
    Describe(QualifiedName),
    Insert {
        table: QualifiedName,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    },
    Optimize(QualifiedName),
    Mutation {
        table: QualifiedName,
        command: MutationCommand,
    },
    Select {
        projection: Projection,
        from: QualifiedName,
        filter: Option<Expr>,
    },
}

/// Strip single quotes from a literal argument, e.g. `'{replica}'`
pub fn unquote(text: &str) -> Option<String> {
    let text = text.trim();
    let inner = text.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("\\'", "'").replace("''", "'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_display() {
        let nested = TypeName {
            name: "Nested".to_string(),
            args: vec![
                TypeArg::Field {
                    name: "A".to_string(),
                    ty: TypeName::simple("UInt8"),
                },
                TypeArg::Field {
                    name: "S".to_string(),
                    ty: TypeName::simple("String"),
                },
            ],
        };
        assert_eq!(nested.to_string(), "Nested(A UInt8, S String)");
        assert!(nested.is_nested());

        let arr = TypeName::array_of(TypeName::simple("UInt32"));
        assert_eq!(arr.to_string(), "Array(UInt32)");

        let fixed = TypeName {
            name: "FixedString".to_string(),
            args: vec![TypeArg::Literal("16".to_string())],
        };
        assert_eq!(fixed.to_string(), "FixedString(16)");
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("'{replica}'"), Some("{replica}".to_string()));
        assert_eq!(unquote(" '/clickhouse/x' "), Some("/clickhouse/x".to_string()));
        assert_eq!(unquote("d"), None);
    }

    #[test]
    fn test_qualified_name_display() {
        assert_eq!(
            QualifiedName::new(Some("testdb".into()), "t").to_string(),
            "testdb.t"
        );
        assert_eq!(QualifiedName::new(None, "t").to_string(), "t");
    }
}
