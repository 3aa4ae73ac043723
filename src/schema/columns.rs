//! Ordered column descriptions
//!
//! Columns keep their declaration order. `Nested(A T, B U)` columns never
//! appear as such: they are flattened into `name.A Array(T)` and
//! `name.B Array(U)`, and a Nested name refers to the whole group.

use serde::{Deserialize, Serialize};

use crate::sql::{ColumnSpec, TypeArg, TypeName};

use super::error::{SchemaError, SchemaResult};

/// One column as reported by DESC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub type_name: String,
    /// `DEFAULT`, `MATERIALIZED`, `ALIAS` or empty
    pub default_kind: String,
    pub default_expression: String,
    pub comment: String,
    /// Rendered as `CODEC(...)` or empty
    pub codec: String,
    pub ttl: String,
}

impl ColumnDescription {
    /// Create a column with only a name and a type
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            default_kind: String::new(),
            default_expression: String::new(),
            comment: String::new(),
            codec: String::new(),
            ttl: String::new(),
        }
    }

    /// Build the flattened column list for a parsed definition
    pub fn from_spec(spec: &ColumnSpec) -> SchemaResult<Vec<ColumnDescription>> {
        let data_type = spec.data_type.as_ref().ok_or_else(|| {
            SchemaError::InvalidColumn(format!("column '{}' has no type", spec.name))
        })?;

        if !data_type.is_nested() {
            let mut column = ColumnDescription::new(&spec.name, data_type.to_string());
            column.apply_clauses(spec);
            return Ok(vec![column]);
        }

        if spec.default.is_some() {
            return Err(SchemaError::InvalidColumn(format!(
                "Nested column '{}' cannot have a default",
                spec.name
            )));
        }

        let mut columns = Vec::with_capacity(data_type.args.len());
        for arg in &data_type.args {
            match arg {
                TypeArg::Field { name, ty } => {
                    let mut column = ColumnDescription::new(
                        format!("{}.{}", spec.name, name),
                        TypeName::array_of(ty.clone()).to_string(),
                    );
                    column.apply_clauses(spec);
                    columns.push(column);
                }
                other => {
                    return Err(SchemaError::InvalidColumn(format!(
                        "Nested column '{}' has unnamed element '{}'",
                        spec.name, other
                    )))
                }
            }
        }
        if columns.is_empty() {
            return Err(SchemaError::InvalidColumn(format!(
                "Nested column '{}' has no elements",
                spec.name
            )));
        }
        Ok(columns)
    }

    /// Copy default, comment, codec and TTL clauses that are present in `spec`
    pub fn apply_clauses(&mut self, spec: &ColumnSpec) {
        if let Some(default) = &spec.default {
            self.default_kind = default.kind.as_str().to_string();
            self.default_expression = default.expression.clone();
        }
        if let Some(comment) = &spec.comment {
            self.comment = comment.clone();
        }
        if let Some(codec) = &spec.codec {
            self.codec = format!("CODEC({})", codec);
        }
        if let Some(ttl) = &spec.ttl {
            self.ttl = ttl.clone();
        }
    }

    /// The DESC row for this column
    pub fn describe_row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.type_name.clone(),
            self.default_kind.clone(),
            self.default_expression.clone(),
            self.comment.clone(),
            self.codec.clone(),
            self.ttl.clone(),
        ]
    }

    /// Whether this column is an element of the Nested group `group`
    pub fn in_nested_group(&self, group: &str) -> bool {
        self.name
            .strip_prefix(group)
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// Ordered list of column descriptions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnsDescription {
    columns: Vec<ColumnDescription>,
}

impl ColumnsDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnDescription> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDescription> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ColumnDescription> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Exact column name
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Name of a flattened Nested group
    pub fn has_nested(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.in_nested_group(name))
    }

    /// Column or Nested group
    pub fn has_physical_or_nested(&self, name: &str) -> bool {
        self.has(name) || self.has_nested(name)
    }

    /// Index just past `name`, or past the last element of Nested group `name`
    pub fn position_after(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .rposition(|c| c.name == name || c.in_nested_group(name))
            .map(|idx| idx + 1)
    }

    /// Insert columns as a contiguous run starting at `index`
    pub fn insert_at(&mut self, index: usize, columns: Vec<ColumnDescription>) {
        let index = index.min(self.columns.len());
        self.columns.splice(index..index, columns);
    }

    pub fn push(&mut self, column: ColumnDescription) {
        self.columns.push(column);
    }

    /// Remove a column or a whole Nested group, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.columns.len();
        self.columns
            .retain(|c| c.name != name && !c.in_nested_group(name));
        before - self.columns.len()
    }

    /// Rename a column, or every element of a Nested group
    pub fn rename(&mut self, from: &str, to: &str) {
        for column in &mut self.columns {
            if column.name == from {
                column.name = to.to_string();
            } else if column.in_nested_group(from) {
                column.name = format!("{}{}", to, &column.name[from.len()..]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{ColumnDefault, DefaultKind};

    fn nested(name: &str, fields: &[(&str, &str)]) -> ColumnSpec {
        ColumnSpec::new(
            name,
            TypeName {
                name: "Nested".to_string(),
                args: fields
                    .iter()
                    .map(|(n, t)| TypeArg::Field {
                        name: n.to_string(),
                        ty: TypeName::simple(*t),
                    })
                    .collect(),
            },
        )
    }

    #[test]
    fn test_flatten_nested() {
        let cols =
            ColumnDescription::from_spec(&nested("NestedColumn", &[("A", "UInt8"), ("S", "String")]))
                .unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "NestedColumn.A");
        assert_eq!(cols[0].type_name, "Array(UInt8)");
        assert_eq!(cols[1].name, "NestedColumn.S");
        assert_eq!(cols[1].type_name, "Array(String)");
    }

    #[test]
    fn test_clauses_render_like_desc() {
        let mut spec = ColumnSpec::new("x", TypeName::simple("UInt32"));
        spec.default = Some(ColumnDefault {
            kind: DefaultKind::Materialized,
            expression: "y * 2".to_string(),
        });
        spec.codec = Some("ZSTD(1)".to_string());
        let cols = ColumnDescription::from_spec(&spec).unwrap();
        assert_eq!(
            cols[0].describe_row(),
            vec!["x", "UInt32", "MATERIALIZED", "y * 2", "", "CODEC(ZSTD(1))", ""]
        );
    }

    #[test]
    fn test_nested_group_helpers() {
        let mut columns = ColumnsDescription::new();
        columns.push(ColumnDescription::new("a", "UInt32"));
        for col in
            ColumnDescription::from_spec(&nested("N", &[("A", "UInt32"), ("B", "UInt64")])).unwrap()
        {
            columns.push(col);
        }
        columns.push(ColumnDescription::new("NA", "UInt8"));

        assert!(columns.has_nested("N"));
        assert!(!columns.has("N"));
        assert!(!columns.has_nested("NA"));
        assert_eq!(columns.position_after("N"), Some(3));
        assert_eq!(columns.position_after("a"), Some(1));
        assert_eq!(columns.position_after("missing"), None);

        columns.rename("N", "M");
        assert_eq!(columns.names(), vec!["a", "M.A", "M.B", "NA"]);

        assert_eq!(columns.remove("M"), 2);
        assert_eq!(columns.names(), vec!["a", "NA"]);
    }
}
