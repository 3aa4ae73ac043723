//! Query results and system table rows

use crate::merge::MutationEntry;
use crate::parts::{matches, Datum, PartError, PartResult};
use crate::schema::rows_to_tsv;
use crate::sql::Expr;

/// Column names of DESC output
pub const DESCRIBE_COLUMNS: &[&str] = &[
    "name",
    "type",
    "default_type",
    "default_expression",
    "comment",
    "codec_expression",
    "ttl_expression",
];

/// Columns of `system.mutations`
pub const MUTATIONS_COLUMNS: &[&str] = &[
    "database",
    "table",
    "mutation_id",
    "version",
    "parts_to_do",
    "is_done",
    "latest_failed_part",
    "latest_fail_reason",
    "fail_count",
];

/// Rows of text returned by a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    /// Result of a statement that returns nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn from_datums(columns: Vec<String>, rows: Vec<Vec<Datum>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| row.iter().map(|d| d.to_string()).collect())
            .collect();
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Tab-separated rows, one per line
    pub fn to_tsv(&self) -> String {
        rows_to_tsv(&self.rows)
    }

    /// Values of one column, if present
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }
}

fn optional(value: &Option<String>) -> Datum {
    Datum::String(value.clone().unwrap_or_default())
}

fn mutation_row(database: &str, table: &str, entry: &MutationEntry) -> Vec<Datum> {
    vec![
        Datum::String(database.to_string()),
        Datum::String(table.to_string()),
        Datum::String(format!("mutation_{}.txt", entry.version)),
        Datum::Int(entry.version as i64),
        Datum::Int(entry.parts_to_do as i64),
        Datum::from_bool(entry.is_done),
        optional(&entry.latest_failed_part),
        optional(&entry.latest_fail_reason),
        Datum::Int(i64::from(entry.fail_count)),
    ]
}

/// `system.mutations` rows for the given tables, projected and filtered
pub fn select_mutations(
    tables: &[(String, String, Vec<MutationEntry>)],
    columns: &[String],
    filter: Option<&Expr>,
) -> PartResult<Vec<Vec<Datum>>> {
    let all: Vec<String> = MUTATIONS_COLUMNS.iter().map(|c| c.to_string()).collect();
    let indices = columns
        .iter()
        .map(|c| {
            all.iter()
                .position(|a| a == c)
                .ok_or_else(|| PartError::ColumnNotFound(c.clone()))
        })
        .collect::<PartResult<Vec<_>>>()?;

    let mut rows = Vec::new();
    for (database, table, entries) in tables {
        for entry in entries {
            let row = mutation_row(database, table, entry);
            if matches(filter, &all, &row)? {
                rows.push(indices.iter().map(|&i| row[i].clone()).collect());
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Literal, MutationCommand};

    #[test]
    fn test_tsv_and_column_access() {
        let result = QueryResult::new(
            vec!["a".to_string(), "b".to_string()],
            vec![
                vec!["1".to_string(), "x".to_string()],
                vec!["2".to_string(), "".to_string()],
            ],
        );
        assert_eq!(result.to_tsv(), "1\tx\n2\t\n");
        assert_eq!(result.column("a"), Some(vec!["1", "2"]));
        assert_eq!(result.column("c"), None);
        assert!(QueryResult::empty().is_empty());
    }

    #[test]
    fn test_select_mutations() {
        let mut done = MutationEntry::new(
            2,
            MutationCommand::Delete {
                filter: Expr::Literal(Literal::Integer(1)),
            },
        );
        done.is_done = true;
        let tables = vec![("default".to_string(), "t".to_string(), vec![done])];
        let rows = select_mutations(
            &tables,
            &["mutation_id".to_string(), "is_done".to_string()],
            None,
        )
        .unwrap();
        let result = QueryResult::from_datums(vec![], rows);
        assert_eq!(result.to_tsv(), "mutation_2.txt\t1\n");

        assert!(select_mutations(&tables, &["nope".to_string()], None).is_err());
    }
}
