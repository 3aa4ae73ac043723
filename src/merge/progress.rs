//! In-flight merge and mutation records (`system.merges`)
//!
//! A record exists exactly while its task runs. Registration fails if the
//! same result part is already being produced, and the returned guard removes
//! the record however the task ends.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::parts::{matches, Datum, PartError, PartResult};
use crate::sql::Expr;

use super::error::{SchedulerError, SchedulerResult};

/// Every column of `system.merges`
pub const MERGES_COLUMNS: &[&str] = &[
    "database",
    "table",
    "elapsed",
    "num_parts",
    "source_part_names",
    "source_part_paths",
    "result_part_name",
    "result_part_path",
    "partition_id",
    "is_mutation",
];

/// Columns returned by `SELECT *`
pub const DEFAULT_MERGES_COLUMNS: &[&str] = &[
    "database",
    "table",
    "num_parts",
    "source_part_names",
    "source_part_paths",
    "result_part_name",
    "result_part_path",
    "partition_id",
    "is_mutation",
];

/// One running merge or mutation
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub database: String,
    pub table: String,
    /// Ascending block order
    pub source_part_names: Vec<String>,
    /// Same order as `source_part_names`
    pub source_part_paths: Vec<String>,
    pub result_part_name: String,
    pub result_part_path: String,
    pub partition_id: String,
    pub is_mutation: bool,
    pub started_at: Instant,
}

impl ExecutionRecord {
    pub fn num_parts(&self) -> usize {
        self.source_part_names.len()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Value of a `system.merges` column
    pub fn column(&self, name: &str) -> Option<Datum> {
        let value = match name {
            "database" => Datum::String(self.database.clone()),
            "table" => Datum::String(self.table.clone()),
            "elapsed" => Datum::Float(self.elapsed().as_secs_f64()),
            "num_parts" => Datum::Int(self.num_parts() as i64),
            "source_part_names" => Datum::String(format_array(&self.source_part_names)),
            "source_part_paths" => Datum::String(format_array(&self.source_part_paths)),
            "result_part_name" => Datum::String(self.result_part_name.clone()),
            "result_part_path" => Datum::String(self.result_part_path.clone()),
            "partition_id" => Datum::String(self.partition_id.clone()),
            "is_mutation" => Datum::from_bool(self.is_mutation),
            _ => return None,
        };
        Some(value)
    }
}

/// Render a string list as `['a','b']`
pub fn format_array(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|s| format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(","))
}

type RecordKey = (String, String, String);

/// Process-wide registry of running tasks
#[derive(Default)]
pub struct ProgressTable {
    records: Mutex<BTreeMap<RecordKey, ExecutionRecord>>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a record; fails if its result part is already being produced
    pub fn register(self: &Arc<Self>, record: ExecutionRecord) -> SchedulerResult<ProgressGuard> {
        let key = (
            record.database.clone(),
            record.table.clone(),
            record.result_part_name.clone(),
        );
        let mut records = self.records.lock();
        if records.contains_key(&key) {
            return Err(SchedulerError::SelectionConflict(key.2));
        }
        records.insert(key.clone(), record);
        Ok(ProgressGuard {
            table: Arc::clone(self),
            key,
        })
    }

    /// Snapshot of the running records, optionally for one database or table
    pub fn records(&self, database: Option<&str>, table: Option<&str>) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .values()
            .filter(|r| database.map_or(true, |db| r.database == db))
            .filter(|r| table.map_or(true, |t| r.table == t))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Rows of `system.merges` projected onto `columns` and filtered
    pub fn select(&self, columns: &[String], filter: Option<&Expr>) -> PartResult<Vec<Vec<Datum>>> {
        for column in columns {
            if !MERGES_COLUMNS.contains(&column.as_str()) {
                return Err(PartError::ColumnNotFound(column.clone()));
            }
        }
        let all: Vec<String> = MERGES_COLUMNS.iter().map(|c| c.to_string()).collect();

        let mut rows = Vec::new();
        for record in self.records(None, None) {
            let full: Vec<Datum> = all
                .iter()
                .map(|c| record.column(c).unwrap_or_default())
                .collect();
            if !matches(filter, &all, &full)? {
                continue;
            }
            rows.push(
                columns
                    .iter()
                    .map(|c| record.column(c).unwrap_or_default())
                    .collect(),
            );
        }
        Ok(rows)
    }

    fn remove(&self, key: &RecordKey) {
        self.records.lock().remove(key);
    }
}

/// Removes its record when dropped
pub struct ProgressGuard {
    table: Arc<ProgressTable>,
    key: RecordKey,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Parser, Statement};

    fn record(table: &str, result: &str, sources: &[&str]) -> ExecutionRecord {
        ExecutionRecord {
            database: "default".to_string(),
            table: table.to_string(),
            source_part_names: sources.iter().map(|s| s.to_string()).collect(),
            source_part_paths: sources
                .iter()
                .map(|s| format!("/var/lib/clickhouse/data/default/{}/{}/", table, s))
                .collect(),
            result_part_name: result.to_string(),
            result_part_path: format!("/var/lib/clickhouse/data/default/{}/{}/", table, result),
            partition_id: "all".to_string(),
            is_mutation: false,
            started_at: Instant::now(),
        }
    }

    fn filter(sql: &str) -> Option<Expr> {
        match Parser::parse_one(sql).unwrap() {
            Statement::Select { filter, .. } => filter,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_guard_removes_record() {
        let progress = Arc::new(ProgressTable::new());
        let guard = progress
            .register(record("t", "all_1_3_1", &["all_1_1_0", "all_2_2_0", "all_3_3_0"]))
            .unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress.records(None, Some("t"))[0].num_parts(), 3);
        assert!(progress.records(None, Some("other")).is_empty());
        drop(guard);
        assert!(progress.is_empty());
    }

    #[test]
    fn test_duplicate_result_conflicts() {
        let progress = Arc::new(ProgressTable::new());
        let _guard = progress.register(record("t", "all_1_2_1", &["all_1_1_0", "all_2_2_0"])).unwrap();
        assert!(matches!(
            progress.register(record("t", "all_1_2_1", &["all_1_1_0", "all_2_2_0"])),
            Err(SchedulerError::SelectionConflict(_))
        ));
        assert!(progress.register(record("u", "all_1_2_1", &["all_1_1_0"])).is_ok());
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn test_select_formats_rows() {
        let progress = Arc::new(ProgressTable::new());
        let _a = progress.register(record("t", "all_1_2_1", &["all_1_1_0", "all_2_2_0"])).unwrap();
        let _b = progress.register(record("u", "all_5_6_1", &["all_5_5_0", "all_6_6_0"])).unwrap();

        let columns: Vec<String> = DEFAULT_MERGES_COLUMNS.iter().map(|c| c.to_string()).collect();
        let rows = progress
            .select(&columns, filter("SELECT * FROM system.merges WHERE table = 't'").as_ref())
            .unwrap();
        assert_eq!(rows.len(), 1);
        let text: Vec<String> = rows[0].iter().map(|d| d.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "default",
                "t",
                "2",
                "['all_1_1_0','all_2_2_0']",
                "['/var/lib/clickhouse/data/default/t/all_1_1_0/','/var/lib/clickhouse/data/default/t/all_2_2_0/']",
                "all_1_2_1",
                "/var/lib/clickhouse/data/default/t/all_1_2_1/",
                "all",
                "0"
            ]
        );

        assert!(matches!(
            progress.select(&["bogus".to_string()], None),
            Err(PartError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_format_array_escapes_quotes() {
        assert_eq!(format_array(&[]), "[]");
        assert_eq!(format_array(&["it's".to_string()]), "['it\\'s']");
    }
}
