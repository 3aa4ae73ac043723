//! Part registry
//!
//! Per-table set of immutable parts keyed by [`PartInfo`], so iteration is in
//! partition and block order. Publishing a merge or mutation result swaps the
//! sources for the result under one write lock; readers see either the old
//! set or the new one. A mutation result also raises the table's committed
//! mutation version in that same step.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::sql::Expr;

use super::datum::Datum;
use super::error::{PartError, PartResult};
use super::eval::matches;
use super::info::{part_path, PartInfo};

/// Immutable chunk of rows
#[derive(Debug, Clone)]
pub struct Part {
    pub info: PartInfo,
    pub name: String,
    /// `<root>/data/<database>/<table>/<name>/`
    pub path: String,
    /// Column names the rows were written with
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Datum>>,
}

impl Part {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Value of `column` in `row`, NULL if the part predates the column
    pub fn value(&self, row: &[Datum], column: &str) -> Datum {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| row.get(idx).cloned())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct RegistryState {
    parts: BTreeMap<PartInfo, Arc<Part>>,
    /// Highest mutation version carried by a published part
    mutation_version: u64,
}

/// Parts of one table
pub struct PartRegistry {
    database: String,
    table: String,
    data_root: String,
    state: RwLock<RegistryState>,
}

impl PartRegistry {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        data_root: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            data_root: data_root.into(),
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Directory a part with this name lives in
    pub fn part_path(&self, name: &str) -> String {
        part_path(&self.data_root, &self.database, &self.table, name)
    }

    /// Build a part owned by this table
    pub fn build_part(&self, info: PartInfo, columns: Vec<String>, rows: Vec<Vec<Datum>>) -> Part {
        let name = info.name();
        Part {
            path: self.part_path(&name),
            info,
            name,
            columns,
            rows,
        }
    }

    /// Live parts ordered by partition, min block, max block, level and mutation
    pub fn list_parts(&self) -> Vec<Arc<Part>> {
        self.state.read().parts.values().cloned().collect()
    }

    /// Live parts together with the committed mutation version, read at once
    pub fn snapshot(&self) -> (Vec<Arc<Part>>, u64) {
        let state = self.state.read();
        (state.parts.values().cloned().collect(), state.mutation_version)
    }

    pub fn mutation_version(&self) -> u64 {
        self.state.read().mutation_version
    }

    pub fn get(&self, name: &str) -> Option<Arc<Part>> {
        let info: PartInfo = name.parse().ok()?;
        self.state.read().parts.get(&info).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().parts.is_empty()
    }

    /// Register a freshly inserted part
    pub fn add(&self, part: Part) -> PartResult<()> {
        let mut state = self.state.write();
        let parts = &mut state.parts;
        if parts.contains_key(&part.info) {
            return Err(PartError::PartExists(part.name));
        }
        tracing::debug!(
            database = %self.database,
            table = %self.table,
            part = %part.name,
            rows = part.num_rows(),
            "Added part"
        );
        parts.insert(part.info.clone(), Arc::new(part));
        Ok(())
    }

    /// Atomically remove `sources` and insert `result`
    ///
    /// Fails without changing anything if a source is gone or the result name
    /// is taken.
    pub fn replace(&self, sources: &[String], result: Part) -> PartResult<()> {
        let source_infos = sources
            .iter()
            .map(|name| name.parse::<PartInfo>())
            .collect::<PartResult<Vec<_>>>()?;

        let mut state = self.state.write();
        let parts = &mut state.parts;
        for (info, name) in source_infos.iter().zip(sources) {
            if !parts.contains_key(info) {
                return Err(PartError::PartNotFound(name.clone()));
            }
        }
        if parts.contains_key(&result.info) && !source_infos.contains(&result.info) {
            return Err(PartError::PartExists(result.name));
        }

        for info in &source_infos {
            parts.remove(info);
        }
        let mutation = result.info.mutation;
        tracing::debug!(
            database = %self.database,
            table = %self.table,
            ?sources,
            result = %result.name,
            "Replaced parts"
        );
        parts.insert(result.info.clone(), Arc::new(result));
        if let Some(version) = mutation {
            state.mutation_version = state.mutation_version.max(version);
        }
        Ok(())
    }

    /// Rows of all live parts in part order, projected onto `columns`
    pub fn scan(&self, columns: &[String], filter: Option<&Expr>) -> PartResult<Vec<Vec<Datum>>> {
        let mut out = Vec::new();
        for part in self.list_parts() {
            for row in &part.rows {
                let projected: Vec<Datum> =
                    columns.iter().map(|c| part.value(row, c)).collect();
                if matches(filter, columns, &projected)? {
                    out.push(projected);
                }
            }
        }
        Ok(out)
    }
}
