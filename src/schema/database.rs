//! Database schema and the fold over DDL log entries

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::replication::DdlLogEntry;
use crate::sql::{DdlStatement, Parser, QualifiedName};

use super::error::{SchemaError, SchemaResult};
use super::table::TableDef;

/// Effect of one applied statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    Created(String),
    Dropped(String),
    Altered(String),
    /// `IF [NOT] EXISTS` made the statement a no-op
    Unchanged,
}

/// All tables of one database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    name: String,
    tables: BTreeMap<String, TableDef>,
}

impl DatabaseSchema {
    /// Create an empty schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Tables in name order
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// Parse and apply a log entry
    pub fn apply(&mut self, entry: &DdlLogEntry) -> SchemaResult<SchemaChange> {
        let statement = Parser::parse_ddl(&entry.statement_text)?;
        self.apply_statement(&statement, entry.sequence_id)
    }

    /// Apply a parsed statement; `sequence_id` becomes the uuid of created tables
    pub fn apply_statement(
        &mut self,
        statement: &DdlStatement,
        sequence_id: u64,
    ) -> SchemaResult<SchemaChange> {
        let name = self.check_database(statement.table())?;

        match statement {
            DdlStatement::CreateTable(create) => {
                if self.tables.contains_key(&name) {
                    return if create.if_not_exists {
                        Ok(SchemaChange::Unchanged)
                    } else {
                        Err(SchemaError::TableExists(name))
                    };
                }
                let table = TableDef::from_create(&self.name, create, sequence_id)?;
                self.tables.insert(name.clone(), table);
                Ok(SchemaChange::Created(name))
            }
            DdlStatement::DropTable { if_exists, .. } => {
                if self.tables.remove(&name).is_some() {
                    Ok(SchemaChange::Dropped(name))
                } else if *if_exists {
                    Ok(SchemaChange::Unchanged)
                } else {
                    Err(SchemaError::TableNotFound(name))
                }
            }
            DdlStatement::AlterTable { commands, .. } => {
                let table = self
                    .tables
                    .get_mut(&name)
                    .ok_or_else(|| SchemaError::TableNotFound(name.clone()))?;
                table.alter(commands)?;
                Ok(SchemaChange::Altered(name))
            }
        }
    }

    /// Replay entries in order on top of `initial`
    pub fn fold<'a>(
        initial: DatabaseSchema,
        entries: impl IntoIterator<Item = &'a DdlLogEntry>,
    ) -> SchemaResult<DatabaseSchema> {
        let mut schema = initial;
        for entry in entries {
            schema.apply(entry)?;
        }
        Ok(schema)
    }

    /// Tab-separated DESC output for `table`
    pub fn describe(&self, table: &str) -> SchemaResult<String> {
        let def = self
            .tables
            .get(table)
            .ok_or_else(|| SchemaError::TableNotFound(format!("{}.{}", self.name, table)))?;
        Ok(rows_to_tsv(&def.describe()))
    }

    fn check_database(&self, table: &QualifiedName) -> SchemaResult<String> {
        match &table.database {
            Some(db) if db != &self.name => Err(SchemaError::ForeignDatabase {
                expected: self.name.clone(),
                found: db.clone(),
            }),
            _ => Ok(table.name.clone()),
        }
    }
}

/// Render rows as tab-separated lines, each terminated by a newline
pub fn rows_to_tsv(rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out
}
