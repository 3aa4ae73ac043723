//! Table definitions and column-level ALTER commands

use serde::{Deserialize, Serialize};

use crate::sql::{unquote, AlterCommand, ColumnPosition, ColumnSpec, CreateTableStatement};

use super::columns::{ColumnDescription, ColumnsDescription};
use super::error::{SchemaError, SchemaResult};

/// Whether a table coordinates its block numbers through the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    Plain,
    Replicated,
}

impl EngineKind {
    pub fn from_engine_name(name: &str) -> Self {
        if name.starts_with("Replicated") {
            EngineKind::Replicated
        } else {
            EngineKind::Plain
        }
    }
}

/// Table definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub database: String,
    pub name: String,
    pub engine_kind: EngineKind,
    /// Engine clause as written, e.g. `MergeTree() ORDER BY tuple()`
    pub engine: String,
    pub columns: ColumnsDescription,
    /// Sequence id of the creating entry; a re-created table gets fresh storage
    pub uuid: u64,
    /// Coordination path for replicated engines
    pub zookeeper_path: Option<String>,
    /// Replica name as written, macros unexpanded; the node name when absent
    #[serde(default)]
    pub replica_name: Option<String>,
}

impl TableDef {
    /// Build a table from a parsed CREATE TABLE
    pub fn from_create(
        database: &str,
        create: &CreateTableStatement,
        uuid: u64,
    ) -> SchemaResult<Self> {
        let name = create.table.name.clone();
        let engine_kind = EngineKind::from_engine_name(&create.engine.name);
        // Only the `('path', 'replica', ...)` form names them; older forms get defaults
        let args = &create.engine.args;
        let named = args.first().and_then(|arg| unquote(arg));
        let (zookeeper_path, replica_name) = match engine_kind {
            EngineKind::Plain => (None, None),
            EngineKind::Replicated => (
                Some(
                    named
                        .clone()
                        .unwrap_or_else(|| format!("/clickhouse/tables/{}/{}", database, name)),
                ),
                named.and(args.get(1).and_then(|arg| unquote(arg))),
            ),
        };

        let mut table = TableDef {
            database: database.to_string(),
            name,
            engine_kind,
            engine: create.engine.full.clone(),
            columns: ColumnsDescription::new(),
            uuid,
            zookeeper_path,
            replica_name,
        };

        for spec in &create.columns {
            for column in ColumnDescription::from_spec(spec)? {
                if table.columns.has(&column.name) {
                    return Err(table.column_exists(&column.name));
                }
                table.columns.push(column);
            }
        }
        Ok(table)
    }

    /// Apply the commands of one ALTER statement, all or nothing
    pub fn alter(&mut self, commands: &[AlterCommand]) -> SchemaResult<()> {
        let mut altered = self.clone();
        for command in commands {
            altered.apply_command(command)?;
        }
        *self = altered;
        Ok(())
    }

    fn apply_command(&mut self, command: &AlterCommand) -> SchemaResult<()> {
        match command {
            AlterCommand::AddColumn {
                column,
                if_not_exists,
                position,
            } => self.add_column(column, *if_not_exists, position),
            AlterCommand::DropColumn { name, if_exists } => {
                if self.columns.remove(name) == 0 && !*if_exists {
                    return Err(self.column_not_found(name));
                }
                Ok(())
            }
            AlterCommand::RenameColumn {
                from,
                to,
                if_exists,
            } => {
                if !self.columns.has_physical_or_nested(from) {
                    return if *if_exists {
                        Ok(())
                    } else {
                        Err(self.column_not_found(from))
                    };
                }
                if self.columns.has_physical_or_nested(to) {
                    return Err(self.column_exists(to));
                }
                self.columns.rename(from, to);
                Ok(())
            }
            AlterCommand::ModifyColumn { column, if_exists } => {
                self.modify_column(column, *if_exists)
            }
            AlterCommand::CommentColumn {
                name,
                comment,
                if_exists,
            } => {
                let table = self.name.clone();
                match self.columns.get_mut(name) {
                    Some(col) => {
                        col.comment = comment.clone();
                        Ok(())
                    }
                    None if *if_exists => Ok(()),
                    None => Err(SchemaError::ColumnNotFound {
                        table,
                        column: name.clone(),
                    }),
                }
            }
        }
    }

    fn add_column(
        &mut self,
        spec: &ColumnSpec,
        if_not_exists: bool,
        position: &ColumnPosition,
    ) -> SchemaResult<()> {
        if self.columns.has_physical_or_nested(&spec.name) {
            return if if_not_exists {
                Ok(())
            } else {
                Err(self.column_exists(&spec.name))
            };
        }

        let new_columns = ColumnDescription::from_spec(spec)?;
        for column in &new_columns {
            if self.columns.has(&column.name) {
                return Err(self.column_exists(&column.name));
            }
        }

        let index = match position {
            ColumnPosition::Last => self.columns.len(),
            ColumnPosition::First => 0,
            ColumnPosition::After(after) => self
                .columns
                .position_after(after)
                .ok_or_else(|| self.column_not_found(after))?,
        };
        self.columns.insert_at(index, new_columns);
        Ok(())
    }

    fn modify_column(&mut self, spec: &ColumnSpec, if_exists: bool) -> SchemaResult<()> {
        if let Some(ty) = &spec.data_type {
            if ty.is_nested() {
                return Err(SchemaError::InvalidColumn(format!(
                    "cannot modify column '{}' to a Nested type",
                    spec.name
                )));
            }
        }

        let table = self.name.clone();
        match self.columns.get_mut(&spec.name) {
            Some(column) => {
                if let Some(ty) = &spec.data_type {
                    column.type_name = ty.to_string();
                }
                column.apply_clauses(spec);
                Ok(())
            }
            None if if_exists => Ok(()),
            None => Err(SchemaError::ColumnNotFound {
                table,
                column: spec.name.clone(),
            }),
        }
    }

    /// DESC rows in column order
    pub fn describe(&self) -> Vec<Vec<String>> {
        self.columns.iter().map(|c| c.describe_row()).collect()
    }

    fn column_exists(&self, column: &str) -> SchemaError {
        SchemaError::ColumnExists {
            table: self.name.clone(),
            column: column.to_string(),
        }
    }

    fn column_not_found(&self, column: &str) -> SchemaError {
        SchemaError::ColumnNotFound {
            table: self.name.clone(),
            column: column.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{DdlStatement, Parser};

    fn create(sql: &str) -> TableDef {
        match Parser::parse_ddl(sql).unwrap() {
            DdlStatement::CreateTable(create) => TableDef::from_create("testdb", &create, 1).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn alter(table: &mut TableDef, sql: &str) -> SchemaResult<()> {
        match Parser::parse_ddl(sql).unwrap() {
            DdlStatement::AlterTable { commands, .. } => table.alter(&commands),
            other => panic!("unexpected {:?}", other),
        }
    }

    const ALTER_TEST: &str = "CREATE TABLE testdb.alter_test (CounterID UInt32, StartDate Date, \
        UserID UInt32, VisitID UInt32, NestedColumn Nested(A UInt8, S String), ToDrop UInt32) \
        ENGINE = MergeTree(StartDate, intHash32(UserID), (CounterID, StartDate, intHash32(UserID), VisitID), 8192)";

    #[test]
    fn test_create_flattens_nested() {
        let table = create(ALTER_TEST);
        assert_eq!(
            table.columns.names(),
            vec![
                "CounterID",
                "StartDate",
                "UserID",
                "VisitID",
                "NestedColumn.A",
                "NestedColumn.S",
                "ToDrop"
            ]
        );
        assert_eq!(table.engine_kind, EngineKind::Plain);
        assert!(table.zookeeper_path.is_none());
    }

    #[test]
    fn test_add_column_sequence() {
        let mut table = create(ALTER_TEST);
        for sql in [
            "ALTER TABLE testdb.alter_test ADD COLUMN Added0 UInt32",
            "ALTER TABLE testdb.alter_test ADD COLUMN Added2 UInt32",
            "ALTER TABLE testdb.alter_test ADD COLUMN Added1 UInt32 AFTER Added0",
            "ALTER TABLE testdb.alter_test ADD COLUMN AddedNested1 Nested(A UInt32, B UInt64) AFTER Added2",
            "ALTER TABLE testdb.alter_test ADD COLUMN AddedNested1.C Array(String) AFTER AddedNested1.B",
            "ALTER TABLE testdb.alter_test ADD COLUMN AddedNested2 Nested(A UInt32, B UInt64) AFTER AddedNested1",
        ] {
            alter(&mut table, sql).unwrap();
        }

        let names = table.columns.names();
        assert_eq!(
            &names[7..],
            &[
                "Added0",
                "Added1",
                "Added2",
                "AddedNested1.A",
                "AddedNested1.B",
                "AddedNested1.C",
                "AddedNested2.A",
                "AddedNested2.B"
            ]
        );
        assert_eq!(
            table.columns.get("AddedNested1.C").unwrap().type_name,
            "Array(String)"
        );
        assert_eq!(
            table.columns.get("AddedNested2.B").unwrap().type_name,
            "Array(UInt64)"
        );
    }

    #[test]
    fn test_alter_is_all_or_nothing() {
        let mut table = create(ALTER_TEST);
        let before = table.clone();
        let err = alter(
            &mut table,
            "ALTER TABLE alter_test ADD COLUMN X UInt8, DROP COLUMN Missing",
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::ColumnNotFound { .. }));
        assert_eq!(table, before);
    }

    #[test]
    fn test_drop_rename_modify_comment() {
        let mut table = create(ALTER_TEST);
        alter(&mut table, "ALTER TABLE alter_test DROP COLUMN ToDrop").unwrap();
        alter(&mut table, "ALTER TABLE alter_test DROP COLUMN NestedColumn").unwrap();
        alter(&mut table, "ALTER TABLE alter_test RENAME COLUMN VisitID TO Visit").unwrap();
        alter(
            &mut table,
            "ALTER TABLE alter_test MODIFY COLUMN UserID UInt64 DEFAULT 0",
        )
        .unwrap();
        alter(
            &mut table,
            "ALTER TABLE alter_test COMMENT COLUMN CounterID 'counter'",
        )
        .unwrap();

        assert_eq!(
            table.columns.names(),
            vec!["CounterID", "StartDate", "UserID", "Visit"]
        );
        assert_eq!(
            table.describe()[2],
            vec!["UserID", "UInt64", "DEFAULT", "0", "", "", ""]
        );
        assert_eq!(table.describe()[0][4], "counter");

        assert!(alter(&mut table, "ALTER TABLE alter_test DROP COLUMN IF EXISTS Gone").is_ok());
        assert!(matches!(
            alter(&mut table, "ALTER TABLE alter_test ADD COLUMN Visit UInt8"),
            Err(SchemaError::ColumnExists { .. })
        ));
        assert!(alter(
            &mut table,
            "ALTER TABLE alter_test ADD COLUMN IF NOT EXISTS Visit UInt8"
        )
        .is_ok());
        assert!(matches!(
            alter(&mut table, "ALTER TABLE alter_test ADD COLUMN Y UInt8 AFTER Nope"),
            Err(SchemaError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_replicated_engine_path() {
        let table = create(
            "CREATE TABLE t (a Int64) ENGINE = ReplicatedMergeTree('/clickhouse/test_merge_simple', '{replica}') ORDER BY tuple()",
        );
        assert_eq!(table.engine_kind, EngineKind::Replicated);
        assert_eq!(
            table.zookeeper_path.as_deref(),
            Some("/clickhouse/test_merge_simple")
        );
        assert_eq!(table.replica_name.as_deref(), Some("{replica}"));

        let table = create("CREATE TABLE t (d Date, k UInt64) ENGINE=ReplicatedMergeTree(d, k, 8192)");
        assert_eq!(
            table.zookeeper_path.as_deref(),
            Some("/clickhouse/tables/testdb/t")
        );
        assert!(table.replica_name.is_none());
    }
}
