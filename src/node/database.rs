//! Databases hosted by a node
//!
//! A local database applies DDL directly to its schema. A replicated database
//! routes DDL through its replicator, so every replica applies it in log order.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::replication::DdlReplicator;
use crate::schema::{DatabaseSchema, TableDef};
use crate::sql::DdlStatement;

use super::error::NodeResult;

/// Non-replicated database
pub struct LocalDatabase {
    schema: RwLock<DatabaseSchema>,
    /// Uuid for the next created table
    next_uuid: AtomicU64,
}

pub enum Database {
    Local(LocalDatabase),
    Replicated(DdlReplicator),
}

impl Database {
    pub fn local(name: &str) -> Self {
        Database::Local(LocalDatabase {
            schema: RwLock::new(DatabaseSchema::new(name)),
            next_uuid: AtomicU64::new(0),
        })
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Database::Replicated(_))
    }

    pub fn replicator(&self) -> Option<&DdlReplicator> {
        match self {
            Database::Local(_) => None,
            Database::Replicated(replicator) => Some(replicator),
        }
    }

    /// Run `f` against the current schema
    pub fn with_schema<R>(&self, f: impl FnOnce(&DatabaseSchema) -> R) -> R {
        match self {
            Database::Local(db) => f(&*db.schema.read()),
            Database::Replicated(replicator) => replicator.with_schema(f),
        }
    }

    /// Copies of every table definition
    pub fn tables(&self) -> Vec<TableDef> {
        self.with_schema(|schema| schema.tables().cloned().collect())
    }

    /// Apply a schema change
    pub async fn execute_ddl(&self, statement_text: &str, statement: &DdlStatement) -> NodeResult<()> {
        match self {
            Database::Local(db) => {
                let uuid = db.next_uuid.fetch_add(1, Ordering::SeqCst);
                db.schema.write().apply_statement(statement, uuid)?;
                Ok(())
            }
            Database::Replicated(replicator) => {
                replicator.execute(statement_text).await?;
                Ok(())
            }
        }
    }

    /// Bring the schema up to date with everything already logged
    pub async fn sync(&self) -> NodeResult<()> {
        if let Database::Replicated(replicator) = self {
            replicator.sync().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Database::Replicated(replicator) = self {
            replicator.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaError;
    use crate::sql::Parser;
    use crate::node::NodeError;

    async fn ddl(db: &Database, sql: &str) -> NodeResult<()> {
        db.execute_ddl(sql, &Parser::parse_ddl(sql).unwrap()).await
    }

    #[tokio::test]
    async fn test_local_database_applies_directly() {
        let db = Database::local("default");
        ddl(&db, "CREATE TABLE t (a UInt32) ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        ddl(&db, "ALTER TABLE default.t ADD COLUMN b String").await.unwrap();
        assert!(!db.is_replicated());

        let tables = db.tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].columns.names(), vec!["a", "b"]);

        ddl(&db, "DROP TABLE t").await.unwrap();
        ddl(&db, "CREATE TABLE t (a UInt32) ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        assert_ne!(db.tables()[0].uuid, tables[0].uuid);

        assert!(matches!(
            ddl(&db, "CREATE TABLE t (a UInt32) ENGINE = MergeTree").await,
            Err(NodeError::Schema(SchemaError::TableExists(_)))
        ));
    }
}
