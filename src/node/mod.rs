//! A single server instance
//!
//! A node hosts databases (local or replicated), keeps one storage per table
//! in step with the schema, and runs the merge scheduler. Everything is
//! reached through [`Node::query`].
//!
//! Table storage is reconciled with the schema lazily: after local DDL and
//! before any statement that touches table data. A table that was dropped and
//! re-created gets fresh storage because its uuid changed.

pub mod config;
pub mod database;
pub mod error;
pub mod query;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::coordination::CoordinationStore;
use crate::merge::{
    MergeScheduler, MergeSelector, MergeTreeTable, MutationEntry, PartTransformer,
    ProgressTable, TableLog, TaskHook, DEFAULT_MERGES_COLUMNS,
};
use crate::parts::{eval, BlockAllocator, Datum, PartError, PartRegistry};
use crate::replication::DdlReplicator;
use crate::schema::{EngineKind, TableDef};
use crate::sql::{
    unquote, DdlStatement, EngineSpec, Expr, MutationCommand, Parser, Projection, QualifiedName,
    Statement,
};

pub use config::{NodeConfig, DEFAULT_DATABASE};
pub use database::{Database, LocalDatabase};
pub use error::{NodeError, NodeResult};
pub use query::{QueryResult, DESCRIBE_COLUMNS, MUTATIONS_COLUMNS};

/// Database holding the system tables
pub const SYSTEM_DATABASE: &str = "system";

/// Storage of one table generation
struct TableStorage {
    uuid: u64,
    table: Arc<MergeTreeTable>,
}

/// Builder for [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    store: Arc<dyn CoordinationStore>,
    hook: Option<Arc<dyn TaskHook>>,
    transformer: Option<Arc<dyn PartTransformer>>,
    selector: Option<Arc<dyn MergeSelector>>,
}

impl NodeBuilder {
    /// Hook run by every merge and mutation task
    #[must_use]
    pub fn hook(mut self, hook: Arc<dyn TaskHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn PartTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    #[must_use]
    pub fn selector(mut self, selector: Arc<dyn MergeSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn start(self) -> Node {
        let mut scheduler = MergeScheduler::builder(self.config.scheduler.clone())
            .progress(Arc::new(ProgressTable::new()));
        if let Some(hook) = self.hook {
            scheduler = scheduler.hook(hook);
        }
        if let Some(transformer) = self.transformer {
            scheduler = scheduler.transformer(transformer);
        }
        if let Some(selector) = self.selector {
            scheduler = scheduler.selector(selector);
        }

        let mut databases = BTreeMap::new();
        databases.insert(
            DEFAULT_DATABASE.to_string(),
            Arc::new(Database::local(DEFAULT_DATABASE)),
        );

        tracing::info!(node = %self.config.name, "Node started");
        Node {
            config: self.config,
            store: self.store,
            databases: RwLock::new(databases),
            storages: Mutex::new(BTreeMap::new()),
            scheduler: scheduler.start(),
        }
    }
}

/// One server instance
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn CoordinationStore>,
    databases: RwLock<BTreeMap<String, Arc<Database>>>,
    storages: Mutex<BTreeMap<(String, String), TableStorage>>,
    scheduler: MergeScheduler,
}

impl Node {
    pub fn builder(config: NodeConfig, store: Arc<dyn CoordinationStore>) -> NodeBuilder {
        NodeBuilder {
            config,
            store,
            hook: None,
            transformer: None,
            selector: None,
        }
    }

    /// Start a node with the default scheduler components
    pub fn start(config: NodeConfig, store: Arc<dyn CoordinationStore>) -> Node {
        Self::builder(config, store).start()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &MergeScheduler {
        &self.scheduler
    }

    pub fn progress(&self) -> &Arc<ProgressTable> {
        self.scheduler.progress()
    }

    pub fn database(&self, name: &str) -> NodeResult<Arc<Database>> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::DatabaseNotFound(name.to_string()))
    }

    /// Names of the hosted databases
    pub fn databases(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    /// Execute one statement
    pub async fn query(&self, sql: &str) -> NodeResult<QueryResult> {
        let statement = Parser::parse_one(sql)?;
        tracing::debug!(node = %self.config.name, sql, "Executing query");

        match statement {
            Statement::Ddl(ddl) => self.execute_ddl(sql, &ddl).await,
            Statement::CreateDatabase {
                name,
                if_not_exists,
                engine,
            } => self.create_database(&name, if_not_exists, engine).await,
            Statement::DropDatabase { name, if_exists } => {
                self.drop_database(&name, if_exists).await
            }
            Statement::Describe(table) => self.describe(&table),
            Statement::Insert {
                table,
                columns,
                rows,
            } => self.insert(&table, columns, rows).await,
            Statement::Optimize(table) => self.optimize(&table).await,
            Statement::Mutation { table, command } => self.mutate(&table, command).await,
            Statement::Select {
                projection,
                from,
                filter,
            } => self.select(projection, &from, filter.as_ref()),
        }
    }

    /// DESC output of a table as tab-separated text
    pub fn describe_tsv(&self, database: &str, table: &str) -> NodeResult<String> {
        Ok(self.database(database)?.with_schema(|s| s.describe(table))?)
    }

    /// Wait until this node has applied everything already in a database's log
    /// and in the logs of its replicated tables
    pub async fn sync(&self, database: &str) -> NodeResult<()> {
        self.database(database)?.sync().await?;
        self.sync_storage()?;

        let replicated: Vec<Arc<MergeTreeTable>> = self
            .storages
            .lock()
            .values()
            .filter(|s| s.table.database() == database && s.table.is_replicated())
            .map(|s| Arc::clone(&s.table))
            .collect();
        for table in replicated {
            self.scheduler.sync_table(database, table.name()).await?;
        }
        Ok(())
    }

    pub fn mutations(&self, database: &str, table: &str) -> NodeResult<Vec<MutationEntry>> {
        Ok(self.scheduler.mutations(database, table)?)
    }

    /// Wait until every mutation of a table registered so far is done
    pub async fn wait_for_mutations(&self, database: &str, table: &str) -> NodeResult<()> {
        for entry in self.scheduler.mutations(database, table)? {
            if !entry.is_done {
                self.scheduler
                    .wait_for_mutation(database, table, entry.version)
                    .await?;
            }
        }
        Ok(())
    }

    /// Stop the scheduler and every replicator
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();
        for database in databases {
            database.shutdown().await;
        }
        tracing::info!(node = %self.config.name, "Node stopped");
    }

    // ============ Statements ============

    async fn execute_ddl(&self, sql: &str, ddl: &DdlStatement) -> NodeResult<QueryResult> {
        let database = self.database(database_of(ddl.table()))?;
        database.execute_ddl(sql, ddl).await?;
        self.sync_storage()?;
        Ok(QueryResult::empty())
    }

    async fn create_database(
        &self,
        name: &str,
        if_not_exists: bool,
        engine: Option<EngineSpec>,
    ) -> NodeResult<QueryResult> {
        if self.databases.read().contains_key(name) {
            return if if_not_exists {
                Ok(QueryResult::empty())
            } else {
                Err(NodeError::DatabaseExists(name.to_string()))
            };
        }

        let database = match engine {
            None => Database::local(name),
            Some(engine) => match engine.name.as_str() {
                "Atomic" | "Ordinary" | "Memory" => Database::local(name),
                "Replicated" => Database::Replicated(self.start_replicator(name, &engine).await?),
                other => return Err(NodeError::InvalidEngine(other.to_string())),
            },
        };
        let database = Arc::new(database);

        let inserted = {
            let mut databases = self.databases.write();
            if databases.contains_key(name) {
                false
            } else {
                databases.insert(name.to_string(), Arc::clone(&database));
                true
            }
        };
        if !inserted {
            database.shutdown().await;
            return if if_not_exists {
                Ok(QueryResult::empty())
            } else {
                Err(NodeError::DatabaseExists(name.to_string()))
            };
        }

        tracing::info!(
            node = %self.config.name,
            database = name,
            replicated = database.is_replicated(),
            "Created database"
        );
        self.sync_storage()?;
        Ok(QueryResult::empty())
    }

    /// `Replicated('path' [, 'shard'], 'replica')`; the replica defaults to `{replica}`
    async fn start_replicator(&self, name: &str, engine: &EngineSpec) -> NodeResult<DdlReplicator> {
        let arg = |idx: usize| -> NodeResult<Option<String>> {
            let Some(raw) = engine.args.get(idx) else {
                return Ok(None);
            };
            let text = unquote(raw).ok_or_else(|| {
                NodeError::InvalidEngine(format!("expected a string literal, got {}", raw))
            })?;
            Ok(Some(self.config.substitute_macros(&text)?))
        };

        let db_path = arg(0)?.ok_or_else(|| {
            NodeError::InvalidEngine("Replicated requires a coordination path".to_string())
        })?;
        let replica = match engine.args.len() {
            0 | 1 => self.config.substitute_macros("{replica}")?,
            2 => arg(1)?.unwrap_or_default(),
            _ => arg(2)?.unwrap_or_default(),
        };

        let mut config = self.config.replicator.clone();
        if let Some(dir) = &self.config.state_dir {
            config = config.with_state_dir(dir.join(name));
        }

        let replicator =
            DdlReplicator::start(Arc::clone(&self.store), name, &db_path, &replica, config).await?;
        if let Err(e) = replicator.wait_active().await {
            tracing::warn!(
                node = %self.config.name,
                database = name,
                error = %e,
                "Replicated database halted during replay"
            );
        }
        Ok(replicator)
    }

    async fn drop_database(&self, name: &str, if_exists: bool) -> NodeResult<QueryResult> {
        let removed = self.databases.write().remove(name);
        match removed {
            Some(database) => {
                database.shutdown().await;
                tracing::info!(node = %self.config.name, database = name, "Dropped database");
                self.sync_storage()?;
                Ok(QueryResult::empty())
            }
            None if if_exists => Ok(QueryResult::empty()),
            None => Err(NodeError::DatabaseNotFound(name.to_string())),
        }
    }

    fn describe(&self, table: &QualifiedName) -> NodeResult<QueryResult> {
        let database = self.database(database_of(table))?;
        let rows = database.with_schema(|schema| {
            schema
                .table(&table.name)
                .map(TableDef::describe)
                .ok_or_else(|| NodeError::TableNotFound(table.to_string()))
        })?;
        Ok(QueryResult::new(
            DESCRIBE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        ))
    }

    async fn insert(
        &self,
        table: &QualifiedName,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
    ) -> NodeResult<QueryResult> {
        let storage = self.storage(table)?;
        let table_columns = storage.columns();
        let targets: Vec<usize> = match columns {
            None => (0..table_columns.len()).collect(),
            Some(columns) => columns
                .iter()
                .map(|c| {
                    table_columns
                        .iter()
                        .position(|t| t == c)
                        .ok_or_else(|| PartError::ColumnNotFound(c.clone()))
                })
                .collect::<Result<_, _>>()?,
        };

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != targets.len() {
                return Err(NodeError::Insert(format!(
                    "expected {} values, got {}",
                    targets.len(),
                    row.len()
                )));
            }
            let mut out = vec![Datum::Null; table_columns.len()];
            for (expr, &idx) in row.iter().zip(&targets) {
                out[idx] = eval(expr, &[], &[])?;
            }
            values.push(out);
        }
        if values.is_empty() {
            return Ok(QueryResult::empty());
        }

        storage.insert(values).await?;
        self.scheduler.notify();
        Ok(QueryResult::empty())
    }

    async fn optimize(&self, table: &QualifiedName) -> NodeResult<QueryResult> {
        let storage = self.storage(table)?;
        self.scheduler
            .optimize(storage.database(), storage.name())
            .await?;
        Ok(QueryResult::empty())
    }

    async fn mutate(
        &self,
        table: &QualifiedName,
        command: MutationCommand,
    ) -> NodeResult<QueryResult> {
        let storage = self.storage(table)?;
        let version = self
            .scheduler
            .mutate(storage.database(), storage.name(), command)
            .await?;
        if self.config.mutations_sync {
            self.scheduler
                .wait_for_mutation(storage.database(), storage.name(), version)
                .await?;
        }
        Ok(QueryResult::empty())
    }

    fn select(
        &self,
        projection: Projection,
        from: &QualifiedName,
        filter: Option<&Expr>,
    ) -> NodeResult<QueryResult> {
        if from.database.as_deref() == Some(SYSTEM_DATABASE) {
            return self.select_system(projection, &from.name, filter);
        }

        let storage = self.storage(from)?;
        let all = storage.columns();
        let columns = match projection {
            Projection::Wildcard => all.clone(),
            Projection::Columns(columns) => columns,
        };
        let indices = columns
            .iter()
            .map(|c| {
                all.iter()
                    .position(|a| a == c)
                    .ok_or_else(|| PartError::ColumnNotFound(c.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rows = storage
            .registry()
            .scan(&all, filter)?
            .into_iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(QueryResult::from_datums(columns, rows))
    }

    fn select_system(
        &self,
        projection: Projection,
        table: &str,
        filter: Option<&Expr>,
    ) -> NodeResult<QueryResult> {
        let columns = |defaults: &[&str]| match &projection {
            Projection::Wildcard => defaults.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            Projection::Columns(columns) => columns.clone(),
        };

        match table {
            "merges" => {
                let columns = columns(DEFAULT_MERGES_COLUMNS);
                let rows = self.progress().select(&columns, filter)?;
                Ok(QueryResult::from_datums(columns, rows))
            }
            "mutations" => {
                let columns = columns(MUTATIONS_COLUMNS);
                self.sync_storage()?;
                let tables: Vec<(String, String, Vec<MutationEntry>)> = self
                    .storages
                    .lock()
                    .values()
                    .map(|s| {
                        (
                            s.table.database().to_string(),
                            s.table.name().to_string(),
                            s.table.mutations(),
                        )
                    })
                    .collect();
                let rows = query::select_mutations(&tables, &columns, filter)?;
                Ok(QueryResult::from_datums(columns, rows))
            }
            other => Err(NodeError::TableNotFound(format!(
                "{}.{}",
                SYSTEM_DATABASE, other
            ))),
        }
    }

    // ============ Table storage ============

    /// Storage of a table, creating it if the schema gained the table
    fn storage(&self, table: &QualifiedName) -> NodeResult<Arc<MergeTreeTable>> {
        self.sync_storage()?;
        let key = (database_of(table).to_string(), table.name.clone());
        self.storages
            .lock()
            .get(&key)
            .map(|s| Arc::clone(&s.table))
            .ok_or_else(|| NodeError::TableNotFound(format!("{}.{}", key.0, key.1)))
    }

    /// Reconcile table storage with the current schemas
    fn sync_storage(&self) -> NodeResult<()> {
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();
        let mut wanted: BTreeMap<(String, String), TableDef> = BTreeMap::new();
        for database in databases {
            for table in database.tables() {
                wanted.insert((table.database.clone(), table.name.clone()), table);
            }
        }

        let mut storages = self.storages.lock();
        let stale: Vec<(String, String)> = storages
            .iter()
            .filter(|(key, storage)| wanted.get(*key).map_or(true, |t| t.uuid != storage.uuid))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            storages.remove(&key);
            self.scheduler.detach(&key.0, &key.1);
            tracing::info!(node = %self.config.name, database = %key.0, table = %key.1, "Released table storage");
        }

        for (key, def) in wanted {
            match storages.get(&key) {
                Some(storage) => storage.table.set_columns(def.columns.names()),
                None => {
                    let table = Arc::new(self.build_storage(&def)?);
                    self.scheduler.attach(Arc::clone(&table));
                    tracing::info!(
                        node = %self.config.name,
                        database = %def.database,
                        table = %def.name,
                        uuid = def.uuid,
                        "Created table storage"
                    );
                    storages.insert(
                        key,
                        TableStorage {
                            uuid: def.uuid,
                            table,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn build_storage(&self, def: &TableDef) -> NodeResult<MergeTreeTable> {
        let registry = PartRegistry::new(
            def.database.as_str(),
            def.name.as_str(),
            self.config.scheduler.data_root.as_str(),
        );
        let columns = def.columns.names();
        let (EngineKind::Replicated, Some(path)) = (def.engine_kind, &def.zookeeper_path) else {
            return Ok(MergeTreeTable::new(registry, BlockAllocator::local(), columns));
        };

        let path = self.config.substitute_macros(path)?;
        let replica = match &def.replica_name {
            Some(name) => self.config.substitute_macros(name)?,
            None => self.config.name.clone(),
        };
        let retry = self.config.replicator.retry.clone();
        let blocks = BlockAllocator::coordinated(Arc::clone(&self.store), path.as_str(), retry.clone());
        let log = TableLog::new(Arc::clone(&self.store), &path, replica, retry);
        Ok(MergeTreeTable::new(registry, blocks, columns).with_replication(log))
    }
}

/// Database a name refers to, `default` when unqualified
fn database_of(name: &QualifiedName) -> &str {
    name.database.as_deref().unwrap_or(DEFAULT_DATABASE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryStore;

    fn node() -> Node {
        Node::start(
            NodeConfig::new("test1").with_mutations_sync(true),
            Arc::new(InMemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn test_insert_select_and_optimize() {
        let node = node();
        node.query("CREATE TABLE t (a UInt32, s String) ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        node.query("INSERT INTO t VALUES (1, 'x'), (2, 'y')").await.unwrap();
        node.query("INSERT INTO t (a) VALUES (3)").await.unwrap();

        let storage = node.storage(&QualifiedName::new(None, "t")).unwrap();
        assert_eq!(storage.registry().len(), 2);

        node.query("OPTIMIZE TABLE t").await.unwrap();
        let names: Vec<String> = storage
            .registry()
            .list_parts()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["all_1_2_1".to_string()]);

        let result = node.query("SELECT s FROM t WHERE a >= 2").await.unwrap();
        assert_eq!(result.to_tsv(), "y\n\\N\n");
        assert!(node.progress().is_empty());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_mutation_and_system_mutations() {
        let node = node();
        node.query("CREATE TABLE t (a UInt32) ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        node.query("INSERT INTO t VALUES (1), (2), (3)").await.unwrap();
        node.query("ALTER TABLE t DELETE WHERE a = 2").await.unwrap();

        let result = node.query("SELECT a FROM t").await.unwrap();
        assert_eq!(result.to_tsv(), "1\n3\n");

        let mutations = node
            .query("SELECT mutation_id, is_done FROM system.mutations WHERE table = 't'")
            .await
            .unwrap();
        assert_eq!(mutations.to_tsv(), "mutation_2.txt\t1\n");

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_and_recreate_gets_fresh_storage() {
        let node = node();
        node.query("CREATE TABLE t (a UInt32) ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        node.query("INSERT INTO t VALUES (1)").await.unwrap();
        node.query("DROP TABLE t").await.unwrap();
        assert!(matches!(
            node.query("SELECT * FROM t").await,
            Err(NodeError::TableNotFound(_))
        ));

        node.query("CREATE TABLE t (a UInt32) ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        assert!(node.query("SELECT * FROM t").await.unwrap().is_empty());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_describe_and_errors() {
        let node = node();
        node.query("CREATE TABLE t (a UInt32 DEFAULT 1 COMMENT 'c') ENGINE = MergeTree ORDER BY a")
            .await
            .unwrap();
        let desc = node.query("DESC TABLE t").await.unwrap();
        assert_eq!(desc.columns[0], "name");
        assert_eq!(desc.to_tsv(), "a\tUInt32\tDEFAULT\t1\tc\t\t\n");
        assert_eq!(node.describe_tsv("default", "t").unwrap(), desc.to_tsv());

        assert!(matches!(
            node.query("INSERT INTO t VALUES (1, 2)").await,
            Err(NodeError::Insert(_))
        ));
        assert!(matches!(
            node.query("SELECT * FROM missing.t").await,
            Err(NodeError::TableNotFound(_))
        ));
        assert!(matches!(
            node.query("SELECT * FROM system.parts").await,
            Err(NodeError::TableNotFound(_))
        ));
        assert!(matches!(
            node.query("CREATE DATABASE default").await,
            Err(NodeError::DatabaseExists(_))
        ));
        assert!(matches!(
            node.query("CREATE DATABASE x ENGINE = Kafka").await,
            Err(NodeError::InvalidEngine(_))
        ));
        node.query("CREATE DATABASE IF NOT EXISTS default").await.unwrap();

        node.shutdown().await;
    }
}
