//! Integration tests for replicated databases
//!
//! Nodes share an in-memory coordination store; each runs its own replicator
//! for `testdb`. Convergence is awaited with `Node::sync` instead of sleeps.

mod test_utils;

use coldb::node::NodeError;
use coldb::replication::{ReplicaStatus, ReplicationError};
use coldb::schema::SchemaError;
use test_utils::{
    exec, start_node, start_persistent_node, synced_describe, test_store, CREATE_TESTDB,
};

const ALTER_TEST: &str = "CREATE TABLE testdb.alter_test (CounterID UInt32, StartDate Date, \
    UserID UInt32, VisitID UInt32, NestedColumn Nested(A UInt8, S String), ToDrop UInt32) \
    ENGINE = MergeTree(StartDate, intHash32(UserID), (CounterID, StartDate, intHash32(UserID), VisitID), 8192);";

const SIMPLE_ALTERS: &[&str] = &[
    "ALTER TABLE testdb.alter_test ADD COLUMN Added0 UInt32;",
    "ALTER TABLE testdb.alter_test ADD COLUMN Added2 UInt32;",
    "ALTER TABLE testdb.alter_test ADD COLUMN Added1 UInt32 AFTER Added0;",
    "ALTER TABLE testdb.alter_test ADD COLUMN AddedNested1 Nested(A UInt32, B UInt64) AFTER Added2;",
    "ALTER TABLE testdb.alter_test ADD COLUMN AddedNested1.C Array(String) AFTER AddedNested1.B;",
    "ALTER TABLE testdb.alter_test ADD COLUMN AddedNested2 Nested(A UInt32, B UInt64) AFTER AddedNested1;",
];

#[tokio::test]
async fn test_create_replicated_table() {
    let store = test_store();
    let node1 = start_node("test1", &store);
    let node2 = start_node("test2", &store);
    exec(&node1, CREATE_TESTDB).await;
    exec(&node2, CREATE_TESTDB).await;

    exec(
        &node1,
        "CREATE TABLE testdb.replicated_table (d Date, k UInt64, i32 Int32) ENGINE=ReplicatedMergeTree(d, k, 8192);",
    )
    .await;

    let desc1 = synced_describe(&node1, "testdb", "replicated_table").await;
    let desc2 = synced_describe(&node2, "testdb", "replicated_table").await;
    assert_eq!(desc1, desc2);
    assert_eq!(desc1.lines().count(), 3);
    assert!(desc1.starts_with("d\tDate\t"));

    // Already logged by node1, so node2 rejects it before logging
    let err = node2
        .query("CREATE TABLE testdb.replicated_table (d Date) ENGINE = MergeTree")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NodeError::Replication(ReplicationError::Rejected(SchemaError::TableExists(_)))
    ));

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn test_simple_alter_table() {
    let store = test_store();
    let node1 = start_node("test1", &store);
    let node2 = start_node("test2", &store);
    exec(&node1, CREATE_TESTDB).await;
    exec(&node2, CREATE_TESTDB).await;

    exec(&node1, ALTER_TEST).await;
    for alter in SIMPLE_ALTERS {
        exec(&node1, alter).await;
    }

    let desc1 = synced_describe(&node1, "testdb", "alter_test").await;
    let desc2 = synced_describe(&node2, "testdb", "alter_test").await;
    assert_eq!(desc1, desc2);

    let names: Vec<&str> = desc1
        .lines()
        .map(|line| line.split('\t').next().unwrap_or_default())
        .collect();
    assert_eq!(
        names,
        vec![
            "CounterID",
            "StartDate",
            "UserID",
            "VisitID",
            "NestedColumn.A",
            "NestedColumn.S",
            "ToDrop",
            "Added0",
            "Added1",
            "Added2",
            "AddedNested1.A",
            "AddedNested1.B",
            "AddedNested1.C",
            "AddedNested2.A",
            "AddedNested2.B",
        ]
    );

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn test_create_replica_after_delay() {
    let store = test_store();
    let node1 = start_node("test1", &store);
    let node2 = start_node("test2", &store);
    exec(&node1, CREATE_TESTDB).await;
    exec(&node2, CREATE_TESTDB).await;
    exec(&node1, ALTER_TEST).await;
    for alter in SIMPLE_ALTERS {
        exec(&node1, alter).await;
    }

    // Joins after seven entries exist and replays all of them
    let node3 = start_node("test3", &store);
    exec(&node3, CREATE_TESTDB).await;

    exec(&node1, "ALTER TABLE testdb.alter_test ADD COLUMN Added3 UInt32 ;").await;
    exec(&node1, "ALTER TABLE testdb.alter_test ADD COLUMN Added4 UInt32 ;").await;
    exec(&node1, "ALTER TABLE testdb.alter_test ADD COLUMN Added5 UInt32 ;").await;

    let desc1 = synced_describe(&node1, "testdb", "alter_test").await;
    assert_eq!(synced_describe(&node3, "testdb", "alter_test").await, desc1);
    assert_eq!(synced_describe(&node2, "testdb", "alter_test").await, desc1);
    assert!(desc1.ends_with("Added5\tUInt32\t\t\t\t\t\n"));

    let replicator = node3.database("testdb").unwrap();
    let progress = replicator.replicator().unwrap().progress();
    assert_eq!(progress.status, ReplicaStatus::Active);
    assert_eq!(progress.last_applied, Some(9));

    node1.shutdown().await;
    node2.shutdown().await;
    node3.shutdown().await;
}

#[tokio::test]
async fn test_alters_from_different_replicas() {
    let store = test_store();
    let node1 = start_node("test1", &store);
    let node3 = start_node("test3", &store);
    exec(&node1, CREATE_TESTDB).await;
    exec(&node3, CREATE_TESTDB).await;

    exec(
        &node1,
        "CREATE TABLE testdb.concurrent_test (CounterID UInt32, StartDate Date, UserID UInt32, \
         VisitID UInt32, NestedColumn Nested(A UInt8, S String), ToDrop UInt32) \
         ENGINE = MergeTree(StartDate, intHash32(UserID), (CounterID, StartDate, intHash32(UserID), VisitID), 8192);",
    )
    .await;

    exec(&node3, "ALTER TABLE testdb.concurrent_test ADD COLUMN Added0 UInt32;").await;
    exec(&node1, "ALTER TABLE testdb.concurrent_test ADD COLUMN Added2 UInt32;").await;
    exec(&node3, "ALTER TABLE testdb.concurrent_test ADD COLUMN Added1 UInt32 AFTER Added0;").await;
    exec(
        &node1,
        "ALTER TABLE testdb.concurrent_test ADD COLUMN AddedNested1 Nested(A UInt32, B UInt64) AFTER Added2;",
    )
    .await;
    exec(
        &node3,
        "ALTER TABLE testdb.concurrent_test ADD COLUMN AddedNested1.C Array(String) AFTER AddedNested1.B;",
    )
    .await;
    exec(
        &node1,
        "ALTER TABLE testdb.concurrent_test ADD COLUMN AddedNested2 Nested(A UInt32, B UInt64) AFTER AddedNested1;",
    )
    .await;

    // Independent changes issued at the same time from both replicas
    tokio::join!(
        async {
            for i in 0..5 {
                exec(
                    &node1,
                    &format!("ALTER TABLE testdb.concurrent_test ADD COLUMN FromOne{} UInt8", i),
                )
                .await;
            }
        },
        async {
            for i in 0..5 {
                exec(
                    &node3,
                    &format!("ALTER TABLE testdb.concurrent_test ADD COLUMN FromThree{} UInt8", i),
                )
                .await;
            }
        },
    );

    let desc1 = synced_describe(&node1, "testdb", "concurrent_test").await;
    let desc3 = synced_describe(&node3, "testdb", "concurrent_test").await;
    assert_eq!(desc1, desc3);
    assert_eq!(desc1.lines().count(), 15 + 10);

    node1.shutdown().await;
    node3.shutdown().await;
}

#[tokio::test]
async fn test_replica_resumes_after_restart() {
    let store = test_store();
    let state_dir = tempfile::tempdir().unwrap();

    let node1 = start_node("test1", &store);
    exec(&node1, CREATE_TESTDB).await;
    let node2 = start_persistent_node("test2", &store, state_dir.path());
    exec(&node2, CREATE_TESTDB).await;

    exec(&node1, ALTER_TEST).await;
    exec(&node1, SIMPLE_ALTERS[0]).await;
    synced_describe(&node2, "testdb", "alter_test").await;
    node2.shutdown().await;
    drop(node2);

    // Entries logged while node2 is down
    exec(&node1, SIMPLE_ALTERS[1]).await;
    exec(&node1, SIMPLE_ALTERS[2]).await;

    let node2 = start_persistent_node("test2", &store, state_dir.path());
    exec(&node2, CREATE_TESTDB).await;
    assert_eq!(
        synced_describe(&node2, "testdb", "alter_test").await,
        synced_describe(&node1, "testdb", "alter_test").await
    );
    assert!(state_dir.path().join("testdb").join("REPLICA_STATE").exists());

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test]
async fn test_local_databases_are_not_replicated() {
    let store = test_store();
    let node1 = start_node("test1", &store);
    let node2 = start_node("test2", &store);

    exec(&node1, "CREATE DATABASE localdb").await;
    exec(&node1, "CREATE TABLE localdb.t (a UInt32) ENGINE = MergeTree ORDER BY a").await;
    assert!(matches!(
        node2.query("DESC TABLE localdb.t").await,
        Err(NodeError::DatabaseNotFound(_))
    ));

    exec(&node1, "DROP DATABASE localdb").await;
    exec(&node1, "DROP DATABASE IF EXISTS localdb").await;
    assert!(matches!(
        node1.query("DROP DATABASE localdb").await,
        Err(NodeError::DatabaseNotFound(_))
    ));

    node1.shutdown().await;
    node2.shutdown().await;
}
