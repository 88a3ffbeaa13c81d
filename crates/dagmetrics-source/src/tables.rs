//! redb table definitions for the snapshot store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Keys put the DAG id first so related rows sort together.

use redb::TableDefinition;

/// DAG definitions keyed by `{dag_id}`.
pub const DAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("dag");

/// DAG runs keyed by `{dag_id}:{execution_date}`.
pub const DAG_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("dag_run");

/// Task instances keyed by `{dag_id}:{task_id}:{execution_date}`.
pub const TASK_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("task_instance");

/// Task failures keyed by zero-padded `{id}`.
pub const TASK_FAILS: TableDefinition<&str, &[u8]> = TableDefinition::new("task_fail");

/// Xcom values keyed by `{dag_id}:{task_id}:{execution_date}:{key}`.
pub const XCOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("xcom");
