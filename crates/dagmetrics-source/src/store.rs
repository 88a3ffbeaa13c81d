//! An embedded redb copy of the Airflow metadata tables.
//!
//! Backed by redb with JSON-serialized records, the same layout the
//! Postgres queries read. It answers every `MetadataSource` query by
//! evaluating the join and grouping semantics in memory over a single read
//! transaction. Used for replaying captured metadata and for tests; it is
//! never the orchestrator's own database.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{SourceError, SourceResult};
use crate::source::MetadataSource;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `SourceError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| SourceError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe snapshot store backed by redb.
#[derive(Clone)]
pub struct SnapshotStore {
    db: Arc<Database>,
}

impl SnapshotStore {
    /// Open (or create) a persistent snapshot at the given path.
    pub fn open(path: &Path) -> SourceResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "snapshot store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory snapshot (for testing).
    pub fn open_in_memory() -> SourceResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory snapshot store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> SourceResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [DAGS, DAG_RUNS, TASK_INSTANCES, TASK_FAILS, XCOMS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Seeding ────────────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, record: &T) -> SourceResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn put_dag(&self, dag: &DagRecord) -> SourceResult<()> {
        self.put(DAGS, &dag.dag_id, dag)
    }

    pub fn put_dag_run(&self, run: &DagRunRecord) -> SourceResult<()> {
        self.put(DAG_RUNS, &run.table_key(), run)
    }

    pub fn put_task_instance(&self, ti: &TaskInstanceRecord) -> SourceResult<()> {
        self.put(TASK_INSTANCES, &ti.table_key(), ti)
    }

    pub fn put_task_fail(&self, fail: &TaskFailRecord) -> SourceResult<()> {
        self.put(TASK_FAILS, &fail.table_key(), fail)
    }

    pub fn put_xcom(&self, xcom: &XComRecord) -> SourceResult<()> {
        self.put(XCOMS, &xcom.table_key(), xcom)
    }

    /// Load a whole fixture in one write transaction. Returns the number of
    /// records written.
    pub fn import(&self, fixture: &SnapshotFixture) -> SourceResult<usize> {
        fn insert_all<T: Serialize>(
            txn: &redb::WriteTransaction,
            table: Table,
            records: &[T],
            key: impl Fn(&T) -> String,
        ) -> SourceResult<usize> {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            for record in records {
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                table
                    .insert(key(record).as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            Ok(records.len())
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written = insert_all(&txn, DAGS, &fixture.dags, |d| d.dag_id.clone())?
            + insert_all(&txn, DAG_RUNS, &fixture.dag_runs, DagRunRecord::table_key)?
            + insert_all(
                &txn,
                TASK_INSTANCES,
                &fixture.task_instances,
                TaskInstanceRecord::table_key,
            )?
            + insert_all(&txn, TASK_FAILS, &fixture.task_fails, TaskFailRecord::table_key)?
            + insert_all(&txn, XCOMS, &fixture.xcoms, XComRecord::table_key)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(records = written, "snapshot fixture imported");
        Ok(written)
    }

    /// Load a JSON-encoded `SnapshotFixture` from disk.
    pub fn import_json(&self, path: &Path) -> SourceResult<usize> {
        let content = std::fs::read(path).map_err(map_err!(Read))?;
        let fixture: SnapshotFixture =
            serde_json::from_slice(&content).map_err(map_err!(Deserialize))?;
        self.import(&fixture)
    }

    // ── Reading ────────────────────────────────────────────────────

    fn begin_read(&self) -> SourceResult<ReadTransaction> {
        self.db.begin_read().map_err(map_err!(Transaction))
    }
}

fn scan<T: DeserializeOwned>(txn: &ReadTransaction, table: Table) -> SourceResult<Vec<T>> {
    let table = txn.open_table(table).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(record);
    }
    Ok(results)
}

/// Active, unpaused DAGs keyed by id.
fn eligible_dags(txn: &ReadTransaction) -> SourceResult<HashMap<DagId, DagRecord>> {
    let dags: Vec<DagRecord> = scan(txn, DAGS)?;
    Ok(dags
        .into_iter()
        .filter(DagRecord::is_eligible)
        .map(|d| (d.dag_id.clone(), d))
        .collect())
}

/// Latest execution date per eligible DAG among runs in `phase`.
fn latest_runs_in_phase(
    runs: &[DagRunRecord],
    dags: &HashMap<DagId, DagRecord>,
    phase: RunPhase,
) -> BTreeMap<DagId, DateTime<Utc>> {
    let mut latest: BTreeMap<DagId, DateTime<Utc>> = BTreeMap::new();
    for run in runs {
        if !dags.contains_key(&run.dag_id)
            || run.state.as_deref() != Some(phase.as_str())
            || (phase.requires_end_date() && run.end_date.is_none())
        {
            continue;
        }
        keep_max(&mut latest, run.dag_id.clone(), run.execution_date);
    }
    latest
}

fn keep_max<K: Ord>(map: &mut BTreeMap<K, DateTime<Utc>>, key: K, ts: DateTime<Utc>) {
    map.entry(key)
        .and_modify(|cur| *cur = (*cur).max(ts))
        .or_insert(ts);
}

fn owners_of(dags: &HashMap<DagId, DagRecord>, dag_id: &str) -> String {
    dags.get(dag_id).map(|d| d.owners.clone()).unwrap_or_default()
}

#[async_trait]
impl MetadataSource for SnapshotStore {
    async fn dag_state_counts(&self) -> SourceResult<Vec<DagStateRow>> {
        let txn = self.begin_read()?;
        let dags = eligible_dags(&txn)?;
        let runs: Vec<DagRunRecord> = scan(&txn, DAG_RUNS)?;

        let mut counts: BTreeMap<(DagId, Option<String>), i64> = BTreeMap::new();
        for run in runs.into_iter().filter(|r| dags.contains_key(&r.dag_id)) {
            *counts.entry((run.dag_id, run.state)).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((dag_id, state), count)| DagStateRow {
                owners: owners_of(&dags, &dag_id),
                dag_id,
                state,
                count,
            })
            .collect())
    }

    async fn dag_latest_durations(&self, phase: RunPhase) -> SourceResult<Vec<DagDurationRow>> {
        let txn = self.begin_read()?;
        let dags = eligible_dags(&txn)?;
        let runs: Vec<DagRunRecord> = scan(&txn, DAG_RUNS)?;
        let tis: Vec<TaskInstanceRecord> = scan(&txn, TASK_INSTANCES)?;
        let latest = latest_runs_in_phase(&runs, &dags, phase);

        // Earliest task start within each latest run.
        let mut first_start: BTreeMap<DagId, DateTime<Utc>> = BTreeMap::new();
        for ti in &tis {
            let (Some(exec), Some(start)) = (latest.get(&ti.dag_id), ti.start_date) else {
                continue;
            };
            if ti.execution_date == *exec {
                first_start
                    .entry(ti.dag_id.clone())
                    .and_modify(|cur| *cur = (*cur).min(start))
                    .or_insert(start);
            }
        }

        Ok(first_start
            .into_iter()
            .filter_map(|(dag_id, start_date)| {
                let exec = latest.get(&dag_id)?;
                let run = runs
                    .iter()
                    .find(|r| r.dag_id == dag_id && r.execution_date == *exec)?;
                Some(DagDurationRow {
                    end_date: run.end_date,
                    dag_id,
                    start_date,
                })
            })
            .collect())
    }

    async fn task_state_counts(&self) -> SourceResult<Vec<TaskStateRow>> {
        let txn = self.begin_read()?;
        let dags = eligible_dags(&txn)?;
        let tis: Vec<TaskInstanceRecord> = scan(&txn, TASK_INSTANCES)?;

        let mut counts: BTreeMap<(DagId, TaskId, Option<String>), i64> = BTreeMap::new();
        for ti in tis.into_iter().filter(|t| dags.contains_key(&t.dag_id)) {
            *counts.entry((ti.dag_id, ti.task_id, ti.state)).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((dag_id, task_id, state), count)| TaskStateRow {
                owners: owners_of(&dags, &dag_id),
                dag_id,
                task_id,
                state,
                count,
            })
            .collect())
    }

    async fn task_latest_durations(
        &self,
        phase: RunPhase,
    ) -> SourceResult<Vec<TaskDurationRow>> {
        let txn = self.begin_read()?;
        let dags = eligible_dags(&txn)?;
        let runs: Vec<DagRunRecord> = scan(&txn, DAG_RUNS)?;
        let tis: Vec<TaskInstanceRecord> = scan(&txn, TASK_INSTANCES)?;
        let latest_run = latest_runs_in_phase(&runs, &dags, phase);

        let mut latest_task: BTreeMap<(DagId, TaskId), DateTime<Utc>> = BTreeMap::new();
        for ti in &tis {
            if ti.state.as_deref() != Some(phase.as_str())
                || ti.start_date.is_none()
                || (phase.requires_end_date() && ti.end_date.is_none())
            {
                continue;
            }
            keep_max(
                &mut latest_task,
                (ti.dag_id.clone(), ti.task_id.clone()),
                ti.execution_date,
            );
        }

        Ok(latest_task
            .into_iter()
            .filter(|((dag_id, _), exec)| latest_run.get(dag_id) == Some(exec))
            .filter_map(|((dag_id, task_id), exec)| {
                let ti = tis.iter().find(|t| {
                    t.dag_id == dag_id && t.task_id == task_id && t.execution_date == exec
                })?;
                Some(TaskDurationRow {
                    start_date: ti.start_date?,
                    end_date: ti.end_date,
                    dag_id,
                    task_id,
                    execution_date: exec,
                })
            })
            .collect())
    }

    async fn task_failure_counts(&self) -> SourceResult<Vec<TaskFailureRow>> {
        let txn = self.begin_read()?;
        let dags = eligible_dags(&txn)?;
        let fails: Vec<TaskFailRecord> = scan(&txn, TASK_FAILS)?;

        let mut counts: BTreeMap<(DagId, TaskId), i64> = BTreeMap::new();
        for fail in fails.into_iter().filter(|f| dags.contains_key(&f.dag_id)) {
            *counts.entry((fail.dag_id, fail.task_id)).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((dag_id, task_id), count)| TaskFailureRow {
                owners: owners_of(&dags, &dag_id),
                dag_id,
                task_id,
                count,
            })
            .collect())
    }

    async fn xcom_params(&self, selector: &TaskSelector) -> SourceResult<Vec<XComRow>> {
        let txn = self.begin_read()?;
        let runs: Vec<DagRunRecord> = scan(&txn, DAG_RUNS)?;
        let xcoms: Vec<XComRecord> = scan(&txn, XCOMS)?;

        // Every DAG's most recent run, regardless of state or activity.
        let mut latest: BTreeMap<DagId, DateTime<Utc>> = BTreeMap::new();
        for run in &runs {
            keep_max(&mut latest, run.dag_id.clone(), run.execution_date);
        }

        Ok(xcoms
            .into_iter()
            .filter(|x| latest.get(&x.dag_id) == Some(&x.execution_date))
            .filter(|x| selector.matches(&x.task_id))
            .map(|x| XComRow {
                dag_id: x.dag_id,
                task_id: x.task_id,
                key: x.key,
                value: x.value,
            })
            .collect())
    }

    async fn dag_scheduler_delay(&self, canary_dag_id: &str) -> SourceResult<Vec<DagDelayRow>> {
        let txn = self.begin_read()?;
        let runs: Vec<DagRunRecord> = scan(&txn, DAG_RUNS)?;

        Ok(runs
            .into_iter()
            .filter(|r| r.dag_id == canary_dag_id)
            .max_by_key(|r| r.execution_date)
            .map(|r| DagDelayRow {
                dag_id: r.dag_id,
                execution_date: r.execution_date,
                start_date: r.start_date,
            })
            .into_iter()
            .collect())
    }

    async fn task_scheduler_delay(
        &self,
        canary_dag_id: &str,
    ) -> SourceResult<Vec<TaskDelayRow>> {
        let txn = self.begin_read()?;
        let tis: Vec<TaskInstanceRecord> = scan(&txn, TASK_INSTANCES)?;
        let canary: Vec<&TaskInstanceRecord> = tis
            .iter()
            .filter(|t| t.dag_id == canary_dag_id && t.queued_dttm.is_some())
            .collect();

        let mut max_start: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for ti in &canary {
            if let (Some(queue), Some(start)) = (ti.queue.as_deref(), ti.start_date) {
                keep_max(&mut max_start, queue, start);
            }
        }

        Ok(max_start
            .into_iter()
            .filter_map(|(queue, start)| {
                let ti = canary
                    .iter()
                    .filter(|t| t.queue.as_deref() == Some(queue) && t.start_date == Some(start))
                    .max_by_key(|t| t.execution_date)?;
                Some(TaskDelayRow {
                    queue: queue.to_string(),
                    execution_date: ti.execution_date,
                    queued_dttm: ti.queued_dttm?,
                    start_date: start,
                })
            })
            .collect())
    }

    async fn num_queued_tasks(&self) -> SourceResult<u64> {
        let txn = self.begin_read()?;
        let tis: Vec<TaskInstanceRecord> = scan(&txn, TASK_INSTANCES)?;
        Ok(tis
            .iter()
            .filter(|t| t.state.as_deref() == Some(TaskState::Queued.as_str()))
            .count() as u64)
    }
}
