//! Record and row types for the Airflow metadata tables.
//!
//! `*Record` types mirror rows of the orchestrator's tables and are what the
//! snapshot store persists. `*Row` types are the flat, typed results of the
//! per-family read queries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub type DagId = String;
pub type TaskId = String;

/// Timestamp in a lexicographically sortable form, used in composite keys.
pub fn sortable_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── States ─────────────────────────────────────────────────────────

/// Task instance states, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskState {
    Success,
    Running,
    Failed,
    UpstreamFailed,
    Skipped,
    UpForRetry,
    UpForReschedule,
    Queued,
    None,
    Scheduled,
}

impl TaskState {
    pub const ALL: [TaskState; 10] = [
        TaskState::Success,
        TaskState::Running,
        TaskState::Failed,
        TaskState::UpstreamFailed,
        TaskState::Skipped,
        TaskState::UpForRetry,
        TaskState::UpForReschedule,
        TaskState::Queued,
        TaskState::None,
        TaskState::Scheduled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Success => "success",
            TaskState::Running => "running",
            TaskState::Failed => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
            TaskState::UpForRetry => "up_for_retry",
            TaskState::UpForReschedule => "up_for_reschedule",
            TaskState::Queued => "queued",
            TaskState::None => "none",
            TaskState::Scheduled => "scheduled",
        }
    }

    /// Exact match against the enumeration.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }

    /// Bucket for a raw column value. NULL and states outside the
    /// enumeration (`deferred`, `removed`, ...) count as `none`.
    pub fn from_column(raw: Option<&str>) -> Self {
        raw.and_then(Self::parse).unwrap_or(TaskState::None)
    }
}

/// DAG run states, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DagState {
    Success,
    Running,
    Failed,
}

impl DagState {
    pub const ALL: [DagState; 3] = [DagState::Success, DagState::Running, DagState::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            DagState::Success => "success",
            DagState::Running => "running",
            DagState::Failed => "failed",
        }
    }

    pub fn from_column(raw: Option<&str>) -> Option<Self> {
        let raw = raw?;
        Self::ALL.into_iter().find(|s| s.as_str() == raw)
    }
}

/// The two states the "latest run" duration queries are asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Success,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Running => "running",
            RunPhase::Success => "success",
        }
    }

    /// Successful runs only count once they have an end date.
    pub fn requires_end_date(self) -> bool {
        matches!(self, RunPhase::Success)
    }
}

/// Which tasks an xcom parameter query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSelector {
    All,
    Task(TaskId),
}

impl TaskSelector {
    pub fn matches(&self, task_id: &str) -> bool {
        match self {
            TaskSelector::All => true,
            TaskSelector::Task(id) => id == task_id,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskSelector::All => None,
            TaskSelector::Task(id) => Some(id),
        }
    }
}

// ── Records ────────────────────────────────────────────────────────

/// A DAG definition (`dag` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DagRecord {
    pub dag_id: DagId,
    pub owners: String,
    pub is_active: bool,
    pub is_paused: bool,
}

impl DagRecord {
    pub fn is_eligible(&self) -> bool {
        self.is_active && !self.is_paused
    }
}

/// One execution of a DAG (`dag_run` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DagRunRecord {
    pub dag_id: DagId,
    pub execution_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub state: Option<String>,
}

impl DagRunRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.dag_id, sortable_ts(&self.execution_date))
    }
}

/// One task attempt within a run (`task_instance` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstanceRecord {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub execution_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub queue: Option<String>,
    pub queued_dttm: Option<DateTime<Utc>>,
}

impl TaskInstanceRecord {
    pub fn table_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.dag_id,
            self.task_id,
            sortable_ts(&self.execution_date)
        )
    }
}

/// A single historical task failure (`task_fail` table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailRecord {
    pub id: u64,
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub execution_date: DateTime<Utc>,
}

impl TaskFailRecord {
    pub fn table_key(&self) -> String {
        format!("{:020}", self.id)
    }
}

/// A value passed between tasks (`xcom` table). `value` is the raw blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct XComRecord {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub execution_date: DateTime<Utc>,
    pub key: String,
    pub value: Vec<u8>,
}

impl XComRecord {
    pub fn table_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.dag_id,
            self.task_id,
            sortable_ts(&self.execution_date),
            self.key
        )
    }
}

/// A full copy of the five tables, as loaded by `SnapshotStore::import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotFixture {
    pub dags: Vec<DagRecord>,
    pub dag_runs: Vec<DagRunRecord>,
    pub task_instances: Vec<TaskInstanceRecord>,
    pub task_fails: Vec<TaskFailRecord>,
    pub xcoms: Vec<XComRecord>,
}

// ── Query rows ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DagStateRow {
    pub dag_id: DagId,
    pub owners: String,
    pub state: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskStateRow {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub owners: String,
    pub state: Option<String>,
    pub count: i64,
}

/// Latest qualifying run of a DAG. `start_date` is the earliest task start.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DagDurationRow {
    pub dag_id: DagId,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskDurationRow {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub execution_date: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskFailureRow {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub owners: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct XComRow {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DagDelayRow {
    pub dag_id: DagId,
    pub execution_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskDelayRow {
    pub queue: String,
    pub execution_date: DateTime<Utc>,
    pub queued_dttm: DateTime<Utc>,
    pub start_date: DateTime<Utc>,
}
