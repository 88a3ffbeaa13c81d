//! The read interface every metadata backend implements.

use async_trait::async_trait;

use crate::error::SourceResult;
use crate::types::*;

/// One read operation per metric family.
///
/// Implementations must be read-only and must not hold a session or
/// transaction beyond a single call.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Run counts grouped by (dag, state) for active, unpaused DAGs.
    async fn dag_state_counts(&self) -> SourceResult<Vec<DagStateRow>>;

    /// Latest run per active DAG in `phase`, with its earliest task start.
    async fn dag_latest_durations(&self, phase: RunPhase) -> SourceResult<Vec<DagDurationRow>>;

    /// Task instance counts grouped by (dag, task, state) for active DAGs.
    async fn task_state_counts(&self) -> SourceResult<Vec<TaskStateRow>>;

    /// Per (dag, task), the instance in `phase` belonging to the DAG's latest
    /// run in that same phase.
    async fn task_latest_durations(&self, phase: RunPhase)
    -> SourceResult<Vec<TaskDurationRow>>;

    /// Failure events grouped by (dag, task) for active DAGs.
    async fn task_failure_counts(&self) -> SourceResult<Vec<TaskFailureRow>>;

    /// Xcom rows of each DAG's most recent run.
    async fn xcom_params(&self, selector: &TaskSelector) -> SourceResult<Vec<XComRow>>;

    /// The canary DAG's most recent run, if any.
    async fn dag_scheduler_delay(&self, canary_dag_id: &str) -> SourceResult<Vec<DagDelayRow>>;

    /// Per queue, the canary task instance that started last.
    async fn task_scheduler_delay(&self, canary_dag_id: &str)
    -> SourceResult<Vec<TaskDelayRow>>;

    /// Number of task instances currently queued.
    async fn num_queued_tasks(&self) -> SourceResult<u64>;
}
