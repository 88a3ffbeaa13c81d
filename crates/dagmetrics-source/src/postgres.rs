//! Read-only access to the live Airflow metadata database.
//!
//! Every query is a single statement against the pool, so a connection is
//! checked out for the duration of one call and returned on drop whether
//! the query succeeds or fails. Nothing is ever written.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::{SourceError, SourceResult};
use crate::source::MetadataSource;
use crate::types::*;

macro_rules! map_err {
    ($variant:ident) => {
        |e| SourceError::$variant(e.to_string())
    };
}

/// Active, unpaused DAG filter shared by the attributed queries.
const ELIGIBLE_DAG: &str = "d.is_active IS TRUE AND d.is_paused IS FALSE";

const DAG_STATE_COUNTS: &str = r#"
SELECT dr.dag_id, COALESCE(d.owners, '') AS owners, dr.state, COUNT(*) AS count
FROM dag_run dr
JOIN dag d ON d.dag_id = dr.dag_id
WHERE {eligible}
GROUP BY dr.dag_id, d.owners, dr.state
ORDER BY dr.dag_id, dr.state
"#;

const TASK_STATE_COUNTS: &str = r#"
SELECT ti.dag_id, ti.task_id, COALESCE(d.owners, '') AS owners, ti.state, COUNT(*) AS count
FROM task_instance ti
JOIN dag d ON d.dag_id = ti.dag_id
WHERE {eligible}
GROUP BY ti.dag_id, ti.task_id, d.owners, ti.state
ORDER BY ti.dag_id, ti.task_id, ti.state
"#;

/// Latest run per eligible DAG in state `$1`; success needs an end date.
const LATEST_RUN_CTE: &str = r#"
latest_run AS (
    SELECT dr.dag_id, MAX(dr.execution_date) AS execution_date
    FROM dag_run dr
    JOIN dag d ON d.dag_id = dr.dag_id
    WHERE {eligible}
      AND dr.state = $1
      AND ($1 <> 'success' OR dr.end_date IS NOT NULL)
    GROUP BY dr.dag_id
)"#;

const DAG_LATEST_DURATIONS: &str = r#"
WITH {latest_run},
started AS (
    SELECT lr.dag_id, lr.execution_date, MIN(ti.start_date) AS start_date
    FROM latest_run lr
    JOIN task_instance ti
      ON ti.dag_id = lr.dag_id AND ti.execution_date = lr.execution_date
    WHERE ti.start_date IS NOT NULL
    GROUP BY lr.dag_id, lr.execution_date
)
SELECT s.dag_id, s.start_date, dr.end_date
FROM started s
JOIN dag_run dr ON dr.dag_id = s.dag_id AND dr.execution_date = s.execution_date
ORDER BY s.dag_id
"#;

const TASK_LATEST_DURATIONS: &str = r#"
WITH {latest_run},
latest_task AS (
    SELECT ti.dag_id, ti.task_id, MAX(ti.execution_date) AS execution_date
    FROM task_instance ti
    WHERE ti.state = $1
      AND ti.start_date IS NOT NULL
      AND ($1 <> 'success' OR ti.end_date IS NOT NULL)
    GROUP BY ti.dag_id, ti.task_id
)
SELECT lt.dag_id, lt.task_id, lt.execution_date, ti.start_date, ti.end_date
FROM latest_task lt
JOIN latest_run lr
  ON lr.dag_id = lt.dag_id AND lr.execution_date = lt.execution_date
JOIN task_instance ti
  ON ti.dag_id = lt.dag_id
 AND ti.task_id = lt.task_id
 AND ti.execution_date = lt.execution_date
WHERE ti.start_date IS NOT NULL
ORDER BY lt.dag_id, lt.task_id
"#;

const TASK_FAILURE_COUNTS: &str = r#"
SELECT tf.dag_id, tf.task_id, COALESCE(d.owners, '') AS owners, COUNT(*) AS count
FROM task_fail tf
JOIN dag d ON d.dag_id = tf.dag_id
WHERE {eligible}
GROUP BY tf.dag_id, tf.task_id, d.owners
ORDER BY tf.dag_id, tf.task_id
"#;

const XCOM_PARAMS: &str = r#"
WITH latest AS (
    SELECT dag_id, MAX(execution_date) AS execution_date
    FROM dag_run
    GROUP BY dag_id
)
SELECT x.dag_id, x.task_id, x.key, COALESCE(x.value, ''::bytea) AS value
FROM xcom x
JOIN latest l ON l.dag_id = x.dag_id AND l.execution_date = x.execution_date
WHERE ($1::text IS NULL OR x.task_id = $1)
ORDER BY x.dag_id, x.task_id, x.key
"#;

const DAG_SCHEDULER_DELAY: &str = r#"
SELECT dag_id, execution_date, start_date
FROM dag_run
WHERE dag_id = $1
ORDER BY execution_date DESC
LIMIT 1
"#;

const TASK_SCHEDULER_DELAY: &str = r#"
WITH latest AS (
    SELECT queue, MAX(start_date) AS max_start
    FROM task_instance
    WHERE dag_id = $1 AND queued_dttm IS NOT NULL AND queue IS NOT NULL
    GROUP BY queue
)
SELECT DISTINCT ON (l.queue)
       l.queue, ti.execution_date, ti.queued_dttm, l.max_start AS start_date
FROM latest l
JOIN task_instance ti ON ti.queue = l.queue AND ti.start_date = l.max_start
WHERE ti.dag_id = $1 AND ti.queued_dttm IS NOT NULL
ORDER BY l.queue, ti.execution_date DESC
"#;

const NUM_QUEUED_TASKS: &str = "SELECT COUNT(*) FROM task_instance WHERE state = 'queued'";

/// Substitute the shared fragments into a query template.
fn render(template: &str) -> String {
    template
        .replace("{latest_run}", LATEST_RUN_CTE.trim_start())
        .replace("{eligible}", ELIGIBLE_DAG)
}

/// Read-only source over the Airflow Postgres schema.
#[derive(Clone)]
pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    /// Build a lazily connecting pool, so the exporter starts (and keeps
    /// answering scrapes) while the database is unreachable.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> SourceResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(map_err!(Open))?;
        debug!(max_connections, "postgres pool configured");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataSource for PgSource {
    async fn dag_state_counts(&self) -> SourceResult<Vec<DagStateRow>> {
        sqlx::query_as::<_, DagStateRow>(&render(DAG_STATE_COUNTS))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn dag_latest_durations(&self, phase: RunPhase) -> SourceResult<Vec<DagDurationRow>> {
        sqlx::query_as::<_, DagDurationRow>(&render(DAG_LATEST_DURATIONS))
            .bind(phase.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn task_state_counts(&self) -> SourceResult<Vec<TaskStateRow>> {
        sqlx::query_as::<_, TaskStateRow>(&render(TASK_STATE_COUNTS))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn task_latest_durations(
        &self,
        phase: RunPhase,
    ) -> SourceResult<Vec<TaskDurationRow>> {
        sqlx::query_as::<_, TaskDurationRow>(&render(TASK_LATEST_DURATIONS))
            .bind(phase.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn task_failure_counts(&self) -> SourceResult<Vec<TaskFailureRow>> {
        sqlx::query_as::<_, TaskFailureRow>(&render(TASK_FAILURE_COUNTS))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn xcom_params(&self, selector: &TaskSelector) -> SourceResult<Vec<XComRow>> {
        sqlx::query_as::<_, XComRow>(XCOM_PARAMS)
            .bind(selector.task_id())
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn dag_scheduler_delay(&self, canary_dag_id: &str) -> SourceResult<Vec<DagDelayRow>> {
        sqlx::query_as::<_, DagDelayRow>(DAG_SCHEDULER_DELAY)
            .bind(canary_dag_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn task_scheduler_delay(
        &self,
        canary_dag_id: &str,
    ) -> SourceResult<Vec<TaskDelayRow>> {
        sqlx::query_as::<_, TaskDelayRow>(TASK_SCHEDULER_DELAY)
            .bind(canary_dag_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err!(Query))
    }

    async fn num_queued_tasks(&self) -> SourceResult<u64> {
        let count: i64 = sqlx::query_scalar(NUM_QUEUED_TASKS)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err!(Query))?;
        Ok(count.max(0) as u64)
    }
}
