//! Turns query rows into gauge families.
//!
//! Everything here is pure: the same rows and the same `now` always produce
//! the same families. State counts are densified over the full state
//! enumeration, and every time delta is computed only when both timestamps
//! exist.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::warn;

use dagmetrics_source::{
    DagDelayRow, DagDurationRow, DagState, DagStateRow, TaskDelayRow, TaskDurationRow,
    TaskFailureRow, TaskState, TaskStateRow,
};

use crate::family::{Family, GaugeFamily};

/// Seconds from `earlier` to `later`; negative when out of order.
pub fn seconds_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    let delta = later - earlier;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_milliseconds() as f64 / 1_000.0,
    }
}

fn execution_day(ts: &DateTime<Utc>) -> String {
    ts.date_naive().format("%Y-%m-%d").to_string()
}

/// Per-entity state counts with the owner of the first row seen.
struct StateCounts<'a, S> {
    owners: &'a str,
    counts: HashMap<S, i64>,
}

impl<'a, S: std::hash::Hash + Eq> StateCounts<'a, S> {
    fn new(owners: &'a str) -> Self {
        Self {
            owners,
            counts: HashMap::new(),
        }
    }

    fn add(&mut self, state: S, count: i64) {
        *self.counts.entry(state).or_default() += count;
    }

    fn get(&self, state: &S) -> i64 {
        self.counts.get(state).copied().unwrap_or(0)
    }
}

/// `task_status`: one sample per (dag, task) per task state.
pub fn task_status(rows: &[TaskStateRow]) -> GaugeFamily {
    let mut by_task: BTreeMap<(&str, &str), StateCounts<'_, TaskState>> = BTreeMap::new();
    for row in rows {
        let entry = by_task
            .entry((row.dag_id.as_str(), row.task_id.as_str()))
            .or_insert_with(|| StateCounts::new(&row.owners));
        if let Some(raw) = row.state.as_deref() {
            if TaskState::parse(raw).is_none() {
                warn!(
                    dag_id = %row.dag_id,
                    task_id = %row.task_id,
                    state = raw,
                    "counting unknown task state as none"
                );
            }
        }
        entry.add(TaskState::from_column(row.state.as_deref()), row.count);
    }

    let mut family = GaugeFamily::new(Family::TaskStatus);
    for ((dag_id, task_id), counts) in &by_task {
        for state in TaskState::ALL {
            family.add(
                vec![
                    dag_id.to_string(),
                    task_id.to_string(),
                    counts.owners.to_string(),
                    state.as_str().to_string(),
                ],
                counts.get(&state) as f64,
            );
        }
    }
    family
}

/// `dag_status`: one sample per DAG per run state.
pub fn dag_status(rows: &[DagStateRow]) -> GaugeFamily {
    let mut by_dag: BTreeMap<&str, StateCounts<'_, DagState>> = BTreeMap::new();
    for row in rows {
        let entry = by_dag
            .entry(row.dag_id.as_str())
            .or_insert_with(|| StateCounts::new(&row.owners));
        match DagState::from_column(row.state.as_deref()) {
            Some(state) => entry.add(state, row.count),
            None => warn!(dag_id = %row.dag_id, state = ?row.state, "dropping unknown dag state"),
        }
    }

    let mut family = GaugeFamily::new(Family::DagStatus);
    for (dag_id, counts) in &by_dag {
        for state in DagState::ALL {
            family.add(
                vec![
                    dag_id.to_string(),
                    counts.owners.to_string(),
                    state.as_str().to_string(),
                ],
                counts.get(&state) as f64,
            );
        }
    }
    family
}

/// `task_duration`: seconds since each running task started.
pub fn task_duration(rows: &[TaskDurationRow], now: DateTime<Utc>) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::TaskDuration);
    for row in rows {
        family.add(
            vec![
                row.task_id.clone(),
                row.dag_id.clone(),
                execution_day(&row.execution_date),
            ],
            seconds_between(now, row.start_date),
        );
    }
    family
}

/// `last_task_success_time`: seconds since each task last finished
/// successfully. Rows without an end date are skipped.
pub fn last_task_success_time(rows: &[TaskDurationRow], now: DateTime<Utc>) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::LastTaskSuccessTime);
    for row in rows {
        let Some(end) = row.end_date else { continue };
        family.add(
            vec![
                row.task_id.clone(),
                row.dag_id.clone(),
                execution_day(&row.execution_date),
            ],
            seconds_between(now, end),
        );
    }
    family
}

pub fn task_fail_count(rows: &[TaskFailureRow]) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::TaskFailCount);
    for row in rows {
        family.add(vec![row.dag_id.clone(), row.task_id.clone()], row.count as f64);
    }
    family
}

/// `dag_run_duration`: seconds since the running DAG run's first task started.
pub fn dag_run_duration(rows: &[DagDurationRow], now: DateTime<Utc>) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::DagRunDuration);
    for row in rows {
        family.add(vec![row.dag_id.clone()], seconds_between(now, row.start_date));
    }
    family
}

pub fn last_dag_success_time(rows: &[DagDurationRow], now: DateTime<Utc>) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::LastDagSuccessTime);
    for row in rows {
        let Some(end) = row.end_date else { continue };
        family.add(vec![row.dag_id.clone()], seconds_between(now, end));
    }
    family
}

/// `dag_scheduler_delay`: observed start minus scheduled execution time.
pub fn dag_scheduler_delay(rows: &[DagDelayRow]) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::DagSchedulerDelay);
    for row in rows {
        let Some(start) = row.start_date else { continue };
        family.add(
            vec![row.dag_id.clone()],
            seconds_between(start, row.execution_date),
        );
    }
    family
}

/// `task_scheduler_delay`: observed start minus queued-at, per queue.
pub fn task_scheduler_delay(rows: &[TaskDelayRow]) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::TaskSchedulerDelay);
    for row in rows {
        family.add(
            vec![row.queue.clone()],
            seconds_between(row.start_date, row.queued_dttm),
        );
    }
    family
}

pub fn num_queued_tasks(count: u64) -> GaugeFamily {
    let mut family = GaugeFamily::new(Family::NumQueuedTasks);
    family.add(Vec::new(), count as f64);
    family
}
