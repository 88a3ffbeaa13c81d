//! The metric families emitted on every scrape.

/// Every gauge family, in collection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    TaskStatus,
    TaskDuration,
    LastTaskSuccessTime,
    TaskFailCount,
    DagStatus,
    DagRunDuration,
    LastDagSuccessTime,
    DagSchedulerDelay,
    XComParameter,
    TaskSchedulerDelay,
    NumQueuedTasks,
}

impl Family {
    pub const ALL: [Family; 11] = [
        Family::TaskStatus,
        Family::TaskDuration,
        Family::LastTaskSuccessTime,
        Family::TaskFailCount,
        Family::DagStatus,
        Family::DagRunDuration,
        Family::LastDagSuccessTime,
        Family::DagSchedulerDelay,
        Family::XComParameter,
        Family::TaskSchedulerDelay,
        Family::NumQueuedTasks,
    ];

    /// Metric name without the namespace prefix.
    pub fn name(self) -> &'static str {
        match self {
            Family::TaskStatus => "task_status",
            Family::TaskDuration => "task_duration",
            Family::LastTaskSuccessTime => "last_task_success_time",
            Family::TaskFailCount => "task_fail_count",
            Family::DagStatus => "dag_status",
            Family::DagRunDuration => "dag_run_duration",
            Family::LastDagSuccessTime => "last_dag_success_time",
            Family::DagSchedulerDelay => "dag_scheduler_delay",
            Family::XComParameter => "xcom_parameter",
            Family::TaskSchedulerDelay => "task_scheduler_delay",
            Family::NumQueuedTasks => "num_queued_tasks",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            Family::TaskStatus => "Shows the number of task instances with particular status",
            Family::TaskDuration => "Duration of running tasks in seconds",
            Family::LastTaskSuccessTime => "Elapsed time in seconds since last task success",
            Family::TaskFailCount => "Count of failed tasks",
            Family::DagStatus => "Shows the number of dag starts with this status",
            Family::DagRunDuration => "Duration of running dag_runs in seconds",
            Family::LastDagSuccessTime => "Elapsed time in seconds since last DAG success",
            Family::DagSchedulerDelay => "Airflow DAG scheduling delay",
            Family::XComParameter => "Airflow Xcom Parameter",
            Family::TaskSchedulerDelay => "Airflow Task scheduling delay",
            Family::NumQueuedTasks => "Airflow Number of Queued Tasks",
        }
    }

    pub fn label_names(self) -> &'static [&'static str] {
        match self {
            Family::TaskStatus => &["dag_id", "task_id", "owner", "status"],
            Family::TaskDuration | Family::LastTaskSuccessTime => {
                &["task_id", "dag_id", "execution_date"]
            }
            Family::TaskFailCount => &["dag_id", "task_id"],
            Family::DagStatus => &["dag_id", "owner", "status"],
            Family::DagRunDuration | Family::LastDagSuccessTime | Family::DagSchedulerDelay => {
                &["dag_id"]
            }
            Family::XComParameter => &["dag_id", "task_id", "xcom_key"],
            Family::TaskSchedulerDelay => &["queue"],
            Family::NumQueuedTasks => &[],
        }
    }
}

/// One labelled value. `labels` lines up with `Family::label_names`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Vec<String>,
    pub value: f64,
}

/// The samples of one family produced by a single scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeFamily {
    pub family: Family,
    pub samples: Vec<Sample>,
}

impl GaugeFamily {
    pub fn new(family: Family) -> Self {
        Self {
            family,
            samples: Vec::new(),
        }
    }

    pub fn add(&mut self, labels: Vec<String>, value: f64) {
        debug_assert_eq!(labels.len(), self.family.label_names().len());
        self.samples.push(Sample { labels, value });
    }

    /// Value of the first sample whose labels equal `labels`.
    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.labels.iter().map(String::as_str).eq(labels.iter().copied()))
            .map(|s| s.value)
    }
}
