//! One collection pass per scrape.
//!
//! Families are visited sequentially in a fixed order under a shared
//! deadline. A family whose query fails or runs past the deadline is logged
//! and left out; the families after it still run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use dagmetrics_core::{CollectorConfig, XComConfig, xcom_search_paths};
use dagmetrics_source::{MetadataSource, RunPhase, TaskSelector};

use crate::aggregate;
use crate::error::{CollectError, CollectResult};
use crate::family::{Family, GaugeFamily};
use crate::prometheus::render_prometheus;
use crate::xcom::{self, XComEncoding};

/// Collector settings resolved from `[collector]`.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub namespace: String,
    pub canary_dag_id: String,
    pub scrape_timeout: Duration,
    pub xcom_encoding: XComEncoding,
}

impl From<&CollectorConfig> for CollectorSettings {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            canary_dag_id: config.canary_dag_id.clone(),
            scrape_timeout: Duration::from_secs(config.scrape_timeout_secs),
            xcom_encoding: XComEncoding::from_pickling(config.xcom_pickling),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from(&CollectorConfig::default())
    }
}

/// Where the xcom parameter list comes from.
#[derive(Debug, Clone)]
pub enum XComParams {
    /// Given explicitly in the exporter config.
    Fixed(XComConfig),
    /// Looked up as `config.toml` in `dirs` on every scrape.
    Discover { dirs: Vec<PathBuf> },
}

impl XComParams {
    /// Discovery over the default search path.
    pub fn discover() -> Self {
        XComParams::Discover {
            dirs: xcom_search_paths(),
        }
    }

    /// File lookups run on the blocking pool.
    async fn resolve(&self) -> XComConfig {
        match self {
            XComParams::Fixed(config) => config.clone(),
            XComParams::Discover { dirs } => {
                let dirs = dirs.clone();
                match tokio::task::spawn_blocking(move || XComConfig::load_first(&dirs)).await {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(error = %e, "xcom config lookup did not complete");
                        XComConfig::default()
                    }
                }
            }
        }
    }
}

/// The result of one collection pass.
#[derive(Debug, Clone)]
pub struct Scrape {
    pub now: DateTime<Utc>,
    pub families: Vec<GaugeFamily>,
    pub failed: Vec<Family>,
}

impl Scrape {
    pub fn family(&self, family: Family) -> Option<&GaugeFamily> {
        self.families.iter().find(|f| f.family == family)
    }
}

pub struct MetricsCollector {
    source: Arc<dyn MetadataSource>,
    settings: CollectorSettings,
    xcom: XComParams,
}

impl MetricsCollector {
    pub fn new(
        source: Arc<dyn MetadataSource>,
        settings: CollectorSettings,
        xcom: XComParams,
    ) -> Self {
        Self {
            source,
            settings,
            xcom,
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    pub async fn collect(&self) -> Scrape {
        self.collect_at(Utc::now()).await
    }

    /// Run every family against the reference time `now`.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> Scrape {
        let deadline = Instant::now() + self.settings.scrape_timeout;
        let mut families = Vec::with_capacity(Family::ALL.len());
        let mut failed = Vec::new();

        for family in Family::ALL {
            let result = match timeout_at(deadline, self.collect_family(family, now)).await {
                Ok(result) => result,
                Err(_) => Err(CollectError::Timeout {
                    family: family.name(),
                }),
            };
            match result {
                Ok(gauges) => families.push(gauges),
                Err(e) => {
                    error!(family = family.name(), error = %e, "metric family failed");
                    failed.push(family);
                }
            }
        }

        debug!(
            collected = families.len(),
            failed = failed.len(),
            "collection pass finished"
        );
        Scrape {
            now,
            families,
            failed,
        }
    }

    /// Collect and encode in the text exposition format.
    pub async fn render(&self) -> CollectResult<String> {
        let scrape = self.collect().await;
        render_prometheus(&self.settings.namespace, &scrape.families)
    }

    async fn collect_family(
        &self,
        family: Family,
        now: DateTime<Utc>,
    ) -> CollectResult<GaugeFamily> {
        let source = self.source.as_ref();
        let canary = self.settings.canary_dag_id.as_str();
        let gauges = match family {
            Family::TaskStatus => aggregate::task_status(&source.task_state_counts().await?),
            Family::TaskDuration => aggregate::task_duration(
                &source.task_latest_durations(RunPhase::Running).await?,
                now,
            ),
            Family::LastTaskSuccessTime => aggregate::last_task_success_time(
                &source.task_latest_durations(RunPhase::Success).await?,
                now,
            ),
            Family::TaskFailCount => {
                aggregate::task_fail_count(&source.task_failure_counts().await?)
            }
            Family::DagStatus => aggregate::dag_status(&source.dag_state_counts().await?),
            Family::DagRunDuration => aggregate::dag_run_duration(
                &source.dag_latest_durations(RunPhase::Running).await?,
                now,
            ),
            Family::LastDagSuccessTime => aggregate::last_dag_success_time(
                &source.dag_latest_durations(RunPhase::Success).await?,
                now,
            ),
            Family::DagSchedulerDelay => {
                aggregate::dag_scheduler_delay(&source.dag_scheduler_delay(canary).await?)
            }
            Family::XComParameter => self.collect_xcom().await?,
            Family::TaskSchedulerDelay => {
                aggregate::task_scheduler_delay(&source.task_scheduler_delay(canary).await?)
            }
            Family::NumQueuedTasks => {
                aggregate::num_queued_tasks(source.num_queued_tasks().await?)
            }
        };
        Ok(gauges)
    }

    async fn collect_xcom(&self) -> CollectResult<GaugeFamily> {
        let config = self.xcom.resolve().await;
        let mut rows = Vec::new();
        for param in &config.xcom_params {
            let selector = if param.matches_all() {
                TaskSelector::All
            } else {
                TaskSelector::Task(param.task_id.clone())
            };
            rows.extend(self.source.xcom_params(&selector).await?);
        }
        Ok(xcom::xcom_parameter(&rows, self.settings.xcom_encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use dagmetrics_core::XComParam;
    use dagmetrics_source::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn dag(id: &str, owners: &str) -> DagRecord {
        DagRecord {
            dag_id: id.to_string(),
            owners: owners.to_string(),
            is_active: true,
            is_paused: false,
        }
    }

    fn run(
        dag_id: &str,
        exec: DateTime<Utc>,
        start: Option<DateTime<Utc>>,
        state: &str,
    ) -> DagRunRecord {
        DagRunRecord {
            dag_id: dag_id.to_string(),
            execution_date: exec,
            start_date: start,
            end_date: None,
            state: Some(state.to_string()),
        }
    }

    fn ti(dag_id: &str, task_id: &str, exec: DateTime<Utc>, state: &str) -> TaskInstanceRecord {
        TaskInstanceRecord {
            dag_id: dag_id.to_string(),
            task_id: task_id.to_string(),
            execution_date: exec,
            start_date: Some(exec),
            end_date: None,
            state: Some(state.to_string()),
            queue: Some("default".to_string()),
            queued_dttm: None,
        }
    }

    /// etl_1 (alice) with 3 successful and 1 running `load` instance.
    fn seeded() -> SnapshotStore {
        let store = SnapshotStore::open_in_memory().unwrap();
        let t = t0();
        store.put_dag(&dag("etl_1", "alice")).unwrap();
        for i in 0..4 {
            let exec = t - ChronoDuration::days(i);
            let state = if i == 0 { "running" } else { "success" };
            store.put_dag_run(&run("etl_1", exec, Some(exec), state)).unwrap();
            store.put_task_instance(&ti("etl_1", "load", exec, state)).unwrap();
        }
        store
    }

    fn collector(source: impl MetadataSource + 'static) -> MetricsCollector {
        MetricsCollector::new(
            Arc::new(source),
            CollectorSettings::default(),
            XComParams::Fixed(XComConfig::default()),
        )
    }

    /// Wraps a store and makes one operation misbehave.
    struct Faulty {
        inner: SnapshotStore,
        broken_task_counts: bool,
        slow_xcom: bool,
    }

    #[async_trait]
    impl MetadataSource for Faulty {
        async fn dag_state_counts(&self) -> SourceResult<Vec<DagStateRow>> {
            self.inner.dag_state_counts().await
        }
        async fn dag_latest_durations(&self, phase: RunPhase) -> SourceResult<Vec<DagDurationRow>> {
            self.inner.dag_latest_durations(phase).await
        }
        async fn task_state_counts(&self) -> SourceResult<Vec<TaskStateRow>> {
            if self.broken_task_counts {
                return Err(SourceError::Query("connection reset".into()));
            }
            self.inner.task_state_counts().await
        }
        async fn task_latest_durations(
            &self,
            phase: RunPhase,
        ) -> SourceResult<Vec<TaskDurationRow>> {
            self.inner.task_latest_durations(phase).await
        }
        async fn task_failure_counts(&self) -> SourceResult<Vec<TaskFailureRow>> {
            self.inner.task_failure_counts().await
        }
        async fn xcom_params(&self, selector: &TaskSelector) -> SourceResult<Vec<XComRow>> {
            if self.slow_xcom {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.xcom_params(selector).await
        }
        async fn dag_scheduler_delay(&self, canary: &str) -> SourceResult<Vec<DagDelayRow>> {
            self.inner.dag_scheduler_delay(canary).await
        }
        async fn task_scheduler_delay(&self, canary: &str) -> SourceResult<Vec<TaskDelayRow>> {
            self.inner.task_scheduler_delay(canary).await
        }
        async fn num_queued_tasks(&self) -> SourceResult<u64> {
            self.inner.num_queued_tasks().await
        }
    }

    #[tokio::test]
    async fn families_come_in_fixed_order() {
        let scrape = collector(seeded()).collect_at(t0()).await;
        assert!(scrape.failed.is_empty());
        let order: Vec<Family> = scrape.families.iter().map(|f| f.family).collect();
        assert_eq!(order, Family::ALL.to_vec());
    }

    #[tokio::test]
    async fn task_status_for_etl_1() {
        let scrape = collector(seeded()).collect_at(t0()).await;
        let family = scrape.family(Family::TaskStatus).unwrap();
        assert_eq!(family.samples.len(), TaskState::ALL.len());
        assert_eq!(family.get(&["etl_1", "load", "alice", "success"]), Some(3.0));
        assert_eq!(family.get(&["etl_1", "load", "alice", "running"]), Some(1.0));
        assert_eq!(family.get(&["etl_1", "load", "alice", "failed"]), Some(0.0));
    }

    #[tokio::test]
    async fn canary_delay_is_five_seconds() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let t = t0();
        store.put_dag(&dag("canary_dag", "ops")).unwrap();
        store
            .put_dag_run(&run("canary_dag", t, Some(t + ChronoDuration::seconds(5)), "success"))
            .unwrap();

        let scrape = collector(store).collect_at(t).await;
        let family = scrape.family(Family::DagSchedulerDelay).unwrap();
        assert_eq!(family.get(&["canary_dag"]), Some(5.0));
    }

    #[tokio::test]
    async fn counts_queued_tasks() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let t = t0();
        store.put_dag(&dag("etl", "alice")).unwrap();
        store.put_task_instance(&ti("etl", "a", t, "queued")).unwrap();
        store.put_task_instance(&ti("etl", "b", t, "queued")).unwrap();
        store.put_task_instance(&ti("etl", "c", t, "running")).unwrap();

        let scrape = collector(store).collect_at(t).await;
        let family = scrape.family(Family::NumQueuedTasks).unwrap();
        assert_eq!(family.get(&[]), Some(2.0));
    }

    #[tokio::test]
    async fn no_xcom_config_emits_nothing() {
        let scrape = collector(seeded()).collect_at(t0()).await;
        let family = scrape.family(Family::XComParameter).unwrap();
        assert!(family.samples.is_empty());
    }

    #[tokio::test]
    async fn configured_xcom_params_are_exposed() {
        let store = seeded();
        store
            .put_xcom(&XComRecord {
                dag_id: "etl_1".to_string(),
                task_id: "load".to_string(),
                execution_date: t0(),
                key: "rows_loaded".to_string(),
                value: b"1200".to_vec(),
            })
            .unwrap();
        let xcom = XComConfig {
            xcom_params: vec![XComParam {
                task_id: "load".to_string(),
            }],
        };
        let collector = MetricsCollector::new(
            Arc::new(store),
            CollectorSettings::default(),
            XComParams::Fixed(xcom),
        );

        let scrape = collector.collect_at(t0()).await;
        let family = scrape.family(Family::XComParameter).unwrap();
        assert_eq!(family.get(&["etl_1", "load", "rows_loaded"]), Some(1200.0));
    }

    #[tokio::test]
    async fn discovered_xcom_config_is_read_each_scrape() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded();
        store
            .put_xcom(&XComRecord {
                dag_id: "etl_1".to_string(),
                task_id: "load".to_string(),
                execution_date: t0(),
                key: "rows_loaded".to_string(),
                value: b"1200".to_vec(),
            })
            .unwrap();
        let collector = MetricsCollector::new(
            Arc::new(store),
            CollectorSettings::default(),
            XComParams::Discover {
                dirs: vec![dir.path().to_path_buf()],
            },
        );

        let before = collector.collect_at(t0()).await;
        assert!(before.family(Family::XComParameter).unwrap().samples.is_empty());

        std::fs::write(
            dir.path().join(dagmetrics_core::XCOM_CONFIG_FILENAME),
            "[[xcom_params]]\ntask_id = \"load\"\n",
        )
        .unwrap();
        let after = collector.collect_at(t0()).await;
        let family = after.family(Family::XComParameter).unwrap();
        assert_eq!(family.get(&["etl_1", "load", "rows_loaded"]), Some(1200.0));
    }

    #[tokio::test]
    async fn failing_family_does_not_suppress_later_ones() {
        let source = Faulty {
            inner: seeded(),
            broken_task_counts: true,
            slow_xcom: false,
        };
        let scrape = collector(source).collect_at(t0()).await;
        assert_eq!(scrape.failed, vec![Family::TaskStatus]);
        assert!(scrape.family(Family::TaskStatus).is_none());
        assert!(scrape.family(Family::DagStatus).is_some());
        assert!(scrape.family(Family::NumQueuedTasks).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_drops_unfinished_families() {
        let source = Faulty {
            inner: seeded(),
            broken_task_counts: false,
            slow_xcom: true,
        };
        let collector = MetricsCollector::new(
            Arc::new(source),
            CollectorSettings {
                scrape_timeout: Duration::from_secs(1),
                ..CollectorSettings::default()
            },
            XComParams::Fixed(XComConfig {
                xcom_params: vec![XComParam {
                    task_id: "all".to_string(),
                }],
            }),
        );

        let scrape = collector.collect_at(t0()).await;
        assert!(scrape.failed.contains(&Family::XComParameter));
        assert!(scrape.family(Family::TaskStatus).is_some());
        assert!(scrape.family(Family::DagSchedulerDelay).is_some());
    }

    #[tokio::test]
    async fn same_rows_same_exposition() {
        let collector = collector(seeded());
        let a = collector.collect_at(t0()).await;
        let b = collector.collect_at(t0()).await;
        let first = render_prometheus("airflow", &a.families).unwrap();
        let second = render_prometheus("airflow", &b.families).unwrap();
        assert_eq!(first, second);
    }
}
