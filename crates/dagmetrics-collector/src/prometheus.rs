//! Prometheus text exposition format.
//!
//! Each call registers the scrape's families into a fresh `Registry`, so no
//! state survives between scrapes.

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::error;

use crate::error::CollectResult;
use crate::family::GaugeFamily;

/// Content type of the standard text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render gauge families as `<namespace>_<family>` metrics.
///
/// A family that cannot be registered is logged and left out; the rest are
/// still encoded.
pub fn render_prometheus(namespace: &str, families: &[GaugeFamily]) -> CollectResult<String> {
    let registry = Registry::new();

    for gauges in families {
        if let Err(e) = register_family(&registry, namespace, gauges) {
            error!(
                family = gauges.family.name(),
                error = %e,
                "skipping unencodable metric family"
            );
        }
    }

    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn register_family(
    registry: &Registry,
    namespace: &str,
    gauges: &GaugeFamily,
) -> prometheus::Result<()> {
    let family = gauges.family;
    let opts = Opts::new(family.name(), family.help()).namespace(namespace);

    if family.label_names().is_empty() {
        let Some(sample) = gauges.samples.last() else {
            return Ok(());
        };
        let gauge = Gauge::with_opts(opts)?;
        gauge.set(sample.value);
        return registry.register(Box::new(gauge));
    }

    if gauges.samples.is_empty() {
        return Ok(());
    }
    let vec = GaugeVec::new(opts, family.label_names())?;
    for sample in &gauges.samples {
        let labels: Vec<&str> = sample.labels.iter().map(String::as_str).collect();
        vec.get_metric_with_label_values(&labels)?.set(sample.value);
    }
    registry.register(Box::new(vec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate;
    use crate::family::Family;

    #[test]
    fn renders_namespaced_gauges() {
        let mut delay = GaugeFamily::new(Family::DagSchedulerDelay);
        delay.add(vec!["canary_dag".to_string()], 5.0);
        let families = vec![delay, aggregate::num_queued_tasks(2)];

        let text = render_prometheus("airflow", &families).unwrap();
        assert!(text.contains("# HELP airflow_dag_scheduler_delay Airflow DAG scheduling delay"));
        assert!(text.contains("# TYPE airflow_dag_scheduler_delay gauge"));
        assert!(text.contains("airflow_dag_scheduler_delay{dag_id=\"canary_dag\"} 5"));
        assert!(text.contains("airflow_num_queued_tasks 2"));
    }

    #[test]
    fn empty_families_are_omitted() {
        let families = vec![GaugeFamily::new(Family::XComParameter)];
        let text = render_prometheus("airflow", &families).unwrap();
        assert!(!text.contains("xcom_parameter"));
    }

    #[test]
    fn bad_family_does_not_blank_the_page() {
        let mut bad = GaugeFamily::new(Family::TaskFailCount);
        // Wrong label arity for the family.
        bad.samples.push(crate::family::Sample {
            labels: vec!["etl".to_string()],
            value: 1.0,
        });
        let families = vec![bad, aggregate::num_queued_tasks(2)];

        let text = render_prometheus("airflow", &families).unwrap();
        assert!(!text.contains("airflow_task_fail_count"));
        assert!(text.contains("airflow_num_queued_tasks 2"));
    }

    #[test]
    fn invalid_namespace_yields_empty_exposition() {
        let families = [aggregate::num_queued_tasks(2)];
        let text = render_prometheus("my-airflow", &families).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn custom_namespace() {
        let text = render_prometheus("prod", &[aggregate::num_queued_tasks(0)]).unwrap();
        assert!(text.contains("prod_num_queued_tasks 0"));
    }

    #[test]
    fn label_order_follows_family() {
        let mut fails = GaugeFamily::new(Family::TaskFailCount);
        fails.add(vec!["etl".to_string(), "load".to_string()], 3.0);
        let text = render_prometheus("airflow", &[fails]).unwrap();
        assert!(text.contains("airflow_task_fail_count{dag_id=\"etl\",task_id=\"load\"} 3"));
    }
}
