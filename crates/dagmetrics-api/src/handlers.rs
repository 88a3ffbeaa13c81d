//! Metrics handlers.
//!
//! Both always answer `200`. If encoding fails the body is empty and the
//! error is logged; per-family failures were already dropped by the
//! collector.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::error;

use dagmetrics_collector::CONTENT_TYPE;

use crate::ApiState;

pub const PLAIN_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

async fn exposition(state: &ApiState) -> String {
    match state.collector.render().await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            String::new()
        }
    }
}

/// GET <route> with `plain_text = true`
pub async fn plain_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = exposition(&state).await;
    (StatusCode::OK, [("content-type", PLAIN_CONTENT_TYPE)], body)
}

/// GET <route> with `plain_text = false`
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = exposition(&state).await;
    (StatusCode::OK, [("content-type", CONTENT_TYPE)], body)
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::response::Response;
    use chrono::Utc;
    use dagmetrics_collector::{CollectorSettings, MetricsCollector, XComParams};
    use dagmetrics_core::XComConfig;
    use dagmetrics_source::{SnapshotStore, TaskInstanceRecord};

    fn test_state() -> ApiState {
        let store = SnapshotStore::open_in_memory().unwrap();
        let now = Utc::now();
        for task in ["a", "b"] {
            store
                .put_task_instance(&TaskInstanceRecord {
                    dag_id: "etl".to_string(),
                    task_id: task.to_string(),
                    execution_date: now,
                    start_date: None,
                    end_date: None,
                    state: Some("queued".to_string()),
                    queue: Some("default".to_string()),
                    queued_dttm: Some(now),
                })
                .unwrap();
        }
        let collector = MetricsCollector::new(
            Arc::new(store),
            CollectorSettings::default(),
            XComParams::Fixed(XComConfig::default()),
        );
        ApiState {
            collector: Arc::new(collector),
        }
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn plain_metrics_is_text_plain() {
        let resp = plain_metrics(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert_eq!(content_type, PLAIN_CONTENT_TYPE);
        assert!(body_text(resp).await.contains("airflow_num_queued_tasks 2"));
    }

    #[tokio::test]
    async fn prometheus_metrics_uses_exposition_type() {
        let resp = prometheus_metrics(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("version=0.0.4"));
    }

    #[tokio::test]
    async fn healthz_says_ok() {
        assert_eq!(healthz().await, "ok");
    }
}
