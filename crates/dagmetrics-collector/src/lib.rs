//! dagmetrics-collector — turns Airflow metadata into Prometheus gauges.
//!
//! Nothing runs in the background. Every scrape performs one collection
//! pass against the configured [`MetadataSource`](dagmetrics_source::MetadataSource)
//! and encodes the result.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector::collect()
//!   ├── MetadataSource query   one per family, under a shared deadline
//!   ├── aggregate / xcom       rows → GaugeFamily
//!   └── Scrape { families, failed }
//!
//! render_prometheus()  → fresh Registry + TextEncoder
//! ```

pub mod aggregate;
pub mod collector;
pub mod error;
pub mod family;
pub mod prometheus;
pub mod xcom;

pub use collector::{CollectorSettings, MetricsCollector, Scrape, XComParams};
pub use error::{CollectError, CollectResult};
pub use family::{Family, GaugeFamily, Sample};
pub use crate::prometheus::{CONTENT_TYPE, render_prometheus};
pub use xcom::XComEncoding;
