//! dagmetrics-core — configuration shared by the dagmetrics crates.
//!
//! Holds the `dagmetrics.toml` exporter config and the discovery logic for
//! the optional xcom parameter list.

pub mod config;

pub use config::{
    CollectorConfig, ConfigError, ConfigResult, ExporterConfig, ServerConfig, SourceConfig,
    XComConfig, XComParam, ALL_TASKS, LEGACY_XCOM_CONFIG_FILENAME, XCOM_CONFIG_FILENAME,
    is_valid_namespace, xcom_search_paths,
};
