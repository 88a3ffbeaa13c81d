//! dagmetrics.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// File name searched for the standalone xcom parameter list.
pub const XCOM_CONFIG_FILENAME: &str = "config.toml";

/// Name the xcom parameter list had before it moved to TOML. Still looked
/// for so a leftover file is reported rather than silently ignored.
pub const LEGACY_XCOM_CONFIG_FILENAME: &str = "config.yaml";

/// Task selector matching every task of a DAG's latest run.
pub const ALL_TASKS: &str = "all";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub collector: CollectorConfig,
    /// Inline xcom parameter list. Takes precedence over `config.toml`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xcom_params: Option<Vec<XComParam>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Path the metrics handler is mounted on.
    pub route: String,
    /// Serve `text/plain` instead of the versioned exposition content type.
    pub plain_text: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9112)),
            route: "/admin/metrics/".to_string(),
            plain_text: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_acquire_timeout")]
        acquire_timeout_secs: u64,
    },
    Snapshot {
        path: PathBuf,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Postgres {
            url: "postgres://airflow@localhost:5432/airflow".to_string(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Prefix prepended to every metric name.
    pub namespace: String,
    /// DAG used as a scheduling heartbeat.
    pub canary_dag_id: String,
    pub scrape_timeout_secs: u64,
    /// Xcom values are pickled strings rather than raw JSON bytes.
    pub xcom_pickling: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            namespace: "airflow".to_string(),
            canary_dag_id: "canary_dag".to_string(),
            scrape_timeout_secs: 10,
            xcom_pickling: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct XComParam {
    pub task_id: String,
}

impl XComParam {
    pub fn matches_all(&self) -> bool {
        self.task_id == ALL_TASKS
    }
}

/// The list of xcom parameters to expose.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct XComConfig {
    pub xcom_params: Vec<XComParam>,
}

impl ExporterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject values that would make every scrape unencodable.
    pub fn validate(&self) -> ConfigResult<()> {
        self.collector.validate()
    }
}

impl CollectorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !is_valid_namespace(&self.namespace) {
            return Err(ConfigError::Invalid {
                field: "collector.namespace",
                reason: format!(
                    "{:?} must match [a-zA-Z_:][a-zA-Z0-9_:]*",
                    self.namespace
                ),
            });
        }
        Ok(())
    }
}

/// Metric name prefix rule. Empty means no prefix.
pub fn is_valid_namespace(namespace: &str) -> bool {
    let mut chars = namespace.chars();
    match chars.next() {
        None => true,
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        }
        Some(_) => false,
    }
}

impl XComConfig {
    /// Search the working directory, then the executable's directory.
    ///
    /// Never fails: a missing or malformed file yields an empty list.
    pub fn discover() -> Self {
        Self::load_first(&xcom_search_paths())
    }

    /// Load the first existing `config.toml` among `dirs`.
    pub fn load_first(dirs: &[PathBuf]) -> Self {
        let Some(path) = dirs
            .iter()
            .map(|dir| dir.join(XCOM_CONFIG_FILENAME))
            .find(|p| p.is_file())
        else {
            if let Some(legacy) = dirs
                .iter()
                .map(|dir| dir.join(LEGACY_XCOM_CONFIG_FILENAME))
                .find(|p| p.is_file())
            {
                warn!(
                    path = ?legacy,
                    "found a YAML xcom config; rewrite it as {} with [[xcom_params]] tables",
                    XCOM_CONFIG_FILENAME
                );
            } else {
                debug!("no xcom config found");
            }
            return Self::default();
        };

        match Self::from_file(&path) {
            Ok(config) => {
                debug!(path = ?path, params = config.xcom_params.len(), "xcom config loaded");
                config
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable xcom config");
                Self::default()
            }
        }
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.xcom_params.is_empty()
    }
}

/// Where `config.toml` is looked for: the working directory, then the
/// executable's directory.
pub fn xcom_search_paths() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        dirs.push(cwd);
    }
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(dir);
    }
    dirs
}
