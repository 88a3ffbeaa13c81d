//! dagmetricsd — the dagmetrics daemon.
//!
//! Serves Airflow scheduler metadata as Prometheus gauges:
//! - Metadata source (Airflow Postgres, or an embedded redb snapshot)
//! - Metrics collector
//! - HTTP exposition endpoint
//!
//! # Usage
//!
//! ```text
//! dagmetricsd serve --config /etc/dagmetrics/dagmetrics.toml
//! dagmetricsd scrape --config dagmetrics.toml
//! dagmetricsd import --fixture airflow.json --out airflow.redb
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use dagmetrics_collector::{CollectorSettings, MetricsCollector, XComParams};
use dagmetrics_core::{ExporterConfig, SourceConfig, XComConfig};
use dagmetrics_source::{MetadataSource, PgSource, SnapshotStore};

#[derive(Parser)]
#[command(name = "dagmetricsd", about = "Airflow Prometheus exporter")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the metrics endpoint.
    Serve {
        /// Exporter config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run one collection pass and print the exposition to stdout.
    Scrape {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Build a snapshot database from a JSON fixture.
    Import {
        /// JSON document with dags, dag_runs, task_instances, task_fails, xcoms.
        #[arg(long)]
        fixture: PathBuf,

        /// redb file to create or extend.
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { config } => run_serve(load_config(config.as_deref())?).await,
        Command::Scrape { config } => run_scrape(load_config(config.as_deref())?).await,
        Command::Import { fixture, out } => run_import(&fixture, &out),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,dagmetricsd=debug,dagmetrics=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ExporterConfig> {
    match path {
        Some(path) => {
            let config = ExporterConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            info!(path = %path.display(), "config loaded");
            Ok(config)
        }
        None => {
            info!("no config given, using defaults");
            Ok(ExporterConfig::default())
        }
    }
}

fn open_source(config: &SourceConfig) -> anyhow::Result<Arc<dyn MetadataSource>> {
    match config {
        SourceConfig::Postgres {
            url,
            max_connections,
            acquire_timeout_secs,
        } => {
            let source = PgSource::connect_lazy(
                url,
                *max_connections,
                Duration::from_secs(*acquire_timeout_secs),
            )
            .context("configuring postgres pool")?;
            info!("postgres source configured");
            Ok(Arc::new(source))
        }
        SourceConfig::Snapshot { path } => {
            let store = SnapshotStore::open(path)
                .with_context(|| format!("opening snapshot {}", path.display()))?;
            info!(path = %path.display(), "snapshot source opened");
            Ok(Arc::new(store))
        }
    }
}

fn build_collector(config: &ExporterConfig) -> anyhow::Result<MetricsCollector> {
    let source = open_source(&config.source)?;
    let xcom = match &config.xcom_params {
        Some(params) => XComParams::Fixed(XComConfig {
            xcom_params: params.clone(),
        }),
        None => XComParams::discover(),
    };
    Ok(MetricsCollector::new(
        source,
        CollectorSettings::from(&config.collector),
        xcom,
    ))
}

async fn run_serve(config: ExporterConfig) -> anyhow::Result<()> {
    info!("dagmetrics exporter starting");

    let collector = Arc::new(build_collector(&config)?);
    info!(
        namespace = %collector.settings().namespace,
        canary_dag_id = %collector.settings().canary_dag_id,
        "metrics collector initialized"
    );

    let router = dagmetrics_api::build_router(collector, &config.server);
    let addr = config.server.listen;
    info!(%addr, route = %config.server.route, "metrics server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await?;

    info!("dagmetrics exporter stopped");
    Ok(())
}

async fn run_scrape(config: ExporterConfig) -> anyhow::Result<()> {
    let collector = build_collector(&config)?;
    let text = collector.render().await.context("encoding metrics")?;
    print!("{text}");
    Ok(())
}

fn run_import(fixture: &Path, out: &Path) -> anyhow::Result<()> {
    let store = SnapshotStore::open(out)
        .with_context(|| format!("opening snapshot {}", out.display()))?;
    let rows = store
        .import_json(fixture)
        .with_context(|| format!("importing {}", fixture.display()))?;
    info!(rows, out = %out.display(), "snapshot written");
    Ok(())
}
