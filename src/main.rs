//! Muster - compose-compatible service readiness orchestrator
//!
//! This is the main CLI entry point for Muster.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use muster::compose::{parse_duration, ComposeParser};
use muster::events::{JsonLinesSink, StatusSink, TracingSink};
use muster::graph::DependencyGraph;
use muster::health::CommandProbe;
use muster::launcher::ProcessLauncher;
use muster::orchestrator::{Orchestrator, OrchestratorConfig};
use muster::service::ServiceDescriptor;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Muster - start services in dependency order and wait for readiness
#[derive(Parser)]
#[command(name = "muster")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "A compose-compatible service readiness orchestrator", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Compose file; repeat to merge, later files win
    #[arg(short = 'f', long = "file", global = true)]
    files: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventFormat {
    /// Transitions as log lines
    Text,
    /// One JSON object per transition on stdout
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start services and wait for them
    Up {
        /// How transitions are reported
        #[arg(long, value_enum, default_value = "text")]
        events: EventFormat,
        /// Stop once every service is terminal or steady
        #[arg(long)]
        exit_when_settled: bool,
        /// Interval between exit-status checks
        #[arg(long, value_parser = duration_arg, default_value = "100ms")]
        poll_interval: Duration,
        /// Give up on a service that takes longer than this to start
        #[arg(long, value_parser = duration_arg)]
        launch_timeout: Option<Duration>,
        /// Default time between stop signal and kill
        #[arg(long, value_parser = duration_arg, default_value = "10s")]
        stop_grace_period: Duration,
        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the compose files and print the normalized services
    Config,

    /// Show start levels and dependency edges
    Graph,
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins unless --debug is given
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let working_dir = std::env::current_dir()?;
    let files = compose_files(&cli.files, &working_dir)?;
    let (store, warnings) = ComposeParser::load(&files)
        .with_context(|| format!("failed to load {}", display_files(&files)))?;
    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    match cli.command {
        Commands::Config => {
            let services: BTreeMap<&str, &ServiceDescriptor> =
                store.iter().map(|d| (d.name.as_str(), d)).collect();
            print!("{}", serde_yaml::to_string(&services)?);
        }

        Commands::Graph => {
            let graph = DependencyGraph::build(store)?;
            for (level, names) in graph.levels().iter().enumerate() {
                println!("level {}: {}", level, names.join(", "));
            }
            for service in graph.services() {
                for edge in &service.depends_on {
                    println!("{} -> {} ({})", service.name, edge.target, edge.condition);
                }
            }
        }

        Commands::Up {
            events,
            exit_when_settled,
            poll_interval,
            launch_timeout,
            stop_grace_period,
            json,
        } => {
            let project_dir = files
                .first()
                .and_then(|f| f.parent())
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| working_dir.join(p))
                .unwrap_or_else(|| working_dir.clone());

            let launcher =
                Arc::new(ProcessLauncher::new(project_dir).grace_period(stop_grace_period));
            let sink: Arc<dyn StatusSink> = match events {
                EventFormat::Text => Arc::new(TracingSink),
                EventFormat::Json => Arc::new(JsonLinesSink::stdout()),
            };

            let orchestrator =
                Orchestrator::from_store(store, launcher, Arc::new(CommandProbe::new()))?
                    .with_sink(sink)
                    .with_config(OrchestratorConfig {
                        exit_poll_interval: poll_interval,
                        launch_timeout,
                        ..OrchestratorConfig::default()
                    });

            tracing::info!("Starting {} services", orchestrator.graph().len());
            let mut session = orchestrator.start();

            if exit_when_settled {
                tokio::select! {
                    settled = session.wait_settled() => settled?,
                    signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl-C")?,
                }
            } else {
                tokio::select! {
                    finished = session.wait_finished() => finished?,
                    signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl-C")?,
                }
            }

            let report = session.stop().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }

            if !report.is_success() {
                bail!("{} service(s) failed", report.failures.len());
            }
        }
    }

    Ok(())
}

/// Files given on the command line, or the default compose file
fn compose_files(files: &[PathBuf], working_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !files.is_empty() {
        return Ok(files.to_vec());
    }
    match ComposeParser::find_compose_file(working_dir) {
        Some(path) => Ok(vec![path]),
        None => bail!("no compose file found in {}", working_dir.display()),
    }
}

fn display_files(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
