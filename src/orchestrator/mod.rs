//! Readiness orchestration
//!
//! The [`Orchestrator`] launches each service as soon as every one of its
//! dependency conditions holds, drives a health prober for services that
//! declare a health check, blocks dependents of failed services, and stops
//! everything in reverse dependency order at the end of a session.

mod report;
mod scheduler;
mod session;

pub use report::{FailureReport, OrchestrationReport, ServiceReport};
pub use scheduler::Progress;
pub use session::Session;

use crate::error::Result;
use crate::events::{StatusSink, TracingSink, TransitionLog};
use crate::graph::DependencyGraph;
use crate::health::ProbeExecutor;
use crate::launcher::Launcher;
use crate::service::{DescriptorStore, ServiceRuntimeState, StateCell};
use scheduler::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Default interval between exit-status polls
pub const DEFAULT_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a stop waits for outstanding start requests
pub const DEFAULT_LAUNCH_DRAIN: Duration = Duration::from_secs(10);

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the launcher is asked whether a live service exited
    pub exit_poll_interval: Duration,
    /// Upper bound for a single start request; unbounded when `None`
    pub launch_timeout: Option<Duration>,
    /// How long stopping waits for outstanding start requests before
    /// abandoning them
    pub launch_drain: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            exit_poll_interval: DEFAULT_EXIT_POLL_INTERVAL,
            launch_timeout: None,
            launch_drain: DEFAULT_LAUNCH_DRAIN,
        }
    }
}

/// Runs a dependency graph of services to readiness
pub struct Orchestrator {
    graph: Arc<DependencyGraph>,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ProbeExecutor>,
    sink: Arc<dyn StatusSink>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        graph: DependencyGraph,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ProbeExecutor>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            launcher,
            probe,
            sink: Arc::new(TracingSink),
            config: OrchestratorConfig::default(),
        }
    }

    /// Validate the descriptors and build an orchestrator for them.
    ///
    /// Graph errors are returned before anything is launched.
    pub fn from_store(
        store: DescriptorStore,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ProbeExecutor>,
    ) -> Result<Self> {
        Ok(Self::new(DependencyGraph::build(store)?, launcher, probe))
    }

    /// Send transitions to `sink` instead of the tracing log
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Start a session. Must be called from within a tokio runtime.
    pub fn start(&self) -> Session {
        let log = Arc::new(TransitionLog::new(self.sink.clone()));

        let mut cells = HashMap::new();
        let mut ordered = Vec::with_capacity(self.graph.len());
        for name in self.graph.start_order() {
            let health_checked = self
                .graph
                .descriptor(name)
                .is_some_and(|d| d.healthcheck.is_some());
            let cell = StateCell::new(ServiceRuntimeState::new(name, health_checked), log.clone());
            cells.insert(name.clone(), cell.clone());
            ordered.push((name.clone(), cell));
        }

        let (commands_tx, commands_rx) = mpsc::channel(4);
        let (progress_tx, progress_rx) = watch::channel(Progress::default());

        let scheduler = Scheduler::new(
            self.graph.clone(),
            self.launcher.clone(),
            self.probe.clone(),
            self.config.clone(),
            cells,
            log.clone(),
            commands_rx,
            progress_tx,
        );
        let task = tokio::spawn(scheduler.run());

        Session::new(ordered, log, progress_rx, commands_tx, task)
    }

    /// Run until every service is terminal, then tear down
    pub async fn run(&self) -> Result<OrchestrationReport> {
        let mut session = self.start();
        session.wait_finished().await?;
        session.stop().await
    }
}
