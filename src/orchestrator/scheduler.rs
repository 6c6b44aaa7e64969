//! Scheduler actor
//!
//! One task owns the scheduling decisions of a session. Launch results,
//! process exits and health transitions arrive as [`Event`]s; each event
//! re-evaluates only the direct dependents of the service it concerns.

use super::report::OrchestrationReport;
use super::OrchestratorConfig;
use crate::error::{MusterError, Result};
use crate::events::TransitionLog;
use crate::graph::DependencyGraph;
use crate::health::{HealthProber, ProbeExecutor};
use crate::launcher::{ExitState, Launcher, ServiceHandle};
use crate::service::{
    DependencyCondition, EdgeState, FailureReason, ServiceDescriptor, ServiceRuntimeState,
    ServiceStatus, StateCell,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Something that happened to a service outside the scheduler
#[derive(Debug)]
pub(crate) enum Event {
    /// The launcher answered a start request
    Started {
        service: String,
        result: Result<ServiceHandle>,
    },
    /// The launcher reported the process gone
    Exited { service: String, state: ExitState },
    /// The prober flipped the health status
    Health {
        service: String,
        status: ServiceStatus,
    },
}

/// Requests from the session handle
#[derive(Debug)]
pub(crate) enum Command {
    Stop,
}

/// Coarse progress of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Every service is terminal, steady, or parked behind one that is
    pub settled: bool,
    /// Every service is terminal
    pub finished: bool,
}

pub(crate) struct Scheduler {
    graph: Arc<DependencyGraph>,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ProbeExecutor>,
    config: OrchestratorConfig,
    cells: HashMap<String, StateCell>,
    log: Arc<TransitionLog>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Receiver<Command>,
    progress: watch::Sender<Progress>,
    /// Cancels the exit monitor and prober of each live service
    cancels: HashMap<String, watch::Sender<bool>>,
    tasks: JoinSet<()>,
    /// Start requests not yet answered
    launches: HashMap<String, AbortHandle>,
    stopping: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        graph: Arc<DependencyGraph>,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ProbeExecutor>,
        config: OrchestratorConfig,
        cells: HashMap<String, StateCell>,
        log: Arc<TransitionLog>,
        commands: mpsc::Receiver<Command>,
        progress: watch::Sender<Progress>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            graph,
            launcher,
            probe,
            config,
            cells,
            log,
            events_tx,
            events_rx,
            commands,
            progress,
            cancels: HashMap::new(),
            tasks: JoinSet::new(),
            launches: HashMap::new(),
            stopping: false,
        }
    }

    /// Drive the session until stop is requested, then tear it down
    pub(crate) async fn run(mut self) -> OrchestrationReport {
        let graph = self.graph.clone();
        for name in graph.start_order() {
            self.evaluate(name);
        }
        self.publish();

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle(event);
                    self.publish();
                }
                Some(joined) = self.tasks.join_next() => self.reap(joined),
                command = self.commands.recv() => match command {
                    Some(Command::Stop) | None => break,
                },
            }
        }

        self.shutdown().await;
        self.publish();
        OrchestrationReport::build(&self.graph, &self.cells, self.log.entries())
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Started { service, result } => self.on_started(&service, result),
            Event::Exited { service, state } => self.on_exited(&service, state),
            Event::Health { service, status } => self.on_health(&service, status),
        }
    }

    fn on_started(&mut self, name: &str, result: Result<ServiceHandle>) {
        self.launches.remove(name);

        match result {
            Ok(handle) => {
                if !self.update(name, |s| s.mark_running(handle.clone())) {
                    warn!("Service {} reported a start it was not waiting for", name);
                    let launcher = self.launcher.clone();
                    self.tasks.spawn(async move {
                        if let Err(e) = launcher.stop(&handle).await {
                            warn!("Failed to stop {}: {}", handle.service, e);
                        }
                    });
                    return;
                }
                info!("Service {} started", name);
                if !self.stopping {
                    self.watch_service(name, handle);
                }
            }
            Err(e) => {
                error!("Failed to start service {}: {}", name, e);
                self.update(name, |s| {
                    s.mark_failed(FailureReason::LaunchFailed {
                        message: e.to_string(),
                    })
                });
            }
        }

        self.notify_dependents(name);
    }

    fn on_exited(&mut self, name: &str, exit: ExitState) {
        if !self.update(name, |s| s.mark_exited(exit)) {
            return;
        }
        self.cancel(name);

        match self.read(name, |s| (s.status, s.reason.clone())) {
            Some((ServiceStatus::Completed, _)) => info!("Service {} completed", name),
            Some((_, Some(reason))) => error!("Service {} failed: {}", name, reason),
            _ => {}
        }

        self.notify_dependents(name);
    }

    fn on_health(&mut self, name: &str, status: ServiceStatus) {
        match status {
            ServiceStatus::Healthy => info!("Service {} is healthy", name),
            ServiceStatus::Unhealthy => warn!("Service {} is unhealthy", name),
            _ => {}
        }
        self.notify_dependents(name);
    }

    fn notify_dependents(&mut self, name: &str) {
        if self.stopping {
            return;
        }
        if self.read(name, |s| s.status) == Some(ServiceStatus::Failed) {
            self.propagate_failure(name);
        }
        let graph = self.graph.clone();
        for dependent in graph.dependents(name) {
            self.evaluate(dependent);
        }
    }

    /// Launch a pending service whose edges are all satisfied, or fail it
    /// when one of them can no longer be
    fn evaluate(&mut self, name: &str) {
        if self.stopping || self.read(name, |s| s.status) != Some(ServiceStatus::Pending) {
            return;
        }

        let graph = self.graph.clone();
        let mut waiting = false;
        for edge in graph.dependencies(name) {
            let Some((state, origin)) = self.read(&edge.target, |t| {
                (t.edge_state(edge.condition), t.failure_origin())
            }) else {
                continue;
            };

            match state {
                EdgeState::Satisfied => {}
                EdgeState::Waiting => waiting = true,
                EdgeState::Blocked => {
                    let reason = match origin {
                        Some(origin) => FailureReason::DependencyFailed {
                            dependency: edge.target.clone(),
                            origin,
                        },
                        None => FailureReason::Unsatisfiable {
                            dependency: edge.target.clone(),
                            condition: edge.condition,
                        },
                    };
                    warn!("Service {} will not start: {}", name, reason);
                    if self.update(name, |s| s.mark_failed(reason)) {
                        self.notify_dependents(name);
                    }
                    return;
                }
            }
        }

        if !waiting {
            self.launch(name);
        }
    }

    /// Fail every transitive dependent of `name` that has not launched yet,
    /// including those behind a dependent that is already running
    fn propagate_failure(&mut self, name: &str) {
        let Some(origin) = self.read(name, |s| s.failure_origin()).flatten() else {
            return;
        };

        let graph = self.graph.clone();
        let dependents = graph.transitive_dependents(name);
        let mut upstream: HashSet<&str> = HashSet::from([name]);
        for dependent in &dependents {
            // Start order puts the dependency on the path ahead of its dependent
            let dependency = graph
                .dependencies(dependent)
                .iter()
                .find(|edge| upstream.contains(edge.target.as_str()))
                .map(|edge| edge.target.clone());
            upstream.insert(dependent);

            let Some(dependency) = dependency else {
                continue;
            };
            let reason = FailureReason::DependencyFailed {
                dependency,
                origin: origin.clone(),
            };
            let failed = self.update(dependent, |s| {
                s.status == ServiceStatus::Pending && s.mark_failed(reason.clone())
            });
            if failed {
                warn!("Service {} will not start: {}", dependent, reason);
            }
        }
    }

    fn launch(&mut self, name: &str) {
        let Some(descriptor) = self.graph.descriptor(name).cloned() else {
            return;
        };
        if !self.update(name, |s| s.mark_launching()) {
            return;
        }

        info!("Starting service: {}", name);

        let launcher = self.launcher.clone();
        let events = self.events_tx.clone();
        let limit = self.config.launch_timeout;
        let abort = self.tasks.spawn(async move {
            let result = start_with_limit(launcher.as_ref(), &descriptor, limit).await;
            let _ = events.send(Event::Started {
                service: descriptor.name,
                result,
            });
        });
        self.launches.insert(name.to_string(), abort);

        self.notify_dependents(name);
    }

    /// Spawn the exit monitor and, when declared, the health prober
    fn watch_service(&mut self, name: &str, handle: ServiceHandle) {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.tasks.spawn(monitor_exit(
            name.to_string(),
            handle,
            self.launcher.clone(),
            self.config.exit_poll_interval,
            self.events_tx.clone(),
            cancel_rx.clone(),
        ));

        let spec = self
            .graph
            .descriptor(name)
            .and_then(|d| d.healthcheck.clone());
        if let (Some(spec), Some(cell)) = (spec, self.cells.get(name)) {
            debug!("Starting health checks for {}: {}", name, spec.action);
            let prober = HealthProber::new(name, spec, cell.clone(), self.probe.clone());
            let events = self.events_tx.clone();
            let service = name.to_string();
            self.tasks.spawn(prober.run(cancel_rx, move |status| {
                let _ = events.send(Event::Health {
                    service: service.clone(),
                    status,
                });
            }));
        }

        self.cancels.insert(name.to_string(), cancel_tx);
    }

    fn cancel(&mut self, name: &str) {
        if let Some(cancel) = self.cancels.remove(name) {
            let _ = cancel.send(true);
        }
    }

    fn reap(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Service task panicked: {}", e);
            }
        }
    }

    /// Stop everything: pending services never launch, in-flight launches
    /// are awaited up to the drain limit, live services stop dependents first
    async fn shutdown(&mut self) {
        self.stopping = true;
        info!("Stopping services");

        let graph = self.graph.clone();
        for name in graph.start_order() {
            self.update(name, |s| {
                if s.status == ServiceStatus::Pending {
                    s.mark_stopped();
                }
            });
        }

        self.drain_launches().await;

        for name in graph.stop_order() {
            self.collect_exit(&name).await;
            let handle = self.update(&name, |s| s.begin_stop());
            self.cancel(&name);
            let Some(handle) = handle else {
                continue;
            };

            info!("Stopping service: {}", name);
            if let Err(e) = self.launcher.stop(&handle).await {
                warn!("Failed to stop service {}: {}", name, e);
            }
            self.update(&name, |s| s.mark_stopped());
        }

        for (_, cancel) in self.cancels.drain() {
            let _ = cancel.send(true);
        }
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined);
        }
        info!("All services stopped");
    }

    async fn drain_launches(&mut self) {
        let deadline = sleep(self.config.launch_drain);
        tokio::pin!(deadline);

        while !self.launches.is_empty() {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = &mut deadline => {
                    let abandoned: Vec<_> = self.launches.drain().collect();
                    for (name, abort) in abandoned {
                        abort.abort();
                        warn!("Abandoning start of service {}", name);
                        self.update(&name, |s| s.mark_stopped());
                    }
                }
            }
        }

        // Starts answered just before the deadline; live handles get stopped
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event);
        }
    }

    /// Record an exit the monitor has not polled yet
    async fn collect_exit(&mut self, name: &str) {
        let Some(handle) = self.read(name, |s| s.handle.clone()).flatten() else {
            return;
        };
        match self.launcher.exit_status(&handle).await {
            Ok(ExitState::Pending) => {}
            Ok(exit) => self.on_exited(name, exit),
            Err(e) => debug!("No exit status for {}: {}", name, e),
        }
    }

    fn publish(&self) {
        self.progress.send_replace(self.progress_now());
    }

    fn progress_now(&self) -> Progress {
        let mut parked: HashSet<&str> = HashSet::new();
        let mut settled = self.launches.is_empty();
        let mut finished = true;

        for name in self.graph.start_order() {
            let Some((status, steady)) = self.read(name, |s| (s.status, s.is_settled())) else {
                continue;
            };
            finished &= status.is_terminal();
            if steady {
                continue;
            }

            if status == ServiceStatus::Pending && self.is_parked(name, &parked) {
                parked.insert(name);
            } else {
                settled = false;
            }
        }

        Progress { settled, finished }
    }

    /// A pending service that can only move after a steady service changes
    fn is_parked(&self, name: &str, parked: &HashSet<&str>) -> bool {
        self.graph.dependencies(name).iter().all(|edge| {
            if parked.contains(edge.target.as_str()) {
                return true;
            }
            match self.read(&edge.target, |t| (t.edge_state(edge.condition), t.status)) {
                Some((EdgeState::Satisfied, _)) => true,
                Some((EdgeState::Waiting, ServiceStatus::Unhealthy)) => {
                    edge.condition == DependencyCondition::Healthy
                }
                _ => false,
            }
        })
    }

    fn update<R: Default>(&self, name: &str, f: impl FnOnce(&mut ServiceRuntimeState) -> R) -> R {
        match self.cells.get(name).map(|cell| cell.update(f)) {
            Some(Ok(result)) => result,
            Some(Err(e)) => {
                error!("Failed to update state of {}: {}", name, e);
                R::default()
            }
            None => R::default(),
        }
    }

    fn read<R>(&self, name: &str, f: impl FnOnce(&ServiceRuntimeState) -> R) -> Option<R> {
        self.cells.get(name).and_then(|cell| cell.read(f).ok())
    }
}

async fn start_with_limit(
    launcher: &dyn Launcher,
    descriptor: &ServiceDescriptor,
    limit: Option<Duration>,
) -> Result<ServiceHandle> {
    let Some(limit) = limit else {
        return launcher.start(descriptor).await;
    };
    timeout(limit, launcher.start(descriptor))
        .await
        .map_err(|_| {
            MusterError::Timeout(format!(
                "service '{}' did not start within {:?}",
                descriptor.name, limit
            ))
        })?
}

/// Poll the launcher until the process exits or the monitor is cancelled
async fn monitor_exit(
    service: String,
    handle: ServiceHandle,
    launcher: Arc<dyn Launcher>,
    poll_interval: Duration,
    events: mpsc::UnboundedSender<Event>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = cancel.changed() => return,
        }
        if *cancel.borrow() {
            return;
        }

        let state = match launcher.exit_status(&handle).await {
            Ok(ExitState::Pending) => continue,
            Ok(state) => state,
            Err(e) => {
                warn!("Lost track of service {}: {}", service, e);
                ExitState::Failure(None)
            }
        };
        let _ = events.send(Event::Exited { service, state });
        return;
    }
}
