//! Scripted launcher and probe executor for tests

use crate::error::{MusterError, Result};
use crate::health::{ProbeExecutor, ProbeOutcome};
use crate::launcher::{ExitState, Launcher, ServiceHandle};
use crate::service::{ProbeAction, ServiceDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How a scripted service behaves once started
#[derive(Debug, Clone, Default)]
pub(crate) struct Behavior {
    start_delay: Duration,
    start_error: Option<String>,
    never_starts: bool,
    exit: Option<(Duration, ExitState)>,
}

impl Behavior {
    /// Runs until stopped
    pub fn long_running() -> Self {
        Self::default()
    }

    /// Exits with `state` after `after`
    pub fn exits(after: Duration, state: ExitState) -> Self {
        Self {
            exit: Some((after, state)),
            ..Self::default()
        }
    }

    /// The launcher refuses to start it
    pub fn fails_to_start(message: &str) -> Self {
        Self {
            start_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// The start request never answers
    pub fn never_starts() -> Self {
        Self {
            never_starts: true,
            ..Self::default()
        }
    }

    /// Takes `delay` to report its start
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

/// Launcher whose services follow a script instead of running processes
#[derive(Default)]
pub(crate) struct ScriptedLauncher {
    behaviors: HashMap<String, Behavior>,
    live: Mutex<HashMap<String, (ServiceHandle, Instant)>>,
    starts: Mutex<Vec<String>>,
    stops: Mutex<Vec<String>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, name: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    /// Services in the order start was requested
    pub fn starts(&self) -> Vec<String> {
        self.starts.lock().unwrap().clone()
    }

    /// Services in the order stop was requested
    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }

    fn exit_of(&self, behavior: &Behavior, started: Instant) -> ExitState {
        match behavior.exit {
            Some((after, state)) if started.elapsed() >= after => state,
            _ => ExitState::Pending,
        }
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ServiceHandle> {
        self.starts.lock().unwrap().push(descriptor.name.clone());
        let behavior = self
            .behaviors
            .get(&descriptor.name)
            .cloned()
            .unwrap_or_default();

        if behavior.never_starts {
            std::future::pending::<()>().await;
        }
        if !behavior.start_delay.is_zero() {
            tokio::time::sleep(behavior.start_delay).await;
        }
        if let Some(message) = behavior.start_error {
            return Err(MusterError::Launch {
                service: descriptor.name.clone(),
                message,
            });
        }

        let mut live = self.live.lock().unwrap();
        if let Some((_, started)) = live.get(&descriptor.name) {
            if self.exit_of(&behavior, *started) == ExitState::Pending {
                return Err(MusterError::AlreadyRunning(descriptor.name.clone()));
            }
        }
        let handle = ServiceHandle::new(&descriptor.name, None);
        live.insert(descriptor.name.clone(), (handle.clone(), Instant::now()));
        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        self.stops.lock().unwrap().push(handle.service.clone());
        self.live
            .lock()
            .unwrap()
            .remove(&handle.service)
            .map(|_| ())
            .ok_or_else(|| MusterError::NotRunning(handle.service.clone()))
    }

    async fn exit_status(&self, handle: &ServiceHandle) -> Result<ExitState> {
        let live = self.live.lock().unwrap();
        let (current, started) = live
            .get(&handle.service)
            .filter(|(h, _)| h.id == handle.id)
            .ok_or_else(|| MusterError::NotRunning(handle.service.clone()))?;
        let behavior = self.behaviors.get(&current.service).cloned().unwrap_or_default();
        Ok(self.exit_of(&behavior, *started))
    }
}

/// One scripted probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeStep {
    Pass,
    Fail,
    /// Never returns; the prober's timeout decides
    Hang,
}

/// Probe executor replaying a script per probe action.
///
/// Actions are keyed by their shell text. The last step of a script
/// repeats forever; unknown actions pass.
#[derive(Default)]
pub(crate) struct ScriptedProbe {
    scripts: Mutex<HashMap<String, (Vec<ProbeStep>, usize)>>,
    runs: Mutex<HashMap<String, usize>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, key: &str, steps: Vec<ProbeStep>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(key.to_string(), (steps, 0));
        self
    }

    /// How many probes ran for `key`
    pub fn runs(&self, key: &str) -> usize {
        self.runs.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn next_step(&self, key: &str) -> ProbeStep {
        *self.runs.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(key) {
            Some((steps, next)) if !steps.is_empty() => {
                let step = steps[(*next).min(steps.len() - 1)];
                *next += 1;
                step
            }
            _ => ProbeStep::Pass,
        }
    }
}

#[async_trait]
impl ProbeExecutor for ScriptedProbe {
    async fn run(&self, action: &ProbeAction, _timeout: Duration) -> ProbeOutcome {
        let key = match action {
            ProbeAction::Shell(script) => script.clone(),
            ProbeAction::Exec(argv) => argv.join(" "),
        };
        match self.next_step(&key) {
            ProbeStep::Pass => ProbeOutcome::Passed,
            ProbeStep::Fail => ProbeOutcome::Failed("scripted failure".to_string()),
            ProbeStep::Hang => std::future::pending::<ProbeOutcome>().await,
        }
    }
}
