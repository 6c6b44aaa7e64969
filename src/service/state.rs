//! Per-service runtime state

use super::descriptor::DependencyCondition;
use crate::error::{MusterError, Result};
use crate::events::{Transition, TransitionLog};
use crate::health::ProbeOutcome;
use crate::launcher::{ExitState, ServiceHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Waiting for dependencies
    Pending,
    /// Start command issued
    Launching,
    /// Process started, health not yet known
    Running,
    /// Last health verdict was positive
    Healthy,
    /// Health retries exhausted
    Unhealthy,
    /// Stop requested
    Stopping,
    /// Exited with success
    Completed,
    /// Failed to launch, exited with failure, or blocked
    Failed,
    /// Stopped by request
    Stopped,
}

impl ServiceStatus {
    /// No further transitions happen from this status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Completed | ServiceStatus::Failed | ServiceStatus::Stopped
        )
    }

    /// A live process handle exists
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Running | ServiceStatus::Healthy | ServiceStatus::Unhealthy
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Pending => write!(f, "pending"),
            ServiceStatus::Launching => write!(f, "launching"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Unhealthy => write!(f, "unhealthy"),
            ServiceStatus::Stopping => write!(f, "stopping"),
            ServiceStatus::Completed => write!(f, "completed"),
            ServiceStatus::Failed => write!(f, "failed"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a service ended up `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The launcher could not start the service
    LaunchFailed { message: String },
    /// The process exited with a failure status
    Exited { code: Option<i32> },
    /// The process exited after its health retries were exhausted
    ExitedUnhealthy,
    /// A dependency failed before this service could launch
    DependencyFailed { dependency: String, origin: String },
    /// A dependency finished without ever meeting the required condition
    Unsatisfiable {
        dependency: String,
        condition: DependencyCondition,
    },
}

impl FailureReason {
    /// Caused by another service's failure rather than this one's
    pub fn is_blocked(&self) -> bool {
        matches!(self, FailureReason::DependencyFailed { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::LaunchFailed { message } => write!(f, "launch failed: {}", message),
            FailureReason::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            FailureReason::Exited { code: None } => write!(f, "exited with failure"),
            FailureReason::ExitedUnhealthy => write!(f, "exited while unhealthy"),
            FailureReason::DependencyFailed { dependency, .. } => {
                write!(f, "blocked by failed dependency `{}`", dependency)
            }
            FailureReason::Unsatisfiable {
                dependency,
                condition,
            } => write!(
                f,
                "dependency `{}` finished without becoming {}",
                dependency, condition
            ),
        }
    }
}

/// Where a dependency edge stands right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Satisfied,
    Waiting,
    Blocked,
}

/// Result of recording one probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRecord {
    /// Status before the probe was recorded
    pub previous: ServiceStatus,
    /// Status after the probe was recorded
    pub current: ServiceStatus,
    /// Consecutive failures after the probe
    pub failures: u32,
    /// Whether the service was still live, i.e. the probe was applied
    pub applied: bool,
}

impl ProbeRecord {
    /// The new status, if the probe changed it
    pub fn transitioned(&self) -> Option<ServiceStatus> {
        (self.previous != self.current).then_some(self.current)
    }
}

/// Mutable runtime state of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRuntimeState {
    /// Service name
    pub name: String,
    /// Lifecycle status
    pub status: ServiceStatus,
    /// Whether a health check drives this service's readiness
    pub health_checked: bool,
    /// Outcome of the latest probe
    pub last_probe: Option<ProbeOutcome>,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
    /// When the process reported its start
    pub started_at: Option<DateTime<Utc>>,
    /// When the service reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code, if the process exited
    pub exit_code: Option<i32>,
    /// Failure cause
    pub reason: Option<FailureReason>,
    /// Live process handle
    #[serde(skip)]
    pub handle: Option<ServiceHandle>,
    launched: bool,
    ready: bool,
}

impl ServiceRuntimeState {
    pub fn new(name: &str, health_checked: bool) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Pending,
            health_checked,
            last_probe: None,
            consecutive_failures: 0,
            started_at: None,
            finished_at: None,
            exit_code: None,
            reason: None,
            handle: None,
            launched: false,
            ready: false,
        }
    }

    /// Reached a status it will stay in without further input
    pub fn is_settled(&self) -> bool {
        match self.status {
            ServiceStatus::Healthy | ServiceStatus::Unhealthy => true,
            ServiceStatus::Running => !self.health_checked,
            status => status.is_terminal(),
        }
    }

    /// Whether the condition has been met. Once met it stays met.
    pub fn satisfies(&self, condition: DependencyCondition) -> bool {
        match condition {
            DependencyCondition::Started => self.launched,
            DependencyCondition::Healthy => self.ready,
            DependencyCondition::CompletedSuccessfully => self.status == ServiceStatus::Completed,
        }
    }

    /// Evaluate an edge pointing at this service
    pub fn edge_state(&self, condition: DependencyCondition) -> EdgeState {
        if self.status == ServiceStatus::Failed {
            EdgeState::Blocked
        } else if self.satisfies(condition) {
            EdgeState::Satisfied
        } else if self.status.is_terminal() {
            EdgeState::Blocked
        } else {
            EdgeState::Waiting
        }
    }

    /// Root service of a failure chain ending here
    pub fn failure_origin(&self) -> Option<String> {
        if self.status != ServiceStatus::Failed {
            return None;
        }
        match &self.reason {
            Some(FailureReason::DependencyFailed { origin, .. }) => Some(origin.clone()),
            _ => Some(self.name.clone()),
        }
    }

    /// Pending -> Launching
    pub fn mark_launching(&mut self) -> bool {
        if self.status != ServiceStatus::Pending {
            return false;
        }
        self.launched = true;
        self.status = ServiceStatus::Launching;
        true
    }

    /// Launching -> Running
    pub fn mark_running(&mut self, handle: ServiceHandle) -> bool {
        if self.status != ServiceStatus::Launching {
            return false;
        }
        self.handle = Some(handle);
        self.started_at = Some(Utc::now());
        if !self.health_checked {
            self.ready = true;
        }
        self.status = ServiceStatus::Running;
        true
    }

    /// Any non-terminal status -> Failed
    pub fn mark_failed(&mut self, reason: FailureReason) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.reason = Some(reason);
        self.finished_at = Some(Utc::now());
        self.handle = None;
        self.status = ServiceStatus::Failed;
        true
    }

    /// Apply an exit reported by the launcher
    pub fn mark_exited(&mut self, exit: ExitState) -> bool {
        if !self.status.is_live() {
            return false;
        }
        match exit {
            ExitState::Pending => false,
            ExitState::Success if self.status == ServiceStatus::Unhealthy => {
                self.exit_code = Some(0);
                self.mark_failed(FailureReason::ExitedUnhealthy)
            }
            ExitState::Success => {
                self.exit_code = Some(0);
                self.finished_at = Some(Utc::now());
                self.handle = None;
                self.status = ServiceStatus::Completed;
                true
            }
            ExitState::Failure(code) => {
                self.exit_code = code;
                self.mark_failed(FailureReason::Exited { code })
            }
        }
    }

    /// Live -> Stopping, handing back the handle to stop
    pub fn begin_stop(&mut self) -> Option<ServiceHandle> {
        if !self.status.is_live() {
            return None;
        }
        self.status = ServiceStatus::Stopping;
        self.handle.clone()
    }

    /// Pending, Launching or Stopping -> Stopped
    pub fn mark_stopped(&mut self) -> bool {
        if !matches!(
            self.status,
            ServiceStatus::Pending | ServiceStatus::Launching | ServiceStatus::Stopping
        ) {
            return false;
        }
        self.handle = None;
        self.finished_at = Some(Utc::now());
        self.status = ServiceStatus::Stopped;
        true
    }

    /// Record a probe outcome and derive the health status.
    ///
    /// A success resets the failure counter and reports `Healthy` only when
    /// the service was not already healthy. A failure reports `Unhealthy`
    /// once `threshold` consecutive failures have accumulated.
    pub fn record_probe(&mut self, outcome: ProbeOutcome, threshold: u32) -> ProbeRecord {
        let previous = self.status;
        if !previous.is_live() {
            return ProbeRecord {
                previous,
                current: previous,
                failures: self.consecutive_failures,
                applied: false,
            };
        }

        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.ready = true;
            self.status = ServiceStatus::Healthy;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= threshold.max(1) {
                self.status = ServiceStatus::Unhealthy;
            }
        }
        self.last_probe = Some(outcome);

        ProbeRecord {
            previous,
            current: self.status,
            failures: self.consecutive_failures,
            applied: true,
        }
    }
}

/// Shared, lock-guarded runtime state record.
///
/// Every status change made through [`StateCell::update`] is appended to
/// the session's transition log while the record is still locked, so the
/// log order matches the order in which records changed.
#[derive(Clone)]
pub struct StateCell {
    state: Arc<Mutex<ServiceRuntimeState>>,
    log: Arc<TransitionLog>,
}

impl StateCell {
    pub fn new(state: ServiceRuntimeState, log: Arc<TransitionLog>) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            log,
        }
    }

    /// Mutate the record; a status change is logged as a transition
    pub fn update<R>(&self, f: impl FnOnce(&mut ServiceRuntimeState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MusterError::Lock("Failed to acquire service state lock".to_string()))?;

        let before = state.status;
        let result = f(&mut state);
        if state.status != before {
            self.log
                .push(Transition::new(&state.name, before, state.status));
        }
        Ok(result)
    }

    /// Read from the record
    pub fn read<R>(&self, f: impl FnOnce(&ServiceRuntimeState) -> R) -> Result<R> {
        let state = self
            .state
            .lock()
            .map_err(|_| MusterError::Lock("Failed to acquire service state lock".to_string()))?;
        Ok(f(&state))
    }

    /// Copy of the record
    pub fn snapshot(&self) -> Result<ServiceRuntimeState> {
        self.read(|s| s.clone())
    }

    /// Current status
    pub fn status(&self) -> Result<ServiceStatus> {
        self.read(|s| s.status)
    }

    /// Probe callback used by the health prober
    pub fn record_probe(&self, outcome: ProbeOutcome, threshold: u32) -> Result<ProbeRecord> {
        self.update(|s| s.record_probe(outcome, threshold))
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.lock() {
            Ok(state) => f.debug_tuple("StateCell").field(&*state).finish(),
            Err(_) => f.write_str("StateCell(<poisoned>)"),
        }
    }
}
