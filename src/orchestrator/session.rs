//! Handle to a running orchestration session

use super::report::OrchestrationReport;
use super::scheduler::{Command, Progress};
use crate::error::{MusterError, Result};
use crate::events::{Transition, TransitionLog};
use crate::service::{ServiceRuntimeState, ServiceStatus, StateCell};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A started orchestration.
///
/// Dropping the session without calling [`Session::stop`] also stops every
/// service, but the report is lost.
pub struct Session {
    /// State records in start order
    services: Vec<(String, StateCell)>,
    log: Arc<TransitionLog>,
    progress: watch::Receiver<Progress>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<OrchestrationReport>,
}

impl Session {
    pub(crate) fn new(
        services: Vec<(String, StateCell)>,
        log: Arc<TransitionLog>,
        progress: watch::Receiver<Progress>,
        commands: mpsc::Sender<Command>,
        task: JoinHandle<OrchestrationReport>,
    ) -> Self {
        Self {
            services,
            log,
            progress,
            commands,
            task,
        }
    }

    /// Wait until every service is terminal or steady
    pub async fn wait_settled(&mut self) -> Result<()> {
        self.wait_for(|p| p.settled).await
    }

    /// Wait until every service is terminal
    pub async fn wait_finished(&mut self) -> Result<()> {
        self.wait_for(|p| p.finished).await
    }

    async fn wait_for(&mut self, done: impl FnMut(&Progress) -> bool) -> Result<()> {
        self.progress
            .wait_for(done)
            .await
            .map(|_| ())
            .map_err(|_| MusterError::SessionClosed)
    }

    /// Latest published progress
    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    /// Copy of every service's runtime state, in start order
    pub fn snapshot(&self) -> Result<Vec<ServiceRuntimeState>> {
        self.services.iter().map(|(_, cell)| cell.snapshot()).collect()
    }

    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        self.services
            .iter()
            .find(|(name, _)| name == service)
            .and_then(|(_, cell)| cell.status().ok())
    }

    /// Transitions so far
    pub fn transitions(&self) -> Vec<Transition> {
        self.log.entries()
    }

    /// Stop every service in reverse dependency order and return the report
    pub async fn stop(self) -> Result<OrchestrationReport> {
        // A closed channel means the scheduler is already shutting down
        let _ = self.commands.send(Command::Stop).await;
        self.task
            .await
            .map_err(|e| MusterError::Internal(format!("scheduler task failed: {}", e)))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("services", &self.services.len())
            .field("progress", &self.progress())
            .finish()
    }
}
