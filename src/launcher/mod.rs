//! Launcher capability
//!
//! The orchestrator never looks inside a running service. It asks a
//! [`Launcher`] to start it, to stop it, and whether it has exited.

pub mod process;

use crate::error::Result;
use crate::service::ServiceDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use process::ProcessLauncher;

/// Opaque handle to a started service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle {
    /// Unique handle ID
    pub id: String,
    /// Service the handle belongs to
    pub service: String,
    /// Process ID, when the launcher runs local processes
    pub pid: Option<u32>,
}

impl ServiceHandle {
    pub fn new(service: &str, pid: Option<u32>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            service: service.to_string(),
            pid,
        }
    }
}

/// Exit status as reported by a launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitState {
    /// Still running
    Pending,
    /// Exited with success
    Success,
    /// Exited with failure, with the exit code when known
    Failure(Option<i32>),
}

/// Starts, stops and observes services
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the service; resolves once the launcher reports it started
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ServiceHandle>;

    /// Stop the service behind the handle
    async fn stop(&self, handle: &ServiceHandle) -> Result<()>;

    /// Exit status of the service behind the handle, without blocking
    async fn exit_status(&self, handle: &ServiceHandle) -> Result<ExitState>;
}
