//! Muster - a compose-compatible service readiness orchestrator
//!
//! Muster starts a set of services in dependency order. Each dependency
//! edge carries a condition:
//!
//! - `started`: the dependency has been issued a start command
//! - `healthy`: the dependency reported its first passing health check
//! - `completed_successfully`: the dependency is a one-shot task that exited
//!   with success
//!
//! Health checks follow the compose model (interval, timeout, retries,
//! start period). Failures propagate to every dependent that has not been
//! launched yet, and a session ends by stopping services in reverse
//! dependency order.

pub mod compose;
pub mod error;
pub mod events;
pub mod graph;
pub mod health;
pub mod launcher;
pub mod orchestrator;
pub mod service;

#[cfg(test)]
mod testing;

pub use error::{MusterError, Result};
pub use graph::DependencyGraph;
pub use orchestrator::{OrchestrationReport, Orchestrator, OrchestratorConfig, Session};
