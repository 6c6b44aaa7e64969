//! Orchestration run report

use crate::events::Transition;
use crate::graph::DependencyGraph;
use crate::health::ProbeOutcome;
use crate::service::{FailureReason, ServiceRuntimeState, ServiceStatus, StateCell};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Final state of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<ProbeOutcome>,
}

impl From<&ServiceRuntimeState> for ServiceReport {
    fn from(state: &ServiceRuntimeState) -> Self {
        Self {
            name: state.name.clone(),
            status: state.status,
            reason: state.reason.clone(),
            exit_code: state.exit_code,
            started_at: state.started_at,
            finished_at: state.finished_at,
            last_probe: state.last_probe.clone(),
        }
    }
}

/// An originating failure and the services it kept from launching
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    /// Service that failed on its own account
    pub service: String,
    /// Why it failed
    pub reason: FailureReason,
    /// Dependents never launched because of it, in start order
    pub blocked: Vec<String>,
}

/// Outcome of an orchestration session
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationReport {
    /// Every service, in start order
    pub services: Vec<ServiceReport>,
    /// Originating failures
    pub failures: Vec<FailureReport>,
    /// Every status change, in the order applied
    pub transitions: Vec<Transition>,
}

impl OrchestrationReport {
    pub(crate) fn build(
        graph: &DependencyGraph,
        cells: &HashMap<String, StateCell>,
        transitions: Vec<Transition>,
    ) -> Self {
        let services: Vec<ServiceReport> = graph
            .start_order()
            .iter()
            .filter_map(|name| cells.get(name))
            .filter_map(|cell| cell.read(|s| ServiceReport::from(s)).ok())
            .collect();

        let failures = services
            .iter()
            .filter_map(|service| match &service.reason {
                Some(reason) if !reason.is_blocked() => Some(FailureReport {
                    service: service.name.clone(),
                    reason: reason.clone(),
                    blocked: services
                        .iter()
                        .filter(|other| {
                            matches!(
                                &other.reason,
                                Some(FailureReason::DependencyFailed { origin, .. }) if *origin == service.name
                            )
                        })
                        .map(|other| other.name.clone())
                        .collect(),
                }),
                _ => None,
            })
            .collect();

        Self {
            services,
            failures,
            transitions,
        }
    }

    /// No service failed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.service(name).map(|s| s.status)
    }

    /// Services that never launched because a dependency failed
    pub fn blocked(&self) -> Vec<&str> {
        self.failures
            .iter()
            .flat_map(|f| f.blocked.iter().map(String::as_str))
            .collect()
    }

    /// Position of the first transition of `service` into `to`
    pub fn transition_index(&self, service: &str, to: ServiceStatus) -> Option<usize> {
        self.transitions
            .iter()
            .position(|t| t.service == service && t.to == to)
    }

    /// Whether a start was ever issued for the service
    pub fn launched(&self, service: &str) -> bool {
        self.transition_index(service, ServiceStatus::Launching)
            .is_some()
    }
}

impl std::fmt::Display for OrchestrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<24} {:<12} DETAIL", "SERVICE", "STATUS")?;
        for service in &self.services {
            let detail = match (&service.reason, service.exit_code) {
                (Some(reason), _) => reason.to_string(),
                (None, Some(code)) => format!("exit code {}", code),
                (None, None) => String::new(),
            };
            writeln!(
                f,
                "{:<24} {:<12} {}",
                service.name,
                service.status.to_string(),
                detail
            )?;
        }

        for failure in &self.failures {
            write!(f, "\n{} failed: {}", failure.service, failure.reason)?;
            if !failure.blocked.is_empty() {
                write!(f, " (blocked: {})", failure.blocked.join(", "))?;
            }
        }
        Ok(())
    }
}
