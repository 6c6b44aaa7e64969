//! Service model
//!
//! Static descriptors (what to run and what it waits for) and the mutable
//! runtime state the orchestrator keeps for each service.

pub mod descriptor;
pub mod state;

pub use descriptor::{
    DependencyCondition, DependencyEdge, DescriptorStore, HealthCheckSpec, LaunchSpec,
    ProbeAction, ServiceDescriptor,
};
pub use state::{
    EdgeState, FailureReason, ProbeRecord, ServiceRuntimeState, ServiceStatus, StateCell,
};
