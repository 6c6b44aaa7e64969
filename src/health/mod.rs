//! Health checking
//!
//! A [`ProbeExecutor`] runs one probe; a [`HealthProber`] turns a stream
//! of probe outcomes into healthy/unhealthy transitions using the
//! interval, timeout, retry and start-period rules of a health check.

pub mod probe;
pub mod prober;

pub use probe::{CommandProbe, ProbeExecutor, ProbeOutcome};
pub use prober::HealthProber;
