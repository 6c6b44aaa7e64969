//! Compose-style descriptor source
//!
//! Reads compose files and turns the service definitions that matter for
//! sequencing (command, environment, dependencies, health checks) into
//! [`ServiceDescriptor`](crate::service::ServiceDescriptor)s.

pub mod config;
pub mod duration;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use duration::{format_duration, parse_duration};
pub use parser::ComposeParser;
