//! Compose file configuration types
//!
//! Only the keys that affect how services are started and sequenced are
//! modelled. Everything else a compose file may carry (images, ports,
//! volumes, networks) is collected into `extra` so it can be reported and
//! ignored instead of rejected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Compose file version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Top-level keys with no meaning here (networks, volumes, x-*)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name, accepted but not used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Build configuration, accepted but not used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<serde_yaml::Value>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Stop grace period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_grace_period: Option<DurationConfig>,
    /// Keys with no meaning here
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Program and arguments to execute
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(cmd) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()]
            }
            CommandConfig::Exec(argv) => argv.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CommandConfig::Shell(cmd) => cmd.trim().is_empty(),
            CommandConfig::Exec(argv) => argv.is_empty(),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to scalar value; a null value inherits from the host
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl EnvironmentConfig {
    /// Unresolved entries keyed by variable; valueless entries map to null
    pub fn entries(&self) -> BTreeMap<String, serde_yaml::Value> {
        match self {
            EnvironmentConfig::Array(items) => items
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((key, value)) => {
                        (key.to_string(), serde_yaml::Value::String(value.to_string()))
                    }
                    None => (item.clone(), serde_yaml::Value::Null),
                })
                .collect(),
            EnvironmentConfig::Map(map) => map.clone(),
        }
    }

    /// Resolve to concrete variables.
    ///
    /// Entries without a value (`KEY` in list form, `KEY:` in map form) are
    /// taken from `host`, and dropped when the host does not define them.
    pub fn resolve<F>(&self, host: F) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars = BTreeMap::new();
        match self {
            EnvironmentConfig::Array(items) => {
                for item in items {
                    match item.split_once('=') {
                        Some((key, value)) => {
                            vars.insert(key.to_string(), value.to_string());
                        }
                        None => {
                            if let Some(value) = host(item) {
                                vars.insert(item.clone(), value);
                            }
                        }
                    }
                }
            }
            EnvironmentConfig::Map(map) => {
                for (key, value) in map {
                    let value = match scalar_to_string(value) {
                        Some(value) => Some(value),
                        None => host(key),
                    };
                    if let Some(value) = value {
                        vars.insert(key.clone(), value);
                    }
                }
            }
        }
        vars
    }
}

/// Render a YAML scalar as an environment value
pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names, each waiting for `service_started`
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    /// Entries as (target, condition)
    pub fn entries(&self) -> Vec<(String, DependsOnCondition)> {
        match self {
            DependsOnConfig::Array(names) => names
                .iter()
                .map(|name| (name.clone(), DependsOnCondition::default()))
                .collect(),
            DependsOnConfig::Map(map) => map
                .iter()
                .map(|(name, cond)| (name.clone(), cond.clone()))
                .collect(),
        }
    }
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default = "default_condition")]
    pub condition: String,
    /// When false, a missing target is skipped instead of rejected
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Default for DependsOnCondition {
    fn default() -> Self {
        Self {
            condition: default_condition(),
            required: default_required(),
        }
    }
}

fn default_condition() -> String {
    "service_started".to_string()
}

fn default_required() -> bool {
    true
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<DurationConfig>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<DurationConfig>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<DurationConfig>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string, run through the shell
    Command(String),
    /// `["CMD", ...]`, `["CMD-SHELL", "..."]` or `["NONE"]`
    Array(Vec<String>),
}

/// Duration written either as a string ("1m30s") or as plain seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationConfig {
    Seconds(u64),
    Text(String),
}

impl DurationConfig {
    pub fn parse(&self) -> crate::error::Result<std::time::Duration> {
        match self {
            DurationConfig::Seconds(secs) => Ok(std::time::Duration::from_secs(*secs)),
            DurationConfig::Text(text) => super::duration::parse_duration(text),
        }
    }
}
