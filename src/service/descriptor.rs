//! Static service descriptors

use crate::compose::duration::serde_duration;
use crate::error::{MusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default interval between health probes
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Default timeout for a single health probe
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of consecutive failures before a service is unhealthy
pub const DEFAULT_HEALTH_RETRIES: u32 = 3;

/// Condition a dependency must satisfy before its dependent may launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyCondition {
    /// The dependency has been issued a start command
    #[serde(rename = "service_started")]
    Started,
    /// The dependency reported its first healthy probe
    #[serde(rename = "service_healthy")]
    Healthy,
    /// The dependency exited with a success status
    #[serde(rename = "service_completed_successfully")]
    CompletedSuccessfully,
}

impl DependencyCondition {
    /// Compose spelling of the condition
    pub fn as_compose_str(&self) -> &'static str {
        match self {
            DependencyCondition::Started => "service_started",
            DependencyCondition::Healthy => "service_healthy",
            DependencyCondition::CompletedSuccessfully => "service_completed_successfully",
        }
    }
}

impl std::fmt::Display for DependencyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyCondition::Started => write!(f, "started"),
            DependencyCondition::Healthy => write!(f, "healthy"),
            DependencyCondition::CompletedSuccessfully => write!(f, "completed_successfully"),
        }
    }
}

impl FromStr for DependencyCondition {
    type Err = MusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "service_started" | "started" => Ok(DependencyCondition::Started),
            "service_healthy" | "healthy" => Ok(DependencyCondition::Healthy),
            "service_completed_successfully" | "completed_successfully" => {
                Ok(DependencyCondition::CompletedSuccessfully)
            }
            other => Err(MusterError::InvalidConfig(format!(
                "unknown dependency condition '{}'",
                other
            ))),
        }
    }
}

/// A dependency edge: the target service and the condition it must meet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// Service depended upon
    pub target: String,
    /// Readiness condition
    pub condition: DependencyCondition,
}

impl DependencyEdge {
    pub fn new(target: &str, condition: DependencyCondition) -> Self {
        Self {
            target: target.to_string(),
            condition,
        }
    }
}

/// Probe action executed by a probe executor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeAction {
    /// Run the program directly with arguments
    Exec(Vec<String>),
    /// Run through `sh -c`
    Shell(String),
}

impl std::fmt::Display for ProbeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeAction::Exec(argv) => write!(f, "{}", argv.join(" ")),
            ProbeAction::Shell(cmd) => write!(f, "sh -c '{}'", cmd),
        }
    }
}

/// Health-check specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// What to run
    pub action: ProbeAction,
    /// Time between probes
    #[serde(with = "serde_duration")]
    pub interval: Duration,
    /// Hard limit for one probe
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
    /// Consecutive failures tolerated before the service is unhealthy
    pub retries: u32,
    /// Grace window before the first probe
    #[serde(with = "serde_duration")]
    pub start_period: Duration,
}

impl HealthCheckSpec {
    /// Create a health check with compose defaults
    pub fn new(action: ProbeAction) -> Self {
        Self {
            action,
            interval: DEFAULT_HEALTH_INTERVAL,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            retries: DEFAULT_HEALTH_RETRIES,
            start_period: Duration::ZERO,
        }
    }

    /// Health check running a shell command
    pub fn shell(command: &str) -> Self {
        Self::new(ProbeAction::Shell(command.to_string()))
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }

    /// Failure budget, never below one
    pub fn failure_threshold(&self) -> u32 {
        self.retries.max(1)
    }
}

/// How to launch a service; interpreted only by the launcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Program and arguments
    pub command: Vec<String>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Time to wait after a stop request before killing
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_duration"
    )]
    pub stop_grace_period: Option<Duration>,
}

/// Static definition of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service name
    pub name: String,
    /// Launch specification
    pub launch: LaunchSpec,
    /// Dependency edges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyEdge>,
    /// Optional health check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheckSpec>,
}

impl ServiceDescriptor {
    /// Create a descriptor with no command, dependencies or health check
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            launch: LaunchSpec::default(),
            depends_on: Vec::new(),
            healthcheck: None,
        }
    }

    /// Set the command to run
    pub fn command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch.command = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.launch.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a dependency edge
    pub fn depends_on(mut self, target: &str, condition: DependencyCondition) -> Self {
        self.depends_on.push(DependencyEdge::new(target, condition));
        self
    }

    /// Attach a health check
    pub fn healthcheck(mut self, spec: HealthCheckSpec) -> Self {
        self.healthcheck = Some(spec);
        self
    }
}

/// The set of declared services, keyed by name
#[derive(Debug, Clone, Default)]
pub struct DescriptorStore {
    services: BTreeMap<String, ServiceDescriptor>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store, rejecting duplicate names
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = ServiceDescriptor>,
    {
        let mut store = Self::new();
        for descriptor in descriptors {
            store.insert(descriptor)?;
        }
        Ok(store)
    }

    /// Add a service
    pub fn insert(&mut self, descriptor: ServiceDescriptor) -> Result<()> {
        if descriptor.name.trim().is_empty() {
            return Err(MusterError::InvalidConfig(
                "service name must not be empty".to_string(),
            ));
        }
        if self.services.contains_key(&descriptor.name) {
            return Err(MusterError::DuplicateService(descriptor.name));
        }
        self.services.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) fn into_map(self) -> BTreeMap<String, ServiceDescriptor> {
        self.services
    }
}

mod optional_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => crate::compose::duration::serde_duration::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| crate::compose::duration::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
