//! Compose file parser

use super::config::{
    ComposeConfig, DurationConfig, EnvironmentConfig, HealthcheckConfig, HealthcheckTest,
    ServiceConfig,
};
use crate::error::{MusterError, Result};
use crate::service::{
    DependencyCondition, DescriptorStore, HealthCheckSpec, LaunchSpec, ProbeAction,
    ServiceDescriptor,
};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Keys a service may carry that are accepted without comment
const QUIET_KEYS: &[&str] = &["container_name", "restart", "labels", "profiles"];

/// `$$`, `${VAR}`, `${VAR<op><arg>}` and `$VAR`
static INTERPOLATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)",
    )
    .expect("interpolation pattern is valid")
});

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MusterError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| MusterError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple compose files, later files overriding earlier ones
    pub fn parse_files<P: AsRef<Path>>(paths: &[P]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path.as_ref())?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => merge_service(existing, service),
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        result.extra.extend(overlay.extra);
        result
    }

    /// Validate compose configuration, returning warnings
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for key in config.extra.keys() {
            if !key.starts_with("x-") {
                warnings.push(format!("Top-level key '{}' is ignored", key));
            }
        }

        for (name, service) in &config.services {
            match &service.command {
                Some(command) if !command.is_empty() => {}
                _ => {
                    return Err(MusterError::InvalidConfig(format!(
                        "Service '{}' must specify a 'command'",
                        name
                    )));
                }
            }

            if service.image.is_some() || service.build.is_some() {
                warnings.push(format!(
                    "Service '{}': 'image' and 'build' are ignored, the command runs on the host",
                    name
                ));
            }
            for key in service.extra.keys() {
                if !QUIET_KEYS.contains(&key.as_str()) && !key.starts_with("x-") {
                    warnings.push(format!("Service '{}': key '{}' is ignored", name, key));
                }
            }

            if let Some(depends) = &service.depends_on {
                for (dep, cond) in depends.entries() {
                    cond.condition.parse::<DependencyCondition>().map_err(|_| {
                        MusterError::InvalidConfig(format!(
                            "Service '{}' uses unknown condition '{}' for '{}'",
                            name, cond.condition, dep
                        ))
                    })?;

                    if !config.services.contains_key(&dep) {
                        if cond.required {
                            return Err(MusterError::UnknownService {
                                service: name.clone(),
                                dependency: dep,
                            });
                        }
                        warnings.push(format!(
                            "Service '{}': optional dependency '{}' is not defined",
                            name, dep
                        ));
                    }
                }
            }

            if let Some(grace) = &service.stop_grace_period {
                grace.parse()?;
            }

            if let Some(healthcheck) = &service.healthcheck {
                if healthcheck.disable != Some(true) {
                    if healthcheck.test.is_none() {
                        warnings.push(format!(
                            "Service '{}': healthcheck has no 'test' and is ignored",
                            name
                        ));
                    }
                    to_health_spec(name, healthcheck)?;
                }
            }
        }

        Ok(warnings)
    }

    /// Substitute `${VAR}`, `$VAR`, `${VAR:-default}`, `${VAR-default}`,
    /// `${VAR:?message}` and `$$` in commands, environment values, working
    /// directories and health-check tests
    pub fn interpolate(config: &mut ComposeConfig, env: &HashMap<String, String>) -> Result<()> {
        let sub = |s: &mut String| -> Result<()> {
            *s = interpolate_string(s, env)?;
            Ok(())
        };

        for service in config.services.values_mut() {
            match &mut service.command {
                Some(super::config::CommandConfig::Shell(cmd)) => sub(cmd)?,
                Some(super::config::CommandConfig::Exec(argv)) => {
                    for arg in argv.iter_mut() {
                        sub(arg)?;
                    }
                }
                None => {}
            }

            if let Some(working_dir) = &mut service.working_dir {
                sub(working_dir)?;
            }

            match &mut service.environment {
                Some(EnvironmentConfig::Array(items)) => {
                    for item in items.iter_mut() {
                        sub(item)?;
                    }
                }
                Some(EnvironmentConfig::Map(map)) => {
                    for value in map.values_mut() {
                        if let serde_yaml::Value::String(s) = value {
                            sub(s)?;
                        }
                    }
                }
                None => {}
            }

            if let Some(HealthcheckConfig { test: Some(test), .. }) = &mut service.healthcheck {
                match test {
                    HealthcheckTest::Command(cmd) => sub(cmd)?,
                    HealthcheckTest::Array(argv) => {
                        for arg in argv.iter_mut() {
                            sub(arg)?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Convert a validated configuration into service descriptors
    pub fn to_store(config: &ComposeConfig) -> Result<DescriptorStore> {
        let mut store = DescriptorStore::new();

        for (name, service) in &config.services {
            store.insert(to_descriptor(name, service, &config.services)?)?;
        }

        Ok(store)
    }

    /// Parse, interpolate against the process environment, validate and
    /// convert the given files. Returns the descriptors and any warnings.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<(DescriptorStore, Vec<String>)> {
        let mut config = Self::parse_files(paths)?;
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::interpolate(&mut config, &env)?;
        let warnings = Self::validate(&config)?;
        let store = Self::to_store(&config)?;
        Ok((store, warnings))
    }
}

/// Overlay service fields onto an existing service
fn merge_service(existing: &mut ServiceConfig, overlay: ServiceConfig) {
    if overlay.image.is_some() {
        existing.image = overlay.image;
    }
    if overlay.build.is_some() {
        existing.build = overlay.build;
    }
    if overlay.command.is_some() {
        existing.command = overlay.command;
    }
    if overlay.working_dir.is_some() {
        existing.working_dir = overlay.working_dir;
    }
    if overlay.depends_on.is_some() {
        existing.depends_on = overlay.depends_on;
    }
    if overlay.healthcheck.is_some() {
        existing.healthcheck = overlay.healthcheck;
    }
    if overlay.stop_grace_period.is_some() {
        existing.stop_grace_period = overlay.stop_grace_period;
    }

    // Environment merges per variable; host lookups happen at conversion
    existing.environment = match (existing.environment.take(), overlay.environment) {
        (Some(base), Some(over)) => {
            let mut vars = base.entries();
            vars.extend(over.entries());
            Some(EnvironmentConfig::Map(vars))
        }
        (base, over) => over.or(base),
    };

    existing.extra.extend(overlay.extra);
}

fn to_descriptor(
    name: &str,
    service: &ServiceConfig,
    services: &std::collections::BTreeMap<String, ServiceConfig>,
) -> Result<ServiceDescriptor> {
    let command = service
        .command
        .as_ref()
        .map(|c| c.to_argv())
        .ok_or_else(|| {
            MusterError::InvalidConfig(format!("Service '{}' must specify a 'command'", name))
        })?;

    let env = service
        .environment
        .as_ref()
        .map(|e| e.resolve(|key| std::env::var(key).ok()))
        .unwrap_or_default();

    let stop_grace_period = service
        .stop_grace_period
        .as_ref()
        .map(DurationConfig::parse)
        .transpose()?;

    let mut descriptor = ServiceDescriptor::new(name);
    descriptor.launch = LaunchSpec {
        command,
        env,
        working_dir: service.working_dir.as_ref().map(PathBuf::from),
        stop_grace_period,
    };

    if let Some(depends) = &service.depends_on {
        for (dep, cond) in depends.entries() {
            if !cond.required && !services.contains_key(&dep) {
                continue;
            }
            let condition: DependencyCondition = cond.condition.parse()?;
            descriptor = descriptor.depends_on(&dep, condition);
        }
    }

    if let Some(healthcheck) = &service.healthcheck {
        if let Some(spec) = to_health_spec(name, healthcheck)? {
            descriptor = descriptor.healthcheck(spec);
        }
    }

    Ok(descriptor)
}

/// Normalize a healthcheck block; `None` when disabled or without a test
fn to_health_spec(service: &str, config: &HealthcheckConfig) -> Result<Option<HealthCheckSpec>> {
    if config.disable == Some(true) {
        return Ok(None);
    }

    let action = match &config.test {
        None => return Ok(None),
        Some(HealthcheckTest::Command(cmd)) if cmd.trim().is_empty() => {
            return Err(empty_test(service));
        }
        Some(HealthcheckTest::Command(cmd)) => ProbeAction::Shell(cmd.clone()),
        Some(HealthcheckTest::Array(argv)) => match argv.split_first() {
            None => return Err(empty_test(service)),
            Some((kind, _)) if kind == "NONE" => return Ok(None),
            Some((kind, rest)) if kind == "CMD" => {
                if rest.is_empty() {
                    return Err(empty_test(service));
                }
                ProbeAction::Exec(rest.to_vec())
            }
            Some((kind, rest)) if kind == "CMD-SHELL" => {
                if rest.is_empty() {
                    return Err(empty_test(service));
                }
                ProbeAction::Shell(rest.join(" "))
            }
            Some(_) => ProbeAction::Exec(argv.clone()),
        },
    };

    let mut spec = HealthCheckSpec::new(action);
    if let Some(interval) = &config.interval {
        spec = spec.interval(interval.parse()?);
    }
    if let Some(timeout) = &config.timeout {
        spec = spec.timeout(timeout.parse()?);
    }
    if let Some(retries) = config.retries {
        spec = spec.retries(retries);
    }
    if let Some(start_period) = &config.start_period {
        spec = spec.start_period(start_period.parse()?);
    }

    if spec.interval.is_zero() {
        return Err(MusterError::InvalidConfig(format!(
            "Service '{}': healthcheck interval must be greater than zero",
            service
        )));
    }

    Ok(Some(spec))
}

fn empty_test(service: &str) -> MusterError {
    MusterError::InvalidConfig(format!("Service '{}': healthcheck test is empty", service))
}

/// Interpolate environment variables in a string
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut last = 0;

    for caps in INTERPOLATION.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        result.push_str(&s[last..whole.start()]);
        result.push_str(&substitute(&caps, env)?);
        last = whole.end();
    }

    result.push_str(&s[last..]);
    Ok(result)
}

fn substitute(caps: &Captures, env: &HashMap<String, String>) -> Result<String> {
    if &caps[0] == "$$" {
        return Ok("$".to_string());
    }
    if let Some(var) = caps.get(4) {
        return Ok(env.get(var.as_str()).cloned().unwrap_or_default());
    }

    let var = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let value = env.get(var);
    let arg = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

    match caps.get(2).map(|m| m.as_str()) {
        None => Ok(value.cloned().unwrap_or_default()),
        Some(":-") => Ok(value
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| arg.to_string())),
        Some("-") => Ok(value.cloned().unwrap_or_else(|| arg.to_string())),
        Some(op) => match value.filter(|v| op == "?" || !v.is_empty()) {
            Some(v) => Ok(v.clone()),
            None => Err(MusterError::InvalidConfig(format!(
                "required variable '{}' is missing: {}",
                var, arg
            ))),
        },
    }
}
