//! Probe execution

use crate::service::ProbeAction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Passed,
    Failed(String),
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Passed)
    }
}

impl std::fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeOutcome::Passed => write!(f, "passed"),
            ProbeOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            ProbeOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Runs probe actions
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Execute the action, giving up after `timeout`
    async fn run(&self, action: &ProbeAction, timeout: Duration) -> ProbeOutcome;
}

/// Probe executor running commands on the host
#[derive(Debug, Clone, Default)]
pub struct CommandProbe;

impl CommandProbe {
    pub fn new() -> Self {
        Self
    }

    fn command(action: &ProbeAction) -> Option<Command> {
        let mut cmd = match action {
            ProbeAction::Shell(script) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            }
            ProbeAction::Exec(argv) => {
                let (program, args) = argv.split_first()?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Some(cmd)
    }
}

#[async_trait]
impl ProbeExecutor for CommandProbe {
    async fn run(&self, action: &ProbeAction, limit: Duration) -> ProbeOutcome {
        let Some(mut cmd) = Self::command(action) else {
            return ProbeOutcome::Failed("empty probe command".to_string());
        };

        match timeout(limit, cmd.status()).await {
            Ok(Ok(status)) if status.success() => ProbeOutcome::Passed,
            Ok(Ok(status)) => ProbeOutcome::Failed(status.to_string()),
            Ok(Err(e)) => {
                tracing::debug!("Health check command failed to execute: {}", e);
                ProbeOutcome::Failed(e.to_string())
            }
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_probe_pass_and_fail() {
        let probe = CommandProbe::new();
        let limit = Duration::from_secs(5);

        assert_eq!(
            probe.run(&ProbeAction::Shell("true".to_string()), limit).await,
            ProbeOutcome::Passed
        );
        assert!(matches!(
            probe.run(&ProbeAction::Shell("exit 1".to_string()), limit).await,
            ProbeOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_exec_probe() {
        let probe = CommandProbe::new();
        let action = ProbeAction::Exec(vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()]);
        assert!(probe.run(&action, Duration::from_secs(5)).await.is_success());
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let probe = CommandProbe::new();
        let outcome = probe
            .run(&ProbeAction::Shell("sleep 5".to_string()), Duration::from_millis(100))
            .await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_empty_exec_fails() {
        let probe = CommandProbe::new();
        let outcome = probe.run(&ProbeAction::Exec(vec![]), Duration::from_secs(1)).await;
        assert!(!outcome.is_success());
    }
}
