//! Local process launcher
//!
//! Runs each service command as a child process of the orchestrator. One
//! live child is kept per service name.

use super::{ExitState, Launcher, ServiceHandle};
use crate::error::{MusterError, Result};
use crate::service::ServiceDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Default time between the stop signal and a forced kill
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

struct ManagedChild {
    handle: ServiceHandle,
    child: Child,
    grace_period: Duration,
}

/// Launcher running services as local processes
pub struct ProcessLauncher {
    /// Directory relative working directories are resolved against
    working_dir: PathBuf,
    /// Grace period for services that declare none
    grace_period: Duration,
    /// Children indexed by service name
    children: Mutex<HashMap<String, ManagedChild>>,
}

impl ProcessLauncher {
    /// Create a launcher rooted at the project directory
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            grace_period: DEFAULT_STOP_GRACE_PERIOD,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Set the default stop grace period
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn build_command(&self, descriptor: &ServiceDescriptor) -> Result<Command> {
        let launch = &descriptor.launch;
        let (program, args) = launch.command.split_first().ok_or_else(|| MusterError::Launch {
            service: descriptor.name.clone(),
            message: "empty command".to_string(),
        })?;

        let cwd = match &launch.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&launch.env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ServiceHandle> {
        let mut children = self.children.lock().await;

        if let Some(existing) = children.get_mut(&descriptor.name) {
            if existing.child.try_wait()?.is_none() {
                return Err(MusterError::AlreadyRunning(descriptor.name.clone()));
            }
        }

        let mut cmd = self.build_command(descriptor)?;
        let child = cmd.spawn().map_err(|e| MusterError::Launch {
            service: descriptor.name.clone(),
            message: e.to_string(),
        })?;

        let handle = ServiceHandle::new(&descriptor.name, child.id());
        tracing::debug!(
            "Spawned {} (pid {:?}): {}",
            descriptor.name,
            handle.pid,
            descriptor.launch.command.join(" ")
        );

        children.insert(
            descriptor.name.clone(),
            ManagedChild {
                handle: handle.clone(),
                child,
                grace_period: descriptor
                    .launch
                    .stop_grace_period
                    .unwrap_or(self.grace_period),
            },
        );

        Ok(handle)
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<()> {
        // Take the child out so the lock is not held while waiting on it
        let managed = {
            let mut children = self.children.lock().await;
            let owned = children
                .get(&handle.service)
                .is_some_and(|m| m.handle.id == handle.id);
            if owned {
                children.remove(&handle.service)
            } else {
                None
            }
        };

        let Some(mut managed) = managed else {
            return Err(MusterError::NotRunning(handle.service.clone()));
        };

        if managed.child.try_wait()?.is_some() {
            return Ok(());
        }

        terminate(&mut managed.child)?;

        match tokio::time::timeout(managed.grace_period, managed.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!("{} exited after stop: {}", handle.service, status);
            }
            Err(_) => {
                tracing::warn!(
                    "{} did not stop within {:?}, killing",
                    handle.service,
                    managed.grace_period
                );
                managed.child.kill().await?;
            }
        }

        Ok(())
    }

    async fn exit_status(&self, handle: &ServiceHandle) -> Result<ExitState> {
        let mut children = self.children.lock().await;
        let managed = children
            .get_mut(&handle.service)
            .filter(|m| m.handle.id == handle.id)
            .ok_or_else(|| MusterError::NotRunning(handle.service.clone()))?;

        Ok(match managed.child.try_wait()? {
            None => ExitState::Pending,
            Some(status) if status.success() => ExitState::Success,
            Some(status) => ExitState::Failure(status.code()),
        })
    }
}

/// Ask the child to terminate
#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: plain signal delivery to a child we spawned and still own
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(MusterError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<()> {
    child.start_kill()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn service(name: &str, script: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name).command(["sh", "-c", script])
    }

    async fn wait_for_exit(launcher: &ProcessLauncher, handle: &ServiceHandle) -> ExitState {
        for _ in 0..200 {
            let state = launcher.exit_status(handle).await.unwrap();
            if state != ExitState::Pending {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        ExitState::Pending
    }

    #[tokio::test]
    async fn test_reports_success_and_failure() {
        let temp = tempdir().unwrap();
        let launcher = ProcessLauncher::new(temp.path().to_path_buf());

        let ok = launcher.start(&service("ok", "exit 0")).await.unwrap();
        let bad = launcher.start(&service("bad", "exit 3")).await.unwrap();

        assert_eq!(wait_for_exit(&launcher, &ok).await, ExitState::Success);
        assert_eq!(wait_for_exit(&launcher, &bad).await, ExitState::Failure(Some(3)));
    }

    #[tokio::test]
    async fn test_refuses_second_live_instance() {
        let temp = tempdir().unwrap();
        let launcher = ProcessLauncher::new(temp.path().to_path_buf());
        let desc = service("sleeper", "sleep 30");

        let handle = launcher.start(&desc).await.unwrap();
        let second = launcher.start(&desc).await;
        assert!(matches!(second, Err(MusterError::AlreadyRunning(_))));

        launcher.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_terminates_process() {
        let temp = tempdir().unwrap();
        let launcher = ProcessLauncher::new(temp.path().to_path_buf())
            .grace_period(Duration::from_secs(2));

        let handle = launcher.start(&service("sleeper", "sleep 30")).await.unwrap();
        assert_eq!(launcher.exit_status(&handle).await.unwrap(), ExitState::Pending);

        launcher.stop(&handle).await.unwrap();
        assert!(launcher.exit_status(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let temp = tempdir().unwrap();
        std::fs::create_dir(temp.path().join("work")).unwrap();
        let launcher = ProcessLauncher::new(temp.path().to_path_buf());

        let mut desc = service("writer", "echo \"$GREETING\" > out.txt").env("GREETING", "hello");
        desc.launch.working_dir = Some(PathBuf::from("work"));

        let handle = launcher.start(&desc).await.unwrap();
        assert_eq!(wait_for_exit(&launcher, &handle).await, ExitState::Success);

        let written = std::fs::read_to_string(temp.path().join("work/out.txt")).unwrap();
        assert_eq!(written.trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let temp = tempdir().unwrap();
        let launcher = ProcessLauncher::new(temp.path().to_path_buf());
        let desc = ServiceDescriptor::new("ghost").command(["/definitely/not/a/program"]);

        let result = launcher.start(&desc).await;
        assert!(matches!(result, Err(MusterError::Launch { .. })));
    }
}
