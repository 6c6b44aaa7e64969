//! Health prober loop for a single service

use super::probe::{ProbeExecutor, ProbeOutcome};
use crate::service::{HealthCheckSpec, ServiceStatus, StateCell};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Drives the health check of one running service.
///
/// The prober waits out the start period, then probes every `interval`.
/// Outcomes are written into the service's state record; when the recorded
/// status flips between healthy and unhealthy the new status is handed to
/// `on_transition`. The loop ends when cancelled or when the service is no
/// longer live.
pub struct HealthProber {
    service: String,
    spec: HealthCheckSpec,
    state: StateCell,
    executor: Arc<dyn ProbeExecutor>,
}

impl HealthProber {
    pub fn new(
        service: &str,
        spec: HealthCheckSpec,
        state: StateCell,
        executor: Arc<dyn ProbeExecutor>,
    ) -> Self {
        Self {
            service: service.to_string(),
            spec,
            state,
            executor,
        }
    }

    /// Run until cancelled or the service stops being live
    pub async fn run<F>(self, mut cancel: watch::Receiver<bool>, mut on_transition: F)
    where
        F: FnMut(ServiceStatus) + Send,
    {
        if !self.spec.start_period.is_zero() {
            debug!(
                "Health check for {} waiting for start period: {:?}",
                self.service, self.spec.start_period
            );
            if wait_or_cancel(self.spec.start_period, &mut cancel).await {
                return;
            }
        }

        let threshold = self.spec.failure_threshold();
        loop {
            if *cancel.borrow() {
                return;
            }

            // In-flight probes are not interrupted by cancellation
            let outcome = self.probe_once().await;

            let record = match self.state.record_probe(outcome.clone(), threshold) {
                Ok(record) => record,
                Err(e) => {
                    error!("Failed to record health check for {}: {}", self.service, e);
                    return;
                }
            };

            if !record.applied {
                debug!(
                    "Health check for {} stopping - service is {}",
                    self.service, record.current
                );
                return;
            }

            if outcome.is_success() {
                debug!("Health check passed for {}", self.service);
            } else {
                warn!(
                    "Health check failed for {} ({}/{}): {}",
                    self.service, record.failures, threshold, outcome
                );
            }

            if let Some(status) = record.transitioned() {
                if status == ServiceStatus::Unhealthy {
                    info!(
                        "Service {} marked as unhealthy after {} failures",
                        self.service, record.failures
                    );
                }
                on_transition(status);
            }

            if wait_or_cancel(self.spec.interval, &mut cancel).await {
                return;
            }
        }
    }

    async fn probe_once(&self) -> ProbeOutcome {
        match timeout(
            self.spec.timeout,
            self.executor.run(&self.spec.action, self.spec.timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}

/// Sleep for `duration`; returns true if cancelled first
async fn wait_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(duration) => false,
        _ = cancel.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TracingSink, TransitionLog};
    use crate::launcher::ServiceHandle;
    use crate::service::ServiceRuntimeState;
    use crate::testing::{ProbeStep, ScriptedProbe};
    use std::sync::Mutex;

    fn running_cell(name: &str) -> StateCell {
        let log = Arc::new(TransitionLog::new(Arc::new(TracingSink)));
        let cell = StateCell::new(ServiceRuntimeState::new(name, true), log);
        cell.update(|s| {
            s.mark_launching();
            s.mark_running(ServiceHandle::new(name, None));
        })
        .unwrap();
        cell
    }

    fn spawn_prober(
        cell: &StateCell,
        spec: HealthCheckSpec,
        probe: Arc<ScriptedProbe>,
    ) -> (
        watch::Sender<bool>,
        Arc<Mutex<Vec<ServiceStatus>>>,
        tokio::task::JoinHandle<()>,
    ) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let prober = HealthProber::new("svc", spec, cell.clone(), probe);
        let task = tokio::spawn(prober.run(cancel_rx, move |status| {
            sink.lock().unwrap().push(status);
        }));
        (cancel_tx, seen, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_is_reported_once() {
        let cell = running_cell("svc");
        let probe = Arc::new(ScriptedProbe::new().script("svc", vec![ProbeStep::Pass]));
        let spec = HealthCheckSpec::shell("svc").interval(Duration::from_secs(1));

        let (cancel, seen, task) = spawn_prober(&cell, spec, probe.clone());
        sleep(Duration::from_millis(5500)).await;
        cancel.send(true).unwrap();
        task.await.unwrap();

        assert!(probe.runs("svc") >= 5);
        assert_eq!(*seen.lock().unwrap(), vec![ServiceStatus::Healthy]);
        assert_eq!(cell.status().unwrap(), ServiceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probes_during_start_period() {
        let cell = running_cell("svc");
        let probe = Arc::new(ScriptedProbe::new().script("svc", vec![ProbeStep::Fail]));
        let spec = HealthCheckSpec::shell("svc")
            .interval(Duration::from_secs(1))
            .retries(1)
            .start_period(Duration::from_secs(10));

        let (cancel, seen, task) = spawn_prober(&cell, spec, probe.clone());

        sleep(Duration::from_millis(9500)).await;
        assert_eq!(probe.runs("svc"), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(cell.status().unwrap(), ServiceStatus::Running);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec![ServiceStatus::Unhealthy]);

        cancel.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_after_retries_then_recovers() {
        let cell = running_cell("svc");
        let probe = Arc::new(ScriptedProbe::new().script(
            "svc",
            vec![
                ProbeStep::Pass,
                ProbeStep::Fail,
                ProbeStep::Fail,
                ProbeStep::Fail,
                ProbeStep::Pass,
            ],
        ));
        let spec = HealthCheckSpec::shell("svc")
            .interval(Duration::from_secs(1))
            .retries(3);

        let (cancel, seen, task) = spawn_prober(&cell, spec, probe);
        sleep(Duration::from_millis(6500)).await;
        cancel.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ServiceStatus::Healthy,
                ServiceStatus::Unhealthy,
                ServiceStatus::Healthy
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_counts_as_timeout() {
        let cell = running_cell("svc");
        let probe = Arc::new(ScriptedProbe::new().script("svc", vec![ProbeStep::Hang]));
        let spec = HealthCheckSpec::shell("svc")
            .interval(Duration::from_secs(1))
            .timeout(Duration::from_secs(2))
            .retries(1);

        let (cancel, seen, task) = spawn_prober(&cell, spec, probe);
        sleep(Duration::from_millis(2500)).await;

        assert_eq!(*seen.lock().unwrap(), vec![ServiceStatus::Unhealthy]);
        let state = cell.snapshot().unwrap();
        assert_eq!(state.last_probe, Some(ProbeOutcome::TimedOut));

        cancel.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prober_retires_when_service_stops() {
        let cell = running_cell("svc");
        let probe = Arc::new(ScriptedProbe::new().script("svc", vec![ProbeStep::Pass]));
        let spec = HealthCheckSpec::shell("svc").interval(Duration::from_secs(1));

        let (_cancel, seen, task) = spawn_prober(&cell, spec, probe.clone());
        sleep(Duration::from_millis(500)).await;
        cell.update(|s| s.begin_stop()).unwrap();

        task.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ServiceStatus::Healthy]);
        assert_eq!(cell.status().unwrap(), ServiceStatus::Stopping);
    }
}
