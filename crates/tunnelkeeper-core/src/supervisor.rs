//! Supervision cycle orchestration
//!
//! One cycle is a linear sequence of bounded steps: probe, and if the tunnel
//! is down, reap stale remote listeners, launch a new session, wait out a
//! settle delay and re-probe to confirm recovery. Every step error is
//! converted into the cycle's outcome here; nothing propagates past the
//! supervisor. A per-spec mutex guarantees at most one recovery in flight
//! per tunnel while independent tunnels run concurrently.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::launcher::{LaunchError, TunnelLauncher};
use crate::probe::{ConnectionProbe, ProbeResult};
use crate::reaper::{ReapError, RemoteReaper};
use crate::report::{CycleOutcome, CycleReport};
use crate::spec::TunnelSpec;

/// Orchestrates probe → reap → launch → verify for a set of tunnels
pub struct Supervisor<P, R, L> {
    probe: P,
    reaper: R,
    launcher: L,
    settle_delay: Duration,
    shutdown: watch::Receiver<bool>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<P, R, L> Supervisor<P, R, L>
where
    P: ConnectionProbe,
    R: RemoteReaper,
    L: TunnelLauncher,
{
    pub fn new(probe: P, reaper: R, launcher: L) -> Self {
        // Default receiver that never fires; dropping the sender keeps the
        // last value readable.
        let (_tx, rx) = watch::channel(false);
        Self {
            probe,
            reaper,
            launcher,
            settle_delay: Duration::from_secs(3),
            shutdown: rx,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait after a launch before trusting the verify probe; session
    /// establishment is not instantaneous.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Shutdown flag checked between steps; a step already in flight runs
    /// to its own timeout.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run one cycle, waiting if a cycle for the same spec is in flight
    pub async fn run_cycle(&self, spec: &TunnelSpec) -> CycleReport {
        let lock = self.spec_lock(&spec.id()).await;
        let _guard = lock.lock_owned().await;
        self.cycle(spec).await
    }

    /// Run one cycle unless one is already in flight for this spec
    pub async fn try_run_cycle(&self, spec: &TunnelSpec) -> Option<CycleReport> {
        let lock = self.spec_lock(&spec.id()).await;
        match lock.try_lock_owned() {
            Ok(_guard) => Some(self.cycle(spec).await),
            Err(_) => {
                debug!(tunnel = %spec.id(), "cycle already in flight, skipping");
                None
            }
        }
    }

    /// Run cycles for independent tunnels concurrently
    pub async fn run_all(&self, specs: &[TunnelSpec]) -> Vec<CycleReport> {
        join_all(specs.iter().map(|spec| self.run_cycle(spec))).await
    }

    async fn spec_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn cycle(&self, spec: &TunnelSpec) -> CycleReport {
        let probe_before = self.probe.probe(spec).await;
        debug!(tunnel = %spec.id(), probe = %probe_before, "probe complete");

        if probe_before == ProbeResult::Established {
            info!(tunnel = %spec.id(), "tunnel healthy, no intervention");
            return CycleReport::new(spec, probe_before, CycleOutcome::Healthy);
        }

        if self.shutdown_requested() {
            return CycleReport::new(spec, probe_before, CycleOutcome::Aborted);
        }

        info!(tunnel = %spec.id(), probe = %probe_before, "tunnel down, starting recovery");

        let mut uncleared = Vec::new();
        match self.reaper.reap(spec).await {
            Ok(()) => debug!(tunnel = %spec.id(), "remote ports cleared"),
            Err(ReapError::PartialClear { ports }) => {
                warn!(tunnel = %spec.id(), ?ports, "some remote ports not cleared, launching anyway");
                uncleared = ports;
            }
            Err(err @ ReapError::Unreachable { .. }) => {
                error!(tunnel = %spec.id(), error = %err, "remote unreachable, recovery aborted");
                return CycleReport::new(spec, probe_before, CycleOutcome::ReapFailed)
                    .with_error(err.to_string());
            }
        }

        if self.shutdown_requested() {
            return CycleReport::new(spec, probe_before, CycleOutcome::Aborted)
                .with_uncleared(uncleared);
        }

        let session = match self.launcher.launch(spec).await {
            Ok(session) => session,
            Err(err) => {
                match &err {
                    // Misconfiguration: retrying will repeat this without
                    // operator action.
                    LaunchError::BindConflict(_) | LaunchError::AuthFailure(_) => {
                        error!(tunnel = %spec.id(), error = %err, "launch failed, operator action required");
                    }
                    _ => warn!(tunnel = %spec.id(), error = %err, "launch failed"),
                }
                return CycleReport::new(spec, probe_before, CycleOutcome::LaunchFailed)
                    .with_error(err.to_string())
                    .with_uncleared(uncleared);
            }
        };
        info!(tunnel = %spec.id(), pid = session.pid, "tunnel session launched");

        tokio::time::sleep(self.settle_delay).await;

        match self.probe.probe(spec).await {
            ProbeResult::Established => {
                info!(tunnel = %spec.id(), pid = session.pid, "tunnel recovered");
                CycleReport::new(spec, probe_before, CycleOutcome::Recovered)
                    .with_session(session)
                    .with_uncleared(uncleared)
            }
            verify => {
                // The launch reported success, so this mismatch points at a
                // silent failure upstream. Surface everything we know.
                error!(
                    tunnel = %spec.id(),
                    pid = session.pid,
                    verify = %verify,
                    "launch reported success but the tunnel did not come up"
                );
                CycleReport::new(spec, probe_before, CycleOutcome::StillDown)
                    .with_session(session)
                    .with_uncleared(uncleared)
                    .with_error(format!("verify probe after launch returned {}", verify))
            }
        }
    }
}
