//! Supervisor: owns the worker, the probe/policy cycle and the restart
//! guarantee.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::KeeperConfig;
use crate::context::{ServiceContext, SupervisorEvent};
use crate::error::RespawnError;
use crate::priority::{PriorityPolicy, ThreadScheduler};
use crate::probe::{CpuCounterSource, UtilizationProbe, UtilizationSample, read_core_frequencies};
use crate::respawn::{RespawnSchedule, WakeRegistrar};
use crate::supervisor::state::{ServiceLifecycleState, StartDisposition, SupervisorStatus};
use crate::worker::{WorkerHandle, WorkerOptions};
use crate::workload::Workload;

const TAG: &str = "WorkerProcessService";

/// Builds a fresh workload for every worker start.
pub type WorkloadFactory = Arc<dyn Fn() -> Box<dyn Workload> + Send + Sync>;

/// Builds the counter source for every probe cycle.
pub type CounterSourceFactory = Arc<dyn Fn() -> Box<dyn CpuCounterSource> + Send + Sync>;

/// Collaborators handed to the supervisor at construction.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub ctx: ServiceContext,
    pub scheduler: Arc<dyn ThreadScheduler>,
    pub registrar: Arc<dyn WakeRegistrar>,
    pub workload: WorkloadFactory,
    pub counters: CounterSourceFactory,
}

/// Timing and policy settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    pub respawn_interval: Duration,
    pub policy: PriorityPolicy,
    pub worker: WorkerOptions,
}

impl SupervisorConfig {
    pub fn from_keeper(config: &KeeperConfig) -> Self {
        Self {
            probe_interval: config.probe_interval,
            respawn_interval: config.respawn_interval,
            policy: PriorityPolicy::new(
                config.low_threshold,
                config.high_threshold,
                config.priority_range,
                config.feedback,
            ),
            worker: WorkerOptions {
                initial_priority: config.initial_priority,
                ..WorkerOptions::default()
            },
        }
    }
}

struct Inner {
    state: ServiceLifecycleState,
    worker: Option<WorkerHandle>,
    probe_task: Option<JoinHandle<()>>,
    respawn: Option<RespawnSchedule>,
    last_sample: Option<UtilizationSample>,
}

impl Inner {
    fn transition(
        &mut self,
        ctx: &ServiceContext,
        target: ServiceLifecycleState,
        reason: &str,
    ) -> bool {
        if self.state == target {
            return true;
        }
        if !self.state.can_transition_to(target) {
            tracing::warn!(
                from = %self.state,
                to = %target,
                reason,
                "Rejected lifecycle transition"
            );
            return false;
        }
        ctx.log(TAG, &format!("{} -> {} ({reason})", self.state, target));
        self.state = target;
        true
    }

    fn stop_probe_cycle(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
    }
}

/// Keeps one worker alive and tunes its priority to the host load.
pub struct Supervisor {
    config: SupervisorConfig,
    deps: SupervisorDeps,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, deps: SupervisorDeps) -> Arc<Self> {
        Arc::new(Self {
            config,
            deps,
            inner: Mutex::new(Inner {
                state: ServiceLifecycleState::Stopped,
                worker: None,
                probe_task: None,
                respawn: None,
                last_sample: None,
            }),
        })
    }

    pub async fn state(&self) -> ServiceLifecycleState {
        self.inner.lock().await.state
    }

    /// Start request from the host. Re-registers the restart guarantee and
    /// launches a worker unless one is alive. Always asks to be restarted.
    pub async fn on_start(self: &Arc<Self>) -> StartDisposition {
        let ctx = &self.deps.ctx;
        let mut inner = self.inner.lock().await;
        ctx.log(TAG, "onStart called");

        self.register_respawn(&mut inner);

        if inner.state == ServiceLifecycleState::Terminating {
            ctx.log(TAG, "Stop in progress, start ignored");
            return StartDisposition::Sticky;
        }
        if inner.worker.as_ref().is_some_and(|w| w.is_alive()) {
            ctx.log(TAG, "Worker thread is already running");
            return StartDisposition::Sticky;
        }

        if let Some(dead) = inner.worker.take() {
            inner.stop_probe_cycle();
            reap(dead);
        }
        if matches!(
            inner.state,
            ServiceLifecycleState::Running | ServiceLifecycleState::Paused
        ) {
            inner.transition(ctx, ServiceLifecycleState::Stopped, "worker found dead");
        }
        inner.transition(ctx, ServiceLifecycleState::Starting, "start requested");

        match WorkerHandle::spawn(
            ctx.clone(),
            Arc::clone(&self.deps.scheduler),
            (self.deps.workload)(),
            self.config.worker.clone(),
        ) {
            Ok(worker) => {
                ctx.log(TAG, &format!("Worker {} launched", worker.id()));
                inner.worker = Some(worker);
            }
            Err(e) => {
                // the next start trigger or respawn fire retries
                tracing::error!(error = %e, "Worker start failed");
            }
        }
        StartDisposition::Sticky
    }

    /// Stop request from the host. The restart registration is left in place.
    pub async fn on_stop(&self) {
        let ctx = &self.deps.ctx;
        let worker = {
            let mut inner = self.inner.lock().await;
            ctx.log(TAG, "onStop called");
            if matches!(
                inner.state,
                ServiceLifecycleState::Stopped | ServiceLifecycleState::Terminating
            ) {
                return;
            }
            inner.transition(ctx, ServiceLifecycleState::Terminating, "stop requested");
            inner.stop_probe_cycle();
            inner.worker.take()
        };

        if let Some(worker) = worker {
            worker.stop();
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Worker ended abnormally"),
                Err(e) => tracing::warn!(error = %e, "Worker join task failed"),
            }
        }

        let mut inner = self.inner.lock().await;
        inner.transition(ctx, ServiceLifecycleState::Stopped, "worker stopped");
    }

    /// Forward a pause to the worker. No-op without a worker.
    pub async fn pause(&self) {
        let ctx = &self.deps.ctx;
        let mut inner = self.inner.lock().await;
        let Some(worker) = inner.worker.as_ref() else {
            ctx.log(TAG, "Pause requested with no worker, ignoring");
            return;
        };
        ctx.log(TAG, "Pausing worker thread");
        worker.request_pause();
        if inner.state == ServiceLifecycleState::Running {
            inner.transition(ctx, ServiceLifecycleState::Paused, "pause requested");
        }
    }

    /// Forward a resume to the worker. No-op without a worker.
    pub async fn resume(&self) {
        let ctx = &self.deps.ctx;
        let mut inner = self.inner.lock().await;
        let Some(worker) = inner.worker.as_ref() else {
            ctx.log(TAG, "Resume requested with no worker, ignoring");
            return;
        };
        ctx.log(TAG, "Resuming worker thread");
        worker.request_resume();
        if inner.state == ServiceLifecycleState::Paused {
            inner.transition(ctx, ServiceLifecycleState::Running, "resume requested");
        }
    }

    /// Remove the restart guarantee. It comes back with the next start.
    pub async fn cancel_respawn(&self) -> Result<(), RespawnError> {
        let mut inner = self.inner.lock().await;
        self.deps.registrar.cancel()?;
        inner.respawn = None;
        Ok(())
    }

    pub async fn status(&self) -> SupervisorStatus {
        let inner = self.inner.lock().await;
        let worker = inner.worker.as_ref();
        let priority = worker.map(|w| w.priority());
        SupervisorStatus {
            state: inner.state,
            worker_id: worker.map(|w| w.id()),
            thread_id: worker.and_then(|w| w.thread_id()),
            phase: worker.map(|w| w.phase()),
            intended_priority: priority.map(|p| p.intended),
            applied_priority: priority.and_then(|p| p.applied),
            iterations: worker.map(|w| w.iterations()).unwrap_or(0),
            last_utilization: inner.last_sample.map(|s| s.derived_percent),
            next_respawn: inner.respawn.map(|r| r.next_fire_after(Utc::now())),
        }
    }

    /// Drain the context channel on a background task. The task holds only a
    /// weak reference and ends once the supervisor is dropped.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                supervisor.handle_event(event).await;
            }
            tracing::debug!("Supervisor event loop ended");
        })
    }

    pub async fn handle_event(self: &Arc<Self>, event: SupervisorEvent) {
        let ctx = &self.deps.ctx;
        let mut inner = self.inner.lock().await;
        match event {
            SupervisorEvent::WorkerReady {
                worker_id,
                thread_id,
            } => {
                ctx.log(TAG, &format!("Get thread TID: {thread_id} from worker."));
                let Some(worker) = inner.worker.as_ref().filter(|w| w.id() == worker_id) else {
                    tracing::debug!(%worker_id, "Ready from a replaced worker, ignoring");
                    return;
                };
                if inner.state != ServiceLifecycleState::Starting {
                    return;
                }
                let target = if worker.is_paused() {
                    ServiceLifecycleState::Paused
                } else {
                    ServiceLifecycleState::Running
                };
                if inner.transition(ctx, target, "worker ready") {
                    self.start_probe_cycle(&mut inner);
                }
            }
            SupervisorEvent::WorkerExited { worker_id } => {
                if inner.worker.as_ref().map(|w| w.id()) != Some(worker_id) {
                    return;
                }
                tracing::warn!(%worker_id, "Worker exited, waiting for the next start trigger");
                inner.stop_probe_cycle();
                if let Some(dead) = inner.worker.take() {
                    reap(dead);
                }
                if inner.state.has_worker() {
                    inner.transition(ctx, ServiceLifecycleState::Stopped, "worker exited");
                }
            }
        }
    }

    fn register_respawn(&self, inner: &mut Inner) {
        let schedule = match RespawnSchedule::new(self.config.respawn_interval, Utc::now()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "Respawn schedule rejected");
                return;
            }
        };
        match self.deps.registrar.register(&schedule) {
            Ok(()) => {
                self.deps.ctx.log(
                    TAG,
                    &format!(
                        "Auto-respawn scheduled with interval: {} ms",
                        schedule.interval_ms
                    ),
                );
                inner.respawn = Some(schedule);
            }
            Err(e) => tracing::error!(error = %e, "Respawn registration failed"),
        }
    }

    fn start_probe_cycle(self: &Arc<Self>, inner: &mut Inner) {
        inner.stop_probe_cycle();

        let weak = Arc::downgrade(self);
        let period = self.config.probe_interval;
        let mut probe = UtilizationProbe::new((self.deps.counters)());
        inner.probe_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the immediate first tick only primes the probe baseline
            loop {
                ticker.tick().await;
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                if !supervisor.probe_tick(&mut probe).await {
                    break;
                }
            }
            tracing::debug!("Probe cycle ended");
        }));
    }

    /// One probe/policy cycle. Returns false once there is no live worker.
    async fn probe_tick(&self, probe: &mut UtilizationProbe<Box<dyn CpuCounterSource>>) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(worker) = inner.worker.as_ref().filter(|w| w.is_alive()) else {
            return false;
        };

        let sample = probe.sample_once();
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(mhz = ?read_core_frequencies(), "CPU frequencies");
        }

        let current = worker.priority();
        let next = self.config.policy.next(&sample, current.intended);
        if next != current.intended {
            self.deps.ctx.log(
                TAG,
                &format!(
                    "Adjusting worker priority {} -> {next} at {:.1}% CPU",
                    current.intended, sample.derived_percent
                ),
            );
            worker.request_priority(next);
        } else if current.is_pending() {
            tracing::debug!(level = current.intended.0, "Retrying priority apply");
            worker.request_priority(current.intended);
        } else {
            tracing::debug!(percent = sample.derived_percent, "Probe CPU usage within band");
        }

        inner.last_sample = Some(sample);
        true
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.stop_probe_cycle();
        if let Some(worker) = inner.worker.take() {
            worker.stop();
        }
    }
}

/// Join a finished or stopping worker off the async threads.
fn reap(worker: WorkerHandle) {
    worker.stop();
    let id = worker.id();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = worker.join() {
            tracing::warn!(worker_id = %id, error = %e, "Worker ended abnormally");
        }
    });
}
