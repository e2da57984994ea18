//! The worker unit: one OS thread running the workload in a tight loop.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::context::{ServiceContext, SupervisorEvent};
use crate::error::WorkerError;
use crate::priority::{PriorityLevel, ThreadScheduler};
use crate::worker::state::{GateOutcome, PrioritySnapshot, WorkerPhase, WorkerShared};
use crate::workload::Workload;

const TAG: &str = "WorkerThread";

/// Messages handled by the worker on its own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    ApplyPriority(PriorityLevel),
}

/// Spawn-time knobs for the worker thread.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub initial_priority: PriorityLevel,
    pub thread_name: String,
    pub stack_size: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            initial_priority: PriorityLevel(0),
            thread_name: "keeper-worker".to_string(),
            stack_size: None,
        }
    }
}

/// Owning handle to a running worker thread.
///
/// Pause, resume and priority requests may come from any thread; the worker
/// picks them up at its next loop boundary.
pub struct WorkerHandle {
    id: Uuid,
    shared: Arc<WorkerShared>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Launch the worker thread.
    ///
    /// On success the thread sends exactly one `WorkerReady` through `ctx`
    /// once it has entered its loop.
    pub fn spawn(
        ctx: ServiceContext,
        scheduler: Arc<dyn ThreadScheduler>,
        workload: Box<dyn Workload>,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        let id = Uuid::new_v4();
        let shared = Arc::new(WorkerShared::new(options.initial_priority));
        let (commands, rx) = mpsc::unbounded_channel();

        let mut builder = std::thread::Builder::new().name(options.thread_name.clone());
        if let Some(size) = options.stack_size {
            builder = builder.stack_size(size);
        }

        let worker = WorkerLoop {
            id,
            shared: Arc::clone(&shared),
            ctx,
            scheduler,
            commands: rx,
        };
        // Mark alive before the thread exists so a fast exit can't be
        // overwritten; the loop's guard clears it again.
        shared.set_alive(true);
        let thread = builder.spawn(move || worker.run(workload)).map_err(|e| {
            shared.set_alive(false);
            WorkerError::SpawnFailed(e)
        })?;

        tracing::debug!(worker_id = %id, "Worker thread spawned");

        Ok(Self {
            id,
            shared,
            commands,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// OS thread id, once the worker has reported in.
    pub fn thread_id(&self) -> Option<i32> {
        self.shared.thread_id()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.shared.phase()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.gate.is_paused()
    }

    /// Completed workload iterations.
    pub fn iterations(&self) -> u64 {
        self.shared.iterations()
    }

    pub fn priority(&self) -> PrioritySnapshot {
        self.shared.priority.snapshot()
    }

    /// Returns true if the flag changed.
    pub fn request_pause(&self) -> bool {
        self.shared.gate.pause()
    }

    /// Returns true if the flag changed.
    pub fn request_resume(&self) -> bool {
        self.shared.gate.resume()
    }

    /// Record `level` as intended and queue it for the worker thread to apply
    /// to itself.
    pub fn request_priority(&self, level: PriorityLevel) {
        self.shared.priority.set_intended(level);
        if self.commands.send(WorkerCommand::ApplyPriority(level)).is_err() {
            tracing::debug!(worker_id = %self.id, "worker gone, priority request dropped");
            return;
        }
        self.shared.gate.kick();
    }

    /// Ask the loop to exit at the next boundary; wakes a paused worker.
    pub fn stop(&self) {
        self.shared.gate.stop();
    }

    /// Stop and wait for the thread to exit. Blocks the caller.
    pub fn join(mut self) -> Result<(), WorkerError> {
        self.stop();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| WorkerError::Panicked { id: self.id }),
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // detached threads still get told to stop
        self.shared.gate.stop();
    }
}

/// Clears liveness and reports the exit however the loop ends.
struct LivenessGuard {
    id: Uuid,
    shared: Arc<WorkerShared>,
    ctx: ServiceContext,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.shared.set_alive(false);
        self.shared.set_phase(WorkerPhase::Stopped);
        if std::thread::panicking() {
            tracing::error!(worker_id = %self.id, "Worker thread crashed");
        }
        self.ctx.log(TAG, "Worker thread finished");
        self.ctx
            .notify(SupervisorEvent::WorkerExited { worker_id: self.id });
    }
}

struct WorkerLoop {
    id: Uuid,
    shared: Arc<WorkerShared>,
    ctx: ServiceContext,
    scheduler: Arc<dyn ThreadScheduler>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
}

impl WorkerLoop {
    fn run(mut self, mut workload: Box<dyn Workload>) {
        let _guard = LivenessGuard {
            id: self.id,
            shared: Arc::clone(&self.shared),
            ctx: self.ctx.clone(),
        };

        let tid = self.scheduler.current_thread_id();
        self.shared.set_thread_id(tid);
        self.shared.set_phase(WorkerPhase::Looping);
        self.ctx
            .log(TAG, &format!("Worker thread sending its TID: {tid}"));
        self.ctx.notify(SupervisorEvent::WorkerReady {
            worker_id: self.id,
            thread_id: tid,
        });

        let initial = self.shared.priority.snapshot().intended;
        self.apply_priority(initial);

        loop {
            self.drain_commands();

            let shared = &self.shared;
            let ctx = &self.ctx;
            let outcome = self.shared.gate.wait(|parking| {
                let phase = if parking {
                    WorkerPhase::Paused
                } else {
                    WorkerPhase::Looping
                };
                if shared.set_phase(phase) != phase {
                    let msg = if parking {
                        "Worker thread entering wait state"
                    } else {
                        "Worker thread resumed"
                    };
                    ctx.log(TAG, msg);
                }
            });

            match outcome {
                GateOutcome::Stop => break,
                GateOutcome::Drain => continue,
                GateOutcome::Run => {}
            }

            workload.run_iteration();
            self.shared.record_iteration();
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                WorkerCommand::ApplyPriority(level) => self.apply_priority(level),
            }
        }
    }

    /// Runs on the worker thread only.
    fn apply_priority(&self, level: PriorityLevel) {
        let before = self.scheduler.get_own_priority().ok();
        match self.scheduler.set_own_priority(level) {
            Ok(()) => {
                self.shared.priority.set_applied(level);
                let from = before.map_or_else(|| "unknown".to_string(), |l| l.to_string());
                self.ctx.log(
                    TAG,
                    &format!("Worker thread priority changed {from} -> {level}"),
                );
            }
            Err(e) => {
                // intended stays recorded; the next probe cycle re-queues it
                tracing::warn!(worker_id = %self.id, error = %e, "Priority apply refused");
            }
        }
    }
}
