//! Restart guarantee: a recurring wake that outlives the service process.
//!
//! The service registers a schedule on every start. A detached watchdog
//! process reads the registration and, on each fire, either pokes the live
//! service's start route or relaunches the service when it is gone.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::{ControlClient, StartTrigger};
use crate::error::{ControlError, RespawnError};

const REGISTRATION_FILE: &str = "respawn.json";

/// Recurring wake schedule, anchored at the moment of registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespawnSchedule {
    pub interval_ms: u64,
    pub registered_at: DateTime<Utc>,
    pub next_fire: DateTime<Utc>,
}

impl RespawnSchedule {
    pub fn new(interval: Duration, now: DateTime<Utc>) -> Result<Self, RespawnError> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if interval_ms == 0 {
            return Err(RespawnError::InvalidInterval(interval));
        }
        let mut schedule = Self {
            interval_ms,
            registered_at: now,
            next_fire: now,
        };
        schedule.next_fire = schedule.next_fire_after(now);
        Ok(schedule)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// First fire time on the registration grid strictly after `t`.
    pub fn next_fire_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let interval = self.interval_ms.min(i64::MAX as u64) as i64;
        let elapsed = (t - self.registered_at).num_milliseconds();
        if elapsed < 0 {
            return self.registered_at + chrono::Duration::milliseconds(interval);
        }
        let periods = elapsed / interval + 1;
        self.registered_at + chrono::Duration::milliseconds(periods.saturating_mul(interval))
    }
}

/// Host facility that keeps firing even when this process is dead.
pub trait WakeRegistrar: Send + Sync {
    /// Register or replace the recurring wake.
    fn register(&self, schedule: &RespawnSchedule) -> Result<(), RespawnError>;

    /// Remove the wake; later fires do nothing.
    fn cancel(&self) -> Result<(), RespawnError>;
}

/// What the watchdog needs to know, persisted as JSON in the state dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub schedule: RespawnSchedule,
    pub service_pid: u32,
    pub control_addr: SocketAddr,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub watchdog_pid: Option<u32>,
}

pub fn registration_path(state_dir: &Path) -> PathBuf {
    state_dir.join(REGISTRATION_FILE)
}

/// Read the registration, `None` when nothing is registered.
pub fn load_registration(state_dir: &Path) -> Result<Option<Registration>, RespawnError> {
    let path = registration_path(state_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(RespawnError::Persist {
                path: path.display().to_string(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| RespawnError::Corrupt {
            path: path.display().to_string(),
            source,
        })
}

/// Write through a temp file so the watchdog never reads half a file.
pub fn store_registration(state_dir: &Path, reg: &Registration) -> Result<(), RespawnError> {
    let path = registration_path(state_dir);
    let persist_err = |source| RespawnError::Persist {
        path: path.display().to_string(),
        source,
    };
    std::fs::create_dir_all(state_dir).map_err(persist_err)?;
    let json = serde_json::to_vec_pretty(reg).map_err(|source| RespawnError::Corrupt {
        path: path.display().to_string(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(persist_err)?;
    std::fs::rename(&tmp, &path).map_err(persist_err)?;
    Ok(())
}

/// True if a process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the permission and existence check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn detached(program: &Path, args: &[String]) -> Command {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    cmd
}

/// Registrar backed by a registration file and a detached watchdog process.
pub struct WatchdogRegistrar {
    state_dir: PathBuf,
    control_addr: SocketAddr,
    program: PathBuf,
    relaunch_args: Vec<String>,
    /// Watchdog spawned by this process, kept so it can be reaped.
    child: Mutex<Option<Child>>,
}

impl WatchdogRegistrar {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        control_addr: SocketAddr,
        program: impl Into<PathBuf>,
        relaunch_args: Vec<String>,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            control_addr,
            program: program.into(),
            relaunch_args,
            child: Mutex::new(None),
        }
    }

    /// Registrar that relaunches the running executable with `run`.
    pub fn for_current_exe(
        state_dir: impl Into<PathBuf>,
        control_addr: SocketAddr,
    ) -> Result<Self, RespawnError> {
        let program = std::env::current_exe().map_err(|source| RespawnError::Launch {
            what: "current executable lookup".to_string(),
            source,
        })?;
        Ok(Self::new(state_dir, control_addr, program, vec!["run".to_string()]))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Pid of a running watchdog, reaping our own child if it exited.
    fn live_watchdog(&self, recorded: Option<u32>) -> Option<u32> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = child.as_mut() {
            match c.try_wait() {
                Ok(None) => return Some(c.id()),
                Ok(Some(status)) => {
                    tracing::warn!(%status, "Watchdog exited");
                    *child = None;
                }
                Err(e) => tracing::warn!(error = %e, "Could not poll watchdog"),
            }
        }
        recorded.filter(|pid| *pid != std::process::id() && pid_alive(*pid))
    }

    fn spawn_watchdog(&self) -> Result<u32, RespawnError> {
        let args = vec![
            "watchdog".to_string(),
            "--state-dir".to_string(),
            self.state_dir.display().to_string(),
        ];
        let child = detached(&self.program, &args)
            .spawn()
            .map_err(|source| RespawnError::Launch {
                what: format!("watchdog {}", self.program.display()),
                source,
            })?;
        let pid = child.id();
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        tracing::info!(pid, "Watchdog launched");
        Ok(pid)
    }
}

impl WakeRegistrar for WatchdogRegistrar {
    fn register(&self, schedule: &RespawnSchedule) -> Result<(), RespawnError> {
        let recorded = match load_registration(&self.state_dir) {
            Ok(reg) => reg.and_then(|r| r.watchdog_pid),
            Err(e) => {
                tracing::warn!(error = %e, "Replacing unreadable respawn registration");
                None
            }
        };

        let mut reg = Registration {
            schedule: *schedule,
            service_pid: std::process::id(),
            control_addr: self.control_addr,
            program: self.program.clone(),
            args: self.relaunch_args.clone(),
            watchdog_pid: self.live_watchdog(recorded),
        };
        // the file has to exist before a fresh watchdog reads it
        store_registration(&self.state_dir, &reg)?;

        if reg.watchdog_pid.is_none() {
            reg.watchdog_pid = Some(self.spawn_watchdog()?);
            store_registration(&self.state_dir, &reg)?;
        }
        Ok(())
    }

    fn cancel(&self) -> Result<(), RespawnError> {
        let path = registration_path(&self.state_dir);
        let reg = load_registration(&self.state_dir).ok().flatten();
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(RespawnError::Persist {
                    path: path.display().to_string(),
                    source,
                });
            }
        }
        if let Some(pid) = reg.and_then(|r| r.watchdog_pid) {
            if pid_alive(pid) {
                // SAFETY: plain signal delivery to the recorded watchdog.
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
        }
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            // reap off the caller's thread; the watchdog exits on SIGTERM
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
        tracing::info!("Respawn registration cancelled");
        Ok(())
    }
}

/// In-memory registrar; records every registration.
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    registrations: Mutex<Vec<RespawnSchedule>>,
    cancelled: AtomicBool,
    fail: AtomicBool,
}

impl RecordingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent registrations fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> Vec<RespawnSchedule> {
        self.registrations
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl WakeRegistrar for RecordingRegistrar {
    fn register(&self, schedule: &RespawnSchedule) -> Result<(), RespawnError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RespawnError::Launch {
                what: "recording registrar".to_string(),
                source: std::io::Error::other("registration disabled"),
            });
        }
        self.cancelled.store(false, Ordering::SeqCst);
        if let Ok(mut regs) = self.registrations.lock() {
            regs.push(*schedule);
        }
        Ok(())
    }

    fn cancel(&self) -> Result<(), RespawnError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// What one watchdog fire did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Service alive; its start route was called.
    Poked,
    /// Service gone; a new one was launched with this pid.
    Relaunched(u32),
}

/// Deliver one fire for `reg`.
///
/// A live pid whose control surface cannot be reached is treated as gone:
/// the pid may have been reused by an unrelated process.
pub async fn fire(
    reg: &Registration,
    trigger: &dyn StartTrigger,
) -> Result<FireOutcome, RespawnError> {
    if pid_alive(reg.service_pid) {
        match trigger.start().await {
            Ok(()) => return Ok(FireOutcome::Poked),
            Err(e @ ControlError::RequestFailed { .. }) => {
                tracing::warn!(
                    error = %e,
                    pid = reg.service_pid,
                    "Service pid alive but control surface unreachable, relaunching"
                );
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    pid = reg.service_pid,
                    "Start request to live service failed"
                );
                return Ok(FireOutcome::Poked);
            }
        }
    }

    let mut cmd = tokio::process::Command::from(detached(&reg.program, &reg.args));
    // dropped children are reaped by tokio in the background
    let child = cmd.spawn().map_err(|source| RespawnError::Launch {
        what: format!("service {}", reg.program.display()),
        source,
    })?;
    let pid = child.id().unwrap_or(0);
    tracing::info!(pid, program = %reg.program.display(), "Service relaunched");
    Ok(FireOutcome::Relaunched(pid))
}

/// Watchdog main loop. Returns when the registration is cancelled or
/// another watchdog has taken over.
pub async fn run_watchdog(state_dir: PathBuf) -> Result<(), RespawnError> {
    let own_pid = std::process::id();
    tracing::info!(pid = own_pid, state_dir = %state_dir.display(), "Watchdog started");

    // fires are computed as the first grid point after the previous fire
    let mut base = Utc::now();
    loop {
        // re-read every time: the service may have re-registered or cancelled
        let Some(reg) = load_registration(&state_dir)? else {
            tracing::info!("No respawn registration, watchdog exiting");
            return Ok(());
        };
        if reg.watchdog_pid.is_some_and(|pid| pid != own_pid) {
            tracing::info!(other = ?reg.watchdog_pid, "Superseded by another watchdog");
            return Ok(());
        }

        let due = reg.schedule.next_fire_after(base);
        let now = Utc::now();
        if due > now {
            tokio::time::sleep((due - now).to_std().unwrap_or(Duration::ZERO)).await;
            continue;
        }

        let client = ControlClient::new(reg.control_addr);
        match fire(&reg, &client).await {
            Ok(outcome) => tracing::debug!(?outcome, "Respawn wake fired"),
            Err(e) => tracing::error!(error = %e, "Respawn wake failed"),
        }
        // missed grid points are not replayed
        base = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn secs(s: i64) -> chrono::Duration {
        chrono::Duration::seconds(s)
    }

    #[test]
    fn first_fire_one_interval_after_registration() {
        let schedule = RespawnSchedule::new(Duration::from_secs(60), t0()).unwrap();
        assert_eq!(schedule.next_fire, t0() + secs(60));
        assert_eq!(schedule.interval(), Duration::from_secs(60));
    }

    #[test]
    fn kill_five_seconds_in_fires_within_one_interval() {
        let schedule = RespawnSchedule::new(Duration::from_secs(60), t0()).unwrap();
        let killed_at = t0() + secs(5);
        let fire = schedule.next_fire_after(killed_at);
        let wait = fire - killed_at;
        assert!(wait > chrono::Duration::zero(), "not immediately");
        assert!(wait <= secs(60), "within one interval");
        assert_eq!(fire, t0() + secs(60));
    }

    #[test]
    fn fires_stay_on_grid() {
        let schedule = RespawnSchedule::new(Duration::from_secs(60), t0()).unwrap();
        assert_eq!(schedule.next_fire_after(t0() + secs(60)), t0() + secs(120));
        assert_eq!(schedule.next_fire_after(t0() + secs(301)), t0() + secs(360));
    }

    #[test]
    fn time_before_registration_maps_to_first_fire() {
        let schedule = RespawnSchedule::new(Duration::from_secs(60), t0()).unwrap();
        assert_eq!(schedule.next_fire_after(t0() - secs(10)), t0() + secs(60));
    }

    #[test]
    fn zero_interval_rejected() {
        assert!(matches!(
            RespawnSchedule::new(Duration::ZERO, t0()),
            Err(RespawnError::InvalidInterval(_))
        ));
    }

    fn sample_registration() -> Registration {
        Registration {
            schedule: RespawnSchedule::new(Duration::from_secs(60), t0()).unwrap(),
            service_pid: 4242,
            control_addr: "127.0.0.1:7878".parse().unwrap(),
            program: PathBuf::from("/usr/bin/worker-keeper"),
            args: vec!["run".to_string()],
            watchdog_pid: Some(99),
        }
    }

    #[test]
    fn registration_persists() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_registration(dir.path()).unwrap(), None);

        let reg = sample_registration();
        store_registration(dir.path(), &reg).unwrap();
        assert_eq!(load_registration(dir.path()).unwrap(), Some(reg));
    }

    #[test]
    fn corrupt_registration_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(registration_path(dir.path()), "{not json").unwrap();
        assert!(matches!(
            load_registration(dir.path()),
            Err(RespawnError::Corrupt { .. })
        ));
    }

    #[test]
    fn own_pid_is_alive_and_bogus_pid_is_not() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
    }

    #[test]
    fn watchdog_registrar_cancel_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = sample_registration();
        reg.watchdog_pid = None;
        store_registration(dir.path(), &reg).unwrap();

        let registrar = WatchdogRegistrar::new(
            dir.path(),
            reg.control_addr,
            "/bin/true",
            vec!["run".to_string()],
        );
        registrar.cancel().unwrap();
        assert!(!registration_path(dir.path()).exists());
        // cancelling twice is fine
        registrar.cancel().unwrap();
    }

    #[test]
    fn recording_registrar_tracks_calls() {
        let registrar = RecordingRegistrar::new();
        let schedule = RespawnSchedule::new(Duration::from_secs(60), t0()).unwrap();
        registrar.register(&schedule).unwrap();
        registrar.register(&schedule).unwrap();
        assert_eq!(registrar.registrations().len(), 2);

        registrar.cancel().unwrap();
        assert!(registrar.is_cancelled());

        registrar.set_fail(true);
        assert!(registrar.register(&schedule).is_err());
        assert_eq!(registrar.registrations().len(), 2);
    }

    #[tokio::test]
    async fn watchdog_exits_without_registration() {
        let dir = tempfile::tempdir().unwrap();
        run_watchdog(dir.path().to_path_buf()).await.unwrap();
    }

    #[tokio::test]
    async fn watchdog_exits_when_superseded() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = sample_registration();
        reg.watchdog_pid = Some(std::process::id().wrapping_add(1));
        store_registration(dir.path(), &reg).unwrap();
        run_watchdog(dir.path().to_path_buf()).await.unwrap();
    }

    #[tokio::test]
    async fn fire_relaunches_dead_service() {
        let reg = Registration {
            service_pid: u32::MAX,
            program: PathBuf::from("/bin/true"),
            args: Vec::new(),
            ..sample_registration()
        };
        let client = ControlClient::new(reg.control_addr);
        let outcome = fire(&reg, &client).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Relaunched(_)));
    }

    #[tokio::test]
    async fn fire_relaunches_when_live_pid_has_no_control_surface() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        // pid 1 is always alive but is not a keeper
        let reg = Registration {
            service_pid: 1,
            control_addr: closed,
            program: PathBuf::from("/bin/true"),
            args: Vec::new(),
            ..sample_registration()
        };
        let client = ControlClient::new(reg.control_addr);
        let outcome = fire(&reg, &client).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Relaunched(_)));
    }

    /// Answers start requests like a service that is up but unhealthy.
    struct RejectingTrigger;

    #[async_trait::async_trait]
    impl StartTrigger for RejectingTrigger {
        async fn start(&self) -> Result<(), ControlError> {
            Err(ControlError::UnexpectedStatus {
                url: "http://127.0.0.1:7878/v1/lifecycle/start".to_string(),
                status: 500,
            })
        }
    }

    #[tokio::test]
    async fn fire_does_not_relaunch_reachable_service() {
        let reg = Registration {
            service_pid: std::process::id(),
            program: PathBuf::from("/bin/false"),
            ..sample_registration()
        };
        let outcome = fire(&reg, &RejectingTrigger).await.unwrap();
        assert_eq!(outcome, FireOutcome::Poked);
    }

    #[tokio::test]
    async fn watchdog_fires_once_per_interval_then_exits_on_cancel() {
        use axum::extract::State;
        use axum::routing::post;

        #[derive(Clone)]
        struct Hits {
            times: Arc<Mutex<Vec<DateTime<Utc>>>>,
            state_dir: PathBuf,
        }

        async fn start(State(hits): State<Hits>) -> axum::http::StatusCode {
            hits.times.lock().unwrap().push(Utc::now());
            // cancel after the first fire so the loop winds down
            let _ = std::fs::remove_file(registration_path(&hits.state_dir));
            axum::http::StatusCode::OK
        }

        let dir = tempfile::tempdir().unwrap();
        let hits = Hits {
            times: Arc::new(Mutex::new(Vec::new())),
            state_dir: dir.path().to_path_buf(),
        };
        let app = axum::Router::new()
            .route("/v1/lifecycle/start", post(start))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let interval = Duration::from_millis(400);
        let registered_at = Utc::now();
        let reg = Registration {
            schedule: RespawnSchedule::new(interval, registered_at).unwrap(),
            service_pid: std::process::id(),
            control_addr: addr,
            program: PathBuf::from("/bin/false"),
            args: Vec::new(),
            watchdog_pid: Some(std::process::id()),
        };
        store_registration(dir.path(), &reg).unwrap();

        tokio::time::timeout(
            Duration::from_secs(10),
            run_watchdog(dir.path().to_path_buf()),
        )
        .await
        .expect("watchdog did not exit after cancel")
        .unwrap();

        let times = hits.times.lock().unwrap().clone();
        assert_eq!(times.len(), 1, "exactly one fire before cancel");
        let waited = times[0] - registered_at;
        assert!(
            waited >= chrono::Duration::milliseconds(390),
            "fired too early: {waited}"
        );
        assert!(
            waited < chrono::Duration::milliseconds(800),
            "fired later than one interval: {waited}"
        );
    }

    #[derive(Default)]
    struct CountingTrigger(std::sync::atomic::AtomicUsize);

    #[async_trait::async_trait]
    impl StartTrigger for CountingTrigger {
        async fn start(&self) -> Result<(), crate::error::ControlError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fire_pokes_live_service() {
        let reg = Registration {
            service_pid: std::process::id(),
            ..sample_registration()
        };
        let trigger = CountingTrigger::default();
        let outcome = fire(&reg, &trigger).await.unwrap();
        assert_eq!(outcome, FireOutcome::Poked);
        assert_eq!(trigger.0.load(Ordering::SeqCst), 1);
    }
}
