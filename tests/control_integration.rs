//! Integration tests for the control surface.
//!
//! Each test spins up the Axum router on a random loopback port in front of
//! a real supervisor and drives it over HTTP, the way a separate process would.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;

use worker_keeper::context::ServiceContext;
use worker_keeper::control::{ControlClient, control_routes};
use worker_keeper::error::ProbeError;
use worker_keeper::priority::{
    FeedbackDirection, PriorityLevel, PriorityPolicy, PriorityRange, RecordingScheduler,
};
use worker_keeper::probe::{CpuCounterSource, CpuCounters};
use worker_keeper::respawn::{
    FireOutcome, RecordingRegistrar, Registration, RespawnSchedule, fire,
};
use worker_keeper::supervisor::{
    ServiceLifecycleState, Supervisor, SupervisorConfig, SupervisorDeps, SupervisorStatus,
};
use worker_keeper::worker::{WorkerOptions, WorkerPhase};
use worker_keeper::workload::{MatrixWorkload, Workload};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Counter source reporting a host that is busy 40% of the time.
struct ModerateLoad(CpuCounters);

impl CpuCounterSource for ModerateLoad {
    fn read(&mut self) -> Result<CpuCounters, ProbeError> {
        self.0.total += 100;
        self.0.idle += 60;
        Ok(self.0)
    }
}

struct Server {
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    registrar: Arc<RecordingRegistrar>,
}

/// Start an Axum server on a random port in front of a stopped supervisor.
async fn start_server() -> Server {
    let (ctx, rx) = ServiceContext::new();
    let registrar = Arc::new(RecordingRegistrar::new());
    let deps = SupervisorDeps {
        ctx,
        scheduler: Arc::new(RecordingScheduler::new(PriorityLevel(0))),
        registrar: registrar.clone(),
        workload: Arc::new(|| -> Box<dyn Workload> { Box::new(MatrixWorkload::new(16)) }),
        counters: Arc::new(|| -> Box<dyn CpuCounterSource> {
            Box::new(ModerateLoad(CpuCounters::default()))
        }),
    };
    let config = SupervisorConfig {
        probe_interval: Duration::from_millis(20),
        respawn_interval: Duration::from_secs(60),
        policy: PriorityPolicy::new(
            30.0,
            50.0,
            PriorityRange::new(PriorityLevel(0), PriorityLevel(4)),
            FeedbackDirection::YieldWhenIdle,
        ),
        worker: WorkerOptions {
            initial_priority: PriorityLevel(2),
            ..WorkerOptions::default()
        },
    };
    let supervisor = Supervisor::new(config, deps);
    supervisor.spawn_event_loop(rx);

    let app = control_routes(Arc::clone(&supervisor));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        addr,
        supervisor,
        registrar,
    }
}

async fn wait_for(
    client: &ControlClient,
    cond: impl Fn(&SupervisorStatus) -> bool,
) -> SupervisorStatus {
    loop {
        let status = client.status().await.unwrap();
        if cond(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn rest_health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = reqwest::get(format!("http://{}/health", server.addr))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "worker-keeper");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pause_and_resume_without_worker_are_no_content() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let http = reqwest::Client::new();

        for route in ["pause", "pause", "resume", "resume"] {
            let resp = http
                .post(format!("http://{}/v1/worker/{route}", server.addr))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 204);
        }
        assert_eq!(
            server.supervisor.state().await,
            ServiceLifecycleState::Stopped
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn status_reports_stopped_service() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = ControlClient::new(server.addr);

        let status = client.status().await.unwrap();
        assert_eq!(status.state, ServiceLifecycleState::Stopped);
        assert_eq!(status.worker_id, None);
        assert_eq!(status.iterations, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn remote_pause_and_resume_drive_worker() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = ControlClient::new(server.addr);

        let resp = reqwest::Client::new()
            .post(format!("http://{}/v1/lifecycle/start", server.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["disposition"], "sticky");

        let running = wait_for(&client, |s| s.state == ServiceLifecycleState::Running).await;
        assert!(running.thread_id.is_some());
        assert_eq!(server.registrar.registrations().len(), 1);

        client.pause_worker().await.unwrap();
        client.pause_worker().await.unwrap();
        let paused = wait_for(&client, |s| s.phase == Some(WorkerPhase::Paused)).await;
        assert_eq!(paused.state, ServiceLifecycleState::Paused);

        client.resume_worker().await.unwrap();
        let resumed = wait_for(&client, |s| {
            s.phase == Some(WorkerPhase::Looping) && s.iterations > paused.iterations
        })
        .await;
        assert_eq!(resumed.state, ServiceLifecycleState::Running);

        server.supervisor.on_stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn moderate_load_holds_priority_steady() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = ControlClient::new(server.addr);

        server.supervisor.on_start().await;
        let status = wait_for(&client, |s| {
            s.last_utilization.is_some_and(|p| p > 0.0)
                && s.applied_priority == Some(PriorityLevel(2))
        })
        .await;
        assert_eq!(status.intended_priority, Some(PriorityLevel(2)));
        assert!((status.last_utilization.unwrap() - 40.0).abs() < 1e-9);

        server.supervisor.on_stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn watchdog_fire_starts_live_service() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = ControlClient::new(server.addr);

        let registration = Registration {
            schedule: RespawnSchedule::new(Duration::from_secs(60), Utc::now()).unwrap(),
            service_pid: std::process::id(),
            control_addr: server.addr,
            program: PathBuf::from("/bin/false"),
            args: Vec::new(),
            watchdog_pid: None,
        };
        let outcome = fire(&registration, &client).await.unwrap();
        assert_eq!(outcome, FireOutcome::Poked);

        wait_for(&client, |s| s.state == ServiceLifecycleState::Running).await;
        assert_eq!(server.registrar.registrations().len(), 1);

        server.supervisor.on_stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn client_against_closed_port_fails_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ControlClient::new(addr);
    assert!(client.status().await.is_err());
    assert!(client.pause_worker().await.is_err());
}
