use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use worker_keeper::config::KeeperConfig;
use worker_keeper::context::ServiceContext;
use worker_keeper::control::{ControlClient, bind_control, control_routes, serve_control};
use worker_keeper::error::{ControlError, Result};
use worker_keeper::priority::NiceScheduler;
use worker_keeper::probe::{CPU_INFO_PATH, CpuCounterSource, ProcStatSource, read_cpu_info};
use worker_keeper::respawn::{WakeRegistrar, WatchdogRegistrar, run_watchdog};
use worker_keeper::supervisor::{Supervisor, SupervisorConfig, SupervisorDeps};
use worker_keeper::workload::{MatrixWorkload, Workload};

// ── CLI ─────────────────────────────────────────────────────────────

/// Keeps one CPU-bound worker thread alive and tunes its priority to host load.
#[derive(Parser, Debug)]
#[command(name = "worker-keeper", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the keeper service in the foreground.
    Run,
    /// Pause the worker of a running keeper.
    Pause,
    /// Resume the worker of a running keeper.
    Resume,
    /// Print the status of a running keeper as JSON.
    Status,
    /// Remove the restart registration and stop its watchdog.
    CancelRespawn,
    /// Restart watchdog, launched by the keeper itself.
    #[command(hide = true)]
    Watchdog {
        #[arg(long)]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = KeeperConfig::from_env();

    match cli.command {
        Command::Run => {
            let _guard = init_tracing(Some(&config.log_dir()));
            run(config).await
        }
        Command::Watchdog { state_dir } => {
            let _guard = init_tracing(Some(&state_dir.join("logs")));
            run_watchdog(state_dir).await?;
            Ok(())
        }
        Command::Pause => {
            init_tracing(None);
            ControlClient::new(config.control_addr).pause_worker().await?;
            Ok(())
        }
        Command::Resume => {
            init_tracing(None);
            ControlClient::new(config.control_addr).resume_worker().await?;
            Ok(())
        }
        Command::Status => {
            init_tracing(None);
            let status = ControlClient::new(config.control_addr).status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::CancelRespawn => {
            init_tracing(None);
            match ControlClient::new(config.control_addr).cancel_respawn().await {
                Ok(()) => {}
                Err(ControlError::RequestFailed { reason, .. }) => {
                    // no running service; clear the registration directly
                    info!(%reason, "Keeper not reachable, cancelling locally");
                    WatchdogRegistrar::for_current_exe(&config.state_dir, config.control_addr)?
                        .cancel()?;
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
    }
}

/// Stderr logging, plus a daily-rolling file under `log_dir` when given.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("keeper")
            .filename_suffix("log")
            .build(dir)
            .map_err(|e| eprintln!("Warning: file logging disabled ({}): {e}", dir.display()))
            .ok()
    });
    let (file, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    guard
}

async fn run(config: KeeperConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("creating state directory {}", config.state_dir.display())
    })?;

    eprintln!("⚙️  Worker Keeper v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Control: http://{}", config.control_addr);
    eprintln!("   State: {}", config.state_dir.display());
    eprintln!(
        "   Policy: {}% / {}% ({}), range {}..{}",
        config.low_threshold,
        config.high_threshold,
        config.feedback,
        config.priority_range.highest(),
        config.priority_range.lowest(),
    );

    if tracing::enabled!(tracing::Level::DEBUG) {
        log_cpu_info();
    }

    let (ctx, rx) = ServiceContext::new();
    let supervisor = build_supervisor(&config, ctx)?;
    // a second instance must fail here, before it registers its pid
    let listener = bind_control(config.control_addr).await?;
    let events = supervisor.spawn_event_loop(rx);
    supervisor.on_start().await;

    let served = serve_control(
        listener,
        control_routes(Arc::clone(&supervisor)),
        shutdown_signal(),
    )
    .await;

    info!("Shutting down");
    supervisor.on_stop().await;
    events.abort();
    served?;
    Ok(())
}

/// One-shot dump of the host CPU description at debug level.
fn log_cpu_info() {
    match read_cpu_info(CPU_INFO_PATH) {
        Ok(entries) => {
            for (key, value) in entries {
                tracing::debug!(%key, %value, "cpuinfo");
            }
        }
        Err(e) => tracing::debug!(error = %e, "CPU info unavailable"),
    }
}

/// Wire the production collaborators: nice-based scheduling, `/proc/stat`
/// counters, the matrix workload and the watchdog-backed restart guarantee.
fn build_supervisor(config: &KeeperConfig, ctx: ServiceContext) -> Result<Arc<Supervisor>> {
    config.validate()?;
    let registrar = WatchdogRegistrar::for_current_exe(&config.state_dir, config.control_addr)?;
    let matrix_size = config.matrix_size;
    let stat_path = config.proc_stat_path.clone();
    let deps = SupervisorDeps {
        ctx,
        scheduler: Arc::new(NiceScheduler),
        registrar: Arc::new(registrar),
        workload: Arc::new(move || -> Box<dyn Workload> {
            Box::new(MatrixWorkload::new(matrix_size))
        }),
        counters: Arc::new(move || -> Box<dyn CpuCounterSource> {
            Box::new(ProcStatSource::new(stat_path.clone()))
        }),
    };
    Ok(Supervisor::new(SupervisorConfig::from_keeper(config), deps))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
