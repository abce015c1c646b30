use anyhow::{Context, Result};
use chrono::Utc;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};

use pi_timer::calendar::{CalendarSync, GoogleCalendar};
use pi_timer::config::{self, Env};
use pi_timer::daemon::{self, Daemon};
use pi_timer::db::Db;
use pi_timer::device::DeviceContext;
use pi_timer::gpio::PinBoard;
use pi_timer::logging;
use pi_timer::state::SystemState;
use pi_timer::watchdog::Watchdog;
use pi_timer::web::{self, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    // ── Env config ──────────────────────────────────────────────────
    let env = Env::from_env();

    if let Err(e) = logging::init(env.log_file.as_deref()) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(env).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "pi-timerd exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(env: Env) -> Result<()> {
    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&env.db_url)
        .await
        .with_context(|| format!("cannot open database {}", env.db_url))?;
    db.migrate().await?;

    // ── Config file (seed devices) ───────────────────────────────────
    let cfg = config::load(&env.config_path)?;
    config::apply(&cfg, &db).await?;
    if cfg.devices.is_empty() {
        warn!("no devices configured");
    }

    let pins: Vec<u8> = cfg
        .devices
        .iter()
        .filter_map(|d| u8::try_from(d.pin).ok())
        .collect();

    // ── Calendar ────────────────────────────────────────────────────
    let calendar = match &cfg.calendar {
        Some(cal) => {
            let sync = CalendarSync::load(cal, cfg.calendar_limits(), &db).await?;
            Some((GoogleCalendar::new(cal.clone()), sync))
        }
        None => None,
    };

    // ── Shared state (ephemeral, for the status API) ────────────────
    let registered: Vec<_> = cfg
        .devices
        .iter()
        .map(|d| (d.record(), d.schedule.kind()))
        .collect();
    let mut system = SystemState::new(&registered);
    system.calendar = calendar.as_ref().map(|(_, sync)| sync.status());
    let status = system.shared();

    // ── Status API ──────────────────────────────────────────────────
    let web_state = AppState {
        status: status.clone(),
        db: db.clone(),
    };
    let port = env.web_port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, port).await {
            error!(error = %format!("{e:#}"), "status api stopped");
        }
    });

    // ── Hardware ────────────────────────────────────────────────────
    let board = PinBoard::new(env.relay_active_low)?;
    let watchdog = Watchdog::open(env.watchdog_device.as_deref())?;

    let ctx = DeviceContext::new(db, board, status);
    let daemon =
        Daemon::start(ctx, &cfg.devices, calendar, watchdog, &cfg.daemon, Utc::now()).await?;

    // ── Signals ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received; stopping after this cycle");
        let _ = shutdown_tx.send(true);
        // Hold the sender so the loop never sees it dropped mid-shutdown.
        std::future::pending::<()>().await;
    });

    // ── Control loop ────────────────────────────────────────────────
    match tokio::spawn(daemon.run(shutdown_rx)).await {
        Ok(result) => result,
        Err(join_err) => {
            error!(error = %join_err, "control loop aborted");
            daemon::release_all(&pins, env.relay_active_low)?;
            Err(join_err).context("control loop aborted")
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; only ctrl-c will stop the daemon");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
