use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use pi_timer::admin;
use pi_timer::calendar::{self, CalendarSync, GoogleCalendar, SyncOutcome};
use pi_timer::config;
use pi_timer::db::Db;
use pi_timer::logging;
use pi_timer::state::SystemState;

/// Ten years.
const MAX_HISTORY_HOURS: i64 = 24 * 366 * 10;

#[derive(Parser)]
#[command(name = "pi-timer-ctl", version, about = "Inspect and manage the pi-timer database")]
struct Cli {
    /// SQLite database used by the daemon.
    #[arg(long, env = "DB_URL", default_value = "sqlite:pi-timer.db?mode=rwc")]
    db_url: String,
    /// Daemon config file (needed by `resync` and `authenticate`).
    #[arg(long, env = "CONFIG_PATH", default_value = "config.toml")]
    config: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered devices
    Devices,
    /// Show ON/OFF history for a device
    History {
        device: i64,
        #[arg(
            long,
            default_value_t = 24,
            value_parser = clap::value_parser!(i64).range(1..=MAX_HISTORY_HOURS)
        )]
        hours: i64,
    },
    /// Delete all history for a device
    ClearHistory { device: i64 },
    /// Stored schedule intervals
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Reset the stored sync time and sync calendar schedules now
    Resync,
    /// Authorize calendar access and store the tokens
    Authenticate,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Show the newest intervals for a device
    Show {
        device: i64,
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
    /// Add an interval: start is HH:MM (today), RFC 3339 or unix seconds
    Set {
        device: i64,
        start: String,
        duration: i64,
        min_duration: i64,
    },
    /// Remove every interval for a device
    Clear { device: i64 },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(None) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(lines) => {
            for line in lines {
                println!("{line}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Vec<String>> {
    let db = Db::connect(&cli.db_url).await?;
    db.migrate().await?;
    let now = Utc::now();

    let lines = match cli.command {
        Commands::Devices => admin::devices(&db).await?,
        Commands::History { device, hours } => admin::history(&db, device, hours, now).await?,
        Commands::ClearHistory { device } => admin::clear_history(&db, device).await?,
        Commands::Schedule { action } => match action {
            ScheduleAction::Show { device, limit } => {
                admin::show_schedule(&db, device, limit).await?
            }
            ScheduleAction::Set {
                device,
                start,
                duration,
                min_duration,
            } => {
                let start = admin::parse_start(&Local, &start, now)?;
                admin::set_schedule(&db, device, start, duration, min_duration, now).await?
            }
            ScheduleAction::Clear { device } => admin::clear_schedule(&db, device).await?,
        },
        Commands::Resync => resync(&cli.config, &db).await?,
        Commands::Authenticate => authenticate(&cli.config, &db).await?,
    };

    db.close().await;
    Ok(lines)
}

async fn resync(config_path: &str, db: &Db) -> Result<Vec<String>> {
    let cfg = config::load(config_path)?;
    let Some(cal) = cfg.calendar.clone() else {
        bail!("{config_path} has no [calendar] section");
    };

    // Reset first so a running daemon retries even if this attempt fails.
    calendar::request_resync(db).await?;

    let mut sync = CalendarSync::new(&cal, cfg.calendar_limits());
    let api = GoogleCalendar::new(cal);
    let status = SystemState::new(&[]).shared();

    let line = match sync.force(&api, db, &status, Utc::now()).await? {
        SyncOutcome::Synced { devices, intervals } => {
            format!("Synced {intervals} interval(s) for {devices} device(s).")
        }
        SyncOutcome::NotDue | SyncOutcome::Failed | SyncOutcome::GaveUp => {
            "Calendar sync failed (see log); the daemon will retry on its next cycle.".to_string()
        }
    };
    Ok(vec![line])
}

async fn authenticate(config_path: &str, db: &Db) -> Result<Vec<String>> {
    let cfg = config::load(config_path)?;
    let Some(cal) = cfg.calendar else {
        bail!("{config_path} has no [calendar] section");
    };
    let api = GoogleCalendar::new(cal);

    println!("Visit this URL to get a code:");
    println!("{}", api.auth_url()?);
    print!("Enter code: ");
    io::stdout().flush()?;

    let mut code = String::new();
    io::stdin()
        .lock()
        .read_line(&mut code)
        .context("failed to read code")?;
    let code = code.trim();
    if code.is_empty() {
        bail!("no code entered");
    }

    let tokens = api.exchange_code(code).await?;
    db.set_tokens(&tokens).await?;
    Ok(vec!["Stored calendar tokens.".to_string()])
}
