use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::Level;

use invoicer_core::security::Password;
use invoicer_engine::retention::{CategoryOutcome, SweepReport};
use invoicer_engine::scheduler::spawn_retention_schedule;
use invoicer_engine::Engine;
use invoicer_server::ServerConfig;
use invoicer_settings::{Settings, MAX_RETENTION_DAYS};
use invoicer_store::Database;
use invoicer_telemetry::{init_telemetry, prune_logs, LogFilter, SqliteLogSink, TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "invoicer", version, about = "Quotes, invoices and customers for small teams")]
struct Cli {
    /// JSON settings file (defaults to ./invoicer.json when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server and the retention schedule.
    Serve,
    /// Run one retention sweep.
    Cleanup {
        /// Remove artifacts older than this many days.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_RETENTION_DAYS)))]
        days: Option<u32>,
        /// Also purge audit log entries.
        #[arg(long)]
        purge_audit: bool,
        /// Do not prompt. Audit entries are kept unless --purge-audit is given.
        #[arg(long)]
        yes: bool,
    },
    /// Manage user accounts.
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Show persisted warn+ log entries, newest first.
    Logs {
        /// Least severe level to show (`warn` includes errors).
        #[arg(long)]
        level: Option<Level>,
        /// Module path prefix, e.g. `invoicer_engine::retention`.
        #[arg(long)]
        target: Option<String>,
        /// Only entries attributed to this user id.
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        request: Option<String>,
        /// RFC 3339 timestamp, or a relative window such as `12h` or `7d`.
        #[arg(long, value_parser = parse_since)]
        since: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    /// Create a user. The password comes from INVOICER_PASSWORD or stdin.
    Create {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, corrections) = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    // one-shot commands keep stdout for their own output
    let telemetry = telemetry(&settings, !matches!(cli.command, Command::Serve));
    for correction in &corrections {
        tracing::warn!("{correction}");
    }

    match cli.command {
        Command::Serve => serve(settings, &telemetry).await,
        Command::Cleanup { days, purge_audit, yes } => cleanup(&settings, &telemetry, days, purge_audit, yes).await,
        Command::User {
            command: UserCommand::Create { email, name, admin },
        } => create_user(&settings, &email, &name, admin),
        Command::Logs {
            level,
            target,
            actor,
            request,
            since,
            limit,
        } => {
            let filter = LogFilter {
                min_level: level,
                target,
                actor_id: actor,
                request_id: request,
                since,
                limit: Some(limit),
            };
            show_logs(&settings, &telemetry, &filter)
        }
    }
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, String> {
    let relative = |digits: &str, unit: fn(i64) -> Option<Duration>| {
        digits
            .parse::<i64>()
            .ok()
            .and_then(unit)
            .and_then(|window| Utc::now().checked_sub_signed(window))
    };
    let parsed = if let Some(hours) = raw.strip_suffix('h') {
        relative(hours, Duration::try_hours)
    } else if let Some(days) = raw.strip_suffix('d') {
        relative(days, Duration::try_days)
    } else {
        DateTime::parse_from_rfc3339(raw).ok().map(|at| at.with_timezone(&Utc))
    };
    parsed.ok_or_else(|| format!("expected an RFC 3339 timestamp or a window like 12h or 7d, got {raw:?}"))
}

fn telemetry(settings: &Settings, stderr: bool) -> TelemetryGuard {
    let logging = &settings.logging;
    init_telemetry(TelemetryConfig {
        log_level: TelemetryConfig::parse_level(&logging.level),
        module_levels: logging
            .modules
            .iter()
            .map(|(module, level)| (module.clone(), TelemetryConfig::parse_level(level)))
            .collect(),
        json: logging.json,
        stderr,
        log_to_sqlite: logging.persist_warnings,
        log_db_path: logging.db_path.clone(),
        log_retention_days: Some(logging.retention_days),
    })
}

fn engine(settings: &Settings) -> Result<Engine> {
    let path = &settings.database.path;
    let db = Database::open(path).with_context(|| format!("failed to open database {}", path.display()))?;
    Ok(Engine::new(db, settings))
}

fn spawn_log_pruning(sink: Arc<SqliteLogSink>, days: u32, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // opening the sink already pruned
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sink = Arc::clone(&sink);
            match tokio::task::spawn_blocking(move || prune_logs(&sink, days)).await {
                Ok(Ok(removed)) => tracing::debug!(removed, "pruned persisted logs"),
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to prune persisted logs"),
                Err(e) => tracing::warn!(error = %e, "log pruning task failed"),
            }
        }
    })
}

async fn serve(settings: Settings, telemetry: &TelemetryGuard) -> Result<()> {
    let engine = engine(&settings)?;
    let schedule = Engine::retention_schedule(&settings)
        .map(|schedule| spawn_retention_schedule(Arc::clone(&engine.sweeper), schedule));
    let log_pruning = telemetry.sink().map(|sink| {
        let every = std::time::Duration::from_secs(u64::from(settings.retention.interval_hours) * 3600);
        spawn_log_pruning(sink, settings.logging.retention_days, every)
    });

    let config = ServerConfig::from_settings(&settings.server);
    let handle = invoicer_server::start(config, engine)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "invoicer ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    for task in schedule.into_iter().chain(log_pruning) {
        task.abort();
    }
    handle.shutdown().await;
    Ok(())
}

async fn cleanup(
    settings: &Settings,
    telemetry: &TelemetryGuard,
    days: Option<u32>,
    purge_audit: bool,
    yes: bool,
) -> Result<()> {
    let days = days.unwrap_or(settings.retention.days);
    let purge_audit = purge_audit || (!yes && confirm(&format!("Also delete audit log entries older than {days} days? [y/N] "))?);

    let engine = engine(settings)?;
    let sweeper = Arc::clone(&engine.sweeper);
    let report = tokio::task::spawn_blocking(move || sweeper.sweep(days, purge_audit))
        .await
        .context("cleanup task failed")?
        .context("cleanup could not start")?;
    print_report(&report);

    if let Some(sink) = telemetry.sink() {
        let retention_days = settings.logging.retention_days;
        match prune_logs(&sink, retention_days) {
            Ok(n) => println!("  Log entries older than {retention_days} days: {n} removed"),
            Err(e) => println!("  Log entries: failed ({e})"),
        }
    }
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!("Removing artifacts older than {} days ({})", report.days, report.cutoff.format("%Y-%m-%d %H:%M"));
    for (category, outcome) in &report.categories {
        match outcome {
            CategoryOutcome::Removed(n) => println!("  {}: {n} removed", category.label()),
            CategoryOutcome::Skipped(reason) => println!("  {}: skipped ({reason})", category.label()),
            CategoryOutcome::Failed(e) => println!("  {}: failed ({e})", category.label()),
        }
    }
    println!("Total removed: {}", report.total_removed());
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn create_user(settings: &Settings, email: &str, name: &str, admin: bool) -> Result<()> {
    let raw = match std::env::var("INVOICER_PASSWORD") {
        Ok(raw) => raw,
        Err(_) => {
            eprint!("Password: ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if raw.is_empty() {
        bail!("a password is required");
    }

    let engine = engine(settings)?;
    let user = engine.auth.register(email, name, &Password::new(raw), admin)?;
    println!("created {} ({}){}", user.email, user.id, if user.is_admin { " [admin]" } else { "" });
    Ok(())
}

fn show_logs(settings: &Settings, telemetry: &TelemetryGuard, filter: &LogFilter) -> Result<()> {
    let path = &settings.logging.db_path;
    let sink = match telemetry.sink() {
        Some(sink) => sink,
        None if path.exists() => Arc::new(
            SqliteLogSink::open(path).with_context(|| format!("failed to open log database {}", path.display()))?,
        ),
        None => {
            println!("no persisted logs at {}", path.display());
            return Ok(());
        }
    };

    let records = sink.query(filter)?;
    for r in &records {
        let span = r.span.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default();
        let actor = r.actor_id.as_deref().map(|id| format!(" actor={id}")).unwrap_or_default();
        let request = r.request_id.as_deref().map(|id| format!(" request={id}")).unwrap_or_default();
        let fields = r.fields.as_deref().map(|f| format!(" {f}")).unwrap_or_default();
        println!("{} {:5} {}{span}: {}{fields}{actor}{request}", r.recorded_at, r.level, r.target, r.message);
    }
    println!("{} of {} persisted entries", records.len(), sink.count()?);
    Ok(())
}
