mod logging;

pub use logging::{LogFilter, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "invoicer_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
    /// Write console output to stderr, keeping stdout for command results.
    pub stderr: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Path to the log database.
    pub log_db_path: PathBuf,
    /// Persisted entries older than this are dropped when the sink opens.
    pub log_retention_days: Option<u32>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            stderr: false,
            log_to_sqlite: false,
            log_db_path: PathBuf::from("logs.db"),
            log_retention_days: None,
        }
    }
}

impl TelemetryConfig {
    /// Parse a level name, falling back to INFO for anything unrecognised.
    pub fn parse_level(name: &str) -> Level {
        name.parse().unwrap_or(Level::INFO)
    }

    fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Keeps the persisted log sink reachable for queries and pruning.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn sink(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Drop persisted entries older than `days`. Returns how many went.
pub fn prune_logs(sink: &SqliteLogSink, days: u32) -> Result<usize, rusqlite::Error> {
    let cutoff = Duration::try_days(i64::from(days))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or_default();
    sink.prune_before(cutoff)
}

fn open_sink(config: &TelemetryConfig) -> Option<Arc<SqliteLogSink>> {
    let sink = match SqliteLogSink::open(&config.log_db_path) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("invoicer-telemetry: failed to open log DB: {e}");
            return None;
        }
    };
    if let Some(days) = config.log_retention_days {
        if let Err(e) = prune_logs(&sink, days) {
            eprintln!("invoicer-telemetry: failed to prune log DB: {e}");
        }
    }
    Some(Arc::new(sink))
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt = tracing_subscriber::fmt::layer().with_target(true);
    let fmt_layer = match (config.json, config.stderr) {
        (true, false) => fmt.json().with_span_list(true).boxed(),
        (true, true) => fmt.json().with_span_list(true).with_writer(std::io::stderr).boxed(),
        (false, false) => fmt.boxed(),
        (false, true) => fmt.with_writer(std::io::stderr).boxed(),
    };

    let sink = if config.log_to_sqlite { open_sink(&config) } else { None };
    let sqlite_layer = sink.clone().map(SqliteLogLayer::new);

    // try_init: a second call (tests, embedded use) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .with(sqlite_layer)
        .try_init();

    TelemetryGuard { log_sink: sink }
}
