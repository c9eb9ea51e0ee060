//! Warn and error events persisted to SQLite, so an operator can find a
//! skipped cleanup file or a failed side effect after the process is gone.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        span TEXT,
        message TEXT NOT NULL,
        fields TEXT,
        actor_id TEXT,
        request_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_recorded_at ON logs(recorded_at);
    CREATE INDEX IF NOT EXISTS idx_logs_request ON logs(request_id);
";

const LEVELS: [Level; 5] = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// One persisted event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub recorded_at: String,
    pub level: String,
    pub target: String,
    /// Innermost span the event was emitted in.
    pub span: Option<String>,
    pub message: String,
    pub fields: Option<String>,
    pub actor_id: Option<String>,
    pub request_id: Option<String>,
}

/// Narrows `SqliteLogSink::query`. Every filter is optional.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    /// Least severe level to include; `WARN` also returns errors.
    pub min_level: Option<Level>,
    /// Module path prefix, e.g. `invoicer_engine::retention`.
    pub target: Option<String>,
    pub actor_id: Option<String>,
    pub request_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl LogFilter {
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if let Some(min) = self.min_level {
            let names: Vec<SqlValue> = LEVELS
                .iter()
                .filter(|l| **l <= min)
                .map(|l| SqlValue::Text(l.to_string()))
                .collect();
            clauses.push(format!("level IN ({})", vec!["?"; names.len()].join(", ")));
            args.extend(names);
        }
        if let Some(target) = &self.target {
            clauses.push("target LIKE ?".to_string());
            args.push(SqlValue::Text(format!("{target}%")));
        }
        if let Some(actor) = &self.actor_id {
            clauses.push("actor_id = ?".to_string());
            args.push(SqlValue::Text(actor.clone()));
        }
        if let Some(request) = &self.request_id {
            clauses.push("request_id = ?".to_string());
            args.push(SqlValue::Text(request.clone()));
        }
        if let Some(since) = self.since {
            clauses.push("recorded_at >= ?".to_string());
            args.push(SqlValue::Text(ts(since)));
        }

        let mut sql = String::from(
            "SELECT id, recorded_at, level, target, span, message, fields, actor_id, request_id FROM logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        args.push(SqlValue::Integer(i64::from(self.limit.unwrap_or(100))));
        (sql, args)
    }
}

/// Handle on the log database.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn write(&self, entry: &Entry) {
        // never fail the code that emitted the event
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (recorded_at, level, target, span, message, fields, actor_id, request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entry.recorded_at,
                entry.level,
                entry.target,
                entry.span,
                entry.message,
                entry.fields,
                entry.correlation.actor_id,
                entry.correlation.request_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (sql, args) = filter.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                recorded_at: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                span: row.get(4)?,
                message: row.get(5)?,
                fields: row.get(6)?,
                actor_id: row.get(7)?,
                request_id: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn.lock().query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }

    /// Delete entries recorded before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        self.conn
            .lock()
            .execute("DELETE FROM logs WHERE recorded_at < ?1", [ts(cutoff)])
    }
}

/// Actor and request ids, taken from an event or inherited from its spans.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Correlation {
    actor_id: Option<String>,
    request_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.actor_id.is_none() && self.request_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.actor_id.is_some() && self.request_id.is_some()
    }

    /// Fill whatever is still missing from `outer`.
    fn inherit(&mut self, outer: &Correlation) {
        if self.actor_id.is_none() {
            self.actor_id.clone_from(&outer.actor_id);
        }
        if self.request_id.is_none() {
            self.request_id.clone_from(&outer.request_id);
        }
    }

    /// Overwrite with whatever `newer` carries.
    fn update(&mut self, newer: Correlation) {
        if newer.actor_id.is_some() {
            self.actor_id = newer.actor_id;
        }
        if newer.request_id.is_some() {
            self.request_id = newer.request_id;
        }
    }
}

#[derive(Default)]
struct Collected {
    message: Option<String>,
    extra: Map<String, Value>,
    correlation: Correlation,
}

impl Collected {
    fn text(&mut self, name: &str, text: String) {
        match name {
            "message" => self.message = Some(text),
            "actor_id" => self.correlation.actor_id = Some(text),
            "request_id" => self.correlation.request_id = Some(text),
            _ => {
                self.extra.insert(name.to_string(), Value::String(text));
            }
        }
    }
}

impl Visit for Collected {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field.name(), format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.extra.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_string(), value.into());
    }
}

struct Entry {
    recorded_at: String,
    level: String,
    target: String,
    span: Option<String>,
    message: String,
    fields: Option<String>,
    correlation: Correlation,
}

/// `tracing` layer that hands warn and error events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        attrs.record(&mut collected);
        if collected.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collected.correlation);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        values.record(&mut collected);
        if collected.correlation.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<Correlation>() {
            Some(existing) => existing.update(collected.correlation),
            None => extensions.insert(collected.correlation),
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut collected = Collected::default();
        event.record(&mut collected);

        let mut span_name = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if span_name.is_none() {
                    span_name = Some(span.name().to_string());
                }
                if collected.correlation.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    collected.correlation.inherit(outer);
                }
            }
        }

        let fields = (!collected.extra.is_empty())
            .then(|| serde_json::to_string(&collected.extra).ok())
            .flatten();
        self.sink.write(&Entry {
            recorded_at: ts(Utc::now()),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            span: span_name,
            message: collected.message.unwrap_or_default(),
            fields,
            correlation: collected.correlation,
        });
    }
}
