//! Settings type definitions.
//!
//! Every section implements [`Default`] with production values and is marked
//! `#[serde(default)]`, so a settings file only needs the keys it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Treat `X-Forwarded-Proto: https` as a secure transport (behind a TLS proxy).
    pub trust_forwarded_proto: bool,
    /// Mark the session cookie `Secure`.
    pub secure_cookies: bool,
    /// Idle sessions older than this are discarded.
    pub session_ttl_hours: u32,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            trust_forwarded_proto: false,
            secure_cookies: false,
            session_ttl_hours: 24 * 14,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: data_dir().join("invoicer.db"),
        }
    }
}

/// Directories holding generated artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub temp_dir: PathBuf,
    pub pdf_dir: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let root = data_dir().join("storage");
        Self {
            temp_dir: root.join("temp"),
            pdf_dir: root.join("pdfs"),
            export_dir: root.join("exports"),
        }
    }
}

/// Retention sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    /// Files and records older than this many days are removed.
    pub days: u32,
    /// Extra days a read notification is kept beyond the primary cutoff.
    pub notification_grace_days: u32,
    /// Run the sweep on a timer inside `serve`.
    pub scheduled: bool,
    pub interval_hours: u32,
    /// Scheduled sweeps never purge audit rows unless this is set.
    pub purge_audit_on_schedule: bool,
    pub lock_path: PathBuf,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            days: 30,
            notification_grace_days: 60,
            scheduled: true,
            interval_hours: 24,
            purge_audit_on_schedule: false,
            lock_path: data_dir().join("retention.lock"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    /// Flat tax rate in basis points (825 = 8.25%). Zero disables tax.
    pub tax_rate_bps: u32,
    pub currency: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            tax_rate_bps: 0,
            currency: "USD".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// Per-module overrides, e.g. `{"invoicer_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
    pub json: bool,
    /// Persist warn+ events to a SQLite log database.
    pub persist_warnings: bool,
    pub db_path: PathBuf,
    /// Persisted entries older than this many days are pruned.
    pub retention_days: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            modules: BTreeMap::new(),
            json: true,
            persist_warnings: true,
            db_path: data_dir().join("logs.db"),
            retention_days: 30,
        }
    }
}

/// Base directory for all default paths (`$HOME/.invoicer`).
pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".invoicer")
}
