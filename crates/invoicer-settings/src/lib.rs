//! # invoicer-settings
//!
//! Layered configuration for the invoicer service, loaded with figment.
//!
//! Sources, highest priority last:
//! 1. Compiled defaults ([`Settings::default()`])
//! 2. A JSON settings file (`invoicer.json` in the working directory, or the
//!    path given with `--config`)
//! 3. Environment variables with the `INVOICER_` prefix, `__` separating
//!    sections: `INVOICER_RETENTION__DAYS=14` sets `retention.days`.

mod error;
mod types;

pub use error::SettingsError;
pub use types::*;

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Default settings file name looked up in the working directory.
pub const DEFAULT_FILE: &str = "invoicer.json";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "INVOICER_";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub storage: StorageSettings,
    pub retention: RetentionSettings,
    pub billing: BillingSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings from defaults, the settings file and the environment.
    ///
    /// An explicit `path` must exist; the implicit `invoicer.json` is optional.
    /// Also returns the corrections [`Settings::validate`] made, for logging
    /// once a subscriber is installed.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<String>), SettingsError> {
        if let Some(p) = path {
            if !p.exists() {
                return Err(SettingsError::InvalidValue {
                    field: "config".into(),
                    reason: format!("settings file not found: {}", p.display()),
                });
            }
        }
        let mut settings: Settings = Self::figment(path).extract()?;
        let corrections = settings.validate();
        Ok((settings, corrections))
    }

    /// Build the provider chain. Public so tests can layer extra providers.
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.map_or_else(|| PathBuf::from(DEFAULT_FILE), Path::to_path_buf);
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if file.exists() {
            figment = figment.merge(Json::file(file));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Replace values that would make the service misbehave and describe
    /// each replacement.
    pub fn validate(&mut self) -> Vec<String> {
        let mut corrections = Vec::new();
        clamp(&mut corrections, "retention.days", &mut self.retention.days, 1, MAX_RETENTION_DAYS);
        clamp(
            &mut corrections,
            "retention.notification_grace_days",
            &mut self.retention.notification_grace_days,
            0,
            MAX_RETENTION_DAYS,
        );
        clamp(&mut corrections, "retention.interval_hours", &mut self.retention.interval_hours, 1, 24 * 365);
        clamp(&mut corrections, "billing.tax_rate_bps", &mut self.billing.tax_rate_bps, 0, 10_000);
        clamp(
            &mut corrections,
            "server.session_ttl_hours",
            &mut self.server.session_ttl_hours,
            1,
            MAX_SESSION_TTL_HOURS,
        );
        clamp(&mut corrections, "logging.retention_days", &mut self.logging.retention_days, 1, MAX_RETENTION_DAYS);
        corrections
    }
}

/// Longest retention window or grace period accepted, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// One year.
pub const MAX_SESSION_TTL_HOURS: u32 = 24 * 365;

fn clamp(corrections: &mut Vec<String>, field: &str, value: &mut u32, min: u32, max: u32) {
    let clamped = (*value).clamp(min, max);
    if clamped != *value {
        corrections.push(format!("{field} must be between {min} and {max}, using {clamped} instead of {value}"));
        *value = clamped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.retention.days, 30);
        assert_eq!(s.retention.notification_grace_days, 60);
        assert!(!s.retention.purge_audit_on_schedule);
        assert_eq!(s.billing.tax_rate_bps, 0);
        assert!(s.storage.pdf_dir.ends_with("pdfs"));
    }

    #[test]
    fn figment_builds_without_files() {
        Jail::expect_with(|_jail| {
            let (s, corrections) = Settings::load(None).expect("defaults load");
            assert!(corrections.is_empty());
            assert_eq!(s.retention.days, 30);
            Ok(())
        });
    }

    #[test]
    fn json_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_FILE,
                r#"{"retention": {"days": 7}, "billing": {"tax_rate_bps": 825}}"#,
            )?;
            let (s, _) = Settings::load(None).expect("file loads");
            assert_eq!(s.retention.days, 7);
            assert_eq!(s.billing.tax_rate_bps, 825);
            // untouched keys keep their defaults
            assert_eq!(s.retention.notification_grace_days, 60);
            Ok(())
        });
    }

    #[test]
    fn env_beats_file() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_FILE, r#"{"server": {"port": 9000}}"#)?;
            jail.set_env("INVOICER_SERVER__PORT", "9100");
            jail.set_env("INVOICER_RETENTION__NOTIFICATION_GRACE_DAYS", "10");
            let (s, _) = Settings::load(None).expect("env loads");
            assert_eq!(s.server.port, 9100);
            assert_eq!(s.retention.notification_grace_days, 10);
            Ok(())
        });
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("settings file not found"));
    }

    #[test]
    fn validate_clamps_bad_values() {
        let mut s = Settings::default();
        s.retention.days = 0;
        s.billing.tax_rate_bps = 50_000;
        s.logging.retention_days = 0;
        let corrections = s.validate();
        assert_eq!(s.retention.days, 1);
        assert_eq!(s.billing.tax_rate_bps, 10_000);
        assert_eq!(s.logging.retention_days, 1);
        assert_eq!(corrections.len(), 3);
        assert!(corrections[0].starts_with("retention.days"));
    }

    #[test]
    fn huge_windows_are_capped() {
        Jail::expect_with(|jail| {
            jail.set_env("INVOICER_RETENTION__DAYS", "200000000");
            jail.set_env("INVOICER_RETENTION__NOTIFICATION_GRACE_DAYS", "4000000000");
            jail.set_env("INVOICER_SERVER__SESSION_TTL_HOURS", "4000000000");
            let (s, corrections) = Settings::load(None).expect("env loads");
            assert_eq!(s.retention.days, MAX_RETENTION_DAYS);
            assert_eq!(s.retention.notification_grace_days, MAX_RETENTION_DAYS);
            assert_eq!(s.server.session_ttl_hours, MAX_SESSION_TTL_HOURS);
            assert_eq!(corrections.len(), 3);
            Ok(())
        });
    }
}
