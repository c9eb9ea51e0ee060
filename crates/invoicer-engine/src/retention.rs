//! Retention sweep: removes expired artifacts and records.
//!
//! Each category runs on its own; one failing never stops the next. A sweep
//! holds an exclusive lock file for its whole run so that a CLI sweep and a
//! scheduled sweep never overlap.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use invoicer_store::audit::AuditRepo;
use invoicer_store::notifications::NotificationRepo;
use invoicer_store::web_sessions::WebSessionRepo;
use invoicer_store::Database;

use crate::error::EngineError;

/// Removes generated files older than a number of days.
pub trait ArtifactCleaner: Send + Sync {
    fn name(&self) -> &str;

    /// Returns how many files were actually deleted.
    fn clean_older_than(&self, days: i64) -> Result<usize, EngineError>;
}

/// Deletes files in one directory whose name matches a glob pattern.
pub struct DirectoryCleaner {
    name: String,
    dir: PathBuf,
    pattern: String,
}

impl DirectoryCleaner {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            pattern: pattern.into(),
        }
    }

    pub fn pdfs(dir: impl Into<PathBuf>) -> Self {
        Self::new("pdf", dir, "*.pdf")
    }

    pub fn exports(dir: impl Into<PathBuf>) -> Self {
        Self::new("exports", dir, "*")
    }
}

impl ArtifactCleaner for DirectoryCleaner {
    fn name(&self) -> &str {
        &self.name
    }

    fn clean_older_than(&self, days: i64) -> Result<usize, EngineError> {
        let age = StdDuration::from_secs(days.max(0) as u64 * 86_400);
        let cutoff = SystemTime::now().checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH);
        let full = self.dir.join(&self.pattern);
        let entries = glob::glob(&full.to_string_lossy())
            .map_err(|e| EngineError::Internal(format!("bad cleanup pattern {}: {e}", self.pattern)))?;
        let mut removed = 0;
        for path in entries.flatten() {
            if remove_if_older(&path, cutoff) {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Delete `path` when it is a regular file last modified before `cutoff`.
/// Returns whether a file was removed; failures are logged.
fn remove_if_older(path: &Path, cutoff: SystemTime) -> bool {
    let modified = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.modified(),
        Ok(_) => return false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat file");
            return false;
        }
    };
    match modified {
        Ok(at) if at < cutoff => match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed expired file");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to delete expired file");
                false
            }
        },
        Ok(_) => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "no modification time");
            false
        }
    }
}

/// Delete every regular file directly inside `dir` modified before `cutoff`.
/// A missing directory has nothing to sweep.
pub fn sweep_dir(dir: &Path, cutoff: SystemTime) -> Result<usize, EngineError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        if remove_if_older(&entry.path(), cutoff) {
            removed += 1;
        }
    }
    Ok(removed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Pdfs,
    Exports,
    TempFiles,
    AuditLog,
    Notifications,
    IdleSessions,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pdfs => "PDF files",
            Self::Exports => "Export files",
            Self::TempFiles => "Temp files",
            Self::AuditLog => "Audit log entries",
            Self::Notifications => "Read notifications",
            Self::IdleSessions => "Idle sessions",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CategoryOutcome {
    Removed(usize),
    Skipped(String),
    Failed(String),
}

impl From<Result<usize, EngineError>> for CategoryOutcome {
    fn from(result: Result<usize, EngineError>) -> Self {
        match result {
            Ok(n) => Self::Removed(n),
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SweepReport {
    pub days: u32,
    pub cutoff: DateTime<Utc>,
    pub categories: Vec<(Category, CategoryOutcome)>,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.categories
            .iter()
            .map(|(_, outcome)| match outcome {
                CategoryOutcome::Removed(n) => *n,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, category: Category) -> Option<&CategoryOutcome> {
        self.categories.iter().find(|(c, _)| *c == category).map(|(_, o)| o)
    }

    pub fn has_failures(&self) -> bool {
        self.categories
            .iter()
            .any(|(_, o)| matches!(o, CategoryOutcome::Failed(_)))
    }
}

/// `at` minus `delta`, floored at the Unix epoch. Nothing the sweep touches
/// is older than that, and huge retention windows must not overflow.
fn saturating_before(at: DateTime<Utc>, delta: Option<Duration>) -> DateTime<Utc> {
    let floor = DateTime::<Utc>::default();
    delta
        .and_then(|d| at.checked_sub_signed(d))
        .map_or(floor, |cutoff| cutoff.max(floor))
}

fn days_before(at: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    saturating_before(at, Duration::try_days(i64::from(days)))
}

fn as_system_time(at: DateTime<Utc>) -> SystemTime {
    let secs = u64::try_from(at.timestamp()).unwrap_or(0);
    SystemTime::UNIX_EPOCH + StdDuration::from_secs(secs)
}

/// Resets the in-process flag however the sweep ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RetentionSweeper {
    db: Database,
    pdfs: Arc<dyn ArtifactCleaner>,
    exports: Arc<dyn ArtifactCleaner>,
    temp_dir: PathBuf,
    notification_grace_days: u32,
    session_ttl: Option<Duration>,
    lock_path: PathBuf,
    running: AtomicBool,
}

impl RetentionSweeper {
    pub fn new(
        db: Database,
        pdfs: Arc<dyn ArtifactCleaner>,
        exports: Arc<dyn ArtifactCleaner>,
        temp_dir: PathBuf,
        notification_grace_days: u32,
        lock_path: PathBuf,
    ) -> Self {
        Self {
            db,
            pdfs,
            exports,
            temp_dir,
            notification_grace_days,
            session_ttl: None,
            lock_path,
            running: AtomicBool::new(false),
        }
    }

    /// Also drop web sessions idle for longer than `ttl`.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// Run one sweep removing everything older than `days`. Audit rows are
    /// only deleted when `purge_audit` is set.
    #[instrument(skip(self))]
    pub fn sweep(&self, days: u32, purge_audit: bool) -> Result<SweepReport, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::SweepInProgress);
        }
        let _running = Running(&self.running);

        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            warn!(lock = %self.lock_path.display(), "another sweep holds the lock");
            return Err(EngineError::SweepInProgress);
        }

        let now = Utc::now();
        let cutoff = days_before(now, days);
        let whole_days = i64::from(days);
        let notification_cutoff = days_before(cutoff, self.notification_grace_days);
        info!(cutoff = %cutoff, "retention sweep started");

        let mut categories: Vec<(Category, CategoryOutcome)> = Vec::with_capacity(6);
        categories.push((Category::Pdfs, self.pdfs.clean_older_than(whole_days).into()));
        categories.push((Category::Exports, self.exports.clean_older_than(whole_days).into()));
        categories.push((
            Category::TempFiles,
            sweep_dir(&self.temp_dir, as_system_time(cutoff)).into(),
        ));
        let audit = if purge_audit {
            let deleted: Result<usize, EngineError> =
                self.db.with_conn(|conn| Ok(AuditRepo::delete_before(conn, cutoff)?));
            deleted.into()
        } else {
            CategoryOutcome::Skipped("not confirmed".into())
        };
        categories.push((Category::AuditLog, audit));
        let notifications: Result<usize, EngineError> = self
            .db
            .with_conn(|conn| Ok(NotificationRepo::delete_read_before(conn, notification_cutoff)?));
        categories.push((Category::Notifications, notifications.into()));
        let sessions = match self.session_ttl {
            Some(ttl) => {
                let idle_before = saturating_before(now, Some(ttl));
                let deleted: Result<usize, EngineError> =
                    self.db.with_conn(|conn| Ok(WebSessionRepo::delete_idle(conn, idle_before)?));
                deleted.into()
            }
            None => CategoryOutcome::Skipped("no session ttl".into()),
        };
        categories.push((Category::IdleSessions, sessions));

        for (category, outcome) in &categories {
            match outcome {
                CategoryOutcome::Failed(e) => warn!(category = category.label(), error = %e, "cleanup category failed"),
                other => debug!(category = category.label(), outcome = ?other, "cleanup category done"),
            }
        }

        let report = SweepReport {
            days,
            cutoff,
            categories,
        };
        if let Err(e) = FileExt::unlock(&lock) {
            warn!(error = %e, "failed to release sweep lock");
        }
        info!(removed = report.total_removed(), failed = report.has_failures(), "retention sweep finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoicer_core::audit::NewAuditEntry;
    use invoicer_core::ids::EventId;
    use invoicer_store::notifications::NewNotification;
    use invoicer_store::users::UserRepo;
    use serde_json::json;
    use std::fs::File;

    fn age(path: &Path, days: u64) {
        let at = SystemTime::now() - StdDuration::from_secs(days * 86_400);
        File::options().write(true).open(path).unwrap().set_modified(at).unwrap();
    }

    fn touch(dir: &Path, name: &str, days_old: u64) -> PathBuf {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, b"x").unwrap();
        age(&path, days_old);
        path
    }

    struct Fixture {
        _root: tempfile::TempDir,
        root: PathBuf,
        sweeper: RetentionSweeper,
        db: Database,
    }

    fn fixture() -> Fixture {
        fixture_with_grace(60)
    }

    fn fixture_with_grace(grace_days: u32) -> Fixture {
        let root_dir = tempfile::tempdir().unwrap();
        let root = root_dir.path().to_path_buf();
        let db = Database::in_memory().unwrap();
        let sweeper = RetentionSweeper::new(
            db.clone(),
            Arc::new(DirectoryCleaner::pdfs(root.join("pdfs"))),
            Arc::new(DirectoryCleaner::exports(root.join("exports"))),
            root.join("temp"),
            grace_days,
            root.join("retention.lock"),
        )
        .with_session_ttl(Duration::hours(24));
        Fixture {
            _root: root_dir,
            root,
            sweeper,
            db,
        }
    }

    #[test]
    fn files_older_than_cutoff_are_removed() {
        let f = fixture();
        let old_pdf = touch(&f.root.join("pdfs"), "old.pdf", 40);
        let new_pdf = touch(&f.root.join("pdfs"), "new.pdf", 10);
        let old_txt = touch(&f.root.join("pdfs"), "old.txt", 40);
        let old_export = touch(&f.root.join("exports"), "invoices-old.json", 35);
        let old_csv = touch(&f.root.join("exports"), "customers.csv", 60);
        let new_export = touch(&f.root.join("exports"), "invoices-new.json", 2);
        let old_tmp = touch(&f.root.join("temp"), "upload.tmp", 31);
        let new_tmp = touch(&f.root.join("temp"), "fresh.tmp", 1);

        let report = f.sweeper.sweep(30, false).unwrap();

        assert!(!old_pdf.exists());
        assert!(new_pdf.exists());
        assert!(old_txt.exists(), "pattern limits the pdf cleaner");
        assert!(!old_export.exists());
        assert!(!old_csv.exists(), "export cleaner takes every file name");
        assert!(new_export.exists());
        assert!(!old_tmp.exists());
        assert!(new_tmp.exists());
        assert_eq!(report.outcome(Category::Pdfs), Some(&CategoryOutcome::Removed(1)));
        assert_eq!(report.outcome(Category::Exports), Some(&CategoryOutcome::Removed(2)));
        assert_eq!(report.outcome(Category::TempFiles), Some(&CategoryOutcome::Removed(1)));
        assert_eq!(report.total_removed(), 4);
    }

    #[test]
    fn huge_windows_remove_nothing_instead_of_overflowing() {
        let f = fixture_with_grace(u32::MAX);
        let old_pdf = touch(&f.root.join("pdfs"), "old.pdf", 400);
        f.db.with_conn(|conn| {
            AuditRepo::insert_at(conn, &NewAuditEntry::new("auth.login", "old"), Utc::now() - Duration::days(400))
        })
        .unwrap();

        let report = f.sweeper.sweep(u32::MAX, true).unwrap();

        assert_eq!(report.cutoff, DateTime::<Utc>::default());
        assert!(!report.has_failures(), "{:?}", report.categories);
        assert_eq!(report.total_removed(), 0);
        assert!(old_pdf.exists());
        assert_eq!(f.db.with_conn(AuditRepo::count).unwrap(), 1);
    }

    #[test]
    fn zero_grace_deletes_read_notifications_at_the_primary_cutoff() {
        let f = fixture_with_grace(0);
        let user = f
            .db
            .with_conn(|conn| {
                let user = UserRepo::create(conn, "a@example.com", "A", "h", false)?.id;
                for _ in 0..2 {
                    NotificationRepo::insert(
                        conn,
                        &NewNotification {
                            event_id: EventId::new(),
                            recipient_id: user.clone(),
                            kind: "quote.accepted".into(),
                            payload: json!({}),
                        },
                    )?;
                }
                let rows = NotificationRepo::list_for(conn, &user, false)?;
                NotificationRepo::mark_read(conn, &rows[0].id, Utc::now() - Duration::days(31))?;
                NotificationRepo::mark_read(conn, &rows[1].id, Utc::now() - Duration::days(29))?;
                Ok::<_, invoicer_store::StoreError>(user)
            })
            .unwrap();

        let report = f.sweeper.sweep(30, false).unwrap();

        assert_eq!(report.outcome(Category::Notifications), Some(&CategoryOutcome::Removed(1)));
        let left = f.db.with_conn(|conn| NotificationRepo::list_for(conn, &user, false)).unwrap();
        assert_eq!(left.len(), 1);
    }

    #[test]
    fn idle_sessions_are_dropped() {
        let f = fixture();
        f.db.with_conn(|conn| {
            WebSessionRepo::create(conn, "stale", None, "c1", None)?;
            WebSessionRepo::create(conn, "fresh", None, "c2", None)?;
            conn.execute(
                "UPDATE web_sessions SET last_seen_at = ?1 WHERE token_hash = 'stale'",
                [invoicer_store::row_helpers::fmt_ts(Utc::now() - Duration::days(2))],
            )?;
            Ok::<_, invoicer_store::StoreError>(())
        })
        .unwrap();

        let report = f.sweeper.sweep(30, false).unwrap();

        assert_eq!(report.outcome(Category::IdleSessions), Some(&CategoryOutcome::Removed(1)));
        f.db.with_conn(|conn| {
            assert!(WebSessionRepo::get(conn, "stale")?.is_none());
            assert!(WebSessionRepo::get(conn, "fresh")?.is_some());
            Ok::<_, invoicer_store::StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn read_notifications_get_a_grace_period() {
        let f = fixture();
        let ids = f
            .db
            .with_conn(|conn| {
                let user = UserRepo::create(conn, "a@example.com", "A", "h", false)?.id;
                for _ in 0..3 {
                    NotificationRepo::insert(
                        conn,
                        &NewNotification {
                            event_id: EventId::new(),
                            recipient_id: user.clone(),
                            kind: "invoice.paid".into(),
                            payload: json!({}),
                        },
                    )?;
                }
                let rows = NotificationRepo::list_for(conn, &user, false)?;
                NotificationRepo::mark_read(conn, &rows[0].id, Utc::now() - Duration::days(31))?;
                NotificationRepo::mark_read(conn, &rows[1].id, Utc::now() - Duration::days(95))?;
                Ok::<_, invoicer_store::StoreError>((user, rows[0].id.clone(), rows[2].id.clone()))
            })
            .unwrap();

        let report = f.sweeper.sweep(30, false).unwrap();
        assert_eq!(report.outcome(Category::Notifications), Some(&CategoryOutcome::Removed(1)));

        let (user, read_recently, unread) = ids;
        let left: Vec<_> = f
            .db
            .with_conn(|conn| NotificationRepo::list_for(conn, &user, false))
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&read_recently));
        assert!(left.contains(&unread));
    }

    #[test]
    fn audit_rows_need_confirmation() {
        let f = fixture();
        f.db.with_conn(|conn| {
            AuditRepo::insert_at(conn, &NewAuditEntry::new("auth.login", "old"), Utc::now() - Duration::days(40))?;
            AuditRepo::insert(conn, &NewAuditEntry::new("auth.login", "new"))
        })
        .unwrap();

        let skipped = f.sweeper.sweep(30, false).unwrap();
        assert!(matches!(skipped.outcome(Category::AuditLog), Some(CategoryOutcome::Skipped(_))));
        assert_eq!(f.db.with_conn(AuditRepo::count).unwrap(), 2);

        let purged = f.sweeper.sweep(30, true).unwrap();
        assert_eq!(purged.outcome(Category::AuditLog), Some(&CategoryOutcome::Removed(1)));
        assert_eq!(f.db.with_conn(AuditRepo::count).unwrap(), 1);
    }

    #[test]
    fn held_lock_rejects_second_sweep() {
        let f = fixture();
        let held = File::create(f.root.join("retention.lock")).unwrap();
        held.lock_exclusive().unwrap();
        assert!(matches!(f.sweeper.sweep(30, false), Err(EngineError::SweepInProgress)));
        FileExt::unlock(&held).unwrap();
        assert!(f.sweeper.sweep(30, false).is_ok());
    }

    #[test]
    fn running_flag_rejects_overlap() {
        let f = fixture();
        f.sweeper.running.store(true, Ordering::Release);
        assert!(matches!(f.sweeper.sweep(30, false), Err(EngineError::SweepInProgress)));
        f.sweeper.running.store(false, Ordering::Release);
        assert!(f.sweeper.sweep(30, false).is_ok());
    }

    #[test]
    fn a_failing_cleaner_does_not_stop_the_rest() {
        struct Broken;
        impl ArtifactCleaner for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            fn clean_older_than(&self, _days: i64) -> Result<usize, EngineError> {
                Err(EngineError::Internal("disk on fire".into()))
            }
        }

        let f = fixture();
        let old_tmp = touch(&f.root.join("temp"), "a.tmp", 45);
        let sweeper = RetentionSweeper::new(
            f.db.clone(),
            Arc::new(Broken),
            Arc::new(DirectoryCleaner::exports(f.root.join("exports"))),
            f.root.join("temp"),
            60,
            f.root.join("retention.lock"),
        );
        let report = sweeper.sweep(30, false).unwrap();
        assert!(report.has_failures());
        assert!(matches!(report.outcome(Category::Pdfs), Some(CategoryOutcome::Failed(e)) if e.contains("disk on fire")));
        assert!(!old_tmp.exists());
        assert_eq!(report.total_removed(), 1);
    }
}
