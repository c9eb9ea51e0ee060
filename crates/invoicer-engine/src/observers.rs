//! Post-write observers.
//!
//! Entity services call [`ObserverRegistry::dispatch`] after the primary
//! write, inside the same transaction. Every observer runs in its own SQL
//! savepoint: a failure or panic rolls back that observer's writes only, is
//! logged at `warn`, and never reaches the caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, warn};

use invoicer_core::events::{EntityEvent, EntityKind};
use invoicer_store::StoreError;

const SAVEPOINT: &str = "observer";

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

impl From<rusqlite::Error> for ObserverError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.into())
    }
}

impl From<serde_json::Error> for ObserverError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(e.into())
    }
}

/// A side effect triggered by an entity mutation.
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    /// Entity kinds this observer wants to see.
    fn handles(&self, _kind: EntityKind) -> bool {
        true
    }

    fn on_event(&self, conn: &Connection, event: &EntityEvent) -> Result<(), ObserverError>;
}

/// Circuit breaker state for an observer.
struct CircuitBreaker {
    failures: AtomicU32,
    threshold: u32,
    last_trip: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
            last_trip: Mutex::new(None),
            cooldown,
        }
    }

    fn is_open(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < self.threshold {
            return false;
        }
        self.last_trip
            .lock()
            .is_some_and(|tripped_at| tripped_at.elapsed() < self.cooldown)
    }

    fn record_failure(&self, observer: &str) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.threshold {
            let mut last_trip = self.last_trip.lock();
            if last_trip.is_none() {
                warn!(
                    observer,
                    failures,
                    threshold = self.threshold,
                    cooldown_secs = self.cooldown.as_secs(),
                    "observer circuit breaker tripped"
                );
            }
            *last_trip = Some(Instant::now());
        }
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        *self.last_trip.lock() = None;
    }
}

struct ObserverEntry {
    observer: Arc<dyn Observer>,
    breaker: CircuitBreaker,
}

/// What happened to one dispatched event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    /// Observers skipped because their circuit breaker is open.
    pub skipped: Vec<String>,
}

/// Ordered list of observers invoked after every entity mutation.
pub struct ObserverRegistry {
    entries: Vec<ObserverEntry>,
    circuit_threshold: u32,
    circuit_cooldown: Duration,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            circuit_threshold: 3,
            circuit_cooldown: Duration::from_secs(60),
        }
    }

    /// Override the breaker settings. Applies to observers registered afterwards.
    pub fn with_circuit(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_threshold = threshold.max(1);
        self.circuit_cooldown = cooldown;
        self
    }

    pub fn register(&mut self, observer: Arc<dyn Observer>) {
        self.entries.push(ObserverEntry {
            observer,
            breaker: CircuitBreaker::new(self.circuit_threshold, self.circuit_cooldown),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every interested observer for `event`, in registration order.
    pub fn dispatch(&self, conn: &Connection, event: &EntityEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        for entry in &self.entries {
            let name = entry.observer.name();
            if !entry.observer.handles(event.kind) {
                continue;
            }
            if entry.breaker.is_open() {
                debug!(observer = name, event_id = %event.id, "observer skipped, circuit open");
                report.skipped.push(name.to_string());
                continue;
            }

            if let Err(e) = conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}")) {
                warn!(observer = name, event_id = %event.id, error = %e, "could not open observer savepoint");
                entry.breaker.record_failure(name);
                report.failed.push(name.to_string());
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| entry.observer.on_event(conn, event)));
            let failure = match outcome {
                Ok(Ok(())) => match conn.execute_batch(&format!("RELEASE SAVEPOINT {SAVEPOINT}")) {
                    Ok(()) => None,
                    Err(e) => Some(format!("release savepoint: {e}")),
                },
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };

            match failure {
                None => {
                    entry.breaker.record_success();
                    report.delivered.push(name.to_string());
                }
                Some(error) => {
                    rollback_savepoint(conn);
                    warn!(
                        observer = name,
                        event_id = %event.id,
                        action = %event.action(),
                        entity_id = %event.entity_id,
                        error = %error,
                        "observer failed, side effect skipped"
                    );
                    entry.breaker.record_failure(name);
                    report.failed.push(name.to_string());
                }
            }
        }

        report
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn rollback_savepoint(conn: &Connection) {
    let sql = format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}; RELEASE SAVEPOINT {SAVEPOINT}");
    if let Err(e) = conn.execute_batch(&sql) {
        warn!(error = %e, "observer savepoint rollback failed");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use invoicer_core::events::ChangeKind;
    use invoicer_core::ids::UserId;
    use invoicer_store::Database;

    fn scratch_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| conn.execute_batch("CREATE TABLE scratch (v TEXT NOT NULL)"))
            .unwrap();
        db
    }

    fn scratch_rows(db: &Database) -> Vec<String> {
        db.with_conn(|conn| {
            conn.prepare("SELECT v FROM scratch ORDER BY rowid")?
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()
        })
        .unwrap()
    }

    fn event(kind: EntityKind) -> EntityEvent {
        EntityEvent::new(kind, ChangeKind::Created, "ent_1", UserId::from_raw("usr_1"), "label")
    }

    struct Writer(&'static str);
    impl Observer for Writer {
        fn name(&self) -> &str {
            self.0
        }
        fn on_event(&self, conn: &Connection, _event: &EntityEvent) -> Result<(), ObserverError> {
            conn.execute("INSERT INTO scratch (v) VALUES (?1)", [self.0])?;
            Ok(())
        }
    }

    /// Writes a row, then fails: the row must be rolled back.
    struct WriteThenFail;
    impl Observer for WriteThenFail {
        fn name(&self) -> &str {
            "write-then-fail"
        }
        fn on_event(&self, conn: &Connection, _event: &EntityEvent) -> Result<(), ObserverError> {
            conn.execute("INSERT INTO scratch (v) VALUES ('partial')", [])?;
            Err(ObserverError::Failed("mail relay unreachable".into()))
        }
    }

    struct Panicker;
    impl Observer for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }
        fn on_event(&self, _conn: &Connection, _event: &EntityEvent) -> Result<(), ObserverError> {
            panic!("observer bug")
        }
    }

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }
    impl Observer for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn handles(&self, kind: EntityKind) -> bool {
            kind.has_line_items()
        }
        fn on_event(&self, _conn: &Connection, _event: &EntityEvent) -> Result<(), ObserverError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Err(ObserverError::Failed("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn failure_is_isolated_to_one_observer() {
        let db = scratch_db();
        let mut registry = ObserverRegistry::new();
        registry.register(Arc::new(Writer("first")));
        registry.register(Arc::new(WriteThenFail));
        registry.register(Arc::new(Panicker));
        registry.register(Arc::new(Writer("last")));

        let report = db
            .with_tx(|tx| -> Result<_, StoreError> {
                tx.execute("INSERT INTO scratch (v) VALUES ('primary')", [])?;
                Ok(registry.dispatch(tx, &event(EntityKind::Customer)))
            })
            .unwrap();

        assert_eq!(report.delivered, vec!["first", "last"]);
        assert_eq!(report.failed, vec!["write-then-fail", "panicker"]);
        assert_eq!(scratch_rows(&db), vec!["primary", "first", "last"]);
    }

    #[test]
    fn dispatch_outside_transaction_commits() {
        let db = scratch_db();
        let mut registry = ObserverRegistry::new();
        registry.register(Arc::new(Writer("solo")));

        let report = db.with_conn(|conn| Ok::<_, StoreError>(registry.dispatch(conn, &event(EntityKind::Item)))).unwrap();
        assert_eq!(report.delivered, vec!["solo"]);
        assert_eq!(scratch_rows(&db), vec!["solo"]);
    }

    #[test]
    fn handles_filters_by_kind() {
        let db = scratch_db();
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let mut registry = ObserverRegistry::new();
        registry.register(counting.clone());

        db.with_conn(|conn| {
            registry.dispatch(conn, &event(EntityKind::Customer));
            registry.dispatch(conn, &event(EntityKind::Invoice));
            Ok::<_, StoreError>(())
        })
        .unwrap();
        assert_eq!(counting.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn breaker_skips_repeatedly_failing_observer() {
        let db = scratch_db();
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut registry = ObserverRegistry::new().with_circuit(2, Duration::from_secs(60));
        registry.register(counting.clone());

        let reports: Vec<DispatchReport> = db
            .with_conn(|conn| Ok::<_, StoreError>((0..4).map(|_| registry.dispatch(conn, &event(EntityKind::Quote))).collect()))
            .unwrap();

        assert_eq!(counting.calls.load(Ordering::Relaxed), 2);
        assert_eq!(reports[1].failed, vec!["counting"]);
        assert_eq!(reports[2].skipped, vec!["counting"]);
    }

    #[test]
    fn circuit_breaker_trips_and_recovers() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("test");
        breaker.record_failure("test");
        assert!(!breaker.is_open());
        breaker.record_failure("test");
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[test]
    fn circuit_breaker_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure("test");
        std::thread::sleep(Duration::from_millis(1));
        assert!(!breaker.is_open());
    }
}
