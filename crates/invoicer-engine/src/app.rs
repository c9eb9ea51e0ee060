use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;

use invoicer_settings::Settings;
use invoicer_store::Database;

use crate::audit::{AuditLog, AuditObserver};
use crate::auth::AuthGateway;
use crate::exports::ExportService;
use crate::notify::NotificationObserver;
use crate::observers::ObserverRegistry;
use crate::retention::{DirectoryCleaner, RetentionSweeper};
use crate::scheduler::RetentionSchedule;
use crate::services::{
    CustomerService, DashboardService, InvoiceService, ItemService, NotificationService, QuoteService, ServiceContext,
};
use crate::totals::TotalsRecalculator;

/// Every service wired to one database and one observer registry.
#[derive(Clone)]
pub struct Engine {
    pub db: Database,
    pub customers: CustomerService,
    pub items: ItemService,
    pub quotes: QuoteService,
    pub invoices: InvoiceService,
    pub notifications: NotificationService,
    pub dashboard: DashboardService,
    pub audit: AuditLog,
    pub auth: AuthGateway,
    pub exports: ExportService,
    pub sweeper: Arc<RetentionSweeper>,
}

impl Engine {
    pub fn new(db: Database, settings: &Settings) -> Self {
        let mut observers = ObserverRegistry::new();
        observers.register(Arc::new(AuditObserver));
        observers.register(Arc::new(NotificationObserver));

        let ctx = ServiceContext::new(
            db.clone(),
            Arc::new(observers),
            TotalsRecalculator::from_rate(settings.billing.tax_rate_bps),
        );
        let storage = &settings.storage;
        let session_ttl = Duration::hours(i64::from(settings.server.session_ttl_hours));
        let sweeper = RetentionSweeper::new(
            db.clone(),
            Arc::new(DirectoryCleaner::pdfs(&storage.pdf_dir)),
            Arc::new(DirectoryCleaner::exports(&storage.export_dir)),
            storage.temp_dir.clone(),
            settings.retention.notification_grace_days,
            settings.retention.lock_path.clone(),
        )
        .with_session_ttl(session_ttl);

        Self {
            customers: CustomerService::new(ctx.clone()),
            items: ItemService::new(ctx.clone()),
            quotes: QuoteService::new(ctx.clone()),
            invoices: InvoiceService::new(ctx.clone()),
            notifications: NotificationService::new(ctx.clone()),
            dashboard: DashboardService::new(ctx),
            audit: AuditLog::new(db.clone()),
            auth: AuthGateway::new(db.clone(), session_ttl),
            exports: ExportService::new(db.clone(), storage.export_dir.clone()),
            sweeper: Arc::new(sweeper),
            db,
        }
    }

    /// The timer settings for `serve`, or `None` when scheduling is off.
    pub fn retention_schedule(settings: &Settings) -> Option<RetentionSchedule> {
        let retention = &settings.retention;
        retention.scheduled.then(|| RetentionSchedule {
            every: StdDuration::from_secs(u64::from(retention.interval_hours) * 3600),
            days: retention.days,
            purge_audit: retention.purge_audit_on_schedule,
        })
    }
}
