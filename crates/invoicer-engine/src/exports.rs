use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument};

use invoicer_core::policy::Actor;
use invoicer_store::invoices::InvoiceRepo;
use invoicer_store::Database;

use crate::error::EngineError;

#[derive(Clone, Debug, Serialize)]
pub struct ExportFile {
    pub path: PathBuf,
    pub invoices: usize,
}

/// Writes JSON snapshots of a user's invoices into the export directory.
/// The retention sweep removes them once they age out.
#[derive(Clone)]
pub struct ExportService {
    db: Database,
    export_dir: PathBuf,
}

impl ExportService {
    pub fn new(db: Database, export_dir: PathBuf) -> Self {
        Self { db, export_dir }
    }

    #[instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub fn export_invoices(&self, actor: &Actor) -> Result<ExportFile, EngineError> {
        let invoices = self
            .db
            .with_conn(|conn| InvoiceRepo::list(conn, Some(&actor.user_id)))?;
        let now = Utc::now();
        let body = serde_json::to_vec_pretty(&json!({
            "exported_at": now,
            "owner_id": actor.user_id,
            "invoices": invoices,
        }))?;

        fs::create_dir_all(&self.export_dir)?;
        let path = self.export_dir.join(format!(
            "invoices-{}-{}.json",
            actor.user_id,
            now.format("%Y%m%dT%H%M%S%.6f")
        ));
        // write then rename so a sweep never sees a half-written file
        let partial = path.with_extension("json.part");
        fs::write(&partial, body)?;
        fs::rename(&partial, &path)?;

        info!(path = %path.display(), invoices = invoices.len(), "invoices exported");
        Ok(ExportFile {
            path,
            invoices: invoices.len(),
        })
    }
}
