//! Mandatory totals recalculation. Unlike observers, a failure here aborts
//! the surrounding mutation.

use std::sync::Arc;

use rusqlite::Connection;
use tracing::debug;

use invoicer_core::ids::{InvoiceId, QuoteId};
use invoicer_core::{compute_totals, FlatRateTax, NoTax, TaxPolicy, Totals};
use invoicer_store::invoices::InvoiceRepo;
use invoicer_store::quotes::QuoteRepo;

use crate::error::EngineError;

#[derive(Clone)]
pub struct TotalsRecalculator {
    tax: Arc<dyn TaxPolicy>,
}

impl TotalsRecalculator {
    pub fn new(tax: Arc<dyn TaxPolicy>) -> Self {
        Self { tax }
    }

    /// Flat tax in basis points; zero means no tax.
    pub fn from_rate(rate_bps: u32) -> Self {
        if rate_bps == 0 {
            Self::new(Arc::new(NoTax))
        } else {
            Self::new(Arc::new(FlatRateTax { rate_bps }))
        }
    }

    pub fn policy(&self) -> &dyn TaxPolicy {
        self.tax.as_ref()
    }

    /// Recompute a quote's totals from its stored lines and quietly save them.
    pub fn recalc_quote(&self, conn: &Connection, id: &QuoteId) -> Result<Totals, EngineError> {
        let quote = QuoteRepo::get(conn, id)?.ok_or_else(|| EngineError::not_found(format!("quote {id}")))?;
        let totals = compute_totals(&quote.lines, quote.discount, self.policy())?;
        QuoteRepo::store_totals(conn, id, &totals)?;
        debug!(quote_id = %id, total = %totals.total, tax_policy = self.tax.name(), "quote totals stored");
        Ok(totals)
    }

    pub fn recalc_invoice(&self, conn: &Connection, id: &InvoiceId) -> Result<Totals, EngineError> {
        let invoice =
            InvoiceRepo::get(conn, id)?.ok_or_else(|| EngineError::not_found(format!("invoice {id}")))?;
        let totals = compute_totals(&invoice.lines, invoice.discount, self.policy())?;
        InvoiceRepo::store_totals(conn, id, &totals)?;
        debug!(invoice_id = %id, total = %totals.total, tax_policy = self.tax.name(), "invoice totals stored");
        Ok(totals)
    }
}
