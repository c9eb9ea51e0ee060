use std::collections::BTreeMap;

use serde::Serialize;

use invoicer_core::policy::Actor;
use invoicer_core::Money;
use invoicer_store::customers::CustomerRepo;
use invoicer_store::invoices::InvoiceRepo;
use invoicer_store::items::ItemRepo;
use invoicer_store::notifications::NotificationRepo;
use invoicer_store::quotes::QuoteRepo;

use super::ServiceContext;
use crate::error::EngineError;

/// Per-user counts shown after login.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub customers: i64,
    pub items: i64,
    pub quotes_by_status: BTreeMap<String, i64>,
    pub invoices_by_status: BTreeMap<String, i64>,
    /// Sum of sent and overdue invoice totals.
    pub outstanding: Money,
    pub unread_notifications: i64,
}

#[derive(Clone)]
pub struct DashboardService {
    ctx: ServiceContext,
}

impl DashboardService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    pub fn summary(&self, actor: &Actor) -> Result<Dashboard, EngineError> {
        let owner = &actor.user_id;
        self.ctx.read(|conn| {
            Ok(Dashboard {
                customers: CustomerRepo::count_for_owner(conn, owner)?,
                items: ItemRepo::count_for_owner(conn, owner)?,
                quotes_by_status: QuoteRepo::status_counts(conn, owner)?
                    .into_iter()
                    .map(|(s, n)| (s.to_string(), n))
                    .collect(),
                invoices_by_status: InvoiceRepo::status_counts(conn, owner)?
                    .into_iter()
                    .map(|(s, n)| (s.to_string(), n))
                    .collect(),
                outstanding: InvoiceRepo::outstanding_total(conn, owner)?,
                unread_notifications: NotificationRepo::count_unread(conn, owner)?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::customers::{CustomerInput, CustomerService};
    use crate::services::invoices::{InvoiceInput, InvoiceService};
    use crate::services::testing::{context, line, user};
    use invoicer_core::status::InvoiceStatus;

    #[test]
    fn summary_counts_only_own_rows() {
        let ctx = context();
        let a = user(&ctx, "a@example.com");
        let b = user(&ctx, "b@example.com");
        let customers = CustomerService::new(ctx.clone());
        let invoices = InvoiceService::new(ctx.clone());

        let acme = customers
            .create(&a, &CustomerInput { name: "Acme".into(), ..Default::default() })
            .unwrap();
        customers
            .create(&b, &CustomerInput { name: "Other".into(), ..Default::default() })
            .unwrap();
        let inv = invoices
            .create(
                &a,
                &InvoiceInput {
                    customer_id: acme.id.clone(),
                    discount: Money::ZERO,
                    due_on: None,
                    lines: Some(vec![line("work", 10_000, 1)]),
                },
            )
            .unwrap();
        invoices.transition(&a, &inv.id, InvoiceStatus::Sent).unwrap();
        invoices.transition(&a, &inv.id, InvoiceStatus::Overdue).unwrap();

        let summary = DashboardService::new(ctx.clone()).summary(&a).unwrap();
        assert_eq!(summary.customers, 1);
        assert_eq!(summary.items, 0);
        assert_eq!(summary.invoices_by_status.get("overdue"), Some(&1));
        assert_eq!(summary.outstanding, Money::from_cents(11_000));
        assert_eq!(summary.unread_notifications, 1);

        let other = DashboardService::new(ctx).summary(&b).unwrap();
        assert_eq!(other.customers, 1);
        assert!(other.invoices_by_status.is_empty());
        assert_eq!(other.outstanding, Money::ZERO);
    }
}
