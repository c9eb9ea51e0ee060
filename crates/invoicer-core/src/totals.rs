//! Quote and invoice totals.
//!
//! Totals are always derived from the line items. Nothing outside this module
//! computes a subtotal, so a document can never carry a total that disagrees
//! with its own lines after a save.

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;
use crate::money::Money;

/// One line on a quote or invoice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Catalogue item the line was priced from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    pub description: String,
    pub unit_price: Money,
    pub quantity: u32,
}

impl LineItem {
    pub fn amount(&self) -> Option<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Derived monetary totals for a document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Money,
    pub discount: Money,
    pub tax: Money,
    pub total: Money,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TotalsError {
    #[error("line {index}: unit price must not be negative")]
    NegativePrice { index: usize },

    #[error("discount must not be negative")]
    NegativeDiscount,

    #[error("amount overflow while computing totals")]
    Overflow,
}

/// Tax rules applied on top of the discounted subtotal.
pub trait TaxPolicy: Send + Sync {
    fn name(&self) -> &str;
    fn tax_on(&self, taxable: Money) -> Option<Money>;
}

/// No tax at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTax;

impl TaxPolicy for NoTax {
    fn name(&self) -> &str {
        "none"
    }

    fn tax_on(&self, _taxable: Money) -> Option<Money> {
        Some(Money::ZERO)
    }
}

/// A single flat rate in basis points (825 = 8.25%).
#[derive(Clone, Copy, Debug)]
pub struct FlatRateTax {
    pub rate_bps: u32,
}

impl TaxPolicy for FlatRateTax {
    fn name(&self) -> &str {
        "flat_rate"
    }

    fn tax_on(&self, taxable: Money) -> Option<Money> {
        taxable.apply_basis_points(self.rate_bps)
    }
}

/// Compute totals for `lines` with a document-level `discount`.
///
/// The discount is clamped to the subtotal so a document total is never
/// negative.
pub fn compute_totals(
    lines: &[LineItem],
    discount: Money,
    tax: &dyn TaxPolicy,
) -> Result<Totals, TotalsError> {
    if discount.is_negative() {
        return Err(TotalsError::NegativeDiscount);
    }

    let mut subtotal = Money::ZERO;
    for (index, line) in lines.iter().enumerate() {
        if line.unit_price.is_negative() {
            return Err(TotalsError::NegativePrice { index });
        }
        let amount = line.amount().ok_or(TotalsError::Overflow)?;
        subtotal = subtotal.checked_add(amount).ok_or(TotalsError::Overflow)?;
    }

    let discount = discount.min(subtotal);
    let taxable = subtotal.checked_sub(discount).ok_or(TotalsError::Overflow)?;
    let tax = tax.tax_on(taxable).ok_or(TotalsError::Overflow)?;
    let total = taxable.checked_add(tax).ok_or(TotalsError::Overflow)?;

    Ok(Totals {
        subtotal,
        discount,
        tax,
        total,
    })
}
