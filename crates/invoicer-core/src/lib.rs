pub mod audit;
pub mod events;
pub mod ids;
pub mod money;
pub mod policy;
pub mod security;
pub mod status;
pub mod totals;

pub use money::Money;
pub use totals::{compute_totals, FlatRateTax, LineItem, NoTax, TaxPolicy, Totals, TotalsError};
