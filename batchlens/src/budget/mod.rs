//! Spending budget enforcement.
//!
//! The budget ledger gate-keeps spend before dispatch: a reservation is
//! taken against every active scope under one lock, then confirmed at
//! the actual cost (or released) once the outcome is known. Calendar
//! windows roll over lazily at UTC boundaries.

mod ledger;
mod window;

pub use ledger::{BudgetLedger, BudgetLimits, Reservation};
pub use window::{next_boundary, BudgetPeriod, BudgetWindow};
