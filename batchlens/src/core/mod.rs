//! Core data model for batch classification.
//!
//! Defines the work item, the classification payload, the per-item
//! outcome (and its wire form in the result log), and the session
//! checkpoint record.

mod outcome;
mod session;
mod work_item;

pub use outcome::{Classification, Outcome, OutcomeRecord, OutcomeStatus};
pub use session::Session;
pub use work_item::{ItemState, WorkItem};
