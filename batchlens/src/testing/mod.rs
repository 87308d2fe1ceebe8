//! Test doubles for pipeline components.
//!
//! Deterministic backends behind the [`crate::backend::Backend`] seam,
//! used by the crate's own tests and available to downstream test
//! suites.

mod events;
mod mocks;

pub use events::EventCollector;
pub use mocks::{sample_classification, FlakyBackend, ScriptedBackend};
