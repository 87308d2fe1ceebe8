//! Pipeline composition: configuration and the orchestrator.

mod config;
mod orchestrator;

#[cfg(test)]
mod integration_tests;

pub use config::PipelineConfig;
pub use orchestrator::{BatchReport, Orchestrator};
