//! Deliberation and grade adjustment engine: compiles per-student results
//! for a cohort deliberation, ranks and classifies them, and records every
//! later grade change in an append-only ledger.

pub mod access;
pub mod compiler;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod models;
pub mod notify;
pub mod policy;
pub mod ranking;
pub mod reader;
pub mod report;
pub mod score;
pub mod store;

#[cfg(test)]
mod testing;

pub use engine::Engine;
pub use error::{EngineError, Result};
