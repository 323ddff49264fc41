// src/engine/mod.rs
//! Engine lifecycle: initialize, run, shutdown

#[allow(clippy::module_inception)]
pub mod engine;

pub use engine::{Engine, EngineStats, LOCAL_EXCHANGE};
