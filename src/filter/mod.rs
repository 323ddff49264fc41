// src/filter/mod.rs
//! Agent subscription filtering
//!
//! - **AgentFilter**: parsed subscription expression of one agent
//! - **ConfigSet**: bitset over agent slots
//! - **BidFilter**: one indexed classification stage
//! - **FilterPool**: all stages, evaluated in priority order

pub mod agent_filter;
pub mod config_set;
pub mod filters;
pub mod pool;

pub use agent_filter::{AgentFilter, IncludeExclude};
pub use config_set::ConfigSet;
pub use filters::BidFilter;
pub use pool::FilterPool;
