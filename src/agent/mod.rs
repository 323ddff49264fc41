// src/agent/mod.rs
//! Agent-side handles

pub mod bidding_agent;

pub use bidding_agent::BiddingAgent;
