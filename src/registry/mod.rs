// src/registry/mod.rs
//! Agent registry
//!
//! Agents live in a generation-checked arena. An [`AgentId`] names a slot
//! and the generation it was issued for; once the slot is released and
//! reused, old ids stop resolving instead of aliasing the new agent.

pub mod agent_registry;

pub use agent_registry::{AgentCounters, AgentRegistry, AgentState};

use std::fmt;

/// Generation-checked agent handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId {
    index: u32,
    generation: u32,
}

impl AgentId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Slot index usable as a bitset position
    pub fn slot(&self) -> usize {
        self.index as usize
    }

    /// Pack into one integer; never zero for a registered agent
    pub fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}v{}", self.index, self.generation)
    }
}
