// src/filter/pool.rs
//! Priority-ordered filter pool
//!
//! Classification starts from the set of active agent slots and runs each
//! filter in ascending priority order, stopping as soon as no candidate is
//! left.

use crate::events::event::BidRequest;
use crate::filter::agent_filter::AgentFilter;
use crate::filter::config_set::ConfigSet;
use crate::filter::filters::{self, BidFilter};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

struct PoolState {
    filters: Vec<Box<dyn BidFilter>>,
    active: ConfigSet,
    by_slot: HashMap<usize, AgentFilter>,
}

/// Set of subscription filters over agent slots
pub struct FilterPool {
    state: RwLock<PoolState>,
}

impl FilterPool {
    /// Pool with the builtin filters
    pub fn new() -> Self {
        Self::with_filters(filters::builtin())
    }

    pub fn with_filters(mut filters: Vec<Box<dyn BidFilter>>) -> Self {
        filters.sort_by_key(|f| f.priority());
        Self {
            state: RwLock::new(PoolState {
                filters,
                active: ConfigSet::new(),
                by_slot: HashMap::new(),
            }),
        }
    }

    /// Install or replace the filter of `slot`
    pub fn add_agent(&self, slot: usize, filter: &AgentFilter) {
        let mut state = self.state.write();

        if state.active.test(slot) {
            for f in state.filters.iter_mut() {
                f.remove_agent(slot);
            }
        }
        for f in state.filters.iter_mut() {
            f.add_agent(slot, filter);
        }
        state.active.set(slot);
        state.by_slot.insert(slot, filter.clone());

        debug!("Filter for slot {}: {}", slot, filter);
    }

    pub fn remove_agent(&self, slot: usize) {
        let mut state = self.state.write();
        if !state.active.test(slot) {
            return;
        }

        for f in state.filters.iter_mut() {
            f.remove_agent(slot);
        }
        state.active.reset(slot);
        state.by_slot.remove(&slot);
    }

    /// Slots whose filter admits `request`
    pub fn filter(&self, request: &BidRequest) -> ConfigSet {
        let state = self.state.read();
        let mut candidates = state.active.clone();

        for f in &state.filters {
            if candidates.is_empty() {
                break;
            }
            f.filter(request, &mut candidates);
        }

        candidates
    }

    /// Slots whose exchange terms admit `exchange`
    pub fn admitting_exchange(&self, exchange: &str) -> Vec<usize> {
        let state = self.state.read();
        let mut slots: Vec<usize> = state
            .by_slot
            .iter()
            .filter(|(_, f)| f.admits_exchange(exchange))
            .map(|(slot, _)| *slot)
            .collect();
        slots.sort_unstable();
        slots
    }

    pub fn filter_of(&self, slot: usize) -> Option<AgentFilter> {
        self.state.read().by_slot.get(&slot).cloned()
    }

    /// Filter names in evaluation order
    pub fn filter_names(&self) -> Vec<&'static str> {
        self.state.read().filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().active.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FilterPool {
    fn default() -> Self {
        Self::new()
    }
}
