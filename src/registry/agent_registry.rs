// src/registry/agent_registry.rs
//! Generation-checked arena of registered agents
//!
//! # Architecture
//!
//! ```text
//! AgentRegistry
//! ├─ slots: [Slot{gen, Some(agent)}, Slot{gen, None}, ...]
//! ├─ free:  [1, ...]                 (reusable slot indices)
//! ├─ names: {"camp42" -> 0, ...}
//! └─ pool:  FilterPool               (subscription per slot)
//! ```
//!
//! Registration, release and filter changes take the write lock, so the
//! name map, the slot table and the filter pool always change together.
//! Dispatch only takes the read lock.

use crate::events::event::ShutdownReason;
use crate::events::queue::AgentQueue;
use crate::filter::{AgentFilter, FilterPool};
use crate::observability::REGISTERED_AGENTS;
use crate::readiness::ReadinessGate;
use crate::registry::AgentId;
use crate::utils::errors::{EngineError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Outbound activity of one agent
#[derive(Debug, Default)]
pub struct AgentCounters {
    /// Bid responses forwarded to an exchange
    pub bids_forwarded: AtomicU64,

    /// Responses without bids
    pub passes: AtomicU64,

    /// Responses rejected as stale or over limits
    pub rejected: AtomicU64,
}

/// Everything the engine keeps about one agent
pub struct AgentState {
    id: AgentId,
    name: String,
    queue: Arc<AgentQueue>,
    gate: Arc<ReadinessGate>,
    pub counters: AgentCounters,
}

impl AgentState {
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<AgentQueue> {
        &self.queue
    }

    /// Per-agent readiness
    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }
}

impl fmt::Debug for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.queue.len())
            .finish()
    }
}

struct Slot {
    generation: u32,
    agent: Option<Arc<AgentState>>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    names: HashMap<String, u32>,
}

/// Registry of live agents
pub struct AgentRegistry {
    arena: RwLock<Arena>,
    pool: Arc<FilterPool>,
    engine_gate: Arc<ReadinessGate>,
    queue_capacity: usize,
}

impl AgentRegistry {
    /// Create a registry whose queues also report to `engine_gate`
    pub fn new(pool: Arc<FilterPool>, engine_gate: Arc<ReadinessGate>, queue_capacity: usize) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            pool,
            engine_gate,
            queue_capacity,
        }
    }

    /// Register a new agent under a unique name
    pub fn register(&self, name: &str, filter: AgentFilter) -> Result<Arc<AgentState>> {
        if name.is_empty() {
            return Err(EngineError::Config("agent name must not be empty".into()));
        }

        // Allocated outside the lock; dropped again on a duplicate name
        let gate = Arc::new(ReadinessGate::with_platform_signal()?);
        let queue = Arc::new(AgentQueue::new(
            self.queue_capacity,
            vec![Arc::clone(&gate), Arc::clone(&self.engine_gate)],
        ));

        let mut arena = self.arena.write();
        if arena.names.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }

        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    agent: None,
                });
                (arena.slots.len() - 1) as u32
            }
        };

        let slot = &mut arena.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1).max(1);
        let id = AgentId::new(index, slot.generation);

        let state = Arc::new(AgentState {
            id,
            name: name.to_string(),
            queue,
            gate,
            counters: AgentCounters::default(),
        });
        slot.agent = Some(Arc::clone(&state));
        arena.names.insert(name.to_string(), index);
        self.pool.add_agent(id.slot(), &filter);

        metrics::gauge!(REGISTERED_AGENTS).set(arena.names.len() as f64);
        info!("Registered agent {} as {} ({})", name, id, filter);
        Ok(state)
    }

    /// Unregister an agent and close its queue.
    ///
    /// Fails with `InvalidHandle` when `id` was already released.
    pub fn unregister(&self, id: AgentId) -> Result<Arc<AgentState>> {
        let state = {
            let mut arena = self.arena.write();
            let state = match arena.slots.get_mut(id.slot()) {
                Some(slot) if slot.generation == id.generation() => slot.agent.take(),
                _ => None,
            }
            .ok_or_else(|| EngineError::InvalidHandle(format!("{} is not registered", id)))?;

            arena.names.remove(state.name());
            arena.free.push(id.index());
            self.pool.remove_agent(id.slot());
            metrics::gauge!(REGISTERED_AGENTS).set(arena.names.len() as f64);
            state
        };

        let discarded = state.queue.close(None);
        info!("Released agent {} ({} queued events discarded)", state.name(), discarded);
        Ok(state)
    }

    /// Replace the subscription filter of a live agent
    pub fn set_filter(&self, id: AgentId, filter: AgentFilter) -> Result<()> {
        let arena = self.arena.write();
        if Self::resolve(&arena, id).is_none() {
            return Err(EngineError::InvalidHandle(format!("{} is not registered", id)));
        }

        debug!("Updating filter of {} to {}", id, filter);
        self.pool.add_agent(id.slot(), &filter);
        Ok(())
    }

    pub fn filter_of(&self, id: AgentId) -> Option<AgentFilter> {
        let arena = self.arena.read();
        Self::resolve(&arena, id)?;
        self.pool.filter_of(id.slot())
    }

    /// Resolve a handle; stale generations are `InvalidHandle`
    pub fn get(&self, id: AgentId) -> Result<Arc<AgentState>> {
        Self::resolve(&self.arena.read(), id)
            .ok_or_else(|| EngineError::InvalidHandle(format!("{} is not registered", id)))
    }

    /// Agent currently occupying a slot
    pub fn by_slot(&self, slot: usize) -> Option<Arc<AgentState>> {
        self.arena.read().slots.get(slot)?.agent.clone()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<AgentState>> {
        let arena = self.arena.read();
        let index = *arena.names.get(name)?;
        arena.slots.get(index as usize)?.agent.clone()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        Self::resolve(&self.arena.read(), id).is_some()
    }

    /// Snapshot of every live agent
    pub fn agents(&self) -> Vec<Arc<AgentState>> {
        self.arena
            .read()
            .slots
            .iter()
            .filter_map(|s| s.agent.clone())
            .collect()
    }

    /// Close every queue for shutdown; returns the total discarded
    pub fn close_all(&self, reason: ShutdownReason) -> u64 {
        self.agents()
            .iter()
            .map(|agent| agent.queue.close(Some(reason)))
            .sum()
    }

    pub fn pool(&self) -> &Arc<FilterPool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.arena.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(arena: &Arena, id: AgentId) -> Option<Arc<AgentState>> {
        let slot = arena.slots.get(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.agent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::fixtures::bid_request;
    use crate::events::event::Event;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(FilterPool::new()), Arc::new(ReadinessGate::new()), 16)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        let a = registry.register("alpha", AgentFilter::any()).unwrap();
        let b = registry.register("beta", "campaign=42".parse().unwrap()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.get(a.id()).unwrap().name(), "alpha");
        assert_eq!(registry.by_name("beta").unwrap().id(), b.id());
        assert_eq!(registry.by_slot(b.id().slot()).unwrap().name(), "beta");
        assert_eq!(registry.filter_of(b.id()).unwrap().to_string(), "campaign=42");
    }

    #[test]
    fn test_duplicate_name() {
        let registry = registry();
        registry.register("alpha", AgentFilter::any()).unwrap();

        let err = registry.register("alpha", AgentFilter::any()).unwrap_err();
        assert_eq!(err, EngineError::DuplicateName("alpha".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_lookup_reports_state() {
        let registry = registry();
        let agent = registry.register("alpha", AgentFilter::any()).unwrap();
        assert!(format!("{:?}", agent).contains("alpha"));

        registry.unregister(agent.id()).unwrap();
        let err = registry.get(agent.id()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidHandle(_)));
    }

    #[test]
    fn test_double_release() {
        let registry = registry();
        let agent = registry.register("alpha", AgentFilter::any()).unwrap();

        registry.unregister(agent.id()).unwrap();
        let err = registry.unregister(agent.id()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidHandle(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_rejects_stale_id() {
        let registry = registry();
        let old = registry.register("alpha", AgentFilter::any()).unwrap();
        registry.unregister(old.id()).unwrap();

        let new = registry.register("alpha", AgentFilter::any()).unwrap();
        assert_eq!(new.id().index(), old.id().index());
        assert_ne!(new.id().generation(), old.id().generation());

        assert!(registry.get(old.id()).is_err());
        assert!(registry.unregister(old.id()).is_err());
        assert!(registry.contains(new.id()));
    }

    #[test]
    fn test_release_closes_queue_and_pool_slot() {
        let registry = registry();
        let agent = registry.register("alpha", AgentFilter::any()).unwrap();
        agent.queue().push(Event::BidRequest(Arc::new(bid_request("a1", None))));

        registry.unregister(agent.id()).unwrap();
        assert!(!agent.queue().is_open());
        assert!(registry.pool().filter(&bid_request("a2", None)).is_empty());
        assert!(matches!(agent.queue().try_pop(), Err(EngineError::InvalidHandle(_))));
    }

    #[test]
    fn test_set_filter() {
        let registry = registry();
        let agent = registry.register("alpha", "campaign=1".parse().unwrap()).unwrap();

        registry.set_filter(agent.id(), "campaign=2".parse().unwrap()).unwrap();
        assert!(registry.pool().filter(&bid_request("a", Some(2))).test(agent.id().slot()));

        registry.unregister(agent.id()).unwrap();
        assert!(registry.set_filter(agent.id(), AgentFilter::any()).is_err());
    }

    #[test]
    fn test_close_all() {
        let registry = registry();
        let a = registry.register("alpha", AgentFilter::any()).unwrap();
        registry.register("beta", AgentFilter::any()).unwrap();
        a.queue().push(Event::BidRequest(Arc::new(bid_request("a1", None))));

        assert_eq!(registry.close_all(ShutdownReason::EngineShutdown), 1);
        assert!(registry.agents().iter().all(|s| !s.queue().is_open()));
    }

    proptest! {
        #[test]
        fn prop_registry_size_tracks_distinct_names(names in prop::collection::vec("[a-d]{1,2}", 0..24)) {
            let registry = registry();
            let mut duplicates = 0;

            for name in &names {
                match registry.register(name, AgentFilter::any()) {
                    Ok(_) => {}
                    Err(EngineError::DuplicateName(n)) => {
                        prop_assert_eq!(&n, name);
                        duplicates += 1;
                    }
                    Err(e) => prop_assert!(false, "unexpected error {}", e),
                }
            }

            let distinct: HashSet<&String> = names.iter().collect();
            prop_assert_eq!(registry.len(), distinct.len());
            prop_assert_eq!(duplicates, names.len() - distinct.len());
        }
    }
}
