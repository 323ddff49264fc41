// src/agent/bidding_agent.rs
//! Bidding agent handle
//!
//! A [`BiddingAgent`] is the consumer side of one registered agent. It
//! receives events from its own queue and sends bid responses and
//! filter updates back through the dispatcher.
//!
//! Every received event is a [`Delivery`] that must be freed (explicitly
//! or by dropping it). The handle is `Send + Sync`, so one thread may
//! block in `next_event` while another sends responses.

use crate::engine::engine::EngineInner;
use crate::events::event::{BidResponse, Event, OutboundEvent};
use crate::events::ledger::{Delivery, EventLedger};
use crate::filter::AgentFilter;
use crate::registry::{AgentId, AgentState};
use crate::utils::errors::{EngineError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

pub struct BiddingAgent {
    state: Arc<AgentState>,
    engine: Weak<EngineInner>,
    ledger: Arc<EventLedger>,
    released: AtomicBool,
}

impl BiddingAgent {
    pub(crate) fn new(state: Arc<AgentState>, engine: &Arc<EngineInner>) -> Self {
        Self {
            state,
            engine: Arc::downgrade(engine),
            ledger: Arc::clone(&engine.ledger),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> AgentId {
        self.state.id()
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Block until the next event.
    ///
    /// After shutdown the first call returns the `ShutdownSignal` event and
    /// later calls fail with `EngineClosed`. A released agent fails with
    /// `InvalidHandle`.
    pub fn next_event(&self) -> Result<Delivery> {
        let event = self.state.queue().pop_blocking()?;
        Ok(self.deliver(event))
    }

    /// Wait at most `timeout`; `Ok(None)` when nothing arrived
    pub fn next_event_timeout(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let event = self.state.queue().pop_timeout(timeout)?;
        Ok(event.map(|e| self.deliver(e)))
    }

    /// Take the next event if one is queued
    pub fn try_next_event(&self) -> Result<Option<Delivery>> {
        let event = self.state.queue().try_pop()?;
        Ok(event.map(|e| self.deliver(e)))
    }

    /// Await the next event without blocking a thread
    pub async fn next_event_async(&self) -> Result<Delivery> {
        let event = self.state.queue().pop_async().await?;
        Ok(self.deliver(event))
    }

    fn deliver(&self, event: Event) -> Delivery {
        Delivery::new(Arc::clone(&self.ledger), self.state.id(), event)
    }

    /// Return an event to the engine.
    ///
    /// Ownership travels with the `Delivery`, so an event received by
    /// another agent of the same engine is freed against its own ledger.
    pub fn free_event(&self, delivery: Delivery) -> Result<()> {
        if delivery.agent() != self.state.id() {
            debug!("{} frees {} received by {}", self.state.name(), delivery.id(), delivery.agent());
        }
        delivery.free()
    }

    /// Send a bid response or a filter update.
    ///
    /// A response to an auction that is expired, unknown, not offered to
    /// this agent or already answered fails with `StaleAuction` and is not
    /// forwarded. Once the agent is released, by this handle or through
    /// `Engine::release_agent`, every send is `InvalidHandle`.
    pub fn send_event(&self, event: OutboundEvent) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(EngineError::InvalidHandle(format!("{} released", self.state.id())));
        }
        let engine = self.engine.upgrade().ok_or(EngineError::EngineClosed)?;
        if engine.is_closed() {
            return Err(EngineError::EngineClosed);
        }
        engine.dispatcher.submit(&self.state, event)
    }

    /// Shorthand for `send_event(OutboundEvent::BidResponse(..))`
    pub fn bid(&self, response: BidResponse) -> Result<()> {
        self.send_event(OutboundEvent::BidResponse(response))
    }

    /// Replace this agent's subscription filter
    pub fn set_filter(&self, filter: &str) -> Result<()> {
        self.send_event(OutboundEvent::Config {
            filter: filter.to_string(),
        })
    }

    /// Current subscription filter
    pub fn filter(&self) -> Option<AgentFilter> {
        let engine = self.engine.upgrade()?;
        engine.registry.filter_of(self.state.id())
    }

    /// Descriptor readable while this agent has queued events
    pub fn fd(&self) -> i32 {
        self.state.gate().fd()
    }

    /// Events waiting in this agent's queue
    pub fn pending(&self) -> usize {
        self.state.gate().pending()
    }

    /// Deliveries handed out and not yet freed
    pub fn outstanding(&self) -> usize {
        self.ledger.outstanding_for(self.state.id())
    }

    /// Unregister the agent; blocked consumers wake with `InvalidHandle`
    pub fn release(self) -> Result<()> {
        self.unregister()
    }

    pub(crate) fn unregister(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(EngineError::InvalidHandle(format!("{} already released", self.state.id())));
        }

        match self.engine.upgrade() {
            Some(engine) if !engine.is_closed() => engine.registry.unregister(self.state.id()).map(|_| ()),
            _ => {
                debug!("Agent {} released after shutdown", self.state.name());
                Ok(())
            }
        }
    }
}

impl Drop for BiddingAgent {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            let _ = self.unregister();
        }
    }
}

impl fmt::Debug for BiddingAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiddingAgent")
            .field("id", &self.state.id())
            .field("name", &self.state.name())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::events::event::{BidResponse, EventType, OutboundEvent};
    use crate::transport::wire::{InboundMessage, WireBidRequest};
    use crate::utils::config::EngineConfig;
    use crate::utils::errors::EngineError;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn engine() -> Engine {
        let config = EngineConfig::from_json_str(r#"{ "engine": { "worker_threads": 1, "queue_capacity": 4 } }"#)
            .unwrap();
        Engine::from_config(config).unwrap()
    }

    fn request(id: &str, campaign: u64) -> InboundMessage {
        InboundMessage::BidRequest(WireBidRequest {
            auction_id: Some(id.to_string()),
            campaign: Some(campaign),
            tmax_ms: Some(5_000),
            spots: vec![crate::events::event::Spot {
                id: "s1".into(),
                formats: vec![],
                reserve_price: None,
            }],
            ..Default::default()
        })
    }

    #[test]
    fn test_fifo_delivery() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();

        for i in 0..3 {
            assert_eq!(engine.inject(request(&format!("r{}", i), 1)).unwrap(), 1);
        }

        for i in 0..3 {
            let delivery = agent.try_next_event().unwrap().unwrap();
            assert_eq!(delivery.event().auction_id(), Some(format!("r{}", i).as_str()));
            agent.free_event(delivery).unwrap();
        }
        assert!(agent.try_next_event().unwrap().is_none());
        assert_eq!(agent.outstanding(), 0);
    }

    #[test]
    fn test_bid_forwarded_once() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();
        let outbound = engine.local_outbound();

        engine.inject(request("r1", 42)).unwrap();
        let delivery = agent.next_event().unwrap();
        assert_eq!(delivery.event_type(), EventType::BidRequest);

        agent.bid(BidResponse::single("r1", "s1", 1.25)).unwrap();
        assert_eq!(outbound.try_recv().unwrap().auction_id(), "r1");

        let err = agent.bid(BidResponse::single("r1", "s1", 1.25)).unwrap_err();
        assert!(matches!(err, EngineError::StaleAuction { .. }));
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn test_unknown_auction_is_stale() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();
        let err = agent
            .send_event(OutboundEvent::BidResponse(BidResponse::single("nope", "s1", 1.0)))
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleAuction { .. }));
    }

    #[test]
    fn test_set_filter_changes_routing() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();

        agent.set_filter("campaign=7").unwrap();
        assert_eq!(engine.inject(request("r1", 42)).unwrap(), 0);
        assert_eq!(engine.inject(request("r2", 7)).unwrap(), 1);

        assert!(matches!(agent.set_filter("colour=red"), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_release_wakes_blocked_consumer() {
        let engine = engine();
        let agent = Arc::new(engine.create_bidding_agent("a").unwrap());

        let waiter = {
            let agent = Arc::clone(&agent);
            thread::spawn(move || agent.next_event())
        };
        thread::sleep(Duration::from_millis(50));

        engine.release_agent(agent.id()).unwrap();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(EngineError::InvalidHandle(_))));

        // The name is free again
        let _again = engine.create_bidding_agent("a").unwrap();
    }

    #[test]
    fn test_released_through_engine_cannot_bid() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();
        let outbound = engine.local_outbound();

        engine.inject(request("r1", 1)).unwrap();
        let _delivery = agent.try_next_event().unwrap().unwrap();
        engine.release_agent(agent.id()).unwrap();

        let err = agent.bid(BidResponse::single("r1", "s1", 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidHandle(_)));
        assert!(matches!(agent.set_filter("campaign=1"), Err(EngineError::InvalidHandle(_))));
        assert!(outbound.try_recv().is_err());
        assert_eq!(engine.stats().dispatch.responses_forwarded, 0);
    }

    #[test]
    fn test_late_bid_is_reported_in_queue() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();

        let mut wire = WireBidRequest {
            auction_id: Some("late".into()),
            tmax_ms: Some(5),
            ..Default::default()
        };
        wire.spots.push(crate::events::event::Spot {
            id: "s1".into(),
            formats: vec![],
            reserve_price: None,
        });
        engine.inject(InboundMessage::BidRequest(wire)).unwrap();
        agent.free_event(agent.next_event().unwrap()).unwrap();
        thread::sleep(Duration::from_millis(30));

        assert!(matches!(
            agent.bid(BidResponse::single("late", "s1", 1.0)),
            Err(EngineError::StaleAuction { .. })
        ));
        let notice = agent.try_next_event().unwrap().unwrap();
        assert_eq!(notice.event_type(), EventType::Error);
        assert_eq!(notice.event().auction_id(), Some("late"));
    }

    #[test]
    fn test_free_event_of_another_agent() {
        let engine = engine();
        let a = engine.create_bidding_agent("a").unwrap();
        let b = engine.create_bidding_agent("b").unwrap();

        engine.inject(request("r1", 1)).unwrap();
        let delivery = a.try_next_event().unwrap().unwrap();
        assert_eq!(a.outstanding(), 1);

        b.free_event(delivery).unwrap();
        assert_eq!(a.outstanding(), 0);
        assert_eq!(engine.stats().outstanding_events, 0);
    }

    #[test]
    fn test_double_release() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();
        let id = agent.id();

        agent.release().unwrap();
        assert!(matches!(engine.release_agent(id), Err(EngineError::InvalidHandle(_))));
    }

    #[test]
    fn test_shutdown_signal_then_closed() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();
        engine.inject(request("r1", 1)).unwrap();

        engine.shutdown().unwrap();

        let delivery = agent.next_event().unwrap();
        assert_eq!(delivery.event_type(), EventType::ShutdownSignal);
        assert!(matches!(agent.next_event(), Err(EngineError::EngineClosed)));
        assert!(matches!(agent.bid(BidResponse::pass("r1")), Err(EngineError::EngineClosed)));
    }

    #[tokio::test]
    async fn test_async_next_event() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();

        let handle = tokio::spawn(async move {
            let delivery = agent.next_event_async().await.unwrap();
            delivery.event().auction_id().map(str::to_string)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.inject(request("r1", 1)).unwrap();

        let id = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_pending_tracks_queue() {
        let engine = engine();
        let agent = engine.create_bidding_agent("a").unwrap();

        engine.inject(request("r1", 1)).unwrap();
        engine.inject(request("r2", 1)).unwrap();
        assert_eq!(agent.pending(), 2);
        assert_eq!(engine.stats().pending_events, 2);

        let _d = agent.try_next_event().unwrap().unwrap();
        assert_eq!(agent.pending(), 1);
        assert_eq!(agent.outstanding(), 1);
    }
}
