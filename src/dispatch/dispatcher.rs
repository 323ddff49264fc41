// src/dispatch/dispatcher.rs
//! Inbound classification and outbound forwarding
//!
//! # Inbound
//!
//! ```text
//! BidRequest ──► expired? ──► FilterPool ──► AuctionBook.open ──► push Arc copy per agent
//!                                                 └─ (exchange, id) already live ──► counted, dropped
//! Win/Loss   ──► explicit agent | recorded bidders ──► push
//! ```
//!
//! # Outbound
//!
//! Only registered agents may send. `BidResponse` passes the risk limits,
//! is claimed in the auction book (live, offered to this agent, first
//! answer, before deadline) and is forwarded through the [`OutboundSink`]
//! to the connection the auction came from. A response after the deadline
//! also queues `Error{LateBid}` for the agent. `Config` replaces the
//! agent's subscription filter.

use crate::dispatch::auction_book::{AuctionBook, SweepReport, DEADLINE_PASSED};
use crate::dispatch::Origin;
use crate::events::event::{
    BidRequest, BidResponse, ErrorEvent, Event, LossNotification, OutboundEvent, WinNotification,
};
use crate::events::queue::PushOutcome;
use crate::filter::AgentFilter;
use crate::observability::{
    BID_REQUESTS_DISPATCHED, BID_REQUESTS_DUPLICATE, BID_REQUESTS_EXPIRED, BID_REQUESTS_RECEIVED, BID_REQUESTS_UNMATCHED,
    BID_RESPONSES_FORWARDED, BID_RESPONSES_REJECTED, NOTIFICATIONS_ROUTED, NOTIFICATIONS_UNROUTED,
    PROTOCOL_ERRORS, QUEUE_OVERFLOWS,
};
use crate::registry::{AgentId, AgentRegistry, AgentState};
use crate::transport::wire::{InboundMessage, OutboundMessage};
use crate::utils::config::RiskLimits;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Destination of forwarded bid responses
pub trait OutboundSink: Send + Sync {
    fn forward(&self, origin: &Origin, message: OutboundMessage) -> Result<()>;
}

/// Dispatcher tuning taken from the engine configuration
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub risk: RiskLimits,
    pub default_tmax: Duration,
    pub win_window: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            risk: RiskLimits::default(),
            default_tmax: Duration::from_millis(100),
            win_window: Duration::from_secs(900),
        }
    }
}

/// Dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub requests_received: u64,
    /// Requests delivered to at least one agent
    pub requests_dispatched: u64,
    pub requests_unmatched: u64,
    /// Requests already past their deadline on arrival
    pub requests_expired: u64,
    /// Requests whose (exchange, auction id) was already live
    pub requests_duplicate: u64,
    /// Events accepted by agent queues
    pub deliveries: u64,
    pub queue_overflows: u64,
    pub responses_forwarded: u64,
    pub passes: u64,
    pub late_bids: u64,
    pub responses_rejected: u64,
    pub wins_routed: u64,
    pub losses_routed: u64,
    pub notifications_unrouted: u64,
    pub protocol_errors: u64,
}

#[derive(Default)]
struct Counters {
    requests_received: AtomicU64,
    requests_dispatched: AtomicU64,
    requests_unmatched: AtomicU64,
    requests_expired: AtomicU64,
    requests_duplicate: AtomicU64,
    deliveries: AtomicU64,
    queue_overflows: AtomicU64,
    responses_forwarded: AtomicU64,
    passes: AtomicU64,
    late_bids: AtomicU64,
    responses_rejected: AtomicU64,
    wins_routed: AtomicU64,
    losses_routed: AtomicU64,
    notifications_unrouted: AtomicU64,
    protocol_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    book: AuctionBook,
    sink: Arc<dyn OutboundSink>,
    settings: DispatchSettings,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(registry: Arc<AgentRegistry>, sink: Arc<dyn OutboundSink>, settings: DispatchSettings) -> Self {
        Self {
            registry,
            book: AuctionBook::new(settings.win_window),
            sink,
            settings,
            counters: Counters::default(),
        }
    }

    /// Route one decoded frame; returns the number of agents reached.
    ///
    /// A bid request that cannot be built is counted as a protocol error.
    pub fn dispatch_message(&self, message: InboundMessage, exchange: &str, origin: Origin) -> Result<usize> {
        match message {
            InboundMessage::BidRequest(wire) => {
                let request = wire
                    .into_request(exchange, self.settings.default_tmax, Utc::now())
                    .map_err(|e| {
                        self.record_protocol_error(exchange, &e);
                        e
                    })?;
                Ok(self.dispatch_bid_request(request, origin))
            }
            InboundMessage::Win(win) => Ok(self.route_win(win)),
            InboundMessage::Loss(loss) => Ok(self.route_loss(loss)),
        }
    }

    /// Fan a bid request out to every agent whose filter admits it
    pub fn dispatch_bid_request(&self, request: BidRequest, origin: Origin) -> usize {
        bump(&self.counters.requests_received);
        metrics::counter!(BID_REQUESTS_RECEIVED).increment(1);

        if request.is_expired(Utc::now()) {
            bump(&self.counters.requests_expired);
            metrics::counter!(BID_REQUESTS_EXPIRED).increment(1);
            debug!("Dropping expired auction {}", request.auction_id);
            return 0;
        }

        let agents: Vec<Arc<AgentState>> = self
            .registry
            .pool()
            .filter(&request)
            .iter()
            .filter_map(|slot| self.registry.by_slot(slot))
            .collect();

        if agents.is_empty() {
            bump(&self.counters.requests_unmatched);
            metrics::counter!(BID_REQUESTS_UNMATCHED).increment(1);
            trace!("No agent for auction {}", request.auction_id);
            return 0;
        }

        // Opened before the push so an immediate response finds the auction
        let request = Arc::new(request);
        if !self.book.open(Arc::clone(&request), origin, agents.iter().map(|a| a.id()).collect()) {
            bump(&self.counters.requests_duplicate);
            metrics::counter!(BID_REQUESTS_DUPLICATE).increment(1);
            warn!(
                "Auction {} from {} is already live, dropping the duplicate",
                request.auction_id, request.exchange
            );
            return 0;
        }

        let delivered = agents
            .iter()
            .filter(|agent| self.deliver(agent, Event::BidRequest(Arc::clone(&request))))
            .count();

        if delivered > 0 {
            bump(&self.counters.requests_dispatched);
            metrics::counter!(BID_REQUESTS_DISPATCHED).increment(delivered as u64);
        }
        delivered
    }

    pub fn route_win(&self, win: WinNotification) -> usize {
        let targets = self.notification_targets(
            &win.auction_id,
            win.spot_id.as_deref(),
            win.agent.as_deref(),
            win.exchange.as_deref(),
        );
        let win = Arc::new(win);
        let delivered = targets
            .iter()
            .filter(|agent| self.deliver(agent, Event::WinNotification(Arc::clone(&win))))
            .count();

        self.count_notification(delivered, &self.counters.wins_routed, &win.auction_id);
        delivered
    }

    pub fn route_loss(&self, loss: LossNotification) -> usize {
        let targets = self.notification_targets(
            &loss.auction_id,
            loss.spot_id.as_deref(),
            loss.agent.as_deref(),
            loss.exchange.as_deref(),
        );
        let loss = Arc::new(loss);
        let delivered = targets
            .iter()
            .filter(|agent| self.deliver(agent, Event::LossNotification(Arc::clone(&loss))))
            .count();

        self.count_notification(delivered, &self.counters.losses_routed, &loss.auction_id);
        delivered
    }

    fn notification_targets(
        &self,
        auction_id: &str,
        spot_id: Option<&str>,
        agent: Option<&str>,
        exchange: Option<&str>,
    ) -> Vec<Arc<AgentState>> {
        if let Some(name) = agent {
            return self.registry.by_name(name).into_iter().collect();
        }

        self.book
            .bidders(auction_id, spot_id, exchange)
            .into_iter()
            .filter_map(|id| self.registry.get(id).ok())
            .collect()
    }

    fn count_notification(&self, delivered: usize, routed: &AtomicU64, auction_id: &str) {
        if delivered > 0 {
            routed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(NOTIFICATIONS_ROUTED).increment(1);
        } else {
            bump(&self.counters.notifications_unrouted);
            metrics::counter!(NOTIFICATIONS_UNROUTED).increment(1);
            debug!("No recipient for notification of auction {}", auction_id);
        }
    }

    /// Validate and act on an event sent by `agent`; a released agent is `InvalidHandle`
    pub fn submit(&self, agent: &AgentState, event: OutboundEvent) -> Result<()> {
        let agent = self.registry.get(agent.id())?;
        match event {
            OutboundEvent::BidResponse(response) => self.submit_response(&agent, response, Utc::now()),
            OutboundEvent::Config { filter } => {
                let filter: AgentFilter = filter.parse()?;
                self.registry.set_filter(agent.id(), filter)
            }
        }
    }

    fn submit_response(&self, agent: &AgentState, response: BidResponse, now: DateTime<Utc>) -> Result<()> {
        if let Err(e) = self.check_risk(&response) {
            self.reject(agent, &e);
            return Err(e);
        }

        let claim = match self.book.claim(&response, agent.id(), now) {
            Ok(claim) => claim,
            Err(e) => {
                if let EngineError::StaleAuction { reason, .. } = &e {
                    bump(&self.counters.late_bids);
                    if reason == DEADLINE_PASSED {
                        let late = ErrorEvent::late_bid(&response.auction_id, response.exchange.as_deref());
                        self.deliver(agent, Event::Error(late));
                    }
                }
                self.reject(agent, &e);
                return Err(e);
            }
        };

        if response.bids.is_empty() {
            bump(&self.counters.passes);
            agent.counters.passes.fetch_add(1, Ordering::Relaxed);
            trace!("{} passed on {}", agent.name(), response.auction_id);
            return Ok(());
        }

        let spots = response.bids.iter().map(|b| b.spot_id.clone()).collect();
        self.sink.forward(
            &claim.origin,
            OutboundMessage::BidResponse {
                auction_id: response.auction_id.clone(),
                agent: agent.name().to_string(),
                bids: response.bids,
            },
        )?;
        self.book.record_bid(&claim.request, agent.id(), spots);

        bump(&self.counters.responses_forwarded);
        agent.counters.bids_forwarded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(BID_RESPONSES_FORWARDED).increment(1);
        debug!("Forwarded bid of {} on {} to {}", agent.name(), response.auction_id, claim.origin);
        Ok(())
    }

    fn check_risk(&self, response: &BidResponse) -> Result<()> {
        let risk = &self.settings.risk;

        if response.bids.len() > risk.max_bids_per_response {
            return Err(EngineError::RiskLimit(format!(
                "{} bids exceed the limit of {}",
                response.bids.len(),
                risk.max_bids_per_response
            )));
        }

        for bid in &response.bids {
            if !bid.price.is_finite() || bid.price < 0.0 {
                return Err(EngineError::RiskLimit(format!("invalid price {} on spot {}", bid.price, bid.spot_id)));
            }
            if bid.price > risk.max_bid_price {
                return Err(EngineError::RiskLimit(format!(
                    "price {} on spot {} exceeds {}",
                    bid.price, bid.spot_id, risk.max_bid_price
                )));
            }
        }
        Ok(())
    }

    fn reject(&self, agent: &AgentState, error: &EngineError) {
        bump(&self.counters.responses_rejected);
        agent.counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(BID_RESPONSES_REJECTED).increment(1);
        debug!("Rejected response from {}: {}", agent.name(), error);
    }

    /// Queue a transport error for every agent subscribed to `exchange`
    pub fn broadcast_transport_error(&self, exchange: &str, message: &str) -> usize {
        let error = ErrorEvent::transport(exchange, message);
        let delivered = self
            .registry
            .pool()
            .admitting_exchange(exchange)
            .into_iter()
            .filter_map(|slot| self.registry.by_slot(slot))
            .filter(|agent| self.deliver(agent, Event::Error(error.clone())))
            .count();

        warn!("Transport failure on {} reported to {} agents: {}", exchange, delivered, message);
        delivered
    }

    /// Count and log a malformed frame
    pub fn record_protocol_error(&self, exchange: &str, error: &EngineError) {
        bump(&self.counters.protocol_errors);
        metrics::counter!(PROTOCOL_ERRORS, "exchange" => exchange.to_string()).increment(1);
        warn!("Malformed frame from {}: {}", exchange, error);
    }

    /// Evict finished auctions and old bid records
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        self.book.sweep(now)
    }

    pub fn book(&self) -> &AuctionBook {
        &self.book
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Look up a live agent
    pub fn agent(&self, id: AgentId) -> Result<Arc<AgentState>> {
        self.registry.get(id)
    }

    fn deliver(&self, agent: &AgentState, event: Event) -> bool {
        match agent.queue().push(event) {
            PushOutcome::Queued => {
                bump(&self.counters.deliveries);
                true
            }
            PushOutcome::Full => {
                bump(&self.counters.queue_overflows);
                metrics::counter!(QUEUE_OVERFLOWS, "agent" => agent.name().to_string()).increment(1);
                false
            }
            PushOutcome::Closed => false,
        }
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        DispatchStats {
            requests_received: load(&c.requests_received),
            requests_dispatched: load(&c.requests_dispatched),
            requests_unmatched: load(&c.requests_unmatched),
            requests_expired: load(&c.requests_expired),
            requests_duplicate: load(&c.requests_duplicate),
            deliveries: load(&c.deliveries),
            queue_overflows: load(&c.queue_overflows),
            responses_forwarded: load(&c.responses_forwarded),
            passes: load(&c.passes),
            late_bids: load(&c.late_bids),
            responses_rejected: load(&c.responses_rejected),
            wins_routed: load(&c.wins_routed),
            losses_routed: load(&c.losses_routed),
            notifications_unrouted: load(&c.notifications_unrouted),
            protocol_errors: load(&c.protocol_errors),
        }
    }

    pub fn log_summary(&self) {
        let s = self.stats();
        info!(
            "Dispatch summary: {} received, {} dispatched, {} unmatched, {} expired, {} forwarded, {} late",
            s.requests_received,
            s.requests_dispatched,
            s.requests_unmatched,
            s.requests_expired,
            s.responses_forwarded,
            s.late_bids
        );
    }
}
