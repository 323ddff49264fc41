// src/dispatch/auction_book.rs
//! Live auctions and forwarded bids
//!
//! A live auction remembers who it was offered to, who already answered
//! and which connection it came from. Once a bid is forwarded, a bid
//! record keeps the auction routable for win/loss notifications until the
//! win window closes.
//!
//! Auction ids are unique per exchange only, so entries are grouped by id
//! and told apart by exchange:
//!
//! ```text
//! "a1" ──► [ (x1, Connection(1), offered {a}) , (x2, Connection(2), offered {b}) ]
//! ```

use crate::dispatch::Origin;
use crate::events::event::{BidRequest, BidResponse};
use crate::registry::AgentId;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// `StaleAuction` reason for a response after the deadline
pub const DEADLINE_PASSED: &str = "deadline passed";

struct LiveAuction {
    request: Arc<BidRequest>,
    origin: Origin,
    offered: Vec<AgentId>,
    answered: Vec<AgentId>,
}

#[derive(Debug, Clone)]
struct BidRecord {
    agent: AgentId,
    exchange: String,
    spots: Vec<String>,
    expires: Instant,
}

/// A response accepted for forwarding
#[derive(Debug, Clone)]
pub struct Claim {
    pub origin: Origin,
    pub request: Arc<BidRequest>,
}

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub auctions_evicted: usize,
    pub bids_evicted: usize,
}

fn matches_exchange(exchange: Option<&str>, candidate: &str) -> bool {
    exchange.map_or(true, |x| x == candidate)
}

pub struct AuctionBook {
    live: DashMap<String, Vec<LiveAuction>>,
    bids: DashMap<String, Vec<BidRecord>>,
    win_window: Duration,
}

impl AuctionBook {
    pub fn new(win_window: Duration) -> Self {
        Self {
            live: DashMap::new(),
            bids: DashMap::new(),
            win_window,
        }
    }

    /// Track an auction offered to `offered`.
    ///
    /// Returns false, leaving the book unchanged, when the same exchange
    /// already has a live auction with this id.
    pub fn open(&self, request: Arc<BidRequest>, origin: Origin, offered: Vec<AgentId>) -> bool {
        let now = Utc::now();
        let mut entries = self.live.entry(request.auction_id.clone()).or_default();
        entries.retain(|a| a.request.exchange != request.exchange || !a.request.is_expired(now));

        if entries.iter().any(|a| a.request.exchange == request.exchange) {
            return false;
        }
        entries.push(LiveAuction {
            request,
            origin,
            offered,
            answered: Vec::new(),
        });
        true
    }

    /// Accept `response` from `agent`, at most once per agent and auction.
    ///
    /// The response goes to the auction with its id that was offered to
    /// `agent`, restricted to `response.exchange` when set. Expired,
    /// unknown, foreign or repeated responses are `StaleAuction`.
    pub fn claim(&self, response: &BidResponse, agent: AgentId, now: DateTime<Utc>) -> Result<Claim> {
        let auction_id = &response.auction_id;
        let exchange = response.exchange.as_deref();
        let mut entries = self
            .live
            .get_mut(auction_id)
            .ok_or_else(|| EngineError::stale(auction_id, "unknown or expired auction"))?;

        if !entries.iter().any(|a| matches_exchange(exchange, &a.request.exchange)) {
            return Err(EngineError::stale(auction_id, "unknown or expired auction"));
        }

        let offered: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, a)| matches_exchange(exchange, &a.request.exchange) && a.offered.contains(&agent))
            .map(|(i, _)| i)
            .collect();
        if offered.is_empty() {
            return Err(EngineError::stale(auction_id, "auction was not offered to this agent"));
        }

        let unanswered: Vec<usize> = offered
            .into_iter()
            .filter(|&i| !entries[i].answered.contains(&agent))
            .collect();
        if unanswered.is_empty() {
            return Err(EngineError::stale(auction_id, "already answered"));
        }

        let index = unanswered
            .into_iter()
            .find(|&i| !entries[i].request.is_expired(now))
            .ok_or_else(|| EngineError::stale(auction_id, DEADLINE_PASSED))?;

        let auction = &mut entries[index];
        if let Some(bid) = response.bids.iter().find(|b| !auction.request.has_spot(&b.spot_id)) {
            return Err(EngineError::Protocol(format!(
                "auction {} has no spot {}",
                auction_id, bid.spot_id
            )));
        }

        auction.answered.push(agent);
        Ok(Claim {
            origin: auction.origin,
            request: Arc::clone(&auction.request),
        })
    }

    /// Remember a forwarded bid for notification routing
    pub fn record_bid(&self, request: &BidRequest, agent: AgentId, spots: Vec<String>) {
        self.bids
            .entry(request.auction_id.clone())
            .or_default()
            .push(BidRecord {
                agent,
                exchange: request.exchange.clone(),
                spots,
                expires: Instant::now() + self.win_window,
            });
    }

    /// Agents that bid on `auction_id`, restricted to `spot_id` and `exchange` when given
    pub fn bidders(&self, auction_id: &str, spot_id: Option<&str>, exchange: Option<&str>) -> Vec<AgentId> {
        let Some(records) = self.bids.get(auction_id) else {
            return Vec::new();
        };

        let mut agents: Vec<AgentId> = records
            .iter()
            .filter(|r| matches_exchange(exchange, &r.exchange))
            .filter(|r| spot_id.map(|s| r.spots.iter().any(|x| x == s)).unwrap_or(true))
            .map(|r| r.agent)
            .collect();
        agents.dedup();
        agents
    }

    /// Evict expired auctions and bid records past the win window
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut auctions_evicted = 0;
        self.live.retain(|_, entries| {
            let len = entries.len();
            entries.retain(|a| !a.request.is_expired(now));
            auctions_evicted += len - entries.len();
            !entries.is_empty()
        });

        let instant = Instant::now();
        let mut bids_evicted = 0;
        self.bids.retain(|_, records| {
            let len = records.len();
            records.retain(|r| r.expires > instant);
            bids_evicted += len - records.len();
            !records.is_empty()
        });

        if auctions_evicted > 0 || bids_evicted > 0 {
            debug!(
                "Swept {} auctions and {} bid records",
                auctions_evicted, bids_evicted
            );
        }

        SweepReport {
            auctions_evicted,
            bids_evicted,
        }
    }

    pub fn is_live(&self, auction_id: &str) -> bool {
        self.live.get(auction_id).is_some_and(|entries| !entries.is_empty())
    }

    pub fn live_count(&self) -> usize {
        self.live.iter().map(|e| e.value().len()).sum()
    }

    pub fn bid_record_count(&self) -> usize {
        self.bids.iter().map(|r| r.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::fixtures::bid_request;

    fn book_with(auction_id: &str, offered: &[AgentId]) -> (AuctionBook, Arc<BidRequest>) {
        let book = AuctionBook::new(Duration::from_secs(60));
        let request = Arc::new(bid_request(auction_id, None));
        book.open(Arc::clone(&request), Origin::Local, offered.to_vec());
        (book, request)
    }

    #[test]
    fn test_claim_once() {
        let agent = AgentId::new(0, 1);
        let (book, request) = book_with("a1", &[agent]);
        let response = BidResponse::single("a1", "spot-1", 1.0);

        let claim = book.claim(&response, agent, request.timestamp).unwrap();
        assert_eq!(claim.origin, Origin::Local);

        let err = book.claim(&response, agent, request.timestamp).unwrap_err();
        assert!(matches!(err, EngineError::StaleAuction { ref reason, .. } if reason == "already answered"));
    }

    #[test]
    fn test_claim_rejections() {
        let agent = AgentId::new(0, 1);
        let stranger = AgentId::new(1, 1);
        let (book, request) = book_with("a1", &[agent]);
        let response = BidResponse::single("a1", "spot-1", 1.0);

        let late = request.deadline + chrono::Duration::milliseconds(1);
        assert!(matches!(
            book.claim(&response, agent, late),
            Err(EngineError::StaleAuction { ref reason, .. }) if reason == DEADLINE_PASSED
        ));
        assert!(matches!(
            book.claim(&response, stranger, request.timestamp),
            Err(EngineError::StaleAuction { .. })
        ));
        assert!(matches!(
            book.claim(&BidResponse::pass("nope"), agent, request.timestamp),
            Err(EngineError::StaleAuction { .. })
        ));
        assert!(matches!(
            book.claim(&BidResponse::single("a1", "spot-9", 1.0), agent, request.timestamp),
            Err(EngineError::Protocol(_))
        ));

        // Rejections do not consume the agent's answer
        assert!(book.claim(&response, agent, request.timestamp).is_ok());
    }

    #[test]
    fn test_bidders_by_spot() {
        let book = AuctionBook::new(Duration::from_secs(60));
        let request = bid_request("a1", None);
        let a = AgentId::new(0, 1);
        let b = AgentId::new(1, 1);
        book.record_bid(&request, a, vec!["s1".into()]);
        book.record_bid(&request, b, vec!["s2".into()]);

        assert_eq!(book.bidders("a1", Some("s2"), None), vec![b]);
        assert_eq!(book.bidders("a1", None, None), vec![a, b]);
        assert!(book.bidders("a2", None, None).is_empty());
        assert!(book.bidders("a1", None, Some("elsewhere")).is_empty());
        assert_eq!(book.bid_record_count(), 2);
    }

    fn request_on(auction_id: &str, exchange: &str) -> Arc<BidRequest> {
        let mut request = bid_request(auction_id, None);
        request.exchange = exchange.to_string();
        Arc::new(request)
    }

    #[test]
    fn test_same_id_on_two_exchanges() {
        let book = AuctionBook::new(Duration::from_secs(60));
        let a = AgentId::new(0, 1);
        let b = AgentId::new(1, 1);
        let first = request_on("same", "x1");
        assert!(book.open(Arc::clone(&first), Origin::Connection(1), vec![a]));
        assert!(book.open(request_on("same", "x2"), Origin::Connection(2), vec![b]));
        assert_eq!(book.live_count(), 2);

        let now = first.timestamp;
        let claim = book.claim(&BidResponse::single("same", "spot-1", 1.0), a, now).unwrap();
        assert_eq!(claim.origin, Origin::Connection(1));
        assert_eq!(claim.request.exchange, "x1");

        let claim = book.claim(&BidResponse::single("same", "spot-1", 1.0), b, now).unwrap();
        assert_eq!(claim.origin, Origin::Connection(2));

        book.record_bid(&first, a, vec!["spot-1".into()]);
        book.record_bid(&claim.request, b, vec!["spot-1".into()]);
        assert_eq!(book.bidders("same", None, Some("x2")), vec![b]);
    }

    #[test]
    fn test_exchange_hint_picks_the_auction() {
        let book = AuctionBook::new(Duration::from_secs(60));
        let agent = AgentId::new(0, 1);
        let first = request_on("same", "x1");
        book.open(Arc::clone(&first), Origin::Connection(1), vec![agent]);
        book.open(request_on("same", "x2"), Origin::Connection(2), vec![agent]);

        let response = BidResponse::single("same", "spot-1", 1.0).on_exchange("x2");
        let claim = book.claim(&response, agent, first.timestamp).unwrap();
        assert_eq!(claim.origin, Origin::Connection(2));

        assert!(matches!(
            book.claim(&response, agent, first.timestamp),
            Err(EngineError::StaleAuction { ref reason, .. }) if reason == "already answered"
        ));
        let unknown = BidResponse::pass("same").on_exchange("x3");
        assert!(matches!(book.claim(&unknown, agent, first.timestamp), Err(EngineError::StaleAuction { .. })));
    }

    #[test]
    fn test_duplicate_live_id_is_refused() {
        let agent = AgentId::new(0, 1);
        let stranger = AgentId::new(1, 1);
        let (book, request) = book_with("a1", &[agent]);

        assert!(!book.open(Arc::new(bid_request("a1", None)), Origin::Connection(9), vec![stranger]));
        assert_eq!(book.live_count(), 1);

        let claim = book.claim(&BidResponse::single("a1", "spot-1", 1.0), agent, request.timestamp).unwrap();
        assert_eq!(claim.origin, Origin::Local);
    }

    #[test]
    fn test_sweep() {
        let agent = AgentId::new(0, 1);
        let (book, request) = book_with("a1", &[agent]);

        let report = book.sweep(request.timestamp);
        assert_eq!(report.auctions_evicted, 0);
        assert!(book.is_live("a1"));

        let report = book.sweep(request.deadline + chrono::Duration::seconds(1));
        assert_eq!(report.auctions_evicted, 1);
        assert_eq!(book.live_count(), 0);

        let expiring = AuctionBook::new(Duration::ZERO);
        expiring.record_bid(&request, agent, vec![]);
        assert_eq!(expiring.sweep(Utc::now()).bids_evicted, 1);
    }
}
