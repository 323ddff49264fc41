// src/events/event.rs
//! Event types exchanged between the engine and its agents
//!
//! Inbound events carry their payload behind an `Arc`: fan-out to several
//! agents shares one immutable copy, so no agent can mutate what another
//! agent sees.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Stable discriminant of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventType {
    BidRequest = 1,
    WinNotification = 2,
    LossNotification = 3,
    Error = 4,
    ShutdownSignal = 5,
}

impl EventType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(EventType::BidRequest),
            2 => Some(EventType::WinNotification),
            3 => Some(EventType::LossNotification),
            4 => Some(EventType::Error),
            5 => Some(EventType::ShutdownSignal),
            _ => None,
        }
    }
}

/// One biddable impression slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    pub id: String,

    /// Creative formats accepted, e.g. `300x250`
    #[serde(default)]
    pub formats: Vec<String>,

    /// Floor price (CPM)
    #[serde(default)]
    pub reserve_price: Option<f64>,
}

/// An auction opportunity with an absolute response deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
    pub auction_id: String,

    /// Exchange the request came from
    pub exchange: String,

    #[serde(default)]
    pub campaign: Option<u64>,

    pub timestamp: DateTime<Utc>,

    /// Responses after this instant are never forwarded
    pub deadline: DateTime<Utc>,

    #[serde(default)]
    pub spots: Vec<Spot>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub segments: Vec<String>,

    /// User ids keyed by id domain (`exchange`, `provider`, ...)
    #[serde(default)]
    pub user_ids: BTreeMap<String, String>,

    /// Exchange specific extension data, passed through untouched
    #[serde(default)]
    pub ext: serde_json::Value,
}

impl BidRequest {
    /// Host part of the page url, lowercased
    pub fn host(&self) -> Option<String> {
        let url = self.url.as_deref()?;
        let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
        let host = rest
            .split(|c: char| c == '/' || c == '?' || c == '#')
            .next()?
            .rsplit('@')
            .next()?
            .split(':')
            .next()?;

        if host.is_empty() {
            None
        } else {
            Some(host.to_ascii_lowercase())
        }
    }

    /// Hour of week of the auction timestamp, 0 = Sunday 00:00 UTC
    pub fn hour_of_week(&self) -> usize {
        let day = self.timestamp.weekday().num_days_from_sunday() as usize;
        day * 24 + self.timestamp.hour() as usize
    }

    /// Time left before the deadline, zero when already past
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn has_spot(&self, spot_id: &str) -> bool {
        self.spots.iter().any(|s| s.id == spot_id)
    }
}

/// Auction won by a forwarded bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinNotification {
    pub auction_id: String,

    #[serde(default)]
    pub spot_id: Option<String>,

    pub win_price: f64,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub bid_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub account: Option<String>,

    /// Explicit target agent, overrides bid-based routing
    #[serde(default)]
    pub agent: Option<String>,

    /// Exchange the auction ran on, when ids are ambiguous across exchanges
    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Auction lost by a forwarded bid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossNotification {
    pub auction_id: String,

    #[serde(default)]
    pub spot_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub agent: Option<String>,

    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Category of an error event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Exchange connection lost and not recovered
    Transport,
    /// Events were rejected because this agent's queue was full
    QueueOverflow,
    /// A response was dropped because the auction deadline had passed
    LateBid,
}

/// Error delivered to an agent as a queued event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,

    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default)]
    pub auction_id: Option<String>,

    /// Number of events lost, for `QueueOverflow`
    #[serde(default)]
    pub dropped: u64,
}

impl ErrorEvent {
    pub fn transport(exchange: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: message.into(),
            exchange: Some(exchange.to_string()),
            auction_id: None,
            dropped: 0,
        }
    }

    pub fn late_bid(auction_id: &str, exchange: Option<&str>) -> Self {
        Self {
            kind: ErrorKind::LateBid,
            message: format!("response to {} arrived after the deadline", auction_id),
            exchange: exchange.map(str::to_string),
            auction_id: Some(auction_id.to_string()),
            dropped: 0,
        }
    }

    pub fn overflow(dropped: u64) -> Self {
        Self {
            kind: ErrorKind::QueueOverflow,
            message: format!("{} events dropped: queue full", dropped),
            exchange: None,
            auction_id: None,
            dropped,
        }
    }
}

/// Why a queue was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    EngineShutdown,
}

/// Terminal event observed once by each agent after engine shutdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownSignal {
    pub reason: ShutdownReason,

    /// Queued events discarded by the shutdown
    pub discarded: u64,
}

/// An inbound event as delivered to an agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "subject", rename_all = "snake_case")]
pub enum Event {
    BidRequest(Arc<BidRequest>),
    WinNotification(Arc<WinNotification>),
    LossNotification(Arc<LossNotification>),
    Error(ErrorEvent),
    ShutdownSignal(ShutdownSignal),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::BidRequest(_) => EventType::BidRequest,
            Event::WinNotification(_) => EventType::WinNotification,
            Event::LossNotification(_) => EventType::LossNotification,
            Event::Error(_) => EventType::Error,
            Event::ShutdownSignal(_) => EventType::ShutdownSignal,
        }
    }

    pub fn auction_id(&self) -> Option<&str> {
        match self {
            Event::BidRequest(r) => Some(&r.auction_id),
            Event::WinNotification(w) => Some(&w.auction_id),
            Event::LossNotification(l) => Some(&l.auction_id),
            Event::Error(e) => e.auction_id.as_deref(),
            Event::ShutdownSignal(_) => None,
        }
    }

    pub fn as_bid_request(&self) -> Option<&Arc<BidRequest>> {
        match self {
            Event::BidRequest(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::ShutdownSignal(_))
    }
}

/// Bid on one spot of an auction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotBid {
    pub spot_id: String,

    /// Price (CPM)
    pub price: f64,

    #[serde(default)]
    pub creative_id: Option<u32>,
}

/// Agent's answer to a bid request; no bids means an explicit pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidResponse {
    pub auction_id: String,

    /// Exchange of the request; needed only when the same auction id is live on several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,

    #[serde(default)]
    pub bids: Vec<SpotBid>,
}

impl BidResponse {
    pub fn pass(auction_id: impl Into<String>) -> Self {
        Self {
            auction_id: auction_id.into(),
            exchange: None,
            bids: Vec::new(),
        }
    }

    pub fn single(auction_id: impl Into<String>, spot_id: impl Into<String>, price: f64) -> Self {
        Self {
            auction_id: auction_id.into(),
            exchange: None,
            bids: vec![SpotBid {
                spot_id: spot_id.into(),
                price,
                creative_id: None,
            }],
        }
    }

    /// Answer the request from `exchange` specifically
    pub fn on_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }
}

/// Event sent by an agent through `send_event`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    BidResponse(BidResponse),
    /// Replace the agent's subscription filter
    Config { filter: String },
}

impl OutboundEvent {
    pub const CONFIG: i32 = 10;
    pub const BID_RESPONSE: i32 = 11;

    pub fn type_code(&self) -> i32 {
        match self {
            OutboundEvent::Config { .. } => Self::CONFIG,
            OutboundEvent::BidResponse(_) => Self::BID_RESPONSE,
        }
    }
}
