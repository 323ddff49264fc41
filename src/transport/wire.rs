// src/transport/wire.rs
//! Newline-delimited JSON wire format
//!
//! Inbound frames:
//!
//! ```text
//! {"type":"bid_request","auction_id":"a1","campaign":42,"tmax_ms":80,"spots":[{"id":"1"}]}
//! {"type":"win","auction_id":"a1","spot_id":"1","win_price":1.2}
//! {"type":"loss","auction_id":"a1","spot_id":"1"}
//! ```
//!
//! Outbound frames:
//!
//! ```text
//! {"type":"bid_response","auction_id":"a1","agent":"camp42","bids":[{"spot_id":"1","price":1.5}]}
//! ```

use crate::events::event::{BidRequest, LossNotification, Spot, SpotBid, WinNotification};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use ulid::Ulid;

/// Bid request as sent by an exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireBidRequest {
    /// Generated when absent
    #[serde(default)]
    pub auction_id: Option<String>,

    /// Overrides the name of the endpoint the frame arrived on
    #[serde(default)]
    pub exchange: Option<String>,

    #[serde(default)]
    pub campaign: Option<u64>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Response budget; the engine default applies when absent
    #[serde(default)]
    pub tmax_ms: Option<u64>,

    #[serde(default)]
    pub spots: Vec<Spot>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub segments: Vec<String>,

    #[serde(default)]
    pub user_ids: BTreeMap<String, String>,

    #[serde(default)]
    pub ext: serde_json::Value,
}

impl WireBidRequest {
    /// Build the engine request; the deadline counts from `received`.
    ///
    /// A `tmax_ms` whose deadline is not representable is a `Protocol` error.
    pub fn into_request(self, exchange: &str, default_tmax: Duration, received: DateTime<Utc>) -> Result<BidRequest> {
        let tmax = self.tmax_ms.map(Duration::from_millis).unwrap_or(default_tmax);
        let deadline = chrono::Duration::from_std(tmax)
            .ok()
            .and_then(|tmax| received.checked_add_signed(tmax))
            .ok_or_else(|| EngineError::Protocol(format!("tmax of {:?} is out of range", tmax)))?;

        Ok(BidRequest {
            auction_id: self.auction_id.unwrap_or_else(|| Ulid::new().to_string()),
            exchange: self.exchange.unwrap_or_else(|| exchange.to_string()),
            campaign: self.campaign,
            timestamp: self.timestamp.unwrap_or(received),
            deadline,
            spots: self.spots,
            url: self.url,
            segments: self.segments,
            user_ids: self.user_ids,
            ext: self.ext,
        })
    }
}

/// Frame received from an exchange or the ad server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    BidRequest(WireBidRequest),
    Win(WinNotification),
    Loss(LossNotification),
}

/// Frame sent back to the exchange an auction came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    BidResponse {
        auction_id: String,
        agent: String,
        bids: Vec<SpotBid>,
    },
}

impl OutboundMessage {
    pub fn auction_id(&self) -> &str {
        match self {
            OutboundMessage::BidResponse { auction_id, .. } => auction_id,
        }
    }
}

/// Parse one inbound frame
pub fn decode_inbound(line: &str) -> Result<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(EngineError::Protocol("empty frame".into()));
    }
    Ok(serde_json::from_str(line)?)
}

/// Serialize one outbound frame, without the trailing newline
pub fn encode_outbound(message: &OutboundMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}
