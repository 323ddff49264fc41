// src/transport/hub.rs
//! Outbound routing to exchange connections
//!
//! Every live exchange connection registers a bounded sender here. The
//! dispatcher forwards responses by [`Origin`]: connection origins go to
//! that connection's writer task, local origins to an in-process channel
//! read by embedders through `Engine::local_outbound`.

use crate::dispatch::{Origin, OutboundSink};
use crate::transport::wire::OutboundMessage;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound frames buffered per connection
const CONNECTION_BUFFER: usize = 1024;

struct Connection {
    exchange: String,
    sender: mpsc::Sender<OutboundMessage>,
}

pub struct TransportHub {
    connections: DashMap<u64, Connection>,
    next_id: AtomicU64,
    local_tx: Sender<OutboundMessage>,
    local_rx: Receiver<OutboundMessage>,
}

impl TransportHub {
    pub fn new() -> Self {
        let (local_tx, local_rx) = crossbeam_channel::unbounded();
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(0),
            local_tx,
            local_rx,
        }
    }

    /// Register a connection and return its origin and outbound receiver
    pub fn register(&self, exchange: &str) -> (Origin, mpsc::Receiver<OutboundMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::channel(CONNECTION_BUFFER);
        self.connections.insert(
            id,
            Connection {
                exchange: exchange.to_string(),
                sender,
            },
        );
        debug!("Registered connection {} for {}", id, exchange);
        (Origin::Connection(id), receiver)
    }

    pub fn unregister(&self, origin: Origin) {
        if let Origin::Connection(id) = origin {
            if self.connections.remove(&id).is_some() {
                debug!("Unregistered connection {}", id);
            }
        }
    }

    /// Exchange name behind a connection origin
    pub fn exchange_of(&self, origin: Origin) -> Option<String> {
        match origin {
            Origin::Connection(id) => self.connections.get(&id).map(|c| c.exchange.clone()),
            Origin::Local => None,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Receiver of responses to injected auctions
    pub fn local_outbound(&self) -> Receiver<OutboundMessage> {
        self.local_rx.clone()
    }

    /// Drop every connection sender so writer tasks drain and stop
    pub fn close_all(&self) {
        self.connections.clear();
    }
}

impl Default for TransportHub {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundSink for TransportHub {
    fn forward(&self, origin: &Origin, message: OutboundMessage) -> Result<()> {
        match origin {
            Origin::Local => self
                .local_tx
                .send(message)
                .map_err(|_| EngineError::Transport("local outbound channel closed".into())),
            Origin::Connection(id) => {
                let connection = self
                    .connections
                    .get(id)
                    .ok_or_else(|| EngineError::Transport(format!("{} is closed", origin)))?;

                connection.sender.try_send(message).map_err(|e| {
                    warn!("Dropping response for {}: {}", connection.exchange, e);
                    EngineError::Transport(format!("{} cannot accept the response: {}", connection.exchange, e))
                })
            }
        }
    }
}
