// src/transport/exchange.rs
//! Exchange connections
//!
//! Endpoints either listen for exchanges to connect or connect out to
//! them. Binding and the first outbound connect happen synchronously
//! while the engine is being initialized, so an unreachable endpoint
//! fails `initialize` instead of surfacing later. Once running, an
//! outbound connection that drops is re-established with exponential
//! backoff; when retries are exhausted every agent subscribed to that
//! exchange receives an `Error` event.

use crate::dispatch::Dispatcher;
use crate::observability::TRANSPORT_RECONNECTS;
use crate::transport::hub::TransportHub;
use crate::transport::wire::{decode_inbound, encode_outbound};
use crate::utils::backoff::{Backoff, BackoffConfig};
use crate::utils::config::ExchangeEndpoint;
use crate::utils::errors::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Shared state of every exchange task
pub struct ExchangeContext {
    pub dispatcher: Arc<Dispatcher>,
    pub hub: Arc<TransportHub>,
    pub max_frame_bytes: usize,
    pub reconnect: BackoffConfig,
}

/// Bind a listening endpoint
pub fn bind(endpoint: &ExchangeEndpoint) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(&endpoint.address).map_err(|e| {
        EngineError::Transport(format!("{}: cannot bind {}: {}", endpoint.name, endpoint.address, e))
    })?;
    listener.set_nonblocking(true)?;

    info!("Exchange {} listening on {}", endpoint.name, listener.local_addr()?);
    Ok(listener)
}

/// Establish the first outbound connection of a connecting endpoint
pub fn connect(endpoint: &ExchangeEndpoint) -> Result<std::net::TcpStream> {
    let timeout = Duration::from_millis(endpoint.connect_timeout_ms);
    let addrs: Vec<SocketAddr> = endpoint
        .address
        .to_socket_addrs()
        .map_err(|e| EngineError::Transport(format!("{}: cannot resolve {}: {}", endpoint.name, endpoint.address, e)))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match std::net::TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                info!("Exchange {} connected to {}", endpoint.name, addr);
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(EngineError::Transport(format!(
        "{}: cannot connect to {}: {}",
        endpoint.name,
        endpoint.address,
        last_error.map(|e| e.to_string()).unwrap_or_else(|| "no address".into())
    )))
}

/// Accept exchange connections until shutdown
pub async fn run_listener(
    listener: TcpListener,
    exchange: String,
    ctx: Arc<ExchangeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Exchange {} accepted {}", exchange, peer);
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        stream,
                        exchange.clone(),
                        Arc::clone(&ctx),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!("Exchange {} accept failed: {}", exchange, e);
                }
            },
        }
    }

    debug!("Exchange {} listener stopped", exchange);
}

/// Serve an outbound connection and keep it alive until shutdown
pub async fn run_connector(
    endpoint: ExchangeEndpoint,
    initial: TcpStream,
    ctx: Arc<ExchangeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(ctx.reconnect.clone());
    let mut stream = Some(initial);
    let mut reported = false;
    let timeout = Duration::from_millis(endpoint.connect_timeout_ms);

    loop {
        if let Some(s) = stream.take() {
            backoff.reset();
            reported = false;
            serve_connection(s, endpoint.name.clone(), Arc::clone(&ctx), shutdown.clone()).await;
        }

        if *shutdown.borrow() {
            break;
        }

        if backoff.exhausted() && !reported {
            ctx.dispatcher.broadcast_transport_error(
                &endpoint.name,
                &format!("{} unreachable after {} attempts", endpoint.address, backoff.attempts()),
            );
            reported = true;
        }

        let delay = backoff.next_delay();
        metrics::counter!(TRANSPORT_RECONNECTS, "exchange" => endpoint.name.clone()).increment(1);
        debug!("Reconnecting {} in {:?}", endpoint.name, delay);

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match tokio::time::timeout(timeout, TcpStream::connect(&endpoint.address)).await {
            Ok(Ok(s)) => {
                info!("Exchange {} reconnected to {}", endpoint.name, endpoint.address);
                let _ = s.set_nodelay(true);
                stream = Some(s);
            }
            Ok(Err(e)) => warn!("Reconnect to {} failed: {}", endpoint.address, e),
            Err(_) => warn!("Reconnect to {} timed out", endpoint.address),
        }
    }

    debug!("Exchange {} connector stopped", endpoint.name);
}

/// Read frames from one connection and write responses back to it
pub async fn serve_connection(
    stream: TcpStream,
    exchange: String,
    ctx: Arc<ExchangeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (origin, mut outbound) = ctx.hub.register(&exchange);
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(ctx.max_frame_bytes));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = framed.next() => match frame {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_inbound(&line) {
                        Ok(message) => {
                            if let Err(e) = ctx.dispatcher.dispatch_message(message, &exchange, origin) {
                                debug!("Dropped frame from {} on {}: {}", exchange, origin, e);
                            }
                        }
                        Err(e) => ctx.dispatcher.record_protocol_error(&exchange, &e),
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let e = EngineError::Protocol(format!("frame exceeds {} bytes", ctx.max_frame_bytes));
                    ctx.dispatcher.record_protocol_error(&exchange, &e);
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    warn!("Exchange {} read error on {}: {}", exchange, origin, e);
                    break;
                }
                None => {
                    info!("Exchange {} closed {}", exchange, origin);
                    break;
                }
            },
            Some(message) = outbound.recv() => match encode_outbound(&message) {
                Ok(line) => {
                    if let Err(e) = framed.send(line).await {
                        warn!("Exchange {} write error on {}: {}", exchange, origin, e);
                        break;
                    }
                }
                Err(e) => error!("Cannot encode response for {}: {}", message.auction_id(), e),
            },
        }
    }

    ctx.hub.unregister(origin);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchSettings;
    use crate::filter::FilterPool;
    use crate::readiness::ReadinessGate;
    use crate::registry::AgentRegistry;
    use crate::utils::config::EndpointMode;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn context() -> (Arc<AgentRegistry>, Arc<ExchangeContext>) {
        let registry = Arc::new(AgentRegistry::new(
            Arc::new(FilterPool::new()),
            Arc::new(ReadinessGate::new()),
            16,
        ));
        let hub = Arc::new(TransportHub::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            hub.clone(),
            DispatchSettings::default(),
        ));
        let ctx = Arc::new(ExchangeContext {
            dispatcher,
            hub,
            max_frame_bytes: 4096,
            reconnect: BackoffConfig::default(),
        });
        (registry, ctx)
    }

    fn endpoint(mode: EndpointMode, address: &str) -> ExchangeEndpoint {
        ExchangeEndpoint {
            name: "mock".into(),
            mode,
            address: address.into(),
            connect_timeout_ms: 200,
        }
    }

    #[test]
    fn test_bind_failure_is_transport_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let err = bind(&endpoint(EndpointMode::Listen, &address)).unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[test]
    fn test_connect_refused_is_transport_error() {
        // Bind then drop to find a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = connect(&endpoint(EndpointMode::Connect, &format!("127.0.0.1:{}", port))).unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_listener_dispatches_and_replies() {
        let (registry, ctx) = context();
        let agent = registry.register("camp42", "campaign=42".parse().unwrap()).unwrap();

        let std_listener = bind(&endpoint(EndpointMode::Listen, "127.0.0.1:0")).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let listener = TcpListener::from_std(std_listener).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_listener(listener, "mock".into(), Arc::clone(&ctx), shutdown_rx));

        let client = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = client.into_split();
        write
            .write_all(b"garbage\n{\"type\":\"bid_request\",\"auction_id\":\"a1\",\"campaign\":42,\"tmax_ms\":2000,\"spots\":[{\"id\":\"s1\"}]}\n")
            .await
            .unwrap();

        let event = tokio::task::spawn_blocking({
            let queue = Arc::clone(agent.queue());
            move || queue.pop_timeout(Duration::from_secs(5))
        })
        .await
        .unwrap()
        .unwrap()
        .expect("bid request delivered");
        assert_eq!(event.auction_id(), Some("a1"));
        assert_eq!(ctx.dispatcher.stats().protocol_errors, 1);

        let response = crate::events::event::BidResponse::single("a1", "s1", 1.5);
        ctx.dispatcher
            .submit(&agent, crate::events::event::OutboundEvent::BidResponse(response))
            .unwrap();

        let mut lines = BufReader::new(read).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["type"], "bid_response");
        assert_eq!(json["agent"], "camp42");

        shutdown_tx.send(true).unwrap();
    }
}
