// src/engine/engine.rs
//! Engine handle
//!
//! Owns the Tokio runtime that drives transport I/O and the auction
//! sweeper, the agent registry, the dispatcher and the engine-wide
//! readiness descriptor.
//!
//! # Lifecycle
//!
//! ```text
//! initialize ─► validate config ─► build runtime ─► bind / connect endpoints
//!            ─► spawn listeners, connectors, ad server, sweeper ─► Engine
//!
//! shutdown   ─► signal tasks ─► close every agent queue (ShutdownSignal)
//!            ─► drop connections ─► stop runtime
//! ```
//!
//! Any failure during `initialize` stops whatever was started; a caller
//! never receives a half-initialized engine.

use crate::agent::BiddingAgent;
use crate::dispatch::{DispatchSettings, DispatchStats, Dispatcher, Origin};
use crate::events::event::ShutdownReason;
use crate::events::ledger::EventLedger;
use crate::filter::{AgentFilter, FilterPool};
use crate::observability::{self, PENDING_EVENTS};
use crate::readiness::{CallbackSignal, ReadinessGate};
use crate::registry::{AgentId, AgentRegistry};
use crate::transport::exchange::{self, ExchangeContext};
use crate::transport::wire::{InboundMessage, OutboundMessage};
use crate::transport::{AdServerConnector, TransportHub};
use crate::utils::config::{EndpointMode, EngineConfig};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Exchange name given to injected bid requests that carry none
pub const LOCAL_EXCHANGE: &str = "local";

/// How long shutdown waits for runtime tasks to stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub dispatch: DispatchStats,

    /// Registered agents
    pub agents: usize,

    /// Events queued across all agents
    pub pending_events: usize,

    /// Events delivered and not yet freed
    pub outstanding_events: usize,

    pub live_auctions: usize,

    /// Open exchange connections
    pub connections: usize,
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    runtime: Mutex<Option<Runtime>>,
    pub(crate) handle: Handle,
    pub(crate) registry: Arc<AgentRegistry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) hub: Arc<TransportHub>,
    pub(crate) gate: Arc<ReadinessGate>,
    pub(crate) ledger: Arc<EventLedger>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    listeners: HashMap<String, SocketAddr>,
    adserver_addr: Option<SocketAddr>,
}

impl EngineInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop everything; later calls are no-ops
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down engine");
        let _ = self.shutdown_tx.send(true);

        let discarded = self.registry.close_all(ShutdownReason::EngineShutdown);
        self.hub.close_all();
        self.dispatcher.log_summary();

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            // Blocking on the runtime is not allowed from inside another one
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
        }

        info!("Engine stopped ({} queued events discarded)", discarded);
    }
}

/// Process-level engine handle
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Load the bootstrap file and start the engine
    pub fn initialize(config_path: impl AsRef<Path>) -> Result<Self> {
        let config = EngineConfig::load(config_path)?;
        Self::from_config(config)
    }

    /// Start the engine from an in-memory configuration
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        observability::init_tracing(&config.telemetry)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.engine.worker_threads)
            .thread_name("rtb-worker")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Io(format!("cannot build runtime: {}", e)))?;

        match Self::start(&runtime, config) {
            Ok(inner) => {
                *inner.runtime.lock() = Some(runtime);
                Ok(Self { inner: Arc::new(inner) })
            }
            Err(e) => {
                warn!("Engine initialization failed: {}", e);
                runtime.shutdown_background();
                Err(e)
            }
        }
    }

    fn start(runtime: &Runtime, config: EngineConfig) -> Result<EngineInner> {
        let gate = Arc::new(ReadinessGate::with_platform_signal()?);
        let pool = Arc::new(FilterPool::new());
        let registry = Arc::new(AgentRegistry::new(pool, Arc::clone(&gate), config.engine.queue_capacity));
        let hub = Arc::new(TransportHub::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            hub.clone(),
            DispatchSettings {
                risk: config.risk.clone(),
                default_tmax: config.engine.default_tmax(),
                win_window: config.engine.win_window(),
            },
        ));

        // Bind and connect before spawning anything so failures leave nothing running
        let mut bound = Vec::new();
        let mut connected = Vec::new();
        for endpoint in &config.exchanges {
            match endpoint.mode {
                EndpointMode::Listen => bound.push((endpoint.name.clone(), exchange::bind(endpoint)?)),
                EndpointMode::Connect => connected.push((endpoint.clone(), exchange::connect(endpoint)?)),
            }
        }
        let adserver = match &config.adserver {
            Some(endpoint) => Some(AdServerConnector::bind(&endpoint.address)?),
            None => None,
        };

        let _guard = runtime.enter();
        observability::init_metrics(&config.telemetry)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Arc::new(ExchangeContext {
            dispatcher: Arc::clone(&dispatcher),
            hub: Arc::clone(&hub),
            max_frame_bytes: config.engine.max_frame_bytes,
            reconnect: config.reconnect.clone(),
        });

        let mut listeners = HashMap::new();
        for (name, listener) in bound {
            listeners.insert(name.clone(), listener.local_addr()?);
            let listener = tokio::net::TcpListener::from_std(listener)?;
            runtime.spawn(exchange::run_listener(listener, name, Arc::clone(&ctx), shutdown_rx.clone()));
        }
        for (endpoint, stream) in connected {
            let stream = tokio::net::TcpStream::from_std(stream)?;
            runtime.spawn(exchange::run_connector(endpoint, stream, Arc::clone(&ctx), shutdown_rx.clone()));
        }

        let adserver_addr = match adserver {
            Some(listener) => {
                let addr = listener.local_addr()?;
                let connector = Arc::new(AdServerConnector::new(Arc::clone(&dispatcher)));
                let listener = tokio::net::TcpListener::from_std(listener)?;
                runtime.spawn(connector.run(listener, shutdown_rx.clone()));
                Some(addr)
            }
            None => None,
        };

        runtime.spawn(sweep_loop(
            Arc::clone(&dispatcher),
            Arc::clone(&gate),
            config.engine.sweep_interval(),
            shutdown_rx,
        ));

        info!(
            "Engine started: {} exchanges, {} declared agents, readiness fd {}",
            config.exchanges.len(),
            config.agents.len(),
            gate.fd()
        );

        Ok(EngineInner {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(None),
            config,
            registry,
            dispatcher,
            hub,
            gate,
            ledger: Arc::new(EventLedger::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
            listeners,
            adserver_addr,
        })
    }

    /// Register an agent; a name declared in the configuration gets its declared filter
    pub fn create_bidding_agent(&self, name: &str) -> Result<BiddingAgent> {
        let declared = self.inner.config.agents.iter().find(|a| a.name == name);
        let filter = match declared {
            Some(decl) => decl.filter.parse()?,
            None => AgentFilter::any(),
        };
        self.register(name, filter)
    }

    /// Register an agent with an explicit filter expression
    pub fn create_bidding_agent_with_filter(&self, name: &str, filter: &str) -> Result<BiddingAgent> {
        self.register(name, filter.parse()?)
    }

    fn register(&self, name: &str, filter: AgentFilter) -> Result<BiddingAgent> {
        if self.inner.is_closed() {
            return Err(EngineError::EngineClosed);
        }
        let state = self.inner.registry.register(name, filter)?;
        Ok(BiddingAgent::new(state, &self.inner))
    }

    /// Release an agent by id; a second release is `InvalidHandle`
    pub fn release_agent(&self, id: AgentId) -> Result<()> {
        if self.inner.is_closed() {
            return Err(EngineError::EngineClosed);
        }
        self.inner.registry.unregister(id).map(|_| ())
    }

    /// Descriptor readable while any agent has queued events; -1 without one
    pub fn fd(&self) -> i32 {
        self.inner.gate.fd()
    }

    /// Invoke `callback(true)` when events become pending and `callback(false)` when drained
    pub fn on_ready(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.inner.gate.attach(Arc::new(CallbackSignal::new(callback)));
    }

    /// Feed one message as if it arrived from an exchange; returns agents reached
    pub fn inject(&self, message: InboundMessage) -> Result<usize> {
        if self.inner.is_closed() {
            return Err(EngineError::EngineClosed);
        }
        self.inner.dispatcher.dispatch_message(message, LOCAL_EXCHANGE, Origin::Local)
    }

    /// Responses forwarded for injected auctions
    pub fn local_outbound(&self) -> crossbeam_channel::Receiver<OutboundMessage> {
        self.inner.hub.local_outbound()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            dispatch: self.inner.dispatcher.stats(),
            agents: self.inner.registry.len(),
            pending_events: self.inner.gate.pending(),
            outstanding_events: self.inner.ledger.outstanding(),
            live_auctions: self.inner.dispatcher.book().live_count(),
            connections: self.inner.hub.connection_count(),
        }
    }

    /// Bound address of a listening exchange endpoint
    pub fn local_addr(&self, exchange: &str) -> Option<SocketAddr> {
        self.inner.listeners.get(exchange).copied()
    }

    pub fn adserver_addr(&self) -> Option<SocketAddr> {
        self.inner.adserver_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub(crate) fn runtime_handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    /// Stop the engine; every agent observes one `ShutdownSignal`
    pub fn shutdown(self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.close();
    }
}

async fn sweep_loop(
    dispatcher: Arc<Dispatcher>,
    gate: Arc<ReadinessGate>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                dispatcher.sweep(Utc::now());
                metrics::gauge!(PENDING_EVENTS).set(gate.pending() as f64);
            }
        }
    }

    debug!("Sweeper stopped");
}
