// src/transport/adserver.rs
//! HTTP ad server connector
//!
//! Accepts post-auction notifications from an ad server:
//!
//! - `POST /win`  with a win notification body
//! - `POST /loss` with a loss notification body
//!
//! Both answer `202 Accepted` with `{"routed": <agents reached>}`; an
//! unroutable notification is still accepted and counted.

use crate::dispatch::Dispatcher;
use crate::events::event::{LossNotification, WinNotification};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest accepted notification body
const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct AdServerConnector {
    dispatcher: Arc<Dispatcher>,
}

impl AdServerConnector {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Bind the HTTP endpoint
    pub fn bind(address: &str) -> Result<std::net::TcpListener> {
        let listener = std::net::TcpListener::bind(address)
            .map_err(|e| EngineError::Transport(format!("adserver: cannot bind {}: {}", address, e)))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Serve notifications until shutdown
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!("Ad server connector listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connector = Arc::clone(&self);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let connector = Arc::clone(&connector);
                                async move { connector.handle_request(req).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                debug!("Ad server connection {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Ad server accept failed: {}", e),
                },
            }
        }

        debug!("Ad server connector stopped");
    }

    async fn handle_request(&self, req: Request<Incoming>) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("Ad server request: {} {}", method, path);

        if method != Method::POST {
            return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, "{\"error\":\"POST only\"}"));
        }
        if path != "/win" && path != "/loss" {
            return Ok(respond(StatusCode::NOT_FOUND, "{\"error\":\"unknown path\"}"));
        }

        let body = match read_body(req).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Ad server body rejected: {}", e);
                return Ok(respond(StatusCode::BAD_REQUEST, &error_body(&e)));
            }
        };

        let routed = if path == "/win" {
            serde_json::from_slice::<WinNotification>(&body).map(|win| self.dispatcher.route_win(win))
        } else {
            serde_json::from_slice::<LossNotification>(&body).map(|loss| self.dispatcher.route_loss(loss))
        };

        match routed {
            Ok(routed) => Ok(respond(StatusCode::ACCEPTED, &format!("{{\"routed\":{}}}", routed))),
            Err(e) => {
                let e = EngineError::from(e);
                self.dispatcher.record_protocol_error("adserver", &e);
                Ok(respond(StatusCode::BAD_REQUEST, &error_body(&e)))
            }
        }
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| EngineError::Protocol(format!("body read error: {}", e)))?
        .to_bytes();

    if body.len() > MAX_BODY_BYTES {
        return Err(EngineError::Protocol(format!("body exceeds {} bytes", MAX_BODY_BYTES)));
    }
    Ok(body)
}

fn error_body(error: &EngineError) -> String {
    serde_json::json!({ "error": error.to_string() }).to_string()
}

fn respond(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
