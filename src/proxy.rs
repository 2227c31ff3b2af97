//! Client-facing server
//!
//! Serves the synthesis and capability-listing paths at a stable local
//! address. Each request is routed to a healthy instance (provisioning one if
//! needed) and the backend's response is relayed once fully received.

use crate::config::OrchestratorConfig;
use crate::error::{json_error_response, provision_error_response, ProxyErrorCode};
use crate::orchestrator::Orchestrator;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamRequest};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Content type relayed when a synthesis response carries none
const SPEECH_CONTENT_TYPE: &str = "application/octet-stream";
/// Content type relayed when a voice listing carries none
const VOICES_CONTENT_TYPE: &str = "application/json";

/// Headers that describe the client connection rather than the request
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&name.as_str()) || name.starts_with("proxy-")
}

/// The two forwarded routes and their timeouts
#[derive(Debug, Clone)]
pub struct ProxyRoutes {
    pub speech_path: String,
    pub voices_path: String,
    pub speech_timeout: Duration,
    pub voices_timeout: Duration,
}

impl ProxyRoutes {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            speech_path: config.speech_path.clone(),
            voices_path: config.health_path.clone(),
            speech_timeout: config.speech_timeout(),
            voices_timeout: config.voices_timeout(),
        }
    }

    /// The served route matching a request, `None` if it is not served
    pub fn route_for(&self, method: &Method, path: &str) -> Option<Route> {
        if method == Method::POST && path == self.speech_path {
            Some(Route {
                timeout: self.speech_timeout,
                default_content_type: SPEECH_CONTENT_TYPE,
            })
        } else if method == Method::GET && path == self.voices_path {
            Some(Route {
                timeout: self.voices_timeout,
                default_content_type: VOICES_CONTENT_TYPE,
            })
        } else {
            None
        }
    }
}

/// Forwarding parameters of one served route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub timeout: Duration,
    pub default_content_type: &'static str,
}

/// The client-facing server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    upstream: Arc<UpstreamClient>,
    routes: Arc<ProxyRoutes>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        upstream: Arc<UpstreamClient>,
        routes: ProxyRoutes,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            orchestrator,
            upstream,
            routes: Arc::new(routes),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            speech_path = %self.routes.speech_path,
            voices_path = %self.routes.voices_path,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let orchestrator = Arc::clone(&self.orchestrator);
                            let upstream = Arc::clone(&self.upstream);
                            let routes = Arc::clone(&self.routes);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, orchestrator, upstream, routes).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    upstream: Arc<UpstreamClient>,
    routes: Arc<ProxyRoutes>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let orchestrator = Arc::clone(&orchestrator);
        let upstream = Arc::clone(&upstream);
        let routes = Arc::clone(&routes);
        async move { handle_request(req, orchestrator, upstream, routes, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    orchestrator: Arc<Orchestrator>,
    upstream: Arc<UpstreamClient>,
    routes: Arc<ProxyRoutes>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(route) = routes.route_for(req.method(), req.uri().path()) else {
        debug!(method = %req.method(), uri = %req.uri(), "Route not served");
        return Ok(json_error_response(
            ProxyErrorCode::NotFound,
            format!("No route for {} {}", req.method(), req.uri().path()),
        ));
    };

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request_id, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                ProxyErrorCode::InvalidRequest,
                "Failed to read request body",
            ));
        }
    };

    debug!(method = %parts.method, uri = %parts.uri, request_id, bytes = body.len(), "Incoming request");

    // Obtain a backend, possibly waiting for provisioning
    let instance = match orchestrator.acquire().await {
        Ok(instance) => instance,
        Err(e) => {
            error!(request_id, error = %e, "No backend available");
            return Ok(provision_error_response(&e));
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let Some(url) = instance.url_for(path) else {
        return Ok(json_error_response(
            ProxyErrorCode::InternalError,
            "Instance has no endpoint",
        ));
    };

    let mut headers = forwardable_headers(&parts.headers);
    headers.push((X_REQUEST_ID.to_string(), request_id.clone().into_bytes()));
    headers.push((
        X_FORWARDED_FOR.to_string(),
        client_addr.ip().to_string().into_bytes(),
    ));

    let request = UpstreamRequest {
        method: parts.method.clone(),
        url,
        headers,
        body,
        timeout: route.timeout,
    };

    match upstream.send(request).await {
        Ok(response) => {
            orchestrator.touch(&instance.id);
            debug!(
                instance_id = %instance.id,
                request_id,
                status = response.status,
                bytes = response.body.len(),
                "Relaying backend response"
            );

            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = response
                .content_type
                .unwrap_or_else(|| route.default_content_type.to_string());
            Ok(Response::builder()
                .status(status)
                .header(hyper::header::CONTENT_TYPE, content_type)
                .header(X_REQUEST_ID, request_id)
                .body(Full::new(response.body).map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| {
                    json_error_response(ProxyErrorCode::InternalError, "Invalid backend response")
                }))
        }
        Err(UpstreamError::Transport(reason)) => {
            let err = orchestrator.mark_unreachable(&instance, &reason);
            Ok(provision_error_response(&err))
        }
        Err(UpstreamError::Timeout(elapsed)) => {
            warn!(
                instance_id = %instance.id,
                request_id,
                timeout_secs = elapsed.as_secs(),
                "Backend request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::BackendUnreachable,
                format!("Backend did not answer within {} seconds", elapsed.as_secs()),
            ))
        }
        Err(UpstreamError::InvalidRequest(reason)) => {
            warn!(request_id, reason, "Request could not be forwarded");
            Ok(json_error_response(ProxyErrorCode::InvalidRequest, reason))
        }
    }
}

/// Client headers minus hop-by-hop ones and any request id we replace
fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !is_hop_by_hop(name) && name != X_REQUEST_ID && name != X_FORWARDED_FOR
        })
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn routes() -> ProxyRoutes {
        ProxyRoutes::from_config(&OrchestratorConfig::default())
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }

    #[test]
    fn test_route_matching() {
        let routes = routes();
        assert_eq!(
            routes.route_for(&Method::POST, "/v1/audio/speech"),
            Some(Route {
                timeout: Duration::from_secs(60),
                default_content_type: "application/octet-stream",
            })
        );
        assert_eq!(
            routes.route_for(&Method::GET, "/v1/audio/voices"),
            Some(Route {
                timeout: Duration::from_secs(10),
                default_content_type: "application/json",
            })
        );
        assert_eq!(routes.route_for(&Method::GET, "/v1/audio/speech"), None);
        assert_eq!(routes.route_for(&Method::POST, "/v1/models"), None);
    }

    #[test]
    fn test_forwardable_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost:8080"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("x-request-id", HeaderValue::from_static("client-id"));

        let mut forwarded: Vec<String> = forwardable_headers(&headers)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        forwarded.sort();
        assert_eq!(forwarded, vec!["authorization", "content-type"]);
    }
}
