use crate::instance::Instance;
use crate::orchestrator::Orchestrator;
use crate::upstream::UpstreamClient;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted endpoint submission
const MAX_SUBMISSION_BYTES: usize = 4096;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Operator API: instance status, manual launches and endpoint hand-in
pub struct AdminServer {
    bind_addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    upstream: Arc<UpstreamClient>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        upstream: Arc<UpstreamClient>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            orchestrator,
            upstream,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let orchestrator = Arc::clone(&self.orchestrator);
                            let upstream = Arc::clone(&self.upstream);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, orchestrator, upstream, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    orchestrator: Arc<Orchestrator>,
    upstream: Arc<UpstreamClient>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let orchestrator = Arc::clone(&orchestrator);
        let upstream = Arc::clone(&upstream);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, orchestrator, upstream, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Value of `key` in a query string, percent-decoded
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k != key {
            return None;
        }
        urlencoding::decode(&v.replace('+', " "))
            .ok()
            .map(|v| v.into_owned())
            .filter(|v| !v.is_empty())
    })
}

fn instance_json(instance: &Instance, orchestrator: &Orchestrator) -> serde_json::Value {
    let max_age = orchestrator.registry().max_age();
    serde_json::json!({
        "id": instance.id,
        "endpoint": instance.endpoint,
        "state": instance.state,
        "credential": instance.credential,
        "created_at": instance.created_at,
        "last_used_at": instance.last_used_at,
        "age_hours": (instance.age_hours() * 100.0).round() / 100.0,
        "expired": instance.is_expired(max_age),
        "supervised": orchestrator.supervisor().is_running(&instance.id),
    })
}

async fn handle_admin_request(
    req: Request<Incoming>,
    orchestrator: Arc<Orchestrator>,
    upstream: Arc<UpstreamClient>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Everything except the health and version probes requires the token
    let public = method == Method::GET && (path == "/health" || path == "/version");
    if !public && !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Instance history: GET /instances
        (&Method::GET, "/instances") => {
            let instances: Vec<serde_json::Value> = orchestrator
                .registry()
                .all()
                .iter()
                .map(|i| instance_json(i, &orchestrator))
                .collect();
            let stats = upstream.stats();
            let body = serde_json::json!({
                "count": instances.len(),
                "instances": instances,
                "provisioning": orchestrator.is_provisioning(),
                "provisioner": orchestrator.provisioner().name(),
                "last_credential": orchestrator.last_credential(),
                "upstream": {
                    "requests": stats.get_total_requests(),
                    "failed_requests": stats.get_failed_requests(),
                    "health_checks": stats.get_health_checks(),
                },
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Start provisioning in the background: POST /instances/launch[?credential=NAME]
        (&Method::POST, "/instances/launch") => {
            let credential = query_param(req.uri().query(), "credential");
            match credential {
                Some(ref name) if !orchestrator.has_credential(name) => {
                    response(StatusCode::NOT_FOUND, "unknown credential")
                }
                _ => {
                    let joined = orchestrator.is_provisioning();
                    orchestrator.launch(credential.as_deref());
                    info!(credential = ?credential, joined, "Provisioning launched via admin API");
                    let body = serde_json::json!({
                        "status": "provisioning",
                        "credential": credential,
                        "already_in_progress": joined,
                    });
                    json_response(StatusCode::ACCEPTED, body.to_string())
                }
            }
        }

        // Manual endpoint hand-in: POST /provision/endpoint with the URL as body
        (&Method::POST, "/provision/endpoint") => {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "Failed to read endpoint submission");
                    return Ok(response(StatusCode::BAD_REQUEST, "unreadable body"));
                }
            };
            if body.len() > MAX_SUBMISSION_BYTES {
                return Ok(response(StatusCode::PAYLOAD_TOO_LARGE, "endpoint too long"));
            }

            let endpoint = String::from_utf8_lossy(&body).trim().to_string();
            if endpoint.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing endpoint")
            } else if orchestrator.provisioner().submit_endpoint(&endpoint) {
                response(StatusCode::OK, "ok")
            } else {
                response(StatusCode::CONFLICT, "no provisioning attempt is waiting for an endpoint")
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
