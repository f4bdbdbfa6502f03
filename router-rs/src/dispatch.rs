//! Proxy dispatcher
//!
//! Per-request decision logic shared by both listeners and by upgrade
//! requests:
//!
//! 1. ACME challenge paths go to the challenge responder, for any host
//! 2. unknown and disabled hosts get 404
//! 3. plaintext requests to `onlySecure` routes get 403
//! 4. everything else is rewritten and handed to the forwarding engine;
//!    backend failures turn into the route's `errorRedirect` (302) or 503

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::challenge::ChallengeResponder;
use crate::engine::{is_upgrade_request, strip_hop_by_hop, ForwardEngine};
use crate::error::BackendError;
use crate::pages::ErrorPages;
use crate::route::{Route, RouteTable};
use crate::table::RouteTableManager;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Outcome of the routing checks for one request
#[derive(Debug, Clone)]
pub enum Decision {
    /// Serve from the challenge webroot
    Challenge,
    /// Hand off to the engine
    Forward { route: Arc<Route>, host: String },
    /// Answer locally with an error status
    Reject {
        status: StatusCode,
        route: Option<Arc<Route>>,
    },
}

/// Routes requests against the current route table
pub struct Dispatcher {
    tables: Arc<RouteTableManager>,
    challenges: ChallengeResponder,
    engine: ForwardEngine,
    pages: ErrorPages,
}

impl Dispatcher {
    pub fn new(
        tables: Arc<RouteTableManager>,
        challenges: ChallengeResponder,
        engine: ForwardEngine,
        pages: ErrorPages,
    ) -> Self {
        Self {
            tables,
            challenges,
            engine,
            pages,
        }
    }

    pub fn tables(&self) -> &Arc<RouteTableManager> {
        &self.tables
    }

    /// Routing checks against one table snapshot
    pub fn decide(table: &RouteTable, uri: &Uri, headers: &HeaderMap, secure: bool) -> Decision {
        if ChallengeResponder::matches(uri.path()) {
            return Decision::Challenge;
        }

        let not_found = Decision::Reject {
            status: StatusCode::NOT_FOUND,
            route: None,
        };

        let Some(host) = inbound_host(uri, headers) else {
            return not_found;
        };
        let Some(route) = table.lookup(host) else {
            return not_found;
        };
        if !route.enabled {
            return not_found;
        }
        if route.ssl.only_secure && !secure {
            return Decision::Reject {
                status: StatusCode::FORBIDDEN,
                route: Some(Arc::clone(route)),
            };
        }

        Decision::Forward {
            route: Arc::clone(route),
            host: host.to_string(),
        }
    }

    /// Handle one request (plain or upgrade) end to end
    pub async fn handle(&self, req: Request<Body>, secure: bool, client: Option<SocketAddr>) -> Response<Body> {
        let table = self.tables.snapshot();

        match Self::decide(&table, req.uri(), req.headers(), secure) {
            Decision::Challenge => {
                debug!("ACME challenge request {}", req.uri().path());
                self.challenges.serve(req.uri().path()).await
            }
            Decision::Reject { status, route } => {
                debug!(
                    "Rejecting {} {} for host {:?} with {}",
                    req.method(),
                    req.uri().path(),
                    inbound_host(req.uri(), req.headers()),
                    status
                );
                self.pages.render(status, route.as_deref()).await
            }
            Decision::Forward { route, host } => {
                let upgrade = is_upgrade_request(req.headers());
                debug!(
                    "{} {}{} -> {}{}",
                    req.method(),
                    host,
                    req.uri().path(),
                    route.target,
                    if upgrade { " (upgrade)" } else { "" }
                );

                let req = prepare_request(req, &route, &host, secure, client, upgrade);
                let result = if upgrade {
                    self.engine.upgrade(req, &route.target).await
                } else {
                    self.engine.forward(req, &route.target).await
                };

                match result {
                    Ok(response) => response,
                    Err(e) => self.backend_failure(e, &route).await,
                }
            }
        }
    }

    async fn backend_failure(&self, err: BackendError, route: &Route) -> Response<Body> {
        if err.is_reset() {
            debug!("Connection reset while proxying {}: {}", route.host, err);
        } else {
            warn!("Proxy error for {}: {}", route.host, err);
        }

        match &route.error_redirect {
            Some(location) => ErrorPages::redirect(location),
            None => self.pages.render(StatusCode::SERVICE_UNAVAILABLE, Some(route)).await,
        }
    }
}

/// `Host` header, or the URI authority for HTTP/2 requests
fn inbound_host<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .filter(|h| !h.is_empty())
}

/// Rewrite headers for the backend
fn prepare_request(
    mut req: Request<Body>,
    route: &Route,
    inbound_host: &str,
    secure: bool,
    client: Option<SocketAddr>,
    upgrade: bool,
) -> Request<Body> {
    let headers = req.headers_mut();
    strip_hop_by_hop(headers, upgrade);

    let backend_host = route.backend_host.as_deref().unwrap_or(inbound_host);
    if let Ok(value) = HeaderValue::from_str(backend_host) {
        headers.insert(header::HOST, value);
    }

    if let Some(addr) = client {
        let ip = addr.ip().to_string();
        let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if secure { "https" } else { "http" }),
    );
    if let Ok(value) = HeaderValue::from_str(inbound_host) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    req
}
