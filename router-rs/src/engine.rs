//! Forwarding engine
//!
//! Moves requests and upgraded connections between clients and backends.
//! Routing decisions are made by the dispatcher; the engine only needs a
//! [`Target`] and a prepared request.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Request, Response, StatusCode, Uri, Version};
use hyper::client::conn::http1;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{BackendError, BackendErrorKind};
use crate::route::{Scheme, Target};

/// HTTP client type for plaintext backends
type HttpClient = Client<HttpConnector, Body>;

/// Headers that describe one hop and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a request asks to switch protocols (WebSocket and friends)
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE) && connection_tokens(headers).any(|t| t.eq_ignore_ascii_case("upgrade"))
}

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Remove hop-by-hop headers, including any named by `Connection`.
///
/// With `keep_upgrade` the `Connection: upgrade` / `Upgrade` pair survives.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<HeaderName> = connection_tokens(headers)
        .filter(|t| !(keep_upgrade && t.eq_ignore_ascii_case("upgrade")))
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    let upgrade = keep_upgrade.then(|| headers.get(header::UPGRADE).cloned()).flatten();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, header::HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol);
    }
}

/// Forwards requests to backend targets
#[derive(Clone)]
pub struct ForwardEngine {
    client: HttpClient,
    tls: TlsConnector,
    timeout: Duration,
}

impl ForwardEngine {
    /// Engine trusting the public web PKI for https targets
    pub fn new(timeout: Duration) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
        }));
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::with_client_config(timeout, config)
    }

    /// Engine with a caller-supplied TLS client configuration
    pub fn with_client_config(timeout: Duration, mut config: ClientConfig) -> Self {
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Self {
            client,
            tls: TlsConnector::from(Arc::new(config)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward an ordinary request and return the backend's response
    pub async fn forward(&self, req: Request<Body>, target: &Target) -> Result<Response<Body>, BackendError> {
        let req = into_backend_request(req, target)?;

        let response = tokio::time::timeout(self.timeout, self.send(req, target))
            .await
            .map_err(|_| self.timed_out(target))??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers, false);
        Ok(Response::from_parts(parts, body))
    }

    async fn send(&self, req: Request<Body>, target: &Target) -> Result<Response<Body>, BackendError> {
        match target.scheme {
            Scheme::Http => {
                let response = self.client.request(req).await.map_err(|e| {
                    let kind = if e.is_connect() {
                        BackendErrorKind::Unreachable
                    } else {
                        classify(&e)
                    };
                    BackendError::new(kind, target.to_string(), error_chain(&e))
                })?;
                Ok(response.map(Body::new))
            }
            Scheme::Https => {
                let stream = self.connect_tls(target).await?;
                let mut sender = handshake(stream, false, target).await?;
                let response = sender
                    .send_request(req)
                    .await
                    .map_err(|e| backend_error(&e, target))?;
                Ok(response.map(Body::new))
            }
        }
    }

    /// Forward a protocol upgrade and splice both connections once the backend agrees.
    ///
    /// The backend's answer is returned as-is; on `101 Switching Protocols`
    /// a task copies bytes in both directions until either side closes.
    pub async fn upgrade(&self, mut req: Request<Body>, target: &Target) -> Result<Response<Body>, BackendError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let req = into_backend_request(req, target)?;

        let exchange = async {
            let mut sender = match target.scheme {
                Scheme::Http => handshake(self.connect_tcp(target).await?, true, target).await?,
                Scheme::Https => handshake(self.connect_tls(target).await?, true, target).await?,
            };
            sender
                .send_request(req)
                .await
                .map_err(|e| backend_error(&e, target))
        };
        let mut response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| self.timed_out(target))??;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!("{} declined upgrade with {}", target, response.status());
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers, false);
            return Ok(Response::from_parts(parts, Body::new(body)));
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);
        let target_name = target.to_string();
        tokio::spawn(async move {
            let (client, backend) = match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!("Upgrade with {} not completed: {}", target_name, e);
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut backend = TokioIo::new(backend);
            match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                Ok((up, down)) => debug!("Upgraded connection to {} closed ({} bytes up, {} down)", target_name, up, down),
                Err(e) => debug!("Upgraded connection to {} ended: {}", target_name, e),
            }
        });

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers, true);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    async fn connect_tcp(&self, target: &Target) -> Result<TcpStream, BackendError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| BackendError::new(BackendErrorKind::Unreachable, target.to_string(), e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn connect_tls(&self, target: &Target) -> Result<tokio_rustls::client::TlsStream<TcpStream>, BackendError> {
        let stream = self.connect_tcp(target).await?;
        let name = rustls::ServerName::try_from(target.host.as_str()).map_err(|e| {
            BackendError::new(BackendErrorKind::Protocol, target.to_string(), e.to_string())
        })?;
        self.tls
            .connect(name, stream)
            .await
            .map_err(|e| BackendError::new(classify_io(&e), target.to_string(), format!("TLS: {}", e)))
    }

    fn timed_out(&self, target: &Target) -> BackendError {
        BackendError::new(
            BackendErrorKind::Timeout,
            target.to_string(),
            format!("no response within {:?}", self.timeout),
        )
    }
}

/// Rewrite a client request for the backend connection
fn into_backend_request(req: Request<Body>, target: &Target) -> Result<Request<Body>, BackendError> {
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri = match target.scheme {
        // The pooled client wants absolute URIs
        Scheme::Http => format!("http://{}{}", target.authority(), path),
        Scheme::Https => path.to_string(),
    };
    parts.uri = uri.parse::<Uri>().map_err(|e| {
        BackendError::new(BackendErrorKind::Protocol, target.to_string(), format!("invalid URI {}: {}", uri, e))
    })?;
    // Backends are spoken to over HTTP/1.1 whatever the client negotiated
    parts.version = Version::HTTP_11;

    Ok(Request::from_parts(parts, body))
}

async fn handshake<S>(stream: S, upgrades: bool, target: &Target) -> Result<http1::SendRequest<Body>, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| backend_error(&e, target))?;

    let target_name = target.to_string();
    tokio::spawn(async move {
        let result = if upgrades { conn.with_upgrades().await } else { conn.await };
        if let Err(e) = result {
            debug!("Backend connection to {} closed: {}", target_name, e);
        }
    });
    Ok(sender)
}

fn backend_error(err: &hyper::Error, target: &Target) -> BackendError {
    BackendError::new(classify(err), target.to_string(), error_chain(err))
}

/// Map an error chain onto the backend failure taxonomy
fn classify(err: &(dyn StdError + 'static)) -> BackendErrorKind {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return classify_io(io_err);
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                return BackendErrorKind::Reset;
            }
            if hyper_err.is_timeout() {
                return BackendErrorKind::Timeout;
            }
        }
        current = e.source();
    }
    BackendErrorKind::Protocol
}

fn classify_io(err: &io::Error) -> BackendErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => BackendErrorKind::Reset,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotFound => {
            BackendErrorKind::Unreachable
        }
        io::ErrorKind::TimedOut => BackendErrorKind::Timeout,
        _ => BackendErrorKind::Protocol,
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}
