//! Listener frontends
//!
//! One plaintext and one TLS listener, both serving the same dispatcher.
//! Connections are driven by hyper's auto (HTTP/1 + HTTP/2) builder with
//! upgrades enabled so WebSocket handshakes reach the dispatcher too.

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;

/// Peer address of the connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Per-listener handler state
#[derive(Clone)]
struct ListenerState {
    dispatcher: Arc<Dispatcher>,
    secure: bool,
}

/// Build the axum router for one listener
pub fn router(dispatcher: Arc<Dispatcher>, secure: bool) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(ListenerState { dispatcher, secure })
}

async fn proxy_handler(State(state): State<ListenerState>, req: Request<Body>) -> Response<Body> {
    let client = req.extensions().get::<ClientAddr>().map(|c| c.0);
    state.dispatcher.handle(req, state.secure, client).await
}

/// Proxy server
pub struct ProxyServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    tls_acceptor: TlsAcceptor,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>, tls_acceptor: TlsAcceptor) -> Self {
        Self {
            config,
            dispatcher,
            tls_acceptor,
        }
    }

    /// Bind both listeners and serve until one of them fails
    pub async fn run(&self) -> Result<()> {
        let http = TcpListener::bind(&self.config.http_addr).await?;
        let https = TcpListener::bind(&self.config.https_addr).await?;

        info!("Listening for HTTP on {}", self.config.http_addr);
        info!("Listening for HTTPS on {}", self.config.https_addr);

        tokio::try_join!(self.run_http(http), self.run_https(https))?;
        Ok(())
    }

    /// Serve plaintext connections from `listener`
    pub async fn run_http(&self, listener: TcpListener) -> Result<()> {
        let router = router(Arc::clone(&self.dispatcher), false);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("HTTP accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let router = router.clone();
            tokio::spawn(serve_connection(stream, router, addr));
        }
    }

    /// Serve TLS connections from `listener`
    pub async fn run_https(&self, listener: TcpListener) -> Result<()> {
        let router = router(Arc::clone(&self.dispatcher), true);
        let handshake_timeout = Duration::from_secs(self.config.handshake_timeout_seconds);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("HTTPS accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let acceptor = self.tls_acceptor.clone();
            let router = router.clone();

            tokio::spawn(async move {
                match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => serve_connection(tls_stream, router, addr).await,
                    Ok(Err(e)) => debug!("TLS handshake failed from {}: {}", addr, e),
                    Err(_) => debug!("TLS handshake from {} timed out", addr),
                }
            });
        }
    }
}

async fn serve_connection<S>(stream: S, router: Router, addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ClientAddr(addr));
        router.clone().oneshot(req)
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!("Error serving connection from {}: {}", addr, e);
    }
}
