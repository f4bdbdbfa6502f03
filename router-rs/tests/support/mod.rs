#![allow(dead_code)]

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use router_rs::authority::SelfSignedAuthority;
use router_rs::challenge::ChallengeResponder;
use router_rs::config::{ServerConfig, TlsConfig};
use router_rs::engine::ForwardEngine;
use router_rs::pages::ErrorPages;
use router_rs::store::CertificateStore;
use router_rs::table::FileSource;
use router_rs::tls::TlsManager;
use router_rs::{CertificateManager, CertificateSettings, Dispatcher, ProxyServer, RouteTableManager};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Running proxy (plaintext and TLS listeners) plus its scratch directory
pub struct TestProxy {
    pub addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub certs: Arc<CertificateManager>,
    pub tables: Arc<RouteTableManager>,
    pub routes_file: PathBuf,
    pub webroot: PathBuf,
    pub dispatcher: Arc<Dispatcher>,
    _dir: TempDir,
}

impl TestProxy {
    /// Start a proxy on 127.0.0.1 serving the given route document
    pub async fn start(routes: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let routes_file = dir.path().join("routes.json");
        let webroot = dir.path().join("ssl");
        write_routes(&routes_file, &routes);

        let tables = Arc::new(RouteTableManager::new(Arc::new(FileSource::new(&routes_file))).unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tables),
            ChallengeResponder::new(&webroot),
            ForwardEngine::new(Duration::from_secs(5)),
            ErrorPages::default(),
        ));

        let certs = Arc::new(CertificateManager::new(
            CertificateStore::new(dir.path().join("certs")),
            Arc::new(SelfSignedAuthority::default()),
            CertificateSettings::default(),
        ));
        certs.scan(&tables.snapshot()).await;
        Arc::clone(&certs).start_sync_task(tables.subscribe());

        let tls_acceptor = TlsManager::new(TlsConfig::default(), Arc::clone(&certs))
            .build_acceptor()
            .unwrap();
        let server = Arc::new(ProxyServer::new(
            ServerConfig::default(),
            Arc::clone(&dispatcher),
            tls_acceptor,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let https_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let https_addr = https_listener.local_addr().unwrap();

        let plain = Arc::clone(&server);
        tokio::spawn(async move { plain.run_http(listener).await });
        tokio::spawn(async move { server.run_https(https_listener).await });

        Self {
            addr,
            https_addr,
            certs,
            tables,
            routes_file,
            webroot,
            dispatcher,
            _dir: dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// GET `path` with the given `Host` header, without following redirects
    pub async fn get(&self, host: &str, path: &str) -> reqwest::Response {
        client()
            .get(self.url(path))
            .header("host", host)
            .send()
            .await
            .unwrap()
    }
}

/// Client that connects to `https_addr` for `host`, sending it as SNI
pub fn tls_client(host: &str, https_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .danger_accept_invalid_certs(true)
        .resolve(host, https_addr)
        .build()
        .unwrap()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

pub fn write_routes(path: &Path, routes: &Value) {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&json!({ "routes": routes })).unwrap()).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

/// Backend answering with request details as JSON, plus a WebSocket echo at `/ws`
pub async fn spawn_backend(name: &'static str) -> u16 {
    let app = Router::new()
        .route("/ws", get(websocket_echo))
        .fallback(move |req: Request<Body>| async move { describe(name, &req) });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    port
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn describe(name: &str, req: &Request<Body>) -> impl IntoResponse {
    let header = |headers: &HeaderMap, key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(|v| Value::String(v.to_string()))
            .unwrap_or(Value::Null)
    };
    let headers = req.headers();
    let body = json!({
        "backend": name,
        "path": req.uri().path(),
        "host": header(headers, "host"),
        "forwardedFor": header(headers, "x-forwarded-for"),
        "forwardedProto": header(headers, "x-forwarded-proto"),
        "forwardedHost": header(headers, "x-forwarded-host"),
        "connection": header(headers, "connection"),
    });
    (StatusCode::OK, axum::Json(body))
}

async fn websocket_echo(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        if let Message::Text(text) = message {
            if socket.send(Message::Text(format!("echo: {}", text))).await.is_err() {
                break;
            }
        }
    }
}
