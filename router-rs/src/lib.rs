//! router-rs: host-based reverse proxy with automatic TLS
//!
//! Routes each request by its `Host` header to a backend, keeps the routing
//! table in sync with a file on disk and obtains certificates for TLS
//! hostnames on demand.
//!
//! # Features
//!
//! - Hot-reloaded route table (JSON or TOML) with atomic snapshot swaps
//! - SNI certificate selection without blocking the handshake
//! - Single-flight certificate issuance with background retries and renewal
//! - ACME HTTP-01 challenge responder on the plaintext listener
//! - WebSocket upgrades through the same routing rules
//!
//! # Example route document
//!
//! ```json
//! {
//!   "routes": {
//!     "app.example.com": {
//!       "target": "http://127.0.0.1:3000",
//!       "aliases": ["www.example.com"],
//!       "ssl": { "enable": true, "onlySecure": true },
//!       "errorRedirect": "https://status.example.com/"
//!     },
//!     "legacy.example.com": {
//!       "address": "10.0.0.5",
//!       "port": 8080,
//!       "headers": { "host": "legacy.internal" },
//!       "enabled": false
//!     }
//!   }
//! }
//! ```

pub mod authority;
pub mod certs;
pub mod challenge;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod pages;
pub mod proxy;
pub mod route;
pub mod store;
pub mod table;
pub mod tls;

pub use certs::{CertificateManager, CertificateSettings};
pub use config::AppConfig;
pub use dispatch::Dispatcher;
pub use error::{Result, RouterError};
pub use proxy::ProxyServer;
pub use route::{Route, RouteTable};
pub use table::RouteTableManager;
