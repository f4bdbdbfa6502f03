//! Configuration for router-rs
//!
//! Two documents feed the router:
//!
//! - [`AppConfig`]: process settings (listeners, certificate storage, ACME),
//!   read once at startup from TOML with `ROUTER__` environment overrides.
//! - [`RoutesDocument`]: the hostname routing table, JSON or TOML, reloaded
//!   whenever it changes on disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Result, RouterError};

/// Main router configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: RoutesConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Global error messages keyed by status code (`"404"`, `"503"`, ...) or `"other"`
    #[serde(default)]
    pub errors: HashMap<String, String>,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Plaintext listen address (e.g., "0.0.0.0:80")
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// TLS listen address (e.g., "0.0.0.0:443")
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Upper bound on a single forwarded request
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,
    /// Upper bound on a TLS handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

/// Where the routing table comes from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutesConfig {
    /// Route document (JSON or TOML, by extension)
    #[serde(default = "default_routes_file")]
    pub file: PathBuf,
    /// Reload the document when it changes on disk
    #[serde(default = "default_true")]
    pub watch: bool,
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Root of per-domain certificate storage
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// Webroot for HTTP-01 challenge files
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,
    /// Certificate served when SNI matches no managed domain
    pub default_cert_path: Option<PathBuf>,
    /// Private key for `default_cert_path`
    pub default_key_path: Option<PathBuf>,
    /// Generate a self-signed fallback instead of failing the handshake
    #[serde(default)]
    pub self_signed_fallback: bool,
}

/// Which certificate authority client to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorityKind {
    Certbot,
    SelfSigned,
}

/// Certificate issuance configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeConfig {
    /// Contact email for Let's Encrypt
    pub email: Option<String>,
    /// Use the production directory instead of staging
    #[serde(default)]
    pub production: bool,
    #[serde(default = "default_authority")]
    pub authority: AuthorityKind,
    #[serde(default = "default_certbot_path")]
    pub certbot_path: PathBuf,
    /// Where certbot leaves issued material
    #[serde(default = "default_live_dir")]
    pub live_dir: PathBuf,
    #[serde(default = "default_issue_timeout")]
    pub issue_timeout_seconds: u64,
    /// Renew certificates this many days before they expire
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,
    #[serde(default = "default_renew_interval")]
    pub renew_interval_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base")]
    pub retry_base_seconds: u64,
    #[serde(default = "default_self_signed_validity")]
    pub self_signed_validity_days: i64,
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_routes_file() -> PathBuf {
    PathBuf::from("routes.json")
}

fn default_true() -> bool {
    true
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("./ssl/certs")
}

fn default_webroot() -> PathBuf {
    PathBuf::from("./ssl")
}

fn default_authority() -> AuthorityKind {
    AuthorityKind::Certbot
}

fn default_certbot_path() -> PathBuf {
    PathBuf::from("certbot")
}

fn default_live_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_issue_timeout() -> u64 {
    120
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_renew_interval() -> u64 {
    12 * 60 * 60
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base() -> u64 {
    30
}

fn default_self_signed_validity() -> i64 {
    90
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            request_timeout_seconds: default_timeout(),
            handshake_timeout_seconds: default_handshake_timeout(),
        }
    }
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            file: default_routes_file(),
            watch: true,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            webroot: default_webroot(),
            default_cert_path: None,
            default_key_path: None,
            self_signed_fallback: false,
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            production: false,
            authority: default_authority(),
            certbot_path: default_certbot_path(),
            live_dir: default_live_dir(),
            issue_timeout_seconds: default_issue_timeout(),
            renew_before_days: default_renew_before_days(),
            renew_interval_seconds: default_renew_interval(),
            max_retries: default_max_retries(),
            retry_base_seconds: default_retry_base(),
            self_signed_validity_days: default_self_signed_validity(),
        }
    }
}

impl AcmeConfig {
    /// ACME directory certbot should talk to
    pub fn directory_url(&self) -> &'static str {
        if self.production {
            "https://acme-v02.api.letsencrypt.org/directory"
        } else {
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, layered with `ROUTER__*` environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("ROUTER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RouterError::Config(format!("Failed to read config: {}", e)))?;

        let config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| RouterError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                http_addr: "127.0.0.1:8080".to_string(),
                https_addr: "127.0.0.1:8443".to_string(),
                ..ServerConfig::default()
            },
            tls: TlsConfig {
                self_signed_fallback: true,
                ..TlsConfig::default()
            },
            acme: AcmeConfig {
                authority: AuthorityKind::SelfSigned,
                ..AcmeConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for addr in [&self.server.http_addr, &self.server.https_addr] {
            addr.parse::<SocketAddr>()
                .map_err(|e| RouterError::Config(format!("Invalid listen address '{}': {}", addr, e)))?;
        }

        if self.acme.authority == AuthorityKind::Certbot && self.acme.email.is_none() {
            return Err(RouterError::Config(
                "acme.email is mandatory for Let's Encrypt to work".to_string(),
            ));
        }

        if self.tls.default_cert_path.is_some() != self.tls.default_key_path.is_some() {
            return Err(RouterError::Config(
                "tls.default_cert_path and tls.default_key_path must be set together".to_string(),
            ));
        }

        if self.acme.max_retries == 0 {
            return Err(RouterError::Config("acme.max_retries must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// A route document: hostname -> route entry
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutesDocument {
    pub routes: HashMap<String, RouteEntry>,
}

/// One hostname entry as written by operators
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteEntry {
    /// Full backend URL (e.g., "http://127.0.0.1:9001")
    pub target: Option<String>,
    /// Backend host, used when `target` is absent
    pub address: Option<String>,
    /// Backend port, used when `target` is absent
    pub port: Option<u16>,
    /// Use https towards the backend when composing from address/port
    pub secure: Option<bool>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub ssl: SslEntry,
    pub error_redirect: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub headers: HeaderEntry,
    /// Per-route error messages, same keys as the global `[errors]` table
    #[serde(default)]
    pub error_pages: HashMap<String, String>,
}

/// TLS flags of a route entry
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SslEntry {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_true")]
    pub generate: bool,
    #[serde(default)]
    pub only_secure: bool,
}

impl Default for SslEntry {
    fn default() -> Self {
        Self {
            enable: false,
            generate: false,
            only_secure: false,
        }
    }
}

/// Header overrides applied to forwarded requests
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HeaderEntry {
    pub host: Option<String>,
}

impl RoutesDocument {
    /// Parse a JSON route document
    pub fn from_json(content: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    /// Parse a TOML route document
    pub fn from_toml(content: &str) -> std::result::Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}
