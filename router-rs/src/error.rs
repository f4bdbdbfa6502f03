//! Error types for router-rs

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for router operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Router error types
#[derive(Error, Debug)]
pub enum RouterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Route table could not be loaded
    #[error("Route table error: {0}")]
    Load(#[from] LoadError),

    /// Certificate lifecycle error
    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    /// Backend failure reported by the proxying engine
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Route not found (or disabled)
    #[error("No route found for {host}")]
    RouteNotFound { host: String },

    /// Plaintext request to a secure-only route
    #[error("Insecure request rejected for {host}")]
    InsecureForbidden { host: String },
}

impl RouterError {
    /// Client-facing status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            RouterError::InsecureForbidden { .. } => StatusCode::FORBIDDEN,
            RouterError::Cert(_) | RouterError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors raised while loading a route document into a route table.
///
/// Any of these rejects the whole document.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read {source_name}: {reason}")]
    Read { source_name: String, reason: String },

    #[error("Failed to parse {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("Route \"{host}\" has no target")]
    MissingTarget { host: String },

    #[error("Route \"{host}\" has an invalid target \"{target}\": {reason}")]
    InvalidTarget {
        host: String,
        target: String,
        reason: String,
    },

    #[error("Route \"{host}\" has an invalid hostname")]
    InvalidHost { host: String },

    #[error("Hostname \"{host}\" is claimed by more than one route")]
    DuplicateHost { host: String },

    #[error("Route \"{host}\" has an invalid errorRedirect \"{url}\"")]
    InvalidRedirect { host: String, url: String },
}

/// Certificate lifecycle errors.
///
/// `Clone` so every waiter on one issuance observes the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertError {
    #[error("Certificate authority rejected {domain}: {reason}")]
    Authority { domain: String, reason: String },

    #[error("Issuance for {domain} timed out after {seconds}s")]
    Timeout { domain: String, seconds: u64 },

    #[error("No certificate available for {domain}")]
    Unavailable { domain: String },

    #[error("No certificate for {domain} and automatic issuance is disabled")]
    NotIssuable { domain: String },

    #[error("Invalid certificate material for {domain}: {reason}")]
    Material { domain: String, reason: String },

    #[error("Certificate storage error for {domain}: {reason}")]
    Storage { domain: String, reason: String },

    #[error("Issuance for {domain} was aborted: {reason}")]
    Aborted { domain: String, reason: String },

    #[error("Invalid domain name: \"{domain}\"")]
    InvalidDomain { domain: String },
}

impl CertError {
    pub fn domain(&self) -> &str {
        match self {
            CertError::Authority { domain, .. }
            | CertError::Timeout { domain, .. }
            | CertError::Unavailable { domain }
            | CertError::NotIssuable { domain }
            | CertError::Material { domain, .. }
            | CertError::Storage { domain, .. }
            | CertError::Aborted { domain, .. }
            | CertError::InvalidDomain { domain } => domain,
        }
    }

    /// Whether a background retry may succeed where this attempt failed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CertError::NotIssuable { .. } | CertError::InvalidDomain { .. }
        )
    }
}

/// How a forward to a backend failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Connection to the target could not be established
    Unreachable,
    /// Peer closed or reset the connection mid-exchange
    Reset,
    /// Backend did not answer within the request timeout
    Timeout,
    /// Anything else (malformed response, TLS failure, ...)
    Protocol,
}

/// Backend failure reported by the proxying engine
#[derive(Error, Debug)]
#[error("{kind:?} talking to {target}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub target: String,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    /// Resets are expected (clients and backends hang up) and not worth reporting
    pub fn is_reset(&self) -> bool {
        self.kind == BackendErrorKind::Reset
    }
}
