//! Routes and the immutable route table
//!
//! A [`RouteTable`] is built once from a [`RoutesDocument`] and never mutated;
//! aliases share the same `Arc<Route>` as their canonical hostname.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{RouteEntry, RoutesDocument};
use crate::error::LoadError;

/// Backend scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Resolved backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parse a backend URL such as `http://127.0.0.1:9001`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = url::Url::parse(raw).map_err(|e| e.to_string())?;
        let scheme = match url.scheme() {
            "http" | "ws" => Scheme::Http,
            "https" | "wss" => Scheme::Https,
            other => return Err(format!("unsupported scheme '{}'", other)),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| "missing host".to_string())?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    /// Compose a target from the address/port/secure shorthand
    pub fn compose(address: &str, port: u16, secure: bool) -> Result<Self, String> {
        let scheme = if secure { "https" } else { "http" };
        Self::parse(&format!("{}://{}:{}", scheme, address, port))
    }

    /// `host:port` as used for the TCP connection
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

/// TLS expectations for a hostname
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SslPolicy {
    /// TLS is expected for this hostname (a certificate is managed)
    pub enable: bool,
    /// Certificates may be issued automatically
    pub generate: bool,
    /// Plaintext requests are rejected with 403
    pub only_secure: bool,
}

/// One routable hostname
#[derive(Debug, Clone)]
pub struct Route {
    /// Canonical hostname (the document key)
    pub host: String,
    pub target: Target,
    pub enabled: bool,
    pub ssl: SslPolicy,
    pub error_redirect: Option<String>,
    pub aliases: Vec<String>,
    /// Host header sent to the backend, if overridden
    pub backend_host: Option<String>,
    /// Per-route error messages keyed like the global table
    pub error_pages: HashMap<String, String>,
}

impl Route {
    /// Build a route from its document entry, validating the target
    pub fn from_entry(host: &str, entry: &RouteEntry) -> Result<Self, LoadError> {
        validate_hostname(host)?;

        let target = match (&entry.target, &entry.address, entry.port) {
            (Some(raw), _, _) => Target::parse(raw).map_err(|reason| LoadError::InvalidTarget {
                host: host.to_string(),
                target: raw.clone(),
                reason,
            })?,
            (None, None, None) => {
                return Err(LoadError::MissingTarget {
                    host: host.to_string(),
                })
            }
            (None, address, port) => {
                let address = address.as_deref().unwrap_or("localhost");
                let port = port.unwrap_or(8080);
                let secure = entry.secure.unwrap_or(false);
                Target::compose(address, port, secure).map_err(|reason| LoadError::InvalidTarget {
                    host: host.to_string(),
                    target: format!("{}:{}", address, port),
                    reason,
                })?
            }
        };

        if let Some(url) = &entry.error_redirect {
            if url::Url::parse(url).is_err() {
                return Err(LoadError::InvalidRedirect {
                    host: host.to_string(),
                    url: url.clone(),
                });
            }
        }

        for alias in &entry.aliases {
            validate_hostname(alias)?;
        }

        Ok(Self {
            host: host.to_string(),
            target,
            enabled: entry.enabled,
            ssl: SslPolicy {
                enable: entry.ssl.enable,
                generate: entry.ssl.enable && entry.ssl.generate,
                only_secure: entry.ssl.only_secure,
            },
            error_redirect: entry.error_redirect.clone(),
            aliases: entry.aliases.clone(),
            backend_host: entry.headers.host.clone(),
            error_pages: entry.error_pages.clone(),
        })
    }

    /// Canonical hostname followed by its aliases
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.host.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

fn validate_hostname(host: &str) -> Result<(), LoadError> {
    let valid = !host.is_empty()
        && !host.starts_with('.')
        && !host.ends_with('.')
        && !host.chars().any(|c| c.is_whitespace() || c == '/');
    if valid {
        Ok(())
    } else {
        Err(LoadError::InvalidHost {
            host: host.to_string(),
        })
    }
}

/// Immutable hostname -> route mapping
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
    version: u64,
}

impl RouteTable {
    /// Build a table from a document; any invalid entry rejects the whole document
    pub fn build(document: &RoutesDocument, version: u64) -> Result<Self, LoadError> {
        let mut routes: HashMap<String, Arc<Route>> = HashMap::new();

        for (host, entry) in &document.routes {
            let route = Arc::new(Route::from_entry(host, entry)?);
            for name in route.hostnames() {
                if routes.insert(name.to_string(), Arc::clone(&route)).is_some() {
                    return Err(LoadError::DuplicateHost {
                        host: name.to_string(),
                    });
                }
            }
        }

        Ok(Self { routes, version })
    }

    /// Exact hostname lookup
    pub fn get(&self, host: &str) -> Option<&Arc<Route>> {
        self.routes.get(host)
    }

    /// Look up an inbound `Host` value, retrying without a trailing `:port`
    pub fn lookup(&self, host: &str) -> Option<&Arc<Route>> {
        self.routes
            .get(host)
            .or_else(|| strip_port(host).and_then(|bare| self.routes.get(bare)))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Every key of the table with its route (aliases included)
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Arc<Route>)> {
        self.routes.iter().map(|(host, route)| (host.as_str(), route))
    }

    /// Distinct routes (each canonical hostname once)
    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes
            .iter()
            .filter(|(host, route)| host.as_str() == route.host)
            .map(|(_, route)| route)
    }
}

fn strip_port(host: &str) -> Option<&str> {
    let (bare, port) = host.rsplit_once(':')?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // "[::1]:443" keeps its brackets off; a bare IPv6 literal has no port to strip
    if bare.starts_with('[') {
        return bare.strip_prefix('[').and_then(|b| b.strip_suffix(']'));
    }
    if bare.contains(':') {
        return None;
    }
    Some(bare)
}
