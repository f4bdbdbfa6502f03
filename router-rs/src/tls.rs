//! TLS configuration and SNI certificate selection
//!
//! Every handshake asks the [`CertificateManager`] for the SNI hostname's
//! certificate. Unknown names get the optional fallback certificate, or no
//! certificate at all, which aborts the handshake.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::authority::SelfSignedAuthority;
use crate::certs::CertificateManager;
use crate::config::TlsConfig;
use crate::error::{Result, RouterError};
use crate::store::CertificateMaterial;

/// ALPN protocols offered on the TLS listener
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Picks the certificate for a handshake from the SNI hostname
pub struct SniResolver {
    certs: Arc<CertificateManager>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn new(certs: Arc<CertificateManager>, fallback: Option<Arc<CertifiedKey>>) -> Self {
        Self { certs, fallback }
    }

    fn certified_key_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let managed = server_name.and_then(|name| {
            let name = name.to_ascii_lowercase();
            let material = self.certs.resolve(&name);
            if material.is_none() {
                debug!("No certificate for SNI {}", name);
            }
            material
        });

        match managed {
            Some(material) => Some(Arc::clone(&material.certified_key)),
            None => self.fallback.clone(),
        }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver")
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.certified_key_for(client_hello.server_name())
    }
}

/// TLS manager for the secure listener
pub struct TlsManager {
    config: TlsConfig,
    certs: Arc<CertificateManager>,
}

impl TlsManager {
    pub fn new(config: TlsConfig, certs: Arc<CertificateManager>) -> Self {
        Self { config, certs }
    }

    /// Build a TLS acceptor backed by the SNI resolver
    pub fn build_acceptor(&self) -> Result<TlsAcceptor> {
        let server_config = self.build_server_config()?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    fn build_server_config(&self) -> Result<ServerConfig> {
        let resolver = SniResolver::new(Arc::clone(&self.certs), self.fallback()?);

        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        Ok(config)
    }

    /// Certificate for handshakes without a managed SNI match
    fn fallback(&self) -> Result<Option<Arc<CertifiedKey>>> {
        if let (Some(cert_path), Some(key_path)) = (&self.config.default_cert_path, &self.config.default_key_path) {
            info!(
                "Loading fallback TLS certificate from {} and {}",
                cert_path.display(),
                key_path.display()
            );
            return load_static_certs(cert_path, key_path).map(Some);
        }

        if self.config.self_signed_fallback {
            info!("Generating self-signed fallback certificate");
            return generate_self_signed().map(Some);
        }

        info!("No fallback certificate, unknown SNI names will fail the handshake");
        Ok(None)
    }
}

/// Load a certificate chain and key from files
fn load_static_certs(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let fullchain = std::fs::read_to_string(cert_path)
        .map_err(|e| RouterError::Tls(format!("Failed to open certificate file: {}", e)))?;
    let private_key = std::fs::read_to_string(key_path)
        .map_err(|e| RouterError::Tls(format!("Failed to open key file: {}", e)))?;

    let material = CertificateMaterial::from_pem("default", private_key, fullchain, String::new())
        .map_err(|e| RouterError::Tls(e.to_string()))?;
    Ok(material.certified_key)
}

/// Self-signed certificate for development
fn generate_self_signed() -> Result<Arc<CertifiedKey>> {
    let issued = SelfSignedAuthority::default()
        .generate("localhost")
        .map_err(|e| RouterError::Tls(e.to_string()))?;

    let material = CertificateMaterial::from_pem("localhost", issued.private_key_pem, issued.fullchain_pem, issued.chain_pem)
        .map_err(|e| RouterError::Tls(e.to_string()))?;
    Ok(material.certified_key)
}
