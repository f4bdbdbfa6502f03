//! Certificate authority clients
//!
//! The certificate manager only needs "give me key material for this domain".
//! How that happens (ACME account, order, HTTP-01 challenge) is the client's
//! business.

use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::AcmeConfig;
use crate::error::CertError;

/// PEM material returned by a certificate authority
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    /// Leaf certificate followed by intermediates
    pub fullchain_pem: String,
    /// Intermediates only (may be empty)
    pub chain_pem: String,
}

/// Issues certificates for single domains
#[async_trait::async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Obtain fresh key material for `domain`
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError>;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Let's Encrypt through certbot's webroot plugin.
///
/// certbot writes the HTTP-01 token under `{webroot}/.well-known/acme-challenge/`,
/// which the challenge responder serves on the plaintext listener.
pub struct CertbotAuthority {
    certbot: PathBuf,
    email: String,
    webroot: PathBuf,
    live_dir: PathBuf,
    directory_url: Option<String>,
}

impl CertbotAuthority {
    pub fn new(config: &AcmeConfig, webroot: PathBuf) -> Result<Self, String> {
        let email = config
            .email
            .clone()
            .ok_or_else(|| "Email is mandatory for Let's Encrypt to work".to_string())?;

        Ok(Self {
            certbot: config.certbot_path.clone(),
            email,
            webroot,
            live_dir: config.live_dir.clone(),
            directory_url: (!config.production).then(|| config.directory_url().to_string()),
        })
    }

    fn args(&self, domain: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "certonly",
            "--non-interactive",
            "--agree-tos",
            "--email",
            self.email.as_str(),
            "--webroot",
            "--webroot-path",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.webroot.display().to_string());
        args.extend(["--domains", domain, "--keep", "--quiet"].iter().map(|s| s.to_string()));

        if let Some(url) = &self.directory_url {
            args.push("--server".to_string());
            args.push(url.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for CertbotAuthority {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        let authority_err = |reason: String| CertError::Authority {
            domain: domain.to_string(),
            reason,
        };

        info!("Requesting certificate for {} ({})", domain, self.email);
        if self.directory_url.is_some() {
            info!("+++ USING TESTING (STAGING) LETSENCRYPT SERVER +++");
        }

        let output = Command::new(&self.certbot)
            .args(self.args(domain))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| authority_err(format!("failed to run {}: {}", self.certbot.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(authority_err(format!(
                "certbot exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let dir = self.live_dir.join(domain);
        debug!("Reading issued certificate from {}", dir.display());
        let read = |name: &'static str| {
            let path = dir.join(name);
            async move {
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| authority_err(format!("failed to read {}: {}", path.display(), e)))
            }
        };

        Ok(IssuedCertificate {
            private_key_pem: read("privkey.pem").await?,
            fullchain_pem: read("fullchain.pem").await?,
            chain_pem: read("chain.pem").await.unwrap_or_default(),
        })
    }

    fn name(&self) -> &str {
        "certbot"
    }
}

/// Self-signed certificates for development and tests
pub struct SelfSignedAuthority {
    validity_days: i64,
}

impl SelfSignedAuthority {
    pub fn new(validity_days: i64) -> Self {
        Self { validity_days }
    }

    /// Generate a certificate synchronously (also used for the TLS fallback)
    pub fn generate(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        let gen_err = |e: rcgen::Error| CertError::Authority {
            domain: domain.to_string(),
            reason: format!("failed to generate self-signed certificate: {}", e),
        };

        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).map_err(gen_err)?;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::days(self.validity_days);

        let key_pair = rcgen::KeyPair::generate().map_err(gen_err)?;
        let cert = params.self_signed(&key_pair).map_err(gen_err)?;

        Ok(IssuedCertificate {
            private_key_pem: key_pair.serialize_pem(),
            fullchain_pem: cert.pem(),
            chain_pem: String::new(),
        })
    }
}

impl Default for SelfSignedAuthority {
    fn default() -> Self {
        Self::new(90)
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        debug!("Generating self-signed certificate for {}", domain);
        self.generate(domain)
    }

    fn name(&self) -> &str {
        "self-signed"
    }
}
