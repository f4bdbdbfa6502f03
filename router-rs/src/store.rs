//! Certificate store
//!
//! Per-domain certificate records (lifecycle status plus cached key material)
//! and their on-disk layout:
//!
//! ```text
//! {cert_dir}/{domain}/privkey.pem
//! {cert_dir}/{domain}/fullchain.pem
//! {cert_dir}/{domain}/chain.pem
//! ```

use chrono::{DateTime, Utc};
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs;
use tracing::debug;

use crate::error::CertError;

/// Lifecycle status of a domain's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    /// Domain requires TLS but no certificate has been obtained yet
    Missing,
    /// First issuance in progress
    Requesting,
    /// Usable certificate cached
    Valid,
    /// Usable certificate cached, replacement in progress
    Renewing,
    /// Last issuance attempt failed
    Failed,
}

/// Parsed certificate chain and private key for one domain
pub struct CertificateMaterial {
    pub domain: String,
    pub private_key_pem: String,
    pub fullchain_pem: String,
    pub chain_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Ready-to-serve rustls key, built once per issuance
    pub certified_key: Arc<CertifiedKey>,
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("domain", &self.domain)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl CertificateMaterial {
    /// Parse PEM material, reading the validity period from the leaf certificate
    pub fn from_pem(
        domain: &str,
        private_key_pem: String,
        fullchain_pem: String,
        chain_pem: String,
    ) -> Result<Self, CertError> {
        let material_err = |reason: String| CertError::Material {
            domain: domain.to_string(),
            reason,
        };

        let chain = rustls_pemfile::certs(&mut fullchain_pem.as_bytes())
            .map_err(|e| material_err(format!("failed to read certificates: {}", e)))?;
        let Some(leaf) = chain.first() else {
            return Err(material_err("no certificates found".to_string()));
        };

        let (_, parsed) = x509_parser::parse_x509_certificate(leaf)
            .map_err(|e| material_err(format!("failed to parse leaf certificate: {}", e)))?;
        let validity = parsed.validity();
        let issued_at = DateTime::<Utc>::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| material_err("notBefore out of range".to_string()))?;
        let expires_at = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| material_err("notAfter out of range".to_string()))?;

        let key = parse_private_key(&private_key_pem).map_err(material_err)?;
        let signing_key = rustls::sign::any_supported_type(&key)
            .map_err(|e| material_err(format!("unsupported private key: {}", e)))?;
        let certs = chain.into_iter().map(rustls::Certificate).collect();

        Ok(Self {
            domain: domain.to_string(),
            private_key_pem,
            fullchain_pem,
            chain_pem,
            issued_at,
            expires_at,
            certified_key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Inside the renewal window before expiry
    pub fn needs_renewal(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.expires_at - now <= threshold
    }
}

/// First PKCS#8, RSA or SEC1 key in a PEM document
fn parse_private_key(pem: &str) -> Result<rustls::PrivateKey, String> {
    let mut reader = pem.as_bytes();
    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|e| format!("failed to read private key: {}", e))? {
            Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) | Some(Item::ECKey(key)) => {
                return Ok(rustls::PrivateKey(key))
            }
            Some(_) => continue,
            None => return Err("no private key found".to_string()),
        }
    }
}

/// Certificate state for one domain
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub domain: String,
    pub status: CertStatus,
    /// Automatic issuance allowed for this domain
    pub generate: bool,
    pub material: Option<Arc<CertificateMaterial>>,
    /// Consecutive failed attempts
    pub attempts: u32,
    pub last_error: Option<CertError>,
    /// When the next background retry is due, if one is scheduled
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CertificateRecord {
    pub fn new(domain: &str, generate: bool) -> Self {
        Self {
            domain: domain.to_string(),
            status: CertStatus::Missing,
            generate,
            material: None,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.material.as_ref().map(|m| m.issued_at)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.material.as_ref().map(|m| m.expires_at)
    }

    /// Material that may still be served to clients
    pub fn servable(&self, now: DateTime<Utc>) -> Option<&Arc<CertificateMaterial>> {
        self.material.as_ref().filter(|m| !m.is_expired(now))
    }

    /// Enter `Requesting`, or `Renewing` when material is already cached
    pub fn begin(&mut self) {
        self.status = if self.material.is_some() {
            CertStatus::Renewing
        } else {
            CertStatus::Requesting
        };
    }

    /// Issuance succeeded
    pub fn succeed(&mut self, material: Arc<CertificateMaterial>) {
        self.status = CertStatus::Valid;
        self.material = Some(material);
        self.attempts = 0;
        self.last_error = None;
        self.next_attempt_at = None;
    }

    /// Issuance failed; cached material (if any) is kept
    pub fn fail(&mut self, error: CertError, next_attempt_at: Option<DateTime<Utc>>) {
        self.status = CertStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error);
        self.next_attempt_at = next_attempt_at;
    }

    /// Forget past failures so the next request starts a fresh attempt
    pub fn reset_failures(&mut self) {
        if self.status == CertStatus::Failed {
            self.status = if self.material.is_some() {
                CertStatus::Valid
            } else {
                CertStatus::Missing
            };
        }
        self.attempts = 0;
        self.last_error = None;
        self.next_attempt_at = None;
    }
}

/// Certificate storage paths for one domain
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub dir: PathBuf,
    pub private_key: PathBuf,
    pub fullchain: PathBuf,
    pub chain: PathBuf,
}

impl CertificatePaths {
    pub fn for_domain(base_dir: &Path, domain: &str) -> Self {
        let dir = base_dir.join(domain);
        Self {
            private_key: dir.join("privkey.pem"),
            fullchain: dir.join("fullchain.pem"),
            chain: dir.join("chain.pem"),
            dir,
        }
    }

    /// Key and full chain present (chain.pem is optional)
    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.private_key).await.unwrap_or(false)
            && fs::try_exists(&self.fullchain).await.unwrap_or(false)
    }
}

/// In-memory records plus on-disk material
pub struct CertificateStore {
    base_dir: PathBuf,
    records: RwLock<HashMap<String, CertificateRecord>>,
}

impl CertificateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn paths(&self, domain: &str) -> CertificatePaths {
        CertificatePaths::for_domain(&self.base_dir, domain)
    }

    /// Snapshot of one record
    pub fn get(&self, domain: &str) -> Option<CertificateRecord> {
        self.read().get(domain).cloned()
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<CertificateRecord> {
        self.read().values().cloned().collect()
    }

    /// Servable material without cloning the record
    pub fn servable(&self, domain: &str, now: DateTime<Utc>) -> Option<Arc<CertificateMaterial>> {
        self.read().get(domain).and_then(|r| r.servable(now)).cloned()
    }

    /// Register a domain, creating a `Missing` record if it is new
    pub fn track(&self, domain: &str, generate: bool) -> CertificateRecord {
        let mut records = self.write();
        let record = records
            .entry(domain.to_string())
            .or_insert_with(|| CertificateRecord::new(domain, generate));
        record.generate = generate;
        record.clone()
    }

    /// Drop records for domains no longer routed
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.write().retain(|domain, _| keep(domain));
    }

    /// Mutate a record under the write lock, creating it if needed
    pub fn update<R>(&self, domain: &str, f: impl FnOnce(&mut CertificateRecord) -> R) -> R {
        let mut records = self.write();
        let record = records
            .entry(domain.to_string())
            .or_insert_with(|| CertificateRecord::new(domain, true));
        f(record)
    }

    /// Read stored material for a domain, if present
    pub async fn load_from_disk(&self, domain: &str) -> Result<Option<CertificateMaterial>, CertError> {
        let paths = self.paths(domain);
        if !paths.exists().await {
            debug!("No stored certificate for {} in {}", domain, paths.dir.display());
            return Ok(None);
        }

        let storage_err = |e: std::io::Error| CertError::Storage {
            domain: domain.to_string(),
            reason: e.to_string(),
        };
        let private_key = fs::read_to_string(&paths.private_key).await.map_err(storage_err)?;
        let fullchain = fs::read_to_string(&paths.fullchain).await.map_err(storage_err)?;
        let chain = fs::read_to_string(&paths.chain).await.unwrap_or_default();

        CertificateMaterial::from_pem(domain, private_key, fullchain, chain).map(Some)
    }

    /// Write material to disk, replacing any previous files
    pub async fn persist(&self, material: &CertificateMaterial) -> Result<(), CertError> {
        let paths = self.paths(&material.domain);
        let storage_err = |e: std::io::Error| CertError::Storage {
            domain: material.domain.clone(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&paths.dir).await.map_err(storage_err)?;
        write_atomic(&paths.private_key, &material.private_key_pem)
            .await
            .map_err(storage_err)?;
        write_atomic(&paths.fullchain, &material.fullchain_pem)
            .await
            .map_err(storage_err)?;
        write_atomic(&paths.chain, &material.chain_pem)
            .await
            .map_err(storage_err)?;

        debug!("Stored certificate for {} in {}", material.domain, paths.dir.display());
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CertificateRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CertificateRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("pem.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await
}
