//! Certificate manager
//!
//! Orchestrates the [`CertificateStore`] and a [`CertificateAuthority`]:
//!
//! - `ensure` returns cached material or issues it, suspending the caller
//! - `resolve` is the non-blocking lookup used inside TLS handshakes
//! - issuance is single-flight per domain: concurrent callers share one
//!   attempt and its outcome
//! - failed attempts are retried in the background with exponential backoff
//! - a periodic sweep renews certificates close to expiry

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::authority::CertificateAuthority;
use crate::config::AcmeConfig;
use crate::error::CertError;
use crate::route::RouteTable;
use crate::store::{CertStatus, CertificateMaterial, CertificateRecord, CertificateStore};

/// Longest wait between two retries
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

type IssueResult = Result<Arc<CertificateMaterial>, CertError>;
type Flight = Shared<BoxFuture<'static, IssueResult>>;

/// Timing and retry policy
#[derive(Debug, Clone)]
pub struct CertificateSettings {
    /// Upper bound on one CA call
    pub issue_timeout: Duration,
    /// Renew when this close to expiry
    pub renew_before: chrono::Duration,
    /// How often the renewal sweep runs
    pub renew_interval: Duration,
    /// Background retries after the first failed attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further failure
    pub retry_base: Duration,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self::from(&AcmeConfig::default())
    }
}

impl From<&AcmeConfig> for CertificateSettings {
    fn from(config: &AcmeConfig) -> Self {
        Self {
            issue_timeout: Duration::from_secs(config.issue_timeout_seconds),
            renew_before: chrono::Duration::days(config.renew_before_days),
            renew_interval: Duration::from_secs(config.renew_interval_seconds),
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(config.retry_base_seconds),
        }
    }
}

impl CertificateSettings {
    /// Delay before retrying after `attempts` failures
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.saturating_sub(1).min(16);
        self.retry_base.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Issue,
    Renew,
}

/// Certificate lifecycle orchestrator
pub struct CertificateManager {
    store: CertificateStore,
    authority: Arc<dyn CertificateAuthority>,
    settings: CertificateSettings,
    inflight: Mutex<HashMap<String, Flight>>,
}

impl CertificateManager {
    pub fn new(
        store: CertificateStore,
        authority: Arc<dyn CertificateAuthority>,
        settings: CertificateSettings,
    ) -> Self {
        Self {
            store,
            authority,
            settings,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn settings(&self) -> &CertificateSettings {
        &self.settings
    }

    /// Snapshot of a domain's record
    pub fn record(&self, domain: &str) -> Option<CertificateRecord> {
        self.store.get(domain)
    }

    /// Usable material for `domain`, issuing it first if needed
    pub async fn ensure(self: &Arc<Self>, domain: &str) -> IssueResult {
        validate_domain(domain)?;

        if let Some(record) = self.store.get(domain) {
            if let Some(material) = record.servable(Utc::now()) {
                return Ok(Arc::clone(material));
            }
            if record.status == CertStatus::Failed {
                debug!(
                    "Certificate for {} unavailable after {} failed attempts",
                    domain, record.attempts
                );
                return Err(CertError::Unavailable {
                    domain: domain.to_string(),
                });
            }
        }

        self.flight(domain, FlightKind::Issue).await
    }

    /// Servable material without blocking or I/O; safe inside a TLS handshake.
    ///
    /// A miss on a tracked, auto-issuable domain kicks off issuance in the
    /// background so a later handshake can succeed.
    pub fn resolve(self: &Arc<Self>, domain: &str) -> Option<Arc<CertificateMaterial>> {
        if let Some(material) = self.store.servable(domain, Utc::now()) {
            return Some(material);
        }
        self.request_in_background(domain);
        None
    }

    fn request_in_background(self: &Arc<Self>, domain: &str) {
        let Some(record) = self.store.get(domain) else {
            return;
        };
        if record.status != CertStatus::Missing || !record.generate {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        debug!("No certificate for {} yet, requesting in background", domain);
        drop(self.flight(domain, FlightKind::Issue));
    }

    /// Join the in-flight issuance for `domain` or start one
    fn flight(self: &Arc<Self>, domain: &str, kind: FlightKind) -> Flight {
        let mut inflight = self.lock_inflight();
        if let Some(existing) = inflight.get(domain) {
            return existing.clone();
        }

        // Another flight may have finished between the caller's check and this lock
        let now = Utc::now();
        if let Some(record) = self.store.get(domain) {
            if record.status == CertStatus::Valid {
                if let Some(material) = record.servable(now) {
                    if kind == FlightKind::Issue || !material.needs_renewal(now, self.settings.renew_before) {
                        return future::ready(Ok(Arc::clone(material))).boxed().shared();
                    }
                }
            }
        }

        let manager = Arc::clone(self);
        let key = domain.to_string();
        let handle = tokio::spawn(async move { manager.run_issuance(key).await });

        let aborted_domain = domain.to_string();
        let flight = async move {
            handle.await.unwrap_or_else(|e| {
                Err(CertError::Aborted {
                    domain: aborted_domain,
                    reason: e.to_string(),
                })
            })
        }
        .boxed()
        .shared();

        inflight.insert(domain.to_string(), flight.clone());
        flight
    }

    /// One issuance attempt; records the outcome and schedules retries
    async fn run_issuance(self: Arc<Self>, domain: String) -> IssueResult {
        let result = self.issue_once(&domain).await;
        let mut retry = None;

        match &result {
            Ok(material) => {
                self.store.update(&domain, |r| r.succeed(Arc::clone(material)));
                info!(
                    "Certificate for {} valid until {}",
                    domain,
                    material.expires_at.to_rfc3339()
                );
            }
            Err(err) => {
                let attempts = self.store.get(&domain).map(|r| r.attempts).unwrap_or(0) + 1;
                retry = (err.is_retryable() && attempts <= self.settings.max_retries)
                    .then(|| self.settings.backoff(attempts));
                let next_attempt_at = retry
                    .and_then(|delay| chrono::Duration::from_std(delay).ok())
                    .map(|delay| Utc::now() + delay);

                self.store.update(&domain, |r| r.fail(err.clone(), next_attempt_at));
                match retry {
                    Some(delay) => error!(
                        "Certificate issuance for {} failed (attempt {}), retrying in {:?}: {}",
                        domain, attempts, delay, err
                    ),
                    None => error!(
                        "Certificate issuance for {} failed (attempt {}), giving up: {}",
                        domain, attempts, err
                    ),
                }
            }
        }

        self.lock_inflight().remove(&domain);
        if let Some(delay) = retry {
            self.schedule_retry(domain, delay);
        }
        result
    }

    async fn issue_once(&self, domain: &str) -> IssueResult {
        let mut record = self.store.update(domain, |r| {
            r.begin();
            r.clone()
        });
        let now = Utc::now();

        if record.material.is_none() {
            match self.store.load_from_disk(domain).await {
                Ok(Some(stored)) if !stored.is_expired(now) => {
                    if !stored.needs_renewal(now, self.settings.renew_before) || !record.generate {
                        info!("Cert for {} already exists, using existing cert", domain);
                        return Ok(Arc::new(stored));
                    }
                    info!("Stored cert for {} expires {}, renewing", domain, stored.expires_at.to_rfc3339());
                    // Serve the stored cert while the renewal runs, and after it if it fails
                    let stored = Arc::new(stored);
                    record = self.store.update(domain, |r| {
                        r.material = Some(stored);
                        r.begin();
                        r.clone()
                    });
                }
                Ok(_) => debug!("Cert for {} does not yet exist", domain),
                Err(e) => warn!("Ignoring unreadable stored cert for {}: {}", domain, e),
            }
        }

        if !record.generate {
            return Err(CertError::NotIssuable {
                domain: domain.to_string(),
            });
        }

        info!(
            "{} certificate for {} via {}",
            if record.status == CertStatus::Renewing { "Renewing" } else { "Requesting" },
            domain,
            self.authority.name()
        );

        let issued = tokio::time::timeout(self.settings.issue_timeout, self.authority.issue(domain))
            .await
            .map_err(|_| CertError::Timeout {
                domain: domain.to_string(),
                seconds: self.settings.issue_timeout.as_secs(),
            })??;

        let material = CertificateMaterial::from_pem(
            domain,
            issued.private_key_pem,
            issued.fullchain_pem,
            issued.chain_pem,
        )?;

        if let Err(e) = self.store.persist(&material).await {
            warn!("Issued cert for {} could not be stored: {}", domain, e);
        }

        Ok(Arc::new(material))
    }

    fn schedule_retry(self: &Arc<Self>, domain: String, delay: Duration) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Skip if the domain was dropped, fixed or reset in the meantime
            let due = manager
                .store
                .get(&domain)
                .map(|r| r.status == CertStatus::Failed && r.next_attempt_at.is_some())
                .unwrap_or(false);
            if !due {
                return;
            }

            debug!("Retrying certificate issuance for {}", domain);
            let _ = manager.flight(&domain, FlightKind::Issue).await;
        });
    }

    /// Register every TLS-enabled hostname of a table; returns them
    pub fn sync_routes(&self, table: &RouteTable) -> Vec<String> {
        let wanted: HashMap<String, bool> = table
            .entries()
            .filter(|(_, route)| route.enabled && route.ssl.enable)
            .map(|(host, route)| (host.to_string(), route.ssl.generate))
            .collect();

        self.store.retain(|domain| wanted.contains_key(domain));

        for (domain, generate) in &wanted {
            let record = self.store.track(domain, *generate);
            // A new config deserves a fresh attempt once retries are exhausted
            if record.status == CertStatus::Failed && record.next_attempt_at.is_none() {
                self.store.update(domain, |r| r.reset_failures());
            }
        }

        wanted.into_keys().collect()
    }

    /// Sync with a table and make sure every TLS hostname has a certificate
    pub async fn scan(self: &Arc<Self>, table: &RouteTable) {
        info!("Scanning router table for SSL requirements...");
        let domains = self.sync_routes(table);

        let checks = domains.iter().map(|domain| async move {
            debug!(" - Checking {} for SSL cert...", domain);
            (domain, self.ensure(domain).await)
        });

        for (domain, result) in future::join_all(checks).await {
            if let Err(e) = result {
                warn!("Unable to load ssl cert for domain {}: {}", domain, e);
            }
        }
        info!("Cert checks complete ({} domains)", domains.len());
    }

    /// Follow route table updates for the lifetime of the channel
    pub fn start_sync_task(self: Arc<Self>, mut updates: watch::Receiver<Arc<RouteTable>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let table = updates.borrow_and_update().clone();
                self.scan(&table).await;
                if updates.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Renew every certificate inside the renewal window and re-arm domains
    /// whose retries ran out; returns how many were attempted
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let due: Vec<(String, FlightKind)> = self
            .store
            .records()
            .into_iter()
            .filter(|r| r.generate)
            .filter_map(|r| {
                let renewal_due = r
                    .material
                    .as_ref()
                    .map(|m| m.needs_renewal(now, self.settings.renew_before));
                match (r.status, renewal_due) {
                    (CertStatus::Valid, Some(true)) => Some((r.domain, FlightKind::Renew)),
                    (CertStatus::Failed, _) if r.next_attempt_at.is_none() => {
                        let kind = match renewal_due {
                            Some(false) => return None,
                            Some(true) => FlightKind::Renew,
                            None => FlightKind::Issue,
                        };
                        self.store.update(&r.domain, |r| r.reset_failures());
                        Some((r.domain, kind))
                    }
                    _ => None,
                }
            })
            .collect();

        if due.is_empty() {
            debug!("No certificates due for renewal");
            return 0;
        }

        let renewals = due.iter().map(|(domain, kind)| self.flight(domain, *kind));
        for result in future::join_all(renewals).await {
            if let Err(e) = result {
                warn!("Certificate renewal failed: {}", e);
            }
        }
        due.len()
    }

    /// Start background certificate renewal task
    pub fn start_renewal_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.settings.renew_interval).await;
                let renewed = self.sweep().await;
                if renewed > 0 {
                    info!("Renewal sweep processed {} certificates", renewed);
                }
            }
        })
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, Flight>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_domain(domain: &str) -> Result<(), CertError> {
    let valid = !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.contains("..")
        && !domain.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\');
    if valid {
        Ok(())
    } else {
        Err(CertError::InvalidDomain {
            domain: domain.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::authority::{IssuedCertificate, SelfSignedAuthority};
    use crate::config::{RouteEntry, RoutesDocument, SslEntry};
    use crate::store::tests::self_signed_pem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts calls; call `n` (1-based) issues a cert valid for `n * days_per_call` days
    pub(crate) struct CountingAuthority {
        pub calls: AtomicUsize,
        pub delay: Duration,
        pub fail_first: usize,
        pub days_per_call: i64,
    }

    impl CountingAuthority {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                fail_first: 0,
                days_per_call: 60,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CertificateAuthority for CountingAuthority {
        async fn issue(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if call <= self.fail_first {
                return Err(CertError::Authority {
                    domain: domain.to_string(),
                    reason: "urn:ietf:params:acme:error:connection".to_string(),
                });
            }
            SelfSignedAuthority::new(self.days_per_call * call as i64).generate(domain)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn settings() -> CertificateSettings {
        CertificateSettings {
            issue_timeout: Duration::from_secs(5),
            renew_before: chrono::Duration::days(30),
            renew_interval: Duration::from_secs(3600),
            max_retries: 3,
            retry_base: Duration::from_secs(3600),
        }
    }

    fn manager(
        authority: Arc<CountingAuthority>,
        settings: CertificateSettings,
    ) -> (Arc<CertificateManager>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        (Arc::new(CertificateManager::new(store, authority, settings)), dir)
    }

    async fn wait_for_status(manager: &CertificateManager, domain: &str, status: CertStatus) {
        for _ in 0..200 {
            if manager.record(domain).map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}", domain, status);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_issues_once() {
        let authority = Arc::new(CountingAuthority::new(Duration::from_millis(100)));
        let (manager, _dir) = manager(authority.clone(), settings());

        let callers = (0..50).map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure("a.example.com").await })
        });
        let results: Vec<_> = future::join_all(callers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(authority.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(manager.record("a.example.com").unwrap().status, CertStatus::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_failure_shared() {
        let mut authority = CountingAuthority::new(Duration::from_millis(50));
        authority.fail_first = usize::MAX;
        let authority = Arc::new(authority);
        let (manager, _dir) = manager(authority.clone(), settings());

        let results = future::join_all((0..20).map(|_| manager.ensure("a.example.com"))).await;

        assert_eq!(authority.calls(), 1);
        for result in results {
            assert!(matches!(result, Err(CertError::Authority { .. })));
        }

        let record = manager.record("a.example.com").unwrap();
        assert_eq!(record.status, CertStatus::Failed);
        assert!(record.next_attempt_at.is_some());

        // While failed, callers get a fast 503-class error without a new CA call
        assert!(matches!(
            manager.ensure("a.example.com").await,
            Err(CertError::Unavailable { .. })
        ));
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_material_returned() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());

        let first = manager.ensure("a.example.com").await.unwrap();
        let second = manager.ensure("a.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_issue_timeout() {
        let authority = Arc::new(CountingAuthority::new(Duration::from_secs(30)));
        let mut settings = settings();
        settings.issue_timeout = Duration::from_millis(50);
        let (manager, _dir) = manager(authority, settings);

        let err = manager.ensure("a.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::Timeout { .. }));
        assert_eq!(manager.record("a.example.com").unwrap().status, CertStatus::Failed);
    }

    #[tokio::test]
    async fn test_background_retry_recovers() {
        let mut authority = CountingAuthority::new(Duration::ZERO);
        authority.fail_first = 1;
        let authority = Arc::new(authority);
        let mut settings = settings();
        settings.retry_base = Duration::from_millis(20);
        let (manager, _dir) = manager(authority.clone(), settings);

        assert!(manager.ensure("a.example.com").await.is_err());
        wait_for_status(&manager, "a.example.com", CertStatus::Valid).await;
        assert_eq!(authority.calls(), 2);
        assert_eq!(manager.record("a.example.com").unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut authority = CountingAuthority::new(Duration::ZERO);
        authority.fail_first = usize::MAX;
        let authority = Arc::new(authority);
        let mut settings = settings();
        settings.retry_base = Duration::from_millis(1);
        settings.max_retries = 2;
        let (manager, _dir) = manager(authority.clone(), settings);

        let _ = manager.ensure("a.example.com").await;
        for _ in 0..200 {
            if manager.record("a.example.com").unwrap().next_attempt_at.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let record = manager.record("a.example.com").unwrap();
        assert_eq!(record.status, CertStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.next_attempt_at.is_none());
        assert_eq!(authority.calls(), 3);
    }

    #[tokio::test]
    async fn test_renewal_sweep() {
        let mut authority = CountingAuthority::new(Duration::ZERO);
        // First cert lives 20 days (inside the 30-day window), the renewal 40
        authority.days_per_call = 20;
        let authority = Arc::new(authority);
        let (manager, _dir) = manager(authority.clone(), settings());

        let before = manager.ensure("a.example.com").await.unwrap();
        assert_eq!(manager.sweep().await, 1);

        let record = manager.record("a.example.com").unwrap();
        assert_eq!(record.status, CertStatus::Valid);
        assert!(record.expires_at().unwrap() > before.expires_at);
        assert_eq!(authority.calls(), 2);

        // Outside the window now
        assert_eq!(manager.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_renewing_keeps_serving() {
        let authority = Arc::new(CountingAuthority::new(Duration::from_millis(200)));
        let (manager, _dir) = manager(authority.clone(), settings());

        let (key, cert) = self_signed_pem("a.example.com", 20);
        let before = Arc::new(CertificateMaterial::from_pem("a.example.com", key, cert, String::new()).unwrap());
        manager.store().update("a.example.com", |r| r.succeed(Arc::clone(&before)));

        let sweeper = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.sweep().await }
        });
        wait_for_status(&manager, "a.example.com", CertStatus::Renewing).await;
        let served = manager.resolve("a.example.com").unwrap();
        assert!(Arc::ptr_eq(&served, &before));

        assert_eq!(sweeper.await.unwrap(), 1);
        let record = manager.record("a.example.com").unwrap();
        assert_eq!(record.status, CertStatus::Valid);
        assert!(record.expires_at().unwrap() > before.expires_at);
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_stored_certificate_used() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());

        let issued = SelfSignedAuthority::new(90).generate("a.example.com").unwrap();
        let material = CertificateMaterial::from_pem(
            "a.example.com",
            issued.private_key_pem,
            issued.fullchain_pem,
            issued.chain_pem,
        )
        .unwrap();
        manager.store().persist(&material).await.unwrap();
        manager.store().track("a.example.com", false);

        let loaded = manager.ensure("a.example.com").await.unwrap();
        assert_eq!(loaded.expires_at, material.expires_at);
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_stored_certificate_served_when_renewal_fails() {
        let mut authority = CountingAuthority::new(Duration::ZERO);
        authority.fail_first = usize::MAX;
        let authority = Arc::new(authority);
        let (manager, _dir) = manager(authority.clone(), settings());

        // Still valid, but inside the 30-day renewal window
        let (key, cert) = self_signed_pem("a.example.com", 20);
        let stored = CertificateMaterial::from_pem("a.example.com", key, cert, String::new()).unwrap();
        manager.store().persist(&stored).await.unwrap();
        manager.store().track("a.example.com", true);

        assert!(manager.ensure("a.example.com").await.is_err());
        assert_eq!(authority.calls(), 1);

        let record = manager.record("a.example.com").unwrap();
        assert_eq!(record.status, CertStatus::Failed);
        let served = manager.resolve("a.example.com").unwrap();
        assert_eq!(served.expires_at, stored.expires_at);
    }

    async fn wait_for_exhausted(manager: &CertificateManager, authority: &CountingAuthority, calls: usize) {
        for _ in 0..200 {
            let exhausted = manager
                .record("a.example.com")
                .map(|r| r.status == CertStatus::Failed && r.next_attempt_at.is_none())
                .unwrap_or(false);
            if exhausted && authority.calls() == calls {
                // Let the finished flight leave the in-flight map
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("retries never ran out after {} calls", calls);
    }

    #[tokio::test]
    async fn test_sweep_retries_exhausted_renewal() {
        let mut authority = CountingAuthority::new(Duration::ZERO);
        authority.fail_first = 2;
        let authority = Arc::new(authority);
        let mut settings = settings();
        settings.retry_base = Duration::from_millis(1);
        settings.max_retries = 1;
        let (manager, _dir) = manager(authority.clone(), settings);

        let (key, cert) = self_signed_pem("a.example.com", 20);
        let before = Arc::new(CertificateMaterial::from_pem("a.example.com", key, cert, String::new()).unwrap());
        manager.store().update("a.example.com", |r| r.succeed(Arc::clone(&before)));

        assert_eq!(manager.sweep().await, 1);
        wait_for_exhausted(&manager, &authority, 2).await;
        assert!(Arc::ptr_eq(&manager.resolve("a.example.com").unwrap(), &before));

        // The CA is back; the next sweep renews despite the spent retry budget
        assert_eq!(manager.sweep().await, 1);
        let record = manager.record("a.example.com").unwrap();
        assert_eq!(record.status, CertStatus::Valid);
        assert_eq!(record.attempts, 0);
        assert!(record.expires_at().unwrap() > before.expires_at);
        assert_eq!(authority.calls(), 3);
    }

    #[tokio::test]
    async fn test_sweep_retries_exhausted_issuance() {
        let mut authority = CountingAuthority::new(Duration::ZERO);
        authority.fail_first = 1;
        let authority = Arc::new(authority);
        let mut settings = settings();
        settings.max_retries = 0;
        let (manager, _dir) = manager(authority.clone(), settings);

        assert!(manager.ensure("a.example.com").await.is_err());
        wait_for_exhausted(&manager, &authority, 1).await;
        assert!(manager.resolve("a.example.com").is_none());
        assert_eq!(authority.calls(), 1);

        assert_eq!(manager.sweep().await, 1);
        assert_eq!(manager.record("a.example.com").unwrap().status, CertStatus::Valid);
        assert!(manager.resolve("a.example.com").is_some());
        assert_eq!(authority.calls(), 2);
    }

    #[tokio::test]
    async fn test_generate_disabled() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());
        manager.store().track("a.example.com", false);

        let err = manager.ensure("a.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::NotIssuable { .. }));
        assert_eq!(authority.calls(), 0);
        assert!(manager.record("a.example.com").unwrap().next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_invalid_domain_rejected() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());
        for domain in ["", "../etc", "a/b", ".example.com"] {
            assert!(matches!(
                manager.ensure(domain).await,
                Err(CertError::InvalidDomain { .. })
            ));
        }
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_never_issues_for_unknown_domains() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());

        assert!(manager.resolve("unknown.example.com").is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_requests_tracked_domain() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());
        manager.store().track("a.example.com", true);

        assert!(manager.resolve("a.example.com").is_none());
        wait_for_status(&manager, "a.example.com", CertStatus::Valid).await;
        assert!(manager.resolve("a.example.com").is_some());
        assert_eq!(authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_scan_follows_table() {
        let authority = Arc::new(CountingAuthority::new(Duration::ZERO));
        let (manager, _dir) = manager(authority.clone(), settings());

        let secure = RouteEntry {
            target: Some("http://127.0.0.1:9001".to_string()),
            enabled: true,
            aliases: vec!["www.a.example.com".to_string()],
            ssl: SslEntry {
                enable: true,
                generate: true,
                only_secure: false,
            },
            ..RouteEntry::default()
        };
        let disabled = RouteEntry {
            enabled: false,
            ..secure.clone()
        };
        let plain = RouteEntry {
            target: Some("http://127.0.0.1:9003".to_string()),
            enabled: true,
            ..RouteEntry::default()
        };
        let mut document = RoutesDocument::default();
        document.routes.insert("a.example.com".to_string(), secure);
        document.routes.insert(
            "b.example.com".to_string(),
            RouteEntry {
                aliases: Vec::new(),
                ..disabled
            },
        );
        document.routes.insert("c.example.com".to_string(), plain);
        let table = RouteTable::build(&document, 1).unwrap();

        manager.scan(&table).await;

        assert_eq!(authority.calls(), 2);
        for domain in ["a.example.com", "www.a.example.com"] {
            assert_eq!(manager.record(domain).unwrap().status, CertStatus::Valid);
        }
        assert!(manager.record("b.example.com").is_none());
        assert!(manager.record("c.example.com").is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = CertificateSettings {
            retry_base: Duration::from_secs(30),
            ..settings()
        };
        assert_eq!(settings.backoff(1), Duration::from_secs(30));
        assert_eq!(settings.backoff(2), Duration::from_secs(60));
        assert_eq!(settings.backoff(3), Duration::from_secs(120));
        assert_eq!(settings.backoff(20), MAX_BACKOFF);
    }
}
