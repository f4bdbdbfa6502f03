//! Route table manager
//!
//! Loads route documents, publishes validated tables through an atomic
//! pointer swap and reloads them when the source file changes.

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::RoutesDocument;
use crate::error::{LoadError, Result, RouterError};
use crate::route::RouteTable;

/// Quiet period after a file event before reloading
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Anything that can produce a route document
pub trait RouteSource: Send + Sync {
    /// Read and parse the current document
    fn load(&self) -> std::result::Result<RoutesDocument, LoadError>;

    /// File to watch for changes, if any
    fn watch_path(&self) -> Option<&Path> {
        None
    }

    /// Human-readable name for logs
    fn describe(&self) -> String;
}

/// Route document on disk, JSON or TOML depending on extension
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RouteSource for FileSource {
    fn load(&self) -> std::result::Result<RoutesDocument, LoadError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| LoadError::Read {
            source_name: self.describe(),
            reason: e.to_string(),
        })?;

        let is_toml = self
            .path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let parsed = if is_toml {
            RoutesDocument::from_toml(&content)
        } else {
            RoutesDocument::from_json(&content)
        };

        parsed.map_err(|reason| LoadError::Parse {
            source_name: self.describe(),
            reason,
        })
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory route document, swappable for tests and embedding
pub struct StaticSource {
    document: Mutex<std::result::Result<RoutesDocument, String>>,
}

impl StaticSource {
    pub fn new(document: RoutesDocument) -> Self {
        Self {
            document: Mutex::new(Ok(document)),
        }
    }

    /// Replace the document returned by the next load
    pub fn set(&self, document: RoutesDocument) {
        *self.lock() = Ok(document);
    }

    /// Make the next load fail with a parse error
    pub fn set_broken(&self, reason: impl Into<String>) {
        *self.lock() = Err(reason.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, std::result::Result<RoutesDocument, String>> {
        self.document.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RouteSource for StaticSource {
    fn load(&self) -> std::result::Result<RoutesDocument, LoadError> {
        self.lock().clone().map_err(|reason| LoadError::Parse {
            source_name: self.describe(),
            reason,
        })
    }

    fn describe(&self) -> String {
        "static routes".to_string()
    }
}

/// Owns the published route table
pub struct RouteTableManager {
    source: Arc<dyn RouteSource>,
    current: ArcSwap<RouteTable>,
    updates: watch::Sender<Arc<RouteTable>>,
    next_version: AtomicU64,
    reload_lock: Mutex<()>,
}

impl RouteTableManager {
    /// Load the initial table; a broken initial document is a startup error
    pub fn new(source: Arc<dyn RouteSource>) -> Result<Self> {
        let table = Arc::new(Self::load(source.as_ref(), 1)?);
        info!(
            "Loaded {} hostnames from {}",
            table.len(),
            source.describe()
        );
        log_table(&table);

        let (updates, _) = watch::channel(Arc::clone(&table));
        Ok(Self {
            source,
            current: ArcSwap::new(table),
            updates,
            next_version: AtomicU64::new(2),
            reload_lock: Mutex::new(()),
        })
    }

    /// Build a table from a source without publishing it
    pub fn load(source: &dyn RouteSource, version: u64) -> std::result::Result<RouteTable, LoadError> {
        let document = source.load()?;
        RouteTable::build(&document, version)
    }

    /// Current table; callers keep this snapshot for the whole request
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    /// Receive every newly published table
    pub fn subscribe(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.updates.subscribe()
    }

    /// Re-read the source and publish it; on failure the current table stays
    pub fn reload(&self) -> Result<Arc<RouteTable>> {
        // Versions are published in the order they are taken
        let _guard = self.reload_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        match Self::load(self.source.as_ref(), version) {
            Ok(table) => {
                let table = Arc::new(table);
                self.current.store(Arc::clone(&table));
                self.updates.send_replace(Arc::clone(&table));
                info!(
                    "Router table updated to version {} ({} hostnames)",
                    version,
                    table.len()
                );
                log_table(&table);
                Ok(table)
            }
            Err(e) => {
                error!(
                    "Failed to reload routes from {}, keeping version {}: {}",
                    self.source.describe(),
                    self.current.load().version(),
                    e
                );
                Err(RouterError::Load(e))
            }
        }
    }

    /// Start watching the source file; dropping the returned handle stops it
    pub fn watch(self: &Arc<Self>) -> Result<Option<ConfigWatcher>> {
        let Some(path) = self.source.watch_path().map(Path::to_path_buf) else {
            debug!("Route source {} cannot be watched", self.source.describe());
            return Ok(None);
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let file_name = path.file_name().map(|name| name.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours && (event.kind.is_modify() || event.kind.is_create()) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("Route file watch error: {}", e),
            }
        })
        .map_err(|e| RouterError::Config(format!("Failed to create file watcher: {}", e)))?;

        // Editors replace files by rename, so watch the directory and filter
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RouterError::Config(format!("Failed to watch {}: {}", dir.display(), e)))?;

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}
                info!("Router table config data has changed, updating...");
                let _ = manager.reload();
            }
        });

        info!("Watching {} for route changes", path.display());
        Ok(Some(ConfigWatcher {
            _watcher: watcher,
            task,
        }))
    }
}

fn log_table(table: &RouteTable) {
    for route in table.routes() {
        if route.enabled {
            debug!("Routing: {} => {}", route.host, route.target);
        } else {
            debug!("Ignoring {} because it is DISABLED", route.host);
        }
    }
}

/// Live file watch on the route document
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
