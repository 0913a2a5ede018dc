//! Durability adapters.
//!
//! The in-memory store is authoritative; an adapter only gives best-effort
//! durability. Writes are staged and become durable on [`flush`], which is
//! all-or-nothing per call.
//!
//! [`flush`]: PersistenceAdapter::flush

use crate::entry::Entry;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A key/value durability backend for stored entries.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Stages `entry` under `key`.
    async fn store(&self, key: &str, entry: &Entry) -> StoreResult<()>;

    /// Returns the latest entry for `key`, staged or durable.
    async fn retrieve(&self, key: &str) -> StoreResult<Option<Entry>>;

    /// Stages removal of `key`. Returns true if the key existed.
    async fn remove(&self, key: &str) -> StoreResult<bool>;

    /// Returns every entry, staged writes included.
    async fn load_all(&self) -> StoreResult<Vec<Entry>>;

    /// Makes all staged changes durable, atomically.
    async fn flush(&self) -> StoreResult<()>;

    /// Flushes and releases the backend. Later calls fail with `Closed`.
    async fn close(&self) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
enum Staged {
    Put(Entry),
    Delete,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: HashMap<String, Entry>,
    staged: HashMap<String, Staged>,
}

impl MemoryState {
    fn lookup(&self, key: &str) -> Option<&Entry> {
        match self.staged.get(key) {
            Some(Staged::Put(entry)) => Some(entry),
            Some(Staged::Delete) => None,
            None => self.committed.get(key),
        }
    }

    fn snapshot(&self) -> HashMap<String, Entry> {
        let mut all = self.committed.clone();
        for (key, op) in &self.staged {
            match op {
                Staged::Put(entry) => {
                    all.insert(key.clone(), entry.clone());
                }
                Staged::Delete => {
                    all.remove(key);
                }
            }
        }
        all
    }
}

/// Process-local adapter. Useful for tests and for embedding without disk.
///
/// [`set_failing`](Self::set_failing) makes every call fail, to exercise
/// degraded-durability paths.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryPersistence {
    /// Creates an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of durable (flushed) entries.
    pub async fn committed_len(&self) -> usize {
        self.state.lock().await.committed.len()
    }

    /// Number of staged, unflushed operations.
    pub async fn staged_len(&self) -> usize {
        self.state.lock().await.staged.len()
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Persistence("adapter unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn store(&self, key: &str, entry: &Entry) -> StoreResult<()> {
        self.check()?;
        self.state
            .lock()
            .await
            .staged
            .insert(key.to_string(), Staged::Put(entry.clone()));
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StoreResult<Option<Entry>> {
        self.check()?;
        Ok(self.state.lock().await.lookup(key).cloned())
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let existed = state.lookup(key).is_some();
        state.staged.insert(key.to_string(), Staged::Delete);
        Ok(existed)
    }

    async fn load_all(&self) -> StoreResult<Vec<Entry>> {
        self.check()?;
        Ok(self.state.lock().await.snapshot().into_values().collect())
    }

    async fn flush(&self) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let committed = state.snapshot();
        state.committed = committed;
        state.staged.clear();
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.flush().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON snapshot file adapter.
///
/// Each flush writes the full entry set to `<path>.tmp` and renames it over
/// `<path>`, so a crash mid-flush leaves the previous snapshot intact.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    state: Mutex<FileState>,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct FileState {
    entries: HashMap<String, Entry>,
    dirty: bool,
}

impl FilePersistence {
    /// Opens (or creates on first flush) a snapshot at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<Entry> = serde_json::from_slice(&bytes)?;
                info!("loaded {} entries from {}", list.len(), path.display());
                list.into_iter().map(|e| (e.id.clone(), e)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(FileState {
                entries,
                dirty: false,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn store(&self, key: &str, entry: &Entry) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.entries.insert(key.to_string(), entry.clone());
        state.dirty = true;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> StoreResult<Option<Entry>> {
        self.check()?;
        Ok(self.state.lock().await.entries.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let existed = state.entries.remove(key).is_some();
        state.dirty |= existed;
        Ok(existed)
    }

    async fn load_all(&self) -> StoreResult<Vec<Entry>> {
        self.check()?;
        Ok(self.state.lock().await.entries.values().cloned().collect())
    }

    async fn flush(&self) -> StoreResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }

        let count = state.entries.len();
        let bytes = {
            let mut list: Vec<&Entry> = state.entries.values().collect();
            list.sort_by(|a, b| a.id.cmp(&b.id));
            serde_json::to_vec(&list)?
        };

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        state.dirty = false;

        debug!("flushed {count} entries to {}", self.path.display());
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.flush().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
