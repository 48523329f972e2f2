//! Replay guard: the dedup authority and owner of the scan watermark.
//!
//! Implementations must make `commit` idempotent and refuse to move the watermark backwards.
//! A failed persist leaves the in-memory state untouched so that callers can abort the cycle
//! without partial mutation.

use crate::cursor::{EventKey, RelayState, StateDocument, WatermarkRegression};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    WatermarkRegression(#[from] WatermarkRegression),
}

/// Tracks which events have been durably handled and how far the ledger has been scanned.
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    async fn is_processed(&self, key: &EventKey) -> Result<bool, GuardError>;
    /// Committing an already-committed key is a no-op.
    async fn commit(&self, key: &EventKey) -> Result<(), GuardError>;
    async fn watermark(&self) -> Result<u64, GuardError>;
    /// Fails with [GuardError::WatermarkRegression] if `block` is below the current watermark.
    async fn advance_watermark(&self, block: u64) -> Result<(), GuardError>;
}

/// Volatile guard. Restarts lose all state.
#[derive(Debug, Default)]
pub struct MemoryReplayGuard {
    state: RwLock<RelayState>,
}

impl MemoryReplayGuard {
    pub fn new(last_scanned_block: u64) -> Self {
        Self {
            state: RwLock::new(RelayState::new(last_scanned_block)),
        }
    }

    pub async fn snapshot(&self) -> RelayState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl ReplayGuard for MemoryReplayGuard {
    async fn is_processed(&self, key: &EventKey) -> Result<bool, GuardError> {
        Ok(self.state.read().await.is_processed(key))
    }

    async fn commit(&self, key: &EventKey) -> Result<(), GuardError> {
        if self.state.write().await.commit(*key) {
            tracing::debug!(%key, "committed event");
        }
        Ok(())
    }

    async fn watermark(&self) -> Result<u64, GuardError> {
        Ok(self.state.read().await.last_scanned_block)
    }

    async fn advance_watermark(&self, block: u64) -> Result<(), GuardError> {
        self.state.write().await.advance_to(block)?;
        Ok(())
    }
}

/// Guard persisted as a JSON snapshot, rewritten atomically (temp file + rename) on every
/// mutation.
#[derive(Debug)]
pub struct FileReplayGuard {
    path: PathBuf,
    scope: String,
    state: RwLock<RelayState>,
}

impl FileReplayGuard {
    /// Load an existing state file. `Ok(None)` if the file does not exist yet.
    pub async fn load(path: impl Into<PathBuf>, scope: &str) -> Result<Option<Self>, GuardError> {
        let path = path.into();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GuardError::Unavailable(format!("{}: {}", path.display(), e))),
        };
        let doc: StateDocument = serde_json::from_str(&contents)
            .map_err(|e| GuardError::Corrupt(format!("{}: {}", path.display(), e)))?;
        if doc.scope != scope {
            return Err(GuardError::Corrupt(format!(
                "{} belongs to scope {}, expected {}",
                path.display(),
                doc.scope,
                scope
            )));
        }
        let state = RelayState::from_document(&doc).map_err(GuardError::Corrupt)?;
        tracing::info!(
            path = %path.display(),
            watermark = state.last_scanned_block,
            processed = state.processed_keys.len(),
            "loaded relay state"
        );
        Ok(Some(Self {
            path,
            scope: scope.to_string(),
            state: RwLock::new(state),
        }))
    }

    /// Create a fresh state file at `last_scanned_block`, overwriting nothing that exists.
    pub async fn create(
        path: impl Into<PathBuf>,
        scope: &str,
        last_scanned_block: u64,
    ) -> Result<Self, GuardError> {
        let path = path.into();
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| GuardError::Unavailable(e.to_string()))?
        {
            return Err(GuardError::Corrupt(format!(
                "{} already exists",
                path.display()
            )));
        }
        let state = RelayState::new(last_scanned_block);
        persist(&path, &state.to_document(scope)).await?;
        tracing::info!(path = %path.display(), watermark = last_scanned_block, "initialized relay state");
        Ok(Self {
            path,
            scope: scope.to_string(),
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> RelayState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl ReplayGuard for FileReplayGuard {
    async fn is_processed(&self, key: &EventKey) -> Result<bool, GuardError> {
        Ok(self.state.read().await.is_processed(key))
    }

    async fn commit(&self, key: &EventKey) -> Result<(), GuardError> {
        let mut state = self.state.write().await;
        if state.is_processed(key) {
            return Ok(());
        }
        let mut next = state.clone();
        next.commit(*key);
        persist(&self.path, &next.to_document(&self.scope)).await?;
        *state = next;
        tracing::debug!(%key, "committed event");
        Ok(())
    }

    async fn watermark(&self) -> Result<u64, GuardError> {
        Ok(self.state.read().await.last_scanned_block)
    }

    async fn advance_watermark(&self, block: u64) -> Result<(), GuardError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        if !next.advance_to(block)? {
            return Ok(());
        }
        persist(&self.path, &next.to_document(&self.scope)).await?;
        *state = next;
        Ok(())
    }
}

/// Write `doc` to a temp file, fsync it, rename it over `path`, then fsync the directory so
/// the rename itself survives power loss. The whole snapshot is rewritten on each call, so a
/// commit costs O(committed keys).
async fn persist(path: &Path, doc: &StateDocument) -> Result<(), GuardError> {
    let body = serde_json::to_vec_pretty(doc).map_err(|e| GuardError::Corrupt(e.to_string()))?;
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GuardError::Unavailable(format!("{}: {}", parent.display(), e)))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let unavailable =
        |p: &Path, e: std::io::Error| GuardError::Unavailable(format!("{}: {}", p.display(), e));

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| unavailable(tmp.as_path(), e))?;
    file.write_all(&body).await.map_err(|e| unavailable(tmp.as_path(), e))?;
    file.sync_all().await.map_err(|e| unavailable(tmp.as_path(), e))?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| unavailable(path, e))?;
    sync_dir(parent.unwrap_or_else(|| Path::new("."))).await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), GuardError> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| GuardError::Unavailable(format!("{}: {}", dir.display(), e)))?;
    handle
        .sync_all()
        .await
        .map_err(|e| GuardError::Unavailable(format!("{}: {}", dir.display(), e)))
}

// Directories cannot be opened for fsync here; the rename is as durable as the platform makes it.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), GuardError> {
    Ok(())
}

/// Wraps a guard so that every call is bounded by `timeout`; elapsed calls surface as
/// [GuardError::Unavailable].
pub struct BoundedGuard {
    inner: Arc<dyn ReplayGuard>,
    timeout: Duration,
}

impl BoundedGuard {
    pub fn new(inner: Arc<dyn ReplayGuard>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = Result<T, GuardError>>,
    ) -> Result<T, GuardError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| GuardError::Unavailable(format!("{} timed out after {:?}", op, self.timeout)))?
    }
}

#[async_trait]
impl ReplayGuard for BoundedGuard {
    async fn is_processed(&self, key: &EventKey) -> Result<bool, GuardError> {
        self.bounded("is_processed", self.inner.is_processed(key)).await
    }

    async fn commit(&self, key: &EventKey) -> Result<(), GuardError> {
        self.bounded("commit", self.inner.commit(key)).await
    }

    async fn watermark(&self) -> Result<u64, GuardError> {
        self.bounded("watermark", self.inner.watermark()).await
    }

    async fn advance_watermark(&self, block: u64) -> Result<(), GuardError> {
        self.bounded("advance_watermark", self.inner.advance_watermark(block))
            .await
    }
}
