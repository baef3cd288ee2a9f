//! Resumption checkpoint: the timestamp of the last event seen.
//!
//! The [`Checkpoint`] cell lives in memory and is advanced by the dispatcher on
//! every event. A background task ([`spawn_flusher`]) periodically persists it
//! through a [`CheckpointStore`]; the default store is a plain-text file
//! ([`FileCheckpointStore`]).
//!
//! **Access rules:**
//! - Dispatcher: sole writer of the cell via [`Checkpoint::advance`]
//! - Flush task: reader of the cell, sole writer of the store
//! - Stream connector: reads both when choosing where to resume

mod flush;
mod resume;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use streamrouter_shared::{Result, RouterError};

pub use flush::{Flusher, spawn_flusher};
pub use resume::{ResumePoint, ResumePolicy, choose_resume_point};

/// Sentinel for "no event observed yet".
const UNSET: i64 = i64::MIN;

// ---------------------------------------------------------------------------
// In-memory cell
// ---------------------------------------------------------------------------

/// Shared last-seen timestamp (Unix seconds).
#[derive(Debug, Clone)]
pub struct Checkpoint {
    ts: Arc<AtomicI64>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self {
            ts: Arc::new(AtomicI64::new(UNSET)),
        }
    }

    /// Move the checkpoint forward to `ts`. Older values are ignored so the
    /// checkpoint never goes backwards while the process runs.
    pub fn advance(&self, ts: i64) {
        self.ts.fetch_max(ts, Ordering::AcqRel);
    }

    /// Current value, or `None` before the first event.
    pub fn get(&self) -> Option<i64> {
        match self.ts.load(Ordering::Acquire) {
            UNSET => None,
            ts => Some(ts),
        }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// Durable single-value store for the checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last persisted timestamp; `None` if missing, empty, or unparseable.
    async fn read(&self) -> Option<i64>;

    /// Persist `ts`, replacing the previous value.
    async fn write(&self, ts: i64) -> Result<()>;
}

/// Checkpoint kept as plain-text Unix seconds in a single file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read(&self) -> Option<i64> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let parsed = content.trim().parse::<i64>().ok();
                if parsed.is_none() {
                    tracing::warn!(path = %self.path.display(), "checkpoint file is not a timestamp");
                }
                parsed
            }
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "no readable checkpoint");
                None
            }
        }
    }

    async fn write(&self, ts: i64) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RouterError::io(parent, e))?;
        }

        // Write-then-rename so readers never see a truncated value.
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, ts.to_string())
            .await
            .map_err(|e| RouterError::Checkpoint(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RouterError::Checkpoint(format!("{}: {e}", self.path.display())))
    }
}
