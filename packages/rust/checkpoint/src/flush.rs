//! Periodic persistence of the in-memory checkpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Checkpoint, CheckpointStore};

/// Writes the checkpoint to its store when it has moved.
pub struct Flusher {
    checkpoint: Checkpoint,
    store: Arc<dyn CheckpointStore>,
    last_written: Option<i64>,
}

impl Flusher {
    pub fn new(checkpoint: Checkpoint, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            checkpoint,
            store,
            last_written: None,
        }
    }

    /// Persist the current value if it changed since the last successful
    /// write. Returns `true` when a write happened. A failed write leaves
    /// `last_written` untouched so the next call retries.
    pub async fn flush(&mut self) -> bool {
        let Some(ts) = self.checkpoint.get() else {
            return false;
        };
        if self.last_written == Some(ts) {
            return false;
        }
        match self.store.write(ts).await {
            Ok(()) => {
                self.last_written = Some(ts);
                true
            }
            Err(e) => {
                warn!(ts, error = %e, "failed to persist checkpoint, will retry");
                false
            }
        }
    }
}

/// Spawn the flush loop. It ticks every `period` and makes one last flush
/// when `token` is cancelled.
pub fn spawn_flusher(
    checkpoint: Checkpoint,
    store: Arc<dyn CheckpointStore>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut flusher = Flusher::new(checkpoint, store);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    flusher.flush().await;
                    debug!("checkpoint flusher stopped");
                    break;
                }
                _ = ticker.tick() => {
                    flusher.flush().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use streamrouter_shared::{Result, RouterError};

    /// Records writes; fails the first `fail_first` of them.
    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<i64>>,
        attempts: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl CheckpointStore for RecordingStore {
        async fn read(&self) -> Option<i64> {
            self.writes.lock().unwrap().last().copied()
        }

        async fn write(&self, ts: i64) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(RouterError::Checkpoint("disk full".into()));
            }
            self.writes.lock().unwrap().push(ts);
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_skips_unset_and_unchanged() {
        let store = Arc::new(RecordingStore::default());
        let cp = Checkpoint::new();
        let mut flusher = Flusher::new(cp.clone(), store.clone());

        assert!(!flusher.flush().await);

        cp.advance(10);
        assert!(flusher.flush().await);
        assert!(!flusher.flush().await);

        cp.advance(11);
        assert!(flusher.flush().await);
        assert_eq!(*store.writes.lock().unwrap(), vec![10, 11]);
    }

    #[tokio::test]
    async fn failed_write_is_retried_and_memory_untouched() {
        let store = Arc::new(RecordingStore {
            fail_first: 2,
            ..Default::default()
        });
        let cp = Checkpoint::new();
        cp.advance(42);
        let mut flusher = Flusher::new(cp.clone(), store.clone());

        assert!(!flusher.flush().await);
        assert!(!flusher.flush().await);
        assert_eq!(cp.get(), Some(42));
        assert!(flusher.flush().await);
        assert_eq!(*store.writes.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn flusher_task_persists_and_flushes_on_shutdown() {
        let store = Arc::new(RecordingStore::default());
        let cp = Checkpoint::new();
        let token = CancellationToken::new();
        let handle = spawn_flusher(
            cp.clone(),
            store.clone(),
            Duration::from_millis(10),
            token.clone(),
        );

        cp.advance(100);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.read().await, Some(100));

        cp.advance(200);
        token.cancel();
        handle.await.unwrap();
        assert_eq!(store.read().await, Some(200));
    }
}
