//! Keeps the pipeline running.
//!
//! Any failure that escapes a pipeline run (an error result or a panic) is
//! logged and the pipeline is rebuilt after a fixed delay. Only cancellation
//! stops the loop.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use streamrouter_shared::{Result, panic_message};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

pub struct Supervisor {
    restart_delay: Duration,
    restarts: AtomicU64,
}

impl Supervisor {
    pub fn new(restart_delay: Duration) -> Self {
        Self {
            restart_delay,
            restarts: AtomicU64::new(0),
        }
    }

    /// How many times the pipeline has been restarted.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run `make_pipeline` until `token` is cancelled, restarting it after
    /// every failure. Each run gets a child token and runs on its own task so
    /// a panic is caught instead of unwinding through here.
    #[instrument(skip_all)]
    pub async fn supervise<F, Fut>(&self, token: CancellationToken, mut make_pipeline: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        loop {
            if token.is_cancelled() {
                break;
            }

            let outcome = tokio::spawn(make_pipeline(token.child_token())).await;
            if token.is_cancelled() {
                break;
            }

            match outcome {
                Ok(Ok(())) => warn!("pipeline stopped without being cancelled"),
                Ok(Err(e)) => error!(error = %e, "pipeline failed"),
                Err(e) if e.is_panic() => {
                    error!(panic = %panic_message(e.into_panic().as_ref()), "pipeline panicked");
                }
                Err(e) => error!(error = %e, "pipeline task aborted"),
            }

            let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                restarts,
                delay_secs = self.restart_delay.as_secs_f64(),
                "restarting pipeline"
            );

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }

        info!(restarts = self.restarts(), "supervisor stopped");
    }
}
