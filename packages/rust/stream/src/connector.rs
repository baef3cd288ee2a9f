//! Long-lived subscription with reconnect, backoff, and rate-limit handling.
//!
//! The connector owns at most one live [`FrameStream`] at a time. Whenever a
//! subscription ends, that stream is dropped before the next one is opened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use streamrouter_checkpoint::{Checkpoint, CheckpointStore, ResumePolicy};
use streamrouter_shared::{ChangeEvent, Result, RouterError, StreamConfig};

use crate::backoff::Backoff;
use crate::transport::{FrameStream, StreamError, SubscribeRequest, Transport};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    /// The feed closed the connection as part of its keep-alive policy.
    BenignDrop,
    /// Cooling down after a 429.
    RateLimited,
    /// Waiting out the backoff after a failed attempt.
    TransportError,
    Stopped,
}

/// How one subscription ended.
#[derive(Debug)]
enum Outcome {
    Stopped,
    Dropped(String),
    RateLimited(Option<Duration>),
    Failed(StreamError),
    Fatal(StreamError),
}

impl From<StreamError> for Outcome {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::RateLimited { retry_after } => Self::RateLimited(retry_after),
            StreamError::Disconnected(reason) => Self::Dropped(reason),
            StreamError::InvalidRequest(_) => Self::Fatal(err),
            StreamError::Status(_) | StreamError::Connect(_) => Self::Failed(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Timing knobs for [`Connector`].
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Wait after a rate-limit signal before resubscribing.
    pub rate_limit_cooldown: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&StreamConfig> for ConnectorOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            rate_limit_cooldown: config.rate_limit_cooldown(),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

/// Subscribes to the event feed and forwards events in arrival order.
pub struct Connector {
    transport: Arc<dyn Transport>,
    checkpoint: Checkpoint,
    store: Arc<dyn CheckpointStore>,
    resume: Arc<ResumePolicy>,
    options: ConnectorOptions,
    state: watch::Sender<ConnectionState>,
}

impl Connector {
    pub fn new(
        transport: Arc<dyn Transport>,
        checkpoint: Checkpoint,
        store: Arc<dyn CheckpointStore>,
        resume: Arc<ResumePolicy>,
        options: ConnectorOptions,
    ) -> Self {
        Self {
            transport,
            checkpoint,
            store,
            resume,
            options,
            state: watch::Sender::new(ConnectionState::Idle),
        }
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Run until `token` is cancelled.
    ///
    /// Returns `Ok(())` on cancellation and an error only for failures a
    /// reconnect cannot fix: an invalid request, or nobody left to receive
    /// events.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        events: mpsc::Sender<ChangeEvent>,
        token: CancellationToken,
    ) -> Result<()> {
        let mut backoff =
            Backoff::new(self.options.backoff_initial, self.options.backoff_max).jittered();
        let mut last_event_id: Option<String> = None;

        loop {
            self.set_state(ConnectionState::Connecting);
            let point = self
                .resume
                .resume_point(&self.checkpoint, self.store.as_ref(), Utc::now())
                .await;
            let request = SubscribeRequest {
                since: point.to_query_value(Utc::now()),
                last_event_id: last_event_id.clone(),
            };

            let opened = tokio::select! {
                _ = token.cancelled() => Err(None),
                opened = self.transport.open(&request) => opened.map_err(Some),
            };

            let outcome = match opened {
                Ok(frames) => {
                    info!(
                        since = %request.since,
                        last_event_id = ?request.last_event_id,
                        "connected to event stream"
                    );
                    self.set_state(ConnectionState::Streaming);
                    self.pump(frames, &events, &mut last_event_id, &mut backoff, &token)
                        .await?
                }
                Err(None) => Outcome::Stopped,
                Err(Some(e)) => Outcome::from(e),
            };

            match outcome {
                Outcome::Stopped => break,
                Outcome::Dropped(reason) => {
                    // Expected every ~15 minutes; reconnect straight away.
                    self.set_state(ConnectionState::BenignDrop);
                    debug!(%reason, "event stream dropped, reconnecting");
                }
                Outcome::RateLimited(retry_after) => {
                    self.set_state(ConnectionState::RateLimited);
                    last_event_id = None;
                    let wait = retry_after.map_or(self.options.rate_limit_cooldown, |r| {
                        r.max(self.options.rate_limit_cooldown)
                    });
                    warn!(wait_ms = wait.as_millis() as u64, "rate limited by event stream");
                    if !sleep_or_cancel(wait, &token).await {
                        break;
                    }
                }
                Outcome::Failed(e) => {
                    self.set_state(ConnectionState::TransportError);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "event stream error, reconnecting after backoff"
                    );
                    if !sleep_or_cancel(delay, &token).await {
                        break;
                    }
                }
                Outcome::Fatal(e) => {
                    self.set_state(ConnectionState::Stopped);
                    return Err(e.into());
                }
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!("event stream stopped");
        Ok(())
    }

    /// Forward frames of one subscription until it ends. `frames` is dropped
    /// on return, closing the connection.
    ///
    /// A subscription that ends before its first frame counts as a failed
    /// attempt, so an empty response backs off instead of reconnecting at once.
    async fn pump(
        &self,
        mut frames: FrameStream,
        events: &mpsc::Sender<ChangeEvent>,
        last_event_id: &mut Option<String>,
        backoff: &mut Backoff,
        token: &CancellationToken,
    ) -> Result<Outcome> {
        let mut received = false;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(Outcome::Stopped),
                next = frames.next() => next,
            };

            let frame = match (next, received) {
                (None, true) => return Ok(Outcome::Dropped("stream ended".into())),
                (None, false) => {
                    return Ok(Outcome::Failed(StreamError::Disconnected(
                        "stream ended before the first frame".into(),
                    )));
                }
                (Some(Err(StreamError::Disconnected(reason))), false) => {
                    return Ok(Outcome::Failed(StreamError::Disconnected(reason)));
                }
                (Some(Err(e)), _) => return Ok(Outcome::from(e)),
                (Some(Ok(frame)), _) => frame,
            };

            received = true;
            backoff.reset();
            if frame.id.is_some() {
                *last_event_id = frame.id.clone();
            }
            if !frame.is_message() {
                debug!(event = ?frame.event, "ignoring non-message frame");
                continue;
            }

            let event = match ChangeEvent::from_json(&frame.data) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "skipping malformed event");
                    continue;
                }
            };

            tokio::select! {
                _ = token.cancelled() => return Ok(Outcome::Stopped),
                sent = events.send(event) => {
                    if sent.is_err() {
                        return Err(RouterError::Pipeline("event channel closed".into()));
                    }
                }
            }
        }
    }
}

/// Sleep for `delay`; `false` if cancelled first.
async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
