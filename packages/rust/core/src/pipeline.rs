//! One run of the stream pipeline: connector → channel → dispatcher.

use std::sync::Arc;

use streamrouter_shared::{Result, RouterError, panic_message};
use streamrouter_stream::Connector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::dispatcher::Dispatcher;

/// Connects a [`Connector`] to a [`Dispatcher`].
///
/// Events are consumed on a single task in arrival order; only route work
/// fans out.
pub struct Pipeline {
    connector: Arc<Connector>,
    dispatcher: Arc<Dispatcher>,
    capacity: usize,
}

impl Pipeline {
    pub fn new(connector: Arc<Connector>, dispatcher: Arc<Dispatcher>, capacity: usize) -> Self {
        Self {
            connector,
            dispatcher,
            capacity: capacity.max(1),
        }
    }

    /// Run until `token` is cancelled (returns `Ok`) or the connector hits a
    /// failure it cannot recover from (returns the error).
    #[instrument(skip_all)]
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(self.capacity);

        let connector = Arc::clone(&self.connector);
        let connector_token = token.child_token();
        let connector_task = tokio::spawn(async move { connector.run(tx, connector_token).await });

        let mut dispatched: u64 = 0;
        // Ends once the connector task has returned and dropped its sender.
        while let Some(event) = rx.recv().await {
            self.dispatcher.on_event(event);
            dispatched += 1;
        }
        debug!(dispatched, "event channel closed");

        match connector_task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(RouterError::Pipeline(format!(
                "connector panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))),
            Err(e) => Err(RouterError::Pipeline(format!("connector task aborted: {e}"))),
        }
    }
}
