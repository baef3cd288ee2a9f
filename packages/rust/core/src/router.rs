//! Process-level assembly: builds every component from [`AppConfig`] and
//! runs the supervised pipeline until cancelled.

use std::sync::Arc;

use streamrouter_checkpoint::{Checkpoint, FileCheckpointStore, ResumePolicy, spawn_flusher};
use streamrouter_routes::{LoadOptions, RouteCatalog, RouteRegistry, RouteSource};
use streamrouter_shared::{AppConfig, LogStream, Result, RouterError};
use streamrouter_stream::{Connector, ConnectorOptions, HttpTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::dispatcher::{AUDIT_LOG, Dispatcher};
use crate::pipeline::Pipeline;
use crate::supervisor::Supervisor;

/// Per-invocation choices that do not belong in the config file.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub routes: RouteSource,
    /// Ignore the checkpoint for the first subscription.
    pub from_now: bool,
    pub catalog: RouteCatalog,
}

impl RouterOptions {
    /// Routes from the configured manifest, built-in catalog, checkpoint
    /// honoured.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            routes: RouteSource::Manifest(config.routes.manifest.clone()),
            from_now: false,
            catalog: RouteCatalog::builtin(),
        }
    }
}

/// Run the router until `token` is cancelled.
///
/// Startup failures (bad config, unreadable manifest, unwritable log
/// directory) are returned; everything after startup is supervised.
#[instrument(skip_all, fields(url = %config.stream.url))]
pub async fn run(config: &AppConfig, options: RouterOptions, token: CancellationToken) -> Result<()> {
    config.validate()?;

    let store = Arc::new(FileCheckpointStore::new(&config.checkpoint.path));
    let checkpoint = Checkpoint::new();

    let registry = RouteRegistry::load(
        &options.routes,
        &options.catalog,
        &LoadOptions::from(&config.routes),
    )
    .await?;
    if registry.is_empty() {
        warn!("no valid routes loaded; events will only be checkpointed");
    }
    info!(
        routes = registry.len(),
        rejected = registry.rejected().len(),
        "route registry ready"
    );

    let audit = LogStream::open(&config.routes.log_dir, AUDIT_LOG)?;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(registry),
        checkpoint.clone(),
        audit,
    ));

    let connector = Arc::new(Connector::new(
        Arc::new(HttpTransport::new(&config.stream)?),
        checkpoint.clone(),
        store.clone(),
        Arc::new(ResumePolicy::new(
            config.stream.freshness_window(),
            options.from_now,
        )),
        ConnectorOptions::from(&config.stream),
    ));

    let flusher = spawn_flusher(
        checkpoint,
        store,
        config.checkpoint.flush_interval(),
        token.child_token(),
    );

    let supervisor = Supervisor::new(config.supervisor.restart_delay());
    let capacity = config.stream.channel_capacity;
    supervisor
        .supervise(token.clone(), |pipeline_token| {
            let pipeline = Pipeline::new(Arc::clone(&connector), Arc::clone(&dispatcher), capacity);
            async move { pipeline.run(pipeline_token).await }
        })
        .await;

    info!(in_flight = dispatcher.in_flight(), "waiting for route workers");
    dispatcher.drain().await;

    // The flusher's token is a child of `token`, so it is already stopping.
    flusher
        .await
        .map_err(|e| RouterError::Checkpoint(format!("flush task failed: {e}")))?;

    info!(restarts = supervisor.restarts(), "router stopped");
    Ok(())
}
