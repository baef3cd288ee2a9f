//! Loading, validating and initializing routes.
//!
//! The registry is built once at startup. Each entry is constructed from the
//! catalog, checked with `validate()` and then initialized on its own task.
//! A bad entry is logged and set aside; it never aborts the load and never
//! takes part in dispatch.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use streamrouter_shared::{LogStream, Result, RouterError, RoutesConfig, panic_message};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::catalog::{Locator, RouteCatalog};
use crate::route::{Route, RouteSpec};

// ---------------------------------------------------------------------------
// Sources and options
// ---------------------------------------------------------------------------

/// Where route definitions come from.
#[derive(Debug, Clone)]
pub enum RouteSource {
    /// JSON object `{ "<route name>": "<locator>" }`.
    Manifest(PathBuf),
    /// A single locator replacing the manifest, for development. The name
    /// defaults to the locator's kind.
    Override {
        locator: String,
        name: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Directory for per-route log streams and state; `None` keeps both in
    /// memory.
    pub log_dir: Option<PathBuf>,
    /// Concurrency cap for routes that do not set their own.
    pub max_in_flight: usize,
    /// Bound of each route's queue of events waiting for a worker.
    pub queue_capacity: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            max_in_flight: 16,
            queue_capacity: 1024,
        }
    }
}

impl From<&RoutesConfig> for LoadOptions {
    fn from(config: &RoutesConfig) -> Self {
        Self {
            log_dir: Some(config.log_dir.clone()),
            max_in_flight: config.max_in_flight,
            queue_capacity: config.queue_capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Pending,
    Ready,
    Failed,
}

/// One-shot readiness signal published by a route's initializer.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<ReadyState>>,
}

impl Readiness {
    pub fn pending() -> Self {
        let (tx, _) = watch::channel(ReadyState::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ReadyState {
        *self.tx.borrow()
    }

    fn settle(&self, state: ReadyState) {
        self.tx.send_replace(state);
    }

    /// Wait until the initializer has finished. Returns `true` when the
    /// route is ready, `false` when it failed.
    pub async fn wait(&self) -> bool {
        let mut rx = self.tx.subscribe();
        rx.wait_for(|s| *s != ReadyState::Pending)
            .await
            .map(|state| *state == ReadyState::Ready)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A validated route together with its runtime plumbing.
pub struct RegisteredRoute {
    pub name: String,
    pub route: Arc<dyn Route>,
    pub log: LogStream,
    pub readiness: Readiness,
    /// Caps simultaneously running workers for this route.
    pub permits: Arc<Semaphore>,
    pub queue_capacity: usize,
}

impl std::fmt::Debug for RegisteredRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredRoute")
            .field("name", &self.name)
            .field("readiness", &self.readiness.state())
            .field("permits", &self.permits.available_permits())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

/// An entry that did not make it into the registry.
#[derive(Debug)]
pub struct RejectedRoute {
    pub name: String,
    pub error: RouterError,
}

/// Ordered set of routes eligible for dispatch.
#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: Vec<Arc<RegisteredRoute>>,
    rejected: Vec<RejectedRoute>,
}

impl RouteRegistry {
    /// Build the registry from a manifest or a single override locator.
    ///
    /// An unreadable or unparseable manifest is an error; everything that
    /// goes wrong with an individual entry is not.
    pub async fn load(
        source: &RouteSource,
        catalog: &RouteCatalog,
        options: &LoadOptions,
    ) -> Result<Self> {
        let entries = match source {
            RouteSource::Manifest(path) => read_manifest(path).await?,
            RouteSource::Override { locator, name } => {
                let name = match name {
                    Some(name) => name.clone(),
                    None => Locator::parse(locator)?.kind,
                };
                vec![(name, locator.clone())]
            }
        };

        Ok(Self::load_entries(entries, catalog, options).await)
    }

    /// Build the registry from `(name, locator)` pairs, in the given order.
    pub async fn load_entries(
        entries: Vec<(String, String)>,
        catalog: &RouteCatalog,
        options: &LoadOptions,
    ) -> Self {
        let mut registry = Self::default();
        let mut seen = HashSet::new();

        for (name, locator) in entries {
            let result = if name.trim().is_empty() {
                Err(RouterError::validation(format!(
                    "route with locator '{locator}' has an empty name"
                )))
            } else if !seen.insert(name.clone()) {
                Err(RouterError::route(&name, "duplicate route name"))
            } else {
                register(&name, &locator, catalog, options)
            };

            match result {
                Ok(entry) => {
                    info!(route = %name, %locator, "route loaded");
                    registry.routes.push(Arc::new(entry));
                }
                Err(e) => {
                    error!(route = %name, %locator, error = %e, "invalid route, skipping");
                    registry.rejected.push(RejectedRoute { name, error: e });
                }
            }
        }

        for entry in &registry.routes {
            spawn_init(Arc::clone(entry));
        }

        registry
    }

    pub fn routes(&self) -> &[Arc<RegisteredRoute>] {
        &self.routes
    }

    pub fn rejected(&self) -> &[RejectedRoute] {
        &self.rejected
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredRoute>> {
        self.routes.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

async fn read_manifest(path: &Path) -> Result<Vec<(String, String)>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RouterError::io(path, e))?;
    let manifest: BTreeMap<String, String> = serde_json::from_str(&raw)
        .map_err(|e| RouterError::parse(format!("route manifest {}: {e}", path.display())))?;
    Ok(manifest.into_iter().collect())
}

fn register(
    name: &str,
    locator: &str,
    catalog: &RouteCatalog,
    options: &LoadOptions,
) -> Result<RegisteredRoute> {
    let locator = Locator::parse(locator)?;
    let factory = catalog.get(&locator.kind).ok_or_else(|| {
        RouterError::route(name, format!("unknown route kind '{}'", locator.kind))
    })?;

    let log = match &options.log_dir {
        Some(dir) => LogStream::open(dir, name)?,
        None => LogStream::in_memory(name),
    };
    let spec = RouteSpec {
        name: name.to_string(),
        argument: locator.argument.clone(),
        log: log.clone(),
        state_dir: options.log_dir.clone(),
    };

    let route = std::panic::catch_unwind(AssertUnwindSafe(|| (**factory)(&spec)))
        .map_err(|payload| {
            RouterError::route(
                name,
                format!("panicked during construction: {}", panic_message(payload.as_ref())),
            )
        })??;

    std::panic::catch_unwind(AssertUnwindSafe(|| route.validate())).map_err(|payload| {
        RouterError::route(
            name,
            format!("panicked during validation: {}", panic_message(payload.as_ref())),
        )
    })??;

    let max_in_flight = route.max_in_flight().unwrap_or(options.max_in_flight).max(1);
    Ok(RegisteredRoute {
        name: name.to_string(),
        route,
        log,
        readiness: Readiness::pending(),
        permits: Arc::new(Semaphore::new(max_in_flight)),
        queue_capacity: options.queue_capacity.max(1),
    })
}

fn spawn_init(entry: Arc<RegisteredRoute>) {
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(entry.route.init()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                debug!(route = %entry.name, "route ready");
                entry.readiness.settle(ReadyState::Ready);
            }
            Ok(Err(e)) => {
                warn!(route = %entry.name, error = %e, "route initialization failed, route stays dormant");
                entry.readiness.settle(ReadyState::Failed);
            }
            Err(payload) => {
                warn!(
                    route = %entry.name,
                    panic = %panic_message(payload.as_ref()),
                    "route initialization panicked, route stays dormant"
                );
                entry.readiness.settle(ReadyState::Failed);
            }
        }
    });
}
