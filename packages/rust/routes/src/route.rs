//! The route contract.

use std::path::PathBuf;

use async_trait::async_trait;
use streamrouter_shared::{ChangeEvent, LogStream, Result};

/// A pluggable event handler.
///
/// `filter` decides whether the route cares about an event; `worker` acts on
/// it. Workers must be idempotent: after a reconnect the same event may be
/// delivered again.
#[async_trait]
pub trait Route: Send + Sync {
    /// Contract check run once at load time. A route that fails it never
    /// joins the registry.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// One-off asynchronous setup. Neither `filter` nor `worker` is called
    /// before this has completed successfully, so `init` may change what
    /// `filter` accepts.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Pure, non-blocking predicate.
    fn filter(&self, _event: &ChangeEvent) -> bool {
        true
    }

    async fn worker(&self, event: &ChangeEvent) -> Result<()>;

    /// Cap on this route's concurrently running workers, replacing the
    /// configured default. `Some(1)` makes workers run one at a time in
    /// arrival order.
    fn max_in_flight(&self) -> Option<usize> {
        None
    }
}

/// Everything a factory needs to construct one route.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    /// Unique route name from the manifest.
    pub name: String,
    /// Locator argument (the part after `kind:`), if any.
    pub argument: Option<String>,
    /// The route's dedicated output sink.
    pub log: LogStream,
    /// Directory for state the route persists between runs; `None` keeps
    /// everything in memory.
    pub state_dir: Option<PathBuf>,
}
