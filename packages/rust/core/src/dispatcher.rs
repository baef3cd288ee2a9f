//! Fan-out of incoming events to routes.
//!
//! `on_event` is called once per event, in arrival order, and never waits
//! for route work. Each route has a lane: a bounded queue drained by one
//! task that waits for the route's readiness, then checks the filter,
//! writes the audit line and starts the worker under the route's permit.
//! Per route, the audit log and worker start order therefore follow arrival
//! order, including events that arrived during `init`. A full lane drops
//! the event for that route only and counts it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures::FutureExt;
use streamrouter_checkpoint::Checkpoint;
use streamrouter_routes::{ReadyState, RegisteredRoute, RouteRegistry};
use streamrouter_shared::{ChangeEvent, LogStream, panic_message};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, OwnedSemaphorePermit, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Name of the log stream that receives routing audit lines.
pub const AUDIT_LOG: &str = "routerlog";

/// Producer side of one route's lane.
struct Lane {
    entry: Arc<RegisteredRoute>,
    tx: mpsc::Sender<Arc<ChangeEvent>>,
    dropped: AtomicU64,
}

/// Events accepted by a lane but not yet handed to a worker, across all
/// lanes. `idle` fires whenever the count returns to zero.
#[derive(Default)]
struct Backlog {
    queued: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    fn push(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.queued.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

pub struct Dispatcher {
    registry: Arc<RouteRegistry>,
    checkpoint: Checkpoint,
    audit: LogStream,
    lanes: Vec<Lane>,
    backlog: Arc<Backlog>,
    workers: TaskTracker,
}

impl Dispatcher {
    /// Build the dispatcher and start one lane task per route. Must be
    /// called from within a Tokio runtime.
    pub fn new(registry: Arc<RouteRegistry>, checkpoint: Checkpoint, audit: LogStream) -> Self {
        let backlog = Arc::new(Backlog::default());
        let workers = TaskTracker::new();

        let lanes = registry
            .routes()
            .iter()
            .map(|entry| {
                let (tx, rx) = mpsc::channel(entry.queue_capacity);
                tokio::spawn(run_lane(
                    Arc::clone(entry),
                    rx,
                    audit.clone(),
                    workers.clone(),
                    Arc::clone(&backlog),
                ));
                Lane {
                    entry: Arc::clone(entry),
                    tx,
                    dropped: AtomicU64::new(0),
                }
            })
            .collect();

        Self {
            registry,
            checkpoint,
            audit,
            lanes,
            backlog,
            workers,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Handle one event. Advances the checkpoint, then queues the event on
    /// every route that has not failed initialization.
    pub fn on_event(&self, event: ChangeEvent) {
        self.checkpoint.advance(event.timestamp);
        let event = Arc::new(event);

        for lane in &self.lanes {
            if lane.entry.readiness.state() == ReadyState::Failed {
                continue;
            }

            self.backlog.push();
            match lane.tx.try_send(Arc::clone(&event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.backlog.done();
                    let dropped = lane.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 1000 == 0 {
                        warn!(route = %lane.entry.name, dropped, "route queue full, dropping events");
                    }
                }
                // The lane has shut down after a failed init.
                Err(TrySendError::Closed(_)) => self.backlog.done(),
            }
        }
    }

    /// Wait until every queued event has reached its worker and every
    /// worker started so far has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.backlog.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.backlog.len() == 0 {
                break;
            }
            idle.await;
        }

        self.workers.close();
        self.workers.wait().await;
        self.workers.reopen();
    }

    /// Events queued for routes plus workers still running.
    pub fn in_flight(&self) -> usize {
        self.backlog.len() + self.workers.len()
    }

    /// Events dropped because a route's queue was full.
    pub fn dropped(&self) -> u64 {
        self.lanes
            .iter()
            .map(|lane| lane.dropped.load(Ordering::Relaxed))
            .sum()
    }
}

/// Drain one route's queue in order until the dispatcher is dropped.
async fn run_lane(
    entry: Arc<RegisteredRoute>,
    mut rx: mpsc::Receiver<Arc<ChangeEvent>>,
    audit: LogStream,
    workers: TaskTracker,
    backlog: Arc<Backlog>,
) {
    let ready = entry.readiness.wait().await;
    if !ready {
        rx.close();
    }

    while let Some(event) = rx.recv().await {
        if ready && accepts(&entry, &event) {
            write_audit(&audit, &entry.name, &event);
            if let Ok(permit) = Arc::clone(&entry.permits).acquire_owned().await {
                workers.spawn(run_worker(Arc::clone(&entry), event, permit));
            }
        }
        backlog.done();
    }
}

/// `Routing to <route>: <note><title>@<wiki>`, where the note names the page
/// of a category change (`+Page@` when added, `-Page@` when removed).
pub fn audit_line(route: &str, event: &ChangeEvent) -> String {
    let note = event
        .category_change()
        .map(|change| format!("{}{}@", if change.added { '+' } else { '-' }, change.title))
        .unwrap_or_default();
    format!("Routing to {route}: {note}{}@{}", event.title, event.wiki)
}

fn write_audit(audit: &LogStream, route: &str, event: &ChangeEvent) {
    let line = audit_line(route, event);
    debug!(route = %route, "{line}");
    audit.log(line);
}

fn accepts(entry: &RegisteredRoute, event: &ChangeEvent) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| entry.route.filter(event))) {
        Ok(accepted) => accepted,
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            error!(route = %entry.name, %panic, "route filter panicked");
            entry.log.log(format!("filter panicked: {panic}"));
            false
        }
    }
}

async fn run_worker(
    entry: Arc<RegisteredRoute>,
    event: Arc<ChangeEvent>,
    _permit: OwnedSemaphorePermit,
) {
    match AssertUnwindSafe(entry.route.worker(&event))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(route = %entry.name, error = %e, title = %event.title, "route worker failed");
            entry.log.log(format!("worker failed on {}@{}: {e}", event.title, event.wiki));
        }
        Err(payload) => {
            let panic = panic_message(payload.as_ref());
            error!(route = %entry.name, %panic, title = %event.title, "route worker panicked");
            entry
                .log
                .log(format!("worker panicked on {}@{}: {panic}", event.title, event.wiki));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use streamrouter_routes::{LoadOptions, Route, RouteCatalog, RouteSpec};
    use streamrouter_shared::{ChangeType, Result, RouterError};

    /// Records the titles it was handed.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        accept: bool,
    }

    #[async_trait]
    impl Route for Recorder {
        fn filter(&self, _event: &ChangeEvent) -> bool {
            self.accept
        }

        async fn worker(&self, event: &ChangeEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.title.clone());
            Ok(())
        }
    }

    /// Fails to initialize; counts worker calls that should never happen.
    struct BrokenInit {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Route for BrokenInit {
        async fn init(&self) -> Result<()> {
            Err(RouterError::Network("no database".into()))
        }

        async fn worker(&self, _event: &ChangeEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Slow initializer; events must wait for it.
    struct SlowInit {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Route for SlowInit {
        async fn init(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }

        async fn worker(&self, event: &ChangeEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.title.clone());
            Ok(())
        }
    }

    /// Worker that never finishes.
    struct Stuck;

    #[async_trait]
    impl Route for Stuck {
        async fn worker(&self, _event: &ChangeEvent) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Erroring;

    #[async_trait]
    impl Route for Erroring {
        async fn worker(&self, _event: &ChangeEvent) -> Result<()> {
            Err(RouterError::route("erroring", "always fails"))
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl Route for PanickingWorker {
        async fn worker(&self, _event: &ChangeEvent) -> Result<()> {
            panic!("worker exploded");
        }
    }

    struct PanickingFilter;

    #[async_trait]
    impl Route for PanickingFilter {
        fn filter(&self, _event: &ChangeEvent) -> bool {
            panic!("filter exploded");
        }

        async fn worker(&self, _event: &ChangeEvent) -> Result<()> {
            Ok(())
        }
    }

    fn event(title: &str, ts: i64) -> ChangeEvent {
        ChangeEvent {
            id: None,
            kind: ChangeType::Edit,
            title: title.into(),
            wiki: "enwiki".into(),
            timestamp: ts,
            comment: String::new(),
            meta: serde_json::Value::Null,
            extra: serde_json::Map::new(),
        }
    }

    fn categorize(comment: &str) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeType::Categorize,
            comment: comment.into(),
            ..event("Category:Articles for deletion", 1_700_000_000)
        }
    }

    async fn dispatcher(catalog: RouteCatalog, entries: &[(&str, &str)]) -> Dispatcher {
        dispatcher_with(catalog, entries, LoadOptions::default()).await
    }

    async fn dispatcher_with(
        catalog: RouteCatalog,
        entries: &[(&str, &str)],
        options: LoadOptions,
    ) -> Dispatcher {
        let entries = entries
            .iter()
            .map(|(n, l)| (n.to_string(), l.to_string()))
            .collect();
        let registry = RouteRegistry::load_entries(entries, &catalog, &options).await;
        Dispatcher::new(
            Arc::new(registry),
            Checkpoint::new(),
            LogStream::in_memory(AUDIT_LOG),
        )
    }

    fn recorder(
        seen: &Arc<Mutex<Vec<String>>>,
        accept: bool,
    ) -> impl Fn(&RouteSpec) -> Result<Arc<dyn Route>> + Send + Sync + 'static {
        let seen = Arc::clone(seen);
        move |_: &RouteSpec| {
            Ok(Arc::new(Recorder {
                seen: Arc::clone(&seen),
                accept,
            }) as Arc<dyn Route>)
        }
    }

    #[tokio::test]
    async fn filter_false_skips_worker() {
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let catalog = RouteCatalog::new()
            .with("yes", recorder(&accepted, true))
            .with("no", recorder(&rejected, false));
        let d = dispatcher(catalog, &[("yes", "yes"), ("no", "no")]).await;

        d.on_event(event("Foo", 10));
        d.drain().await;

        assert_eq!(*accepted.lock().unwrap(), vec!["Foo"]);
        assert!(rejected.lock().unwrap().is_empty());
        assert_eq!(d.audit.lines(), vec!["Routing to yes: Foo@enwiki"]);
    }

    #[tokio::test]
    async fn failed_init_never_runs_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let catalog = RouteCatalog::new().with("broken", {
            let calls = Arc::clone(&calls);
            move |_: &RouteSpec| {
                Ok(Arc::new(BrokenInit {
                    calls: Arc::clone(&calls),
                }) as Arc<dyn Route>)
            }
        });
        let d = dispatcher(catalog, &[("broken", "broken")]).await;

        d.on_event(event("Foo", 10));
        d.drain().await;
        d.on_event(event("Bar", 11));
        d.drain().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(d.audit.lines().is_empty());
    }

    #[tokio::test]
    async fn events_wait_for_slow_init() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let catalog = RouteCatalog::new().with("slow", {
            let seen = Arc::clone(&seen);
            move |_: &RouteSpec| {
                Ok(Arc::new(SlowInit {
                    seen: Arc::clone(&seen),
                }) as Arc<dyn Route>)
            }
        });
        let d = dispatcher(catalog, &[("slow", "slow")]).await;

        d.on_event(event("Early", 10));
        assert!(seen.lock().unwrap().is_empty());
        d.drain().await;

        assert_eq!(*seen.lock().unwrap(), vec!["Early"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn events_queued_during_init_keep_arrival_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let catalog = RouteCatalog::new().with("slow", {
            let seen = Arc::clone(&seen);
            move |_: &RouteSpec| {
                Ok(Arc::new(SlowInit {
                    seen: Arc::clone(&seen),
                }) as Arc<dyn Route>)
            }
        });
        let d = dispatcher(catalog, &[("slow", "slow")]).await;

        let titles: Vec<String> = (0..200).map(|i| format!("Page {i}")).collect();
        for (i, title) in titles.iter().enumerate() {
            d.on_event(event(title, 1_000 + i as i64));
        }
        d.drain().await;

        let expected: Vec<String> = titles
            .iter()
            .map(|t| format!("Routing to slow: {t}@enwiki"))
            .collect();
        assert_eq!(d.audit.lines(), expected);
        assert_eq!(seen.lock().unwrap().len(), 200);
        assert_eq!(d.dropped(), 0);
    }

    #[tokio::test]
    async fn stuck_route_keeps_bounded_backlog() {
        let catalog = RouteCatalog::new().with("stuck", |_| Ok(Arc::new(Stuck) as Arc<dyn Route>));
        let options = LoadOptions {
            max_in_flight: 4,
            queue_capacity: 8,
            ..LoadOptions::default()
        };
        let d = dispatcher_with(catalog, &[("stuck", "stuck")], options).await;

        for i in 0..10_000 {
            d.on_event(event("Flood", i));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // four running workers, at most eight queued events
        assert!(d.in_flight() <= 12, "in flight: {}", d.in_flight());
        assert!(d.dropped() >= 10_000 - 12);
        assert_eq!(d.checkpoint().get(), Some(9_999));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn category_changes_apply_in_arrival_order() {
        let d = dispatcher(
            RouteCatalog::builtin(),
            &[("afd", "category:Category:Articles for deletion")],
        )
        .await;

        for _ in 0..50 {
            d.on_event(categorize("[[:Example Page]] added to category"));
            d.on_event(categorize("[[:Example Page]] removed from category"));
        }
        d.drain().await;

        let log = d.registry().get("afd").unwrap().log.lines();
        assert_eq!(log.len(), 100);
        assert_eq!(log.last().map(String::as_str), Some("-Example Page (0 members)"));
        assert!(
            log.chunks(2)
                .all(|pair| pair[0].starts_with('+') && pair[1].starts_with('-'))
        );
    }

    #[tokio::test]
    async fn failing_routes_do_not_affect_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let catalog = RouteCatalog::new()
            .with("ok", recorder(&seen, true))
            .with("erroring", |_| Ok(Arc::new(Erroring) as Arc<dyn Route>))
            .with("panics", |_| Ok(Arc::new(PanickingWorker) as Arc<dyn Route>))
            .with("bad-filter", |_| Ok(Arc::new(PanickingFilter) as Arc<dyn Route>));
        let d = dispatcher(
            catalog,
            &[
                ("a-erroring", "erroring"),
                ("b-panics", "panics"),
                ("c-bad-filter", "bad-filter"),
                ("d-ok", "ok"),
            ],
        )
        .await;

        for (i, title) in ["One", "Two", "Three"].into_iter().enumerate() {
            d.on_event(event(title, 100 + i as i64));
        }
        d.drain().await;

        let mut titles = seen.lock().unwrap().clone();
        titles.sort();
        assert_eq!(titles, vec!["One", "Three", "Two"]);
        assert_eq!(d.in_flight(), 0);
    }

    #[tokio::test]
    async fn checkpoint_advances_per_event() {
        let d = dispatcher(RouteCatalog::new(), &[]).await;
        assert_eq!(d.checkpoint().get(), None);

        d.on_event(event("A", 200));
        d.on_event(event("B", 150));
        assert_eq!(d.checkpoint().get(), Some(200));
    }

    #[tokio::test]
    async fn category_audit_notes_page() {
        let d = dispatcher(
            RouteCatalog::builtin(),
            &[
                ("afd", "category:Category:Articles for deletion"),
                ("other", "category:Category:Something else"),
            ],
        )
        .await;

        d.on_event(categorize("[[:Example Page]] added to category"));
        d.drain().await;

        let lines = d.audit.lines();
        assert_eq!(
            lines,
            vec!["Routing to afd: +Example Page@Category:Articles for deletion@enwiki"]
        );
        assert!(lines[0].contains("+Example Page@"));
    }

    #[test]
    fn audit_line_formats() {
        assert_eq!(
            audit_line("gan", &event("Foo", 1)),
            "Routing to gan: Foo@enwiki"
        );
        assert_eq!(
            audit_line("afd", &categorize("[[:Old Page]] removed from category")),
            "Routing to afd: -Old Page@Category:Articles for deletion@enwiki"
        );
    }
}
