//! Choosing where a new subscription starts.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tracing::info;

use crate::{Checkpoint, CheckpointStore};

/// Where a subscription should begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Replay from this instant.
    Since(DateTime<Utc>),
    /// Only events from the moment of subscribing.
    Now,
}

impl ResumePoint {
    /// Concrete instant for the `since` parameter.
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Since(ts) => ts,
            Self::Now => now,
        }
    }

    /// ISO-8601 with millisecond precision and a `Z` suffix.
    pub fn to_query_value(self, now: DateTime<Utc>) -> String {
        self.resolve(now).to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Resume from `last_seen` when it is present and newer than `now - window`;
/// otherwise from now. `from_now` skips the checkpoint entirely.
pub fn choose_resume_point(
    last_seen: Option<i64>,
    now: DateTime<Utc>,
    window: Duration,
    from_now: bool,
) -> ResumePoint {
    if from_now {
        return ResumePoint::Now;
    }
    let Some(ts) = last_seen.and_then(|ts| DateTime::from_timestamp(ts, 0)) else {
        return ResumePoint::Now;
    };
    // A window reaching past the representable range keeps every checkpoint.
    let fresh = now.checked_sub_signed(window).is_none_or(|cutoff| cutoff < ts);
    if fresh { ResumePoint::Since(ts) } else { ResumePoint::Now }
}

/// Resume policy shared by every (re)subscription of one process.
#[derive(Debug)]
pub struct ResumePolicy {
    window: Duration,
    force_from_now: AtomicBool,
}

impl ResumePolicy {
    /// `force_from_now` applies to the first subscription only; later
    /// reconnects resume from what this process has already seen.
    pub fn new(window: Duration, force_from_now: bool) -> Self {
        Self {
            window,
            force_from_now: AtomicBool::new(force_from_now),
        }
    }

    /// Pick the resume point from the in-memory checkpoint, falling back to
    /// the durable store when nothing has been observed yet.
    pub async fn resume_point(
        &self,
        checkpoint: &Checkpoint,
        store: &dyn CheckpointStore,
        now: DateTime<Utc>,
    ) -> ResumePoint {
        let from_now = self.force_from_now.swap(false, Ordering::AcqRel);
        let last_seen = match checkpoint.get() {
            Some(ts) => Some(ts),
            None => store.read().await,
        };
        let point = choose_resume_point(last_seen, now, self.window, from_now);
        info!(?last_seen, from_now, resume = ?point, "selected resume point");
        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use streamrouter_shared::Result;

    struct FixedStore(Option<i64>);

    #[async_trait]
    impl CheckpointStore for FixedStore {
        async fn read(&self) -> Option<i64> {
            self.0
        }
        async fn write(&self, _ts: i64) -> Result<()> {
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn three_day_old_checkpoint_is_used() {
        let ts = (now() - Duration::days(3)).timestamp();
        let point = choose_resume_point(Some(ts), now(), Duration::days(7), false);
        assert_eq!(point, ResumePoint::Since(DateTime::from_timestamp(ts, 0).unwrap()));
    }

    #[test]
    fn ten_day_old_checkpoint_is_ignored() {
        let ts = (now() - Duration::days(10)).timestamp();
        let point = choose_resume_point(Some(ts), now(), Duration::days(7), false);
        assert_eq!(point, ResumePoint::Now);
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let ts = (now() - Duration::days(7)).timestamp();
        assert_eq!(
            choose_resume_point(Some(ts), now(), Duration::days(7), false),
            ResumePoint::Now
        );
        assert!(matches!(
            choose_resume_point(Some(ts + 1), now(), Duration::days(7), false),
            ResumePoint::Since(_)
        ));
    }

    #[test]
    fn oversized_window_keeps_checkpoint() {
        let ts = (now() - Duration::days(3_650)).timestamp();
        let window = Duration::days(i64::from(u32::MAX));
        assert_eq!(
            choose_resume_point(Some(ts), now(), window, false),
            ResumePoint::Since(DateTime::from_timestamp(ts, 0).unwrap())
        );
    }

    #[test]
    fn absent_checkpoint_or_from_now_means_now() {
        assert_eq!(
            choose_resume_point(None, now(), Duration::days(7), false),
            ResumePoint::Now
        );
        let fresh = now().timestamp() - 60;
        assert_eq!(
            choose_resume_point(Some(fresh), now(), Duration::days(7), true),
            ResumePoint::Now
        );
    }

    #[test]
    fn query_value_is_iso_with_millis() {
        let point = ResumePoint::Since(now());
        assert_eq!(point.to_query_value(now()), "2023-11-14T22:13:20.000Z");
        assert_eq!(ResumePoint::Now.to_query_value(now()), "2023-11-14T22:13:20.000Z");
    }

    #[tokio::test]
    async fn policy_prefers_memory_over_store() {
        let policy = ResumePolicy::new(Duration::days(7), false);
        let store = FixedStore(Some(now().timestamp() - 3_600));
        let cp = Checkpoint::new();

        let from_store = policy.resume_point(&cp, &store, now()).await;
        assert_eq!(
            from_store,
            ResumePoint::Since(DateTime::from_timestamp(now().timestamp() - 3_600, 0).unwrap())
        );

        cp.advance(now().timestamp() - 10);
        let from_memory = policy.resume_point(&cp, &store, now()).await;
        assert_eq!(
            from_memory,
            ResumePoint::Since(DateTime::from_timestamp(now().timestamp() - 10, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn force_from_now_applies_once() {
        let policy = ResumePolicy::new(Duration::days(7), true);
        let store = FixedStore(Some(now().timestamp() - 60));
        let cp = Checkpoint::new();

        assert_eq!(policy.resume_point(&cp, &store, now()).await, ResumePoint::Now);
        assert!(matches!(
            policy.resume_point(&cp, &store, now()).await,
            ResumePoint::Since(_)
        ));
    }
}
