use crate::core::errors::ExchangeError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A positive offset smaller than this is round-trip noise, not clock skew
const NEGLIGIBLE_OFFSET_MS: i64 = 500;

/// Source of authoritative server time
#[async_trait]
pub trait ServerClock: Send + Sync {
    /// Server time in milliseconds since the Unix epoch
    async fn server_time(&self) -> Result<i64, ExchangeError>;
}

type SyncOutcome = Result<i64, String>;

#[derive(Debug)]
struct SyncInner {
    offset_ms: i64,
    last_sync: Option<Instant>,
    /// Bumped by every successful sync; signed calls remember the epoch they used
    epoch: u64,
    invalidated: bool,
    in_flight: Option<watch::Receiver<Option<SyncOutcome>>>,
}

/// Offset in effect for one signed request, tagged with the sync epoch it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetLease {
    pub offset_ms: i64,
    pub epoch: u64,
}

impl OffsetLease {
    /// Local wall clock corrected by the leased offset
    pub fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.offset_ms
    }
}

/// Clock offset shared by every signed request of one client.
///
/// Reads are cheap and concurrent. Recalculation is single-flight: callers that
/// trigger it while a server-time call is outstanding wait for that call and
/// observe its result instead of issuing their own.
#[derive(Debug)]
pub struct TimeSyncState {
    auto_timestamp: bool,
    recalculation_interval: Duration,
    inner: Mutex<SyncInner>,
    sync_calls: AtomicU64,
    invalidations: AtomicU64,
}

impl TimeSyncState {
    pub fn new(auto_timestamp: bool, recalculation_interval: Duration) -> Self {
        Self {
            auto_timestamp,
            recalculation_interval,
            inner: Mutex::new(SyncInner {
                offset_ms: 0,
                last_sync: None,
                epoch: 0,
                invalidated: false,
                in_flight: None,
            }),
            sync_calls: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// State with auto-timestamp off; the offset stays at zero
    pub fn disabled() -> Self {
        Self::new(false, Duration::MAX)
    }

    pub fn is_auto(&self) -> bool {
        self.auto_timestamp
    }

    /// Current offset (server minus local) in milliseconds
    pub fn offset_ms(&self) -> i64 {
        if !self.auto_timestamp {
            return 0;
        }
        self.inner.lock().offset_ms
    }

    pub fn last_sync(&self) -> Option<Instant> {
        self.inner.lock().last_sync
    }

    /// Number of server-time calls actually issued
    pub fn sync_count(&self) -> u64 {
        self.sync_calls.load(Ordering::Acquire)
    }

    /// Number of invalidations that took effect
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Acquire)
    }

    pub fn needs_sync(&self) -> bool {
        if !self.auto_timestamp {
            return false;
        }
        self.is_stale(&self.inner.lock())
    }

    fn is_stale(&self, inner: &SyncInner) -> bool {
        inner.invalidated
            || inner
                .last_sync
                .map_or(true, |at| at.elapsed() >= self.recalculation_interval)
    }

    /// Offset to use for the next signed request, syncing first when stale
    pub async fn lease(&self, clock: &dyn ServerClock) -> Result<OffsetLease, ExchangeError> {
        if !self.auto_timestamp {
            return Ok(OffsetLease {
                offset_ms: 0,
                epoch: 0,
            });
        }
        self.sync(clock, true).await?;
        let inner = self.inner.lock();
        Ok(OffsetLease {
            offset_ms: inner.offset_ms,
            epoch: inner.epoch,
        })
    }

    /// Mark the offset stale after a stale-timestamp rejection.
    ///
    /// Only the first report against a given epoch has an effect, so a burst of
    /// rejected requests that all signed with the same offset invalidates it
    /// once. Returns whether this call performed the invalidation.
    pub fn invalidate(&self, epoch: u64) -> bool {
        if !self.auto_timestamp {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.invalidated {
            return false;
        }
        inner.invalidated = true;
        drop(inner);
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        debug!(epoch, "Received invalid timestamp error, triggering new time sync");
        true
    }

    /// Run one server-time exchange, or join the one already in flight
    pub async fn recalculate(&self, clock: &dyn ServerClock) -> Result<i64, ExchangeError> {
        self.sync(clock, false).await
    }

    /// Staleness is decided under the same lock that elects the leader, so a
    /// caller arriving just after a sync finished reuses its offset.
    async fn sync(
        &self,
        clock: &dyn ServerClock,
        only_if_stale: bool,
    ) -> Result<i64, ExchangeError> {
        let (mut rx, leader) = {
            let mut inner = self.inner.lock();
            if only_if_stale && !self.is_stale(&inner) {
                return Ok(inner.offset_ms);
            }
            match &inner.in_flight {
                Some(rx) => (rx.clone(), None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.in_flight = Some(rx.clone());
                    (rx, Some(tx))
                }
            }
        };

        if let Some(tx) = leader {
            let guard = InFlightGuard { state: self };
            let outcome = self.exchange_server_time(clock).await;
            {
                let mut inner = self.inner.lock();
                if let Ok(offset) = outcome {
                    inner.offset_ms = offset;
                    inner.last_sync = Some(Instant::now());
                    inner.epoch += 1;
                    inner.invalidated = false;
                }
            }
            drop(guard);
            let _ = tx.send(Some(outcome.clone()));
            return outcome.map_err(ExchangeError::TimeSyncFailed);
        }

        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(ExchangeError::TimeSyncFailed);
            }
            if rx.changed().await.is_err() {
                return Err(ExchangeError::TimeSyncFailed(
                    "time sync abandoned before completion".to_string(),
                ));
            }
        }
    }

    async fn exchange_server_time(&self, clock: &dyn ServerClock) -> SyncOutcome {
        self.sync_calls.fetch_add(1, Ordering::AcqRel);
        let local_before = Utc::now().timestamp_millis();
        let started = Instant::now();

        let server_time = clock.server_time().await.map_err(|e| {
            warn!(error = %e, "Server time request failed");
            e.to_string()
        })?;

        let round_trip = started.elapsed().as_millis() as i64;
        let mut offset = server_time - (local_before + round_trip / 2);
        if (0..NEGLIGIBLE_OFFSET_MS).contains(&offset) {
            offset = 0;
        }

        info!(offset_ms = offset, round_trip_ms = round_trip, "Time offset set");
        Ok(offset)
    }
}

/// Clears the in-flight marker even when the leading caller is cancelled
struct InFlightGuard<'a> {
    state: &'a TimeSyncState,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state.inner.lock().in_flight = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FixedClock {
        skew_ms: i64,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FixedClock {
        fn new(skew_ms: i64, delay: Duration) -> Self {
            Self {
                skew_ms,
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ServerClock for FixedClock {
        async fn server_time(&self) -> Result<i64, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Utc::now().timestamp_millis() + self.skew_ms)
        }
    }

    struct FailingClock;

    #[async_trait]
    impl ServerClock for FailingClock {
        async fn server_time(&self) -> Result<i64, ExchangeError> {
            Err(ExchangeError::NetworkError("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_disabled_offset_is_zero_and_never_syncs() {
        let state = TimeSyncState::disabled();
        let clock = FixedClock::new(10_000, Duration::ZERO);

        let lease = state.lease(&clock).await.unwrap();
        assert_eq!(lease.offset_ms, 0);
        assert_eq!(clock.calls.load(Ordering::SeqCst), 0);
        assert!(!state.invalidate(0));
    }

    #[tokio::test]
    async fn test_first_lease_syncs_once() {
        let state = TimeSyncState::new(true, Duration::from_secs(3600));
        let clock = FixedClock::new(-5_000, Duration::ZERO);

        let first = state.lease(&clock).await.unwrap();
        let second = state.lease(&clock).await.unwrap();

        assert_eq!(clock.calls.load(Ordering::SeqCst), 1);
        assert!((first.offset_ms + 5_000).abs() < 200);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_small_positive_offset_is_ignored() {
        let state = TimeSyncState::new(true, Duration::from_secs(3600));
        let clock = FixedClock::new(100, Duration::ZERO);

        let offset = state.recalculate(&clock).await.unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_concurrent_recalculations_share_one_call() {
        let state = Arc::new(TimeSyncState::new(true, Duration::from_secs(3600)));
        let clock = Arc::new(FixedClock::new(-3_000, Duration::from_millis(50)));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let state = state.clone();
            let clock = clock.clone();
            tasks.push(tokio::spawn(async move {
                state.recalculate(clock.as_ref()).await
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap().unwrap());
        }

        assert_eq!(clock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.sync_count(), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leases_racing_a_finished_sync_reuse_its_offset() {
        let state = Arc::new(TimeSyncState::new(true, Duration::from_secs(3600)));
        let clock = Arc::new(FixedClock::new(-3_000, Duration::ZERO));

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let state = state.clone();
            let clock = clock.clone();
            tasks.push(tokio::spawn(async move {
                state.lease(clock.as_ref()).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().epoch, 1);
        }

        assert_eq!(clock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.sync_count(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_once_per_epoch() {
        let state = TimeSyncState::new(true, Duration::from_secs(3600));
        let clock = FixedClock::new(-2_000, Duration::ZERO);
        let lease = state.lease(&clock).await.unwrap();

        assert!(state.invalidate(lease.epoch));
        assert!(!state.invalidate(lease.epoch));
        assert!(state.needs_sync());
        assert_eq!(state.invalidation_count(), 1);

        let renewed = state.lease(&clock).await.unwrap();
        assert_eq!(renewed.epoch, lease.epoch + 1);
        assert!(!state.needs_sync());
        // A late report against the old epoch is ignored
        assert!(!state.invalidate(lease.epoch));
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_previous_offset() {
        let state = TimeSyncState::new(true, Duration::from_secs(3600));
        let result = state.recalculate(&FailingClock).await;

        assert!(matches!(result, Err(ExchangeError::TimeSyncFailed(_))));
        assert_eq!(state.offset_ms(), 0);
        assert!(state.last_sync().is_none());
        assert!(state.needs_sync());
    }

    #[tokio::test]
    async fn test_interval_expiry_triggers_resync() {
        let state = TimeSyncState::new(true, Duration::from_millis(20));
        let clock = FixedClock::new(-1_000, Duration::ZERO);

        state.lease(&clock).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(state.needs_sync());
        state.lease(&clock).await.unwrap();

        assert_eq!(clock.calls.load(Ordering::SeqCst), 2);
    }
}
