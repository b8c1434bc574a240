//! Throttled datastore liveness probing.
//!
//! [`LivenessProber::check_availability`] issues at most one trivial round-trip
//! to the datastore per throttle interval and serves the cached verdict in
//! between. The window is claimed under the state lock before probing, so
//! concurrent requests inside the same window reuse the cached value instead
//! of all hitting an already degraded datastore.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_postgres::{Config, NoTls};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("datastore connect failed: {0}")]
    Connect(String),
    #[error("liveness query failed: {0}")]
    Query(String),
    #[error("liveness probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Minimal reachability check against the backing datastore.
pub trait DatastoreProbe: Send + Sync {
    fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessState {
    pub is_available: bool,
    pub last_checked_at: Option<Instant>,
}

impl Default for LivenessState {
    fn default() -> Self { Self { is_available: true, last_checked_at: None } }
}

pub struct LivenessProber {
    probe: Arc<dyn DatastoreProbe>,
    interval: Duration,
    timeout: Duration,
    state: Mutex<LivenessState>,
}

impl LivenessProber {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(750);

    pub fn new(probe: Arc<dyn DatastoreProbe>, interval: Duration, timeout: Duration) -> Self {
        Self { probe, interval, timeout, state: Mutex::new(LivenessState::default()) }
    }

    pub fn with_defaults(probe: Arc<dyn DatastoreProbe>) -> Self {
        Self::new(probe, Self::DEFAULT_INTERVAL, Self::DEFAULT_TIMEOUT)
    }

    pub fn interval(&self) -> Duration { self.interval }

    pub fn timeout(&self) -> Duration { self.timeout }

    fn is_due(&self, state: &LivenessState, now: Instant) -> bool {
        match state.last_checked_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Cached availability, refreshed by a probe when the window has elapsed.
    pub async fn check_availability(&self, now: Instant) -> bool {
        {
            let mut st = self.state.lock();
            if !self.is_due(&st, now) {
                return st.is_available;
            }
            st.last_checked_at = Some(now);
        }

        let outcome = match tokio::time::timeout(self.timeout, self.probe.ping()).await {
            Ok(res) => res,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        };
        let available = outcome.is_ok();

        let previous = {
            let mut st = self.state.lock();
            let previous = st.is_available;
            // A later claim already owns the window; keep its verdict.
            if st.last_checked_at.map_or(true, |t| t <= now) {
                st.last_checked_at = Some(now);
                st.is_available = available;
            }
            previous
        };

        match (&outcome, previous) {
            (Err(e), true) => warn!(target: "liveness", error = %e, "datastore unreachable, switching to offline mode"),
            (Err(e), false) => warn!(target: "liveness", error = %e, "datastore still unreachable"),
            (Ok(()), false) => info!(target: "liveness", "datastore reachable again, leaving offline mode"),
            (Ok(()), true) => debug!(target: "liveness", "datastore probe ok"),
        }
        available
    }

    pub fn snapshot(&self) -> LivenessState { *self.state.lock() }
}

/// `SELECT 1` over a fresh PostgreSQL connection.
pub struct PgProbe {
    config: Config,
}

impl PgProbe {
    pub fn from_url(url: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let mut config: Config = url.parse().context("invalid datastore url")?;
        config.connect_timeout(connect_timeout);
        Ok(Self { config })
    }
}

impl DatastoreProbe for PgProbe {
    fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
        async move {
            let (client, conn) = self
                .config
                .connect(NoTls)
                .await
                .map_err(|e| ProbeError::Connect(e.to_string()))?;
            // drive the connection in background; it ends when `client` drops
            tokio::spawn(async move { let _ = conn.await; });
            client
                .simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(|e| ProbeError::Query(e.to_string()))
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Scripted {
        up: AtomicBool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(up: bool) -> Arc<Self> { Arc::new(Self { up: AtomicBool::new(up), calls: AtomicUsize::new(0) }) }
    }

    impl DatastoreProbe for Scripted {
        fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let up = self.up.load(Ordering::SeqCst);
            async move { if up { Ok(()) } else { Err(ProbeError::Connect("refused".into())) } }.boxed()
        }
    }

    struct Hangs;

    impl DatastoreProbe for Hangs {
        fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
            futures_util::future::pending().boxed()
        }
    }

    #[tokio::test]
    async fn first_check_probes_and_records_failure() {
        let db = Scripted::new(false);
        let prober = LivenessProber::with_defaults(db.clone());
        let t0 = Instant::now();
        assert!(prober.snapshot().is_available);
        assert!(!prober.check_availability(t0).await);
        let st = prober.snapshot();
        assert!(!st.is_available);
        assert_eq!(st.last_checked_at, Some(t0));
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_inside_window_reprobed_at_boundary() {
        let db = Scripted::new(false);
        let prober = LivenessProber::with_defaults(db.clone());
        let t0 = Instant::now();
        assert!(!prober.check_availability(t0).await);

        // datastore recovers, but the window still holds the old verdict
        db.up.store(true, Ordering::SeqCst);
        assert!(!prober.check_availability(t0 + Duration::from_secs(3)).await);
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);

        assert!(prober.check_availability(t0 + Duration::from_secs(5)).await);
        assert_eq!(db.calls.load(Ordering::SeqCst), 2);
        assert_eq!(prober.snapshot().last_checked_at, Some(t0 + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn success_is_cached_too() {
        let db = Scripted::new(true);
        let prober = LivenessProber::new(db.clone(), Duration::from_secs(5), Duration::from_millis(200));
        let t0 = Instant::now();
        for s in 0..5 {
            assert!(prober.check_availability(t0 + Duration::from_secs(s)).await);
        }
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hanging_probe_times_out_as_unavailable() {
        let prober = LivenessProber::new(Arc::new(Hangs), Duration::from_secs(5), Duration::from_millis(20));
        let t0 = Instant::now();
        assert!(!prober.check_availability(t0).await);
        assert_eq!(prober.snapshot().last_checked_at, Some(t0));
    }

    struct Slow {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl DatastoreProbe for Slow {
        fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_share_one_probe_per_window() {
        let db = Arc::new(Slow { calls: AtomicUsize::new(0), delay: Duration::from_millis(100) });
        let prober = Arc::new(LivenessProber::new(db.clone(), Duration::from_secs(5), Duration::from_secs(1)));
        let now = Instant::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let prober = prober.clone();
                tokio::spawn(async move { prober.check_availability(now).await })
            })
            .collect();
        for h in futures_util::future::join_all(handles).await {
            assert!(h.unwrap());
        }
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);
    }

    /// First call fails slowly, later calls succeed at once.
    struct SlowFailThenUp {
        calls: AtomicUsize,
    }

    impl DatastoreProbe for SlowFailThenUp {
        fn ping(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Err(ProbeError::Query("stalled".into()))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn older_probe_does_not_overwrite_newer_verdict() {
        let db = Arc::new(SlowFailThenUp { calls: AtomicUsize::new(0) });
        let prober = Arc::new(LivenessProber::new(db.clone(), Duration::from_secs(5), Duration::from_secs(1)));
        let t0 = Instant::now();
        let older = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.check_availability(t0).await })
        };
        // let the older check claim its window and start probing
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);

        let t1 = t0 + Duration::from_secs(5);
        assert!(prober.check_availability(t1).await);
        assert!(!older.await.unwrap());

        let st = prober.snapshot();
        assert!(st.is_available);
        assert_eq!(st.last_checked_at, Some(t1));
    }

    #[tokio::test]
    async fn checks_during_first_probe_see_optimistic_default() {
        let db = Arc::new(SlowFailThenUp { calls: AtomicUsize::new(0) });
        let prober = Arc::new(LivenessProber::new(db.clone(), Duration::from_secs(5), Duration::from_secs(1)));
        let t0 = Instant::now();
        let first = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.check_availability(t0).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(prober.check_availability(t0 + Duration::from_secs(1)).await);
        assert!(!first.await.unwrap());
        assert!(!prober.check_availability(t0 + Duration::from_secs(2)).await);
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pg_probe_rejects_bad_url() {
        assert!(PgProbe::from_url("postgres://user@host:notaport/db", Duration::from_millis(500)).is_err());
        assert!(PgProbe::from_url("host=localhost user=pos dbname=pos", Duration::from_millis(500)).is_ok());
    }
}
