//! Per-request identity resolution with offline fallback.
//!
//! Online, identity comes from the datastore collaborator. Offline, it comes
//! from the record the login flow left in the session, as long as that record
//! is younger than the configured ceiling. Resolution is total: every path
//! ends in a principal and an offline flag.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::liveness::LivenessProber;
use super::offline_store::{read_principal_record, record_age};
use super::principal::{OfflinePrincipal, Principal};
use super::provider::AuthProvider;
use super::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub user: Principal,
    pub offline: bool,
}

impl Resolution {
    fn online(user: Principal) -> Self { Self { user, offline: false } }
    fn offline(user: Principal) -> Self { Self { user, offline: true } }
}

pub struct IdentityResolver {
    prober: Arc<LivenessProber>,
    provider: Arc<dyn AuthProvider>,
    offline_max_age: Duration,
    lookup_timeout: Duration,
}

impl IdentityResolver {
    pub const DEFAULT_OFFLINE_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

    /// Online lookups are bounded by the prober's timeout.
    pub fn new(prober: Arc<LivenessProber>, provider: Arc<dyn AuthProvider>, offline_max_age: Duration) -> Self {
        let lookup_timeout = prober.timeout();
        Self { prober, provider, offline_max_age, lookup_timeout }
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    pub fn prober(&self) -> &Arc<LivenessProber> { &self.prober }

    pub async fn resolve(&self, session: Option<&Session>, now: Instant, wall_now: DateTime<Utc>) -> Resolution {
        if self.prober.check_availability(now).await {
            if let Some(res) = self.resolve_online(session).await {
                return res;
            }
        }
        Resolution::offline(self.resolve_offline(session, wall_now))
    }

    /// `None` when the collaborator failed and the caller should fall back.
    async fn resolve_online(&self, session: Option<&Session>) -> Option<Resolution> {
        let Some(user_id) = session.and_then(Session::auth_user_id) else {
            return Some(Resolution::online(Principal::Anonymous));
        };
        match tokio::time::timeout(self.lookup_timeout, self.provider.lookup(user_id)).await {
            Ok(Ok(Some(user))) => Some(Resolution::online(Principal::Datastore(user))),
            Ok(Ok(None)) => {
                debug!(target: "identity", user_id, "session user no longer active");
                Some(Resolution::online(Principal::Anonymous))
            }
            Ok(Err(e)) => {
                warn!(target: "identity", user_id, error = %e, "datastore lookup failed after a passing probe; using offline identity");
                None
            }
            Err(_) => {
                warn!(target: "identity", user_id, timeout_ms = self.lookup_timeout.as_millis() as u64, "datastore lookup timed out after a passing probe; using offline identity");
                None
            }
        }
    }

    fn resolve_offline(&self, session: Option<&Session>, wall_now: DateTime<Utc>) -> Principal {
        let Some(session) = session else { return Principal::Anonymous; };
        let Some(record) = read_principal_record(session) else { return Principal::Anonymous; };
        // unknown age counts as stale
        match record_age(session, wall_now) {
            Some(age) if age <= self.offline_max_age && !self.offline_max_age.is_zero() => {
                Principal::OfflineSession(OfflinePrincipal::from(&record))
            }
            age => {
                debug!(target: "identity", age_secs = age.map(|a| a.as_secs()), "offline session record rejected as stale");
                Principal::Anonymous
            }
        }
    }
}
