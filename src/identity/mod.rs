//! Connectivity-aware identity: liveness probing, session-backed offline
//! principals, and per-request resolution.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;
mod request_context;
mod guard;
pub mod liveness;
pub mod offline_store;
pub mod resolver;

pub use principal::{Principal, DatastoreUser, OfflinePrincipal, DEFAULT_ROLE};
pub use session::{redact_id, Session, SessionId, SessionManager, AUTH_USER_KEY};
pub use provider::{AuthProvider, ConnectionSlot, PgAuthProvider, hash_password, verify_password};
pub use request_context::RequestAuthContext;
pub use guard::{ensure_logged_in, require_login};
pub use liveness::{DatastoreProbe, LivenessProber, LivenessState, PgProbe, ProbeError};
pub use offline_store::OfflineRecord;
pub use resolver::{IdentityResolver, Resolution};
