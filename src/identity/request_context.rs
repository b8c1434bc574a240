use serde::Serialize;

use super::resolver::Resolution;
use super::Principal;

/// Identity attached to every request by the identity layer. Read-only for
/// handlers; resolved once per request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestAuthContext {
    pub request_id: String,
    pub user: Principal,
    #[serde(rename = "modo_offline")]
    pub offline: bool,
    #[serde(skip)]
    pub session_id: Option<String>,
}

impl RequestAuthContext {
    pub fn new(resolution: Resolution, session_id: Option<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user: resolution.user,
            offline: resolution.offline,
            session_id,
        }
    }
}

impl Default for RequestAuthContext {
    fn default() -> Self {
        Self { request_id: String::new(), user: Principal::Anonymous, offline: false, session_id: None }
    }
}
