use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::{AppError, AppResult};
use super::RequestAuthContext;

/// Login gate that works in both modes: offline it accepts the session-derived
/// principal, online only a datastore-backed one.
pub fn ensure_logged_in(ctx: &RequestAuthContext) -> AppResult<()> {
    if ctx.user.is_authenticated() {
        return Ok(());
    }
    let msg = if ctx.offline {
        "offline mode: no stored session for this browser, log in again once the datastore is back"
    } else {
        "login required"
    };
    Err(AppError::auth("login_required", msg))
}

/// Route layer for handlers that require a logged-in user.
pub async fn require_login(req: Request, next: Next) -> Response {
    let verdict = match req.extensions().get::<RequestAuthContext>() {
        Some(ctx) => ensure_logged_in(ctx),
        None => Err(AppError::internal("identity_unresolved", "identity layer missing")),
    };
    match verdict {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{OfflinePrincipal, Principal};

    #[test]
    fn anonymous_is_rejected_in_both_modes() {
        let online = RequestAuthContext::default();
        assert_eq!(ensure_logged_in(&online).unwrap_err().http_status(), 401);
        let offline = RequestAuthContext { offline: true, ..Default::default() };
        let err = ensure_logged_in(&offline).unwrap_err();
        assert!(err.message().starts_with("offline mode"));
    }

    #[test]
    fn offline_principal_passes() {
        let ctx = RequestAuthContext {
            offline: true,
            user: Principal::OfflineSession(OfflinePrincipal {
                id: Some(7),
                username: "ana".into(),
                full_name: None,
                role_name: Some("cajero".into()),
                linked_system_user_id: None,
            }),
            ..Default::default()
        };
        assert!(ensure_logged_in(&ctx).is_ok());
    }
}
