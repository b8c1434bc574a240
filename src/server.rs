//!
//! posgate HTTP server
//! -------------------
//! Axum-based front door for the point-of-sale backend.
//!
//! Responsibilities:
//! - Identity layer ahead of every route: probes the datastore (throttled),
//!   resolves the request principal, and attaches a `RequestAuthContext`.
//! - Session management with a cookie + CSRF token model.
//! - Login/logout endpoints backed by the datastore `AuthProvider`; a
//!   successful login leaves an offline record in the session.
//! - Connectivity status and offline-mode endpoints for the frontend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{Request, State};
use axum::http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Timelike, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::offline_store::{clear_principal_record, write_principal_record};
use crate::identity::{
    require_login, AuthProvider, IdentityResolver, LivenessProber, PgAuthProvider, PgProbe, RequestAuthContext,
    SessionManager,
};

pub const SESSION_COOKIE: &str = "pos_session";
const CSRF_HEADER: &str = "x-csrf-token";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub resolver: Arc<IdentityResolver>,
    pub provider: Arc<dyn AuthProvider>,
    pub cookie_secure: bool,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionManager>,
        prober: Arc<LivenessProber>,
        provider: Arc<dyn AuthProvider>,
        offline_max_age: Duration,
        cookie_secure: bool,
    ) -> Self {
        let resolver = Arc::new(IdentityResolver::new(prober, provider.clone(), offline_max_age));
        Self { sessions, resolver, provider, cookie_secure }
    }

    fn prober(&self) -> &LivenessProber { self.resolver.prober() }
}

/// Build the router with the identity layer wrapped around every route.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/csrf", get(get_csrf))
        .route("/api/sync-offline-sales", post(sync_offline_sales))
        .route_layer(middleware::from_fn(require_login));

    Router::new()
        .route("/", get(|| async { "posgate ok" }))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/estado", get(estado))
        .route("/offline", get(offline_info))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), identity_layer))
        .with_state(state)
}

/// Start the HTTP server with a PostgreSQL-backed probe and auth provider.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        target: "startup",
        "posgate starting: http_port={}, probe_interval_ms={}, probe_timeout_ms={}, offline_max_age_secs={}, session_ttl_secs={}",
        config.http_port,
        config.probe_interval.as_millis(),
        config.probe_timeout.as_millis(),
        config.offline_max_age.as_secs(),
        config.session_ttl.as_secs()
    );

    let probe = PgProbe::from_url(&config.database_url, config.probe_timeout)
        .context("While configuring the datastore liveness probe")?;
    let provider = PgAuthProvider::from_url(&config.database_url, config.probe_timeout)
        .context("While configuring the datastore auth provider")?;
    let prober = Arc::new(LivenessProber::new(Arc::new(probe), config.probe_interval, config.probe_timeout));
    let sessions = Arc::new(SessionManager::new(config.session_ttl));

    // Background session sweeper
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            loop {
                let removed = sessions.sweep_expired();
                if removed > 0 { debug!(target: "server", removed = removed, "session_sweep"); }
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
    }

    let state = AppState::new(sessions, prober, Arc::new(provider), config.offline_max_age, config.cookie_secure);
    let app = router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("bind {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn identity_layer(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let session = parse_cookie(req.headers(), SESSION_COOKIE).and_then(|sid| state.sessions.get(&sid));
    let resolution = state.resolver.resolve(session.as_ref(), Instant::now(), Utc::now()).await;
    let ctx = RequestAuthContext::new(resolution, session.map(|s| s.session_id));
    debug!(
        target: "identity",
        request_id = %ctx.request_id,
        user = ctx.user.username(),
        modo_offline = ctx.offline,
        "request identity resolved"
    );
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie")?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name { return Some(v[1..].to_string()); }
        }
    }
    None
}

fn validate_csrf(state: &AppState, ctx: &RequestAuthContext, headers: &HeaderMap) -> bool {
    let Some(sid) = ctx.session_id.as_deref() else { return false; };
    let Some(provided) = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()) else { return false; };
    match state.sessions.get(sid) {
        Some(sess) => sess.csrf_token == provided,
        None => false,
    }
}

fn set_session_cookie(sid: &str, secure: bool) -> AppResult<HeaderValue> {
    let secure = if secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!("{}={}; HttpOnly; SameSite=Lax; Path=/{}", SESSION_COOKIE, sid, secure))
        .map_err(|e| AppError::internal("cookie_encoding".to_string(), e.to_string()))
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("pos_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax; Path=/")
}

/// Time-of-day greeting shown after login.
pub fn greeting_for_hour(hour: u32) -> &'static str {
    match hour {
        0..=11 => "Buenos días",
        12..=17 => "Buenas tardes",
        _ => "Buenas noches",
    }
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestAuthContext>,
    Json(payload): Json<LoginPayload>,
) -> AppResult<impl IntoResponse> {
    if ctx.offline {
        return Err(AppError::unavailable(
            "offline_login_unavailable",
            "the datastore is unreachable; new logins are not possible in offline mode",
        ));
    }
    let username = payload.username.trim();
    if username.is_empty() || payload.password.is_empty() {
        return Err(AppError::user("missing_fields", "username and password are required"));
    }

    let user = match state.provider.authenticate(username, &payload.password).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            info!(target: "server", user = username, "login rejected");
            return Err(AppError::auth("invalid_credentials", "wrong username or password, or the account is disabled"));
        }
        Err(e) => {
            warn!(target: "server", user = username, error = %e, "login failed: datastore error");
            return Err(AppError::unavailable("datastore_unavailable", "the datastore could not verify the credentials"));
        }
    };

    // rotate the session id on privilege change
    if let Some(old) = ctx.session_id.as_deref() {
        state.sessions.destroy(old);
    }
    let session = state.sessions.create()?;
    let record = user.to_offline_record();
    let stored_at: DateTime<Utc> = Utc::now();
    state.sessions.update(&session.session_id, |s| {
        s.set_auth_user_id(user.id);
        write_principal_record(s, &record, stored_at);
    });

    let display_name = record.nombre_completo.clone().unwrap_or_else(|| user.username.clone());
    let role = record.rol_nombre.clone().unwrap_or_default();
    let now_local = chrono::Local::now();
    info!(target: "server", user = %user.username, role = %role, "login ok");

    let mut headers = HeaderMap::new();
    headers.insert(SET_COOKIE, set_session_cookie(&session.session_id, state.cookie_secure)?);
    let body = json!({
        "status": "ok",
        "user": &record,
        "greeting": format!("¡{} {}!", greeting_for_hour(now_local.hour()), display_name),
        "role": role,
        "logged_in_at": now_local.format("%d/%m/%Y %H:%M").to_string(),
        "csrf": session.csrf_token,
    });
    Ok((StatusCode::OK, headers, Json(body)))
}

async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestAuthContext>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    if let Some(sid) = ctx.session_id.as_deref() {
        if !validate_csrf(&state, &ctx, &headers) {
            return Err(AppError::csrf("invalid_csrf", "invalid csrf"));
        }
        state.sessions.update(sid, clear_principal_record);
        state.sessions.destroy(sid);
        info!(target: "server", user = ctx.user.username(), modo_offline = ctx.offline, "logout");
    }
    let mut h = HeaderMap::new();
    h.insert(SET_COOKIE, clear_session_cookie());
    Ok((StatusCode::OK, h, Json(json!({"status": "ok"}))))
}

async fn get_csrf(State(state): State<AppState>, Extension(ctx): Extension<RequestAuthContext>) -> AppResult<Json<serde_json::Value>> {
    let sess = ctx
        .session_id
        .as_deref()
        .and_then(|sid| state.sessions.get(sid))
        .ok_or_else(|| AppError::auth("login_required", "no session"))?;
    Ok(Json(json!({"status": "ok", "csrf": sess.csrf_token})))
}

async fn me(Extension(ctx): Extension<RequestAuthContext>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "request_id": ctx.request_id,
        "authenticated": ctx.user.is_authenticated(),
        "display_name": ctx.user.display_name(),
        "role": ctx.user.role_name(),
        "user": ctx.user,
        "modo_offline": ctx.offline,
    }))
}

async fn estado(State(state): State<AppState>, Extension(ctx): Extension<RequestAuthContext>) -> Json<serde_json::Value> {
    let snap = state.prober().snapshot();
    let since_ms = snap.last_checked_at.map(|t| Instant::now().saturating_duration_since(t).as_millis() as u64);
    Json(json!({
        "status": "ok",
        "db_available": snap.is_available,
        "modo_offline": ctx.offline,
        "last_probe_ms_ago": since_ms,
        "probe_interval_ms": state.prober().interval().as_millis() as u64,
    }))
}

async fn offline_info(Extension(ctx): Extension<RequestAuthContext>) -> Json<serde_json::Value> {
    let message = if ctx.offline {
        "Sin conexión a la base de datos. Está trabajando en modo offline; algunas funciones no están disponibles."
    } else {
        "Conexión a la base de datos disponible."
    };
    Json(json!({"status": "ok", "modo_offline": ctx.offline, "message": message}))
}

#[derive(Debug, Deserialize)]
struct SyncPayload {
    #[serde(default)]
    sales: Vec<serde_json::Value>,
}

async fn sync_offline_sales(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestAuthContext>,
    headers: HeaderMap,
    Json(payload): Json<SyncPayload>,
) -> AppResult<Json<serde_json::Value>> {
    if !validate_csrf(&state, &ctx, &headers) {
        return Err(AppError::csrf("invalid_csrf", "invalid csrf"));
    }
    if ctx.offline {
        return Err(AppError::unavailable("offline_sync_unavailable", "cannot sync while the datastore is unreachable"));
    }
    let count = payload.sales.len();
    info!(target: "server", user = ctx.user.username(), synced_count = count, "offline sales accepted for sync");
    Ok(Json(json!({"success": true, "message": "offline sales received", "synced_count": count})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_boundaries() {
        assert_eq!(greeting_for_hour(0), "Buenos días");
        assert_eq!(greeting_for_hour(11), "Buenos días");
        assert_eq!(greeting_for_hour(12), "Buenas tardes");
        assert_eq!(greeting_for_hour(17), "Buenas tardes");
        assert_eq!(greeting_for_hour(18), "Buenas noches");
        assert_eq!(greeting_for_hour(23), "Buenas noches");
    }

    #[test]
    fn cookie_parsing() {
        let mut h = HeaderMap::new();
        h.insert("cookie", HeaderValue::from_static("theme=dark; pos_session=abc123; other=1"));
        assert_eq!(parse_cookie(&h, SESSION_COOKIE).as_deref(), Some("abc123"));
        assert_eq!(parse_cookie(&h, "missing"), None);
        assert_eq!(parse_cookie(&HeaderMap::new(), SESSION_COOKIE), None);
    }

    #[test]
    fn session_cookie_flags() {
        let v = set_session_cookie("sid", true).unwrap();
        assert!(v.to_str().unwrap().ends_with("; Secure"));
        let v = set_session_cookie("sid", false).unwrap();
        assert!(v.to_str().unwrap().starts_with("pos_session=sid; HttpOnly"));
        assert!(!v.to_str().unwrap().contains("Secure"));
    }
}
