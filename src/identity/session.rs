use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use base64::Engine;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use crate::tprintln;

pub type SessionId = String;

/// Session key holding the id of the user authenticated against the datastore.
pub const AUTH_USER_KEY: &str = "_auth_user_id";

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub csrf_token: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub values: Map<String, Value>,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&Value> { self.values.get(key) }
    pub fn insert(&mut self, key: &str, value: Value) { self.values.insert(key.to_string(), value); }
    pub fn remove(&mut self, key: &str) -> Option<Value> { self.values.remove(key) }

    pub fn auth_user_id(&self) -> Option<i64> {
        self.get(AUTH_USER_KEY).and_then(Value::as_i64)
    }

    pub fn set_auth_user_id(&mut self, id: i64) {
        self.insert(AUTH_USER_KEY, Value::from(id));
    }

    fn is_expired(&self, now: Instant) -> bool { self.expires_at <= now }
}

fn gen_id() -> Result<String> {
    // 256-bit random token, base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("session id entropy: {}", e))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Log-safe prefix of a session token.
pub fn redact_id(id: &str) -> String {
    let prefix: String = id.chars().take(6).collect();
    format!("{}..", prefix)
}

/// In-memory session table. Owned by the server state, one per process.
pub struct SessionManager {
    pub ttl: Duration,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(12 * 60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, sessions: RwLock::new(HashMap::new()) }
    }

    pub fn create(&self) -> Result<Session> {
        let now = Instant::now();
        let sess = Session {
            session_id: gen_id()?,
            csrf_token: gen_id()?,
            issued_at: now,
            expires_at: now + self.ttl,
            values: Map::new(),
        };
        self.sessions.write().insert(sess.session_id.clone(), sess.clone());
        tprintln!("session.create sid={} ttl_secs={}", redact_id(&sess.session_id), self.ttl.as_secs());
        Ok(sess)
    }

    /// Snapshot of a live session. Expired entries are dropped on access.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = Instant::now();
        let expired = {
            let map = self.sessions.read();
            match map.get(session_id) {
                Some(s) if !s.is_expired(now) => return Some(s.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.sessions.write().remove(session_id);
        }
        None
    }

    /// Mutate a live session in place.
    pub fn update<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let now = Instant::now();
        let mut map = self.sessions.write();
        match map.get_mut(session_id) {
            Some(s) if !s.is_expired(now) => Some(f(s)),
            _ => None,
        }
    }

    pub fn destroy(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id).is_some()
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.sessions.write();
        let before = map.len();
        map.retain(|_, s| !s.is_expired(now));
        before - map.len()
    }

    pub fn len(&self) -> usize { self.sessions.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
