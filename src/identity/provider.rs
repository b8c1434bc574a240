use anyhow::{anyhow, Context, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use password_hash::{PasswordHash, SaltString};
use std::future::Future;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::debug;
use crate::tprintln;

use super::principal::DatastoreUser;

/// Datastore-backed authentication, consulted only while the datastore is
/// reachable.
pub trait AuthProvider: Send + Sync {
    /// Verify credentials. `Ok(None)` means unknown user, wrong password, or a
    /// deactivated account.
    fn authenticate<'a>(&'a self, username: &'a str, password: &'a str) -> BoxFuture<'a, Result<Option<DatastoreUser>>>;

    /// Resolve an already authenticated session back to its user.
    fn lookup(&self, user_id: i64) -> BoxFuture<'_, Result<Option<DatastoreUser>>>;
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        let argon2 = Argon2::default();
        argon2.verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}

const USER_COLUMNS: &str = r#"u.id, u."nombreUsuario", u."contrasenaHash", u."nombreCompleto", r.nombre, u.activo"#;

fn user_query(filter: &str) -> String {
    format!(r#"SELECT {USER_COLUMNS} FROM usuarios u LEFT JOIN roles r ON u."idRol" = r.id WHERE {filter} AND u.anulado = false"#)
}

/// Login name is either the username or the account email.
fn authenticate_query() -> String { user_query(r#"(u."nombreUsuario" = $1 OR u.email = $1)"#) }

fn lookup_query() -> String { user_query("u.id = $1") }

/// One lazily established connection shared by every caller.
///
/// Callers hold the slot for the duration of their statement, so at most one
/// connection is open per slot.
pub struct ConnectionSlot<C> {
    slot: tokio::sync::Mutex<Option<C>>,
}

impl<C> Default for ConnectionSlot<C> {
    fn default() -> Self { Self { slot: tokio::sync::Mutex::new(None) } }
}

impl<C> ConnectionSlot<C> {
    /// Locks the slot, connecting first when it is empty or `is_closed`.
    pub async fn acquire<F, Fut>(&self, connect: F, is_closed: impl Fn(&C) -> bool) -> Result<MutexGuard<'_, Option<C>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut guard = self.slot.lock().await;
        if guard.as_ref().map_or(true, |c| is_closed(c)) {
            *guard = None;
            *guard = Some(connect().await?);
        }
        Ok(guard)
    }

    /// Drops the held connection; the next `acquire` reconnects.
    pub async fn reset(&self) { *self.slot.lock().await = None; }
}

/// Reads `usuarios` joined with `roles` over PostgreSQL.
pub struct PgAuthProvider {
    config: Config,
    timeout: Duration,
    conn: ConnectionSlot<Client>,
}

impl PgAuthProvider {
    /// `timeout` bounds the connect and every statement.
    pub fn from_url(url: &str, timeout: Duration) -> Result<Self> {
        let mut config: Config = url.parse().context("invalid datastore url")?;
        config.connect_timeout(timeout);
        Ok(Self { config, timeout, conn: ConnectionSlot::default() })
    }

    async fn connect_client(config: &Config) -> Result<Client> {
        let (client, conn) = config.connect(NoTls).await.context("connect to datastore")?;
        // drive the connection in background
        tokio::spawn(async move { let _ = conn.await; });
        debug!(target: "identity", "auth provider connected to datastore");
        Ok(client)
    }

    /// Runs one single-row statement on the shared connection.
    async fn query_user(&self, sql: &str, param: &(dyn ToSql + Sync)) -> Result<Option<(DatastoreUser, String)>> {
        let config = &self.config;
        let run = async {
            let guard = self.conn.acquire(move || Self::connect_client(config), Client::is_closed).await?;
            let client = guard.as_ref().context("datastore connection unavailable")?;
            let row = client.query_opt(sql, &[param]).await.context("user query")?;
            row.as_ref().map(Self::row_to_user).transpose()
        };
        let outcome = match tokio::time::timeout(self.timeout, run).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("user query timed out after {:?}", self.timeout)),
        };
        if outcome.is_err() {
            // the connection may be stalled or broken; start fresh next time
            self.conn.reset().await;
        }
        outcome
    }

    fn row_to_user(row: &Row) -> Result<(DatastoreUser, String)> {
        let id: i32 = row.try_get(0)?;
        let username: String = row.try_get(1)?;
        let hash: Option<String> = row.try_get(2)?;
        let full_name: Option<String> = row.try_get(3)?;
        let role_name: Option<String> = row.try_get(4)?;
        let active: Option<bool> = row.try_get(5)?;
        let user = DatastoreUser {
            id: i64::from(id),
            username,
            full_name,
            role_name,
            linked_system_user_id: Some(i64::from(id)),
            active: active.unwrap_or(false),
        };
        Ok((user, hash.unwrap_or_default()))
    }
}

impl AuthProvider for PgAuthProvider {
    fn authenticate<'a>(&'a self, username: &'a str, password: &'a str) -> BoxFuture<'a, Result<Option<DatastoreUser>>> {
        async move {
            let Some((user, hash)) = self.query_user(&authenticate_query(), &username).await.context("user lookup by name")? else {
                return Ok(None);
            };
            if !user.active || !verify_password(&hash, password) {
                tprintln!("auth.reject user={} active={}", username, user.active);
                return Ok(None);
            }
            Ok(Some(user))
        }
        .boxed()
    }

    fn lookup(&self, user_id: i64) -> BoxFuture<'_, Result<Option<DatastoreUser>>> {
        async move {
            let id = i32::try_from(user_id).map_err(|_| anyhow!("user id out of range: {}", user_id))?;
            let found = self.query_user(&lookup_query(), &id).await.context("user lookup by id")?;
            Ok(found.map(|(user, _)| user).filter(|user| user.active))
        }
        .boxed()
    }
}
