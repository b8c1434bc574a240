//! Session-backed storage of the principal used while the datastore is down.
//!
//! The login flow writes a flat record under [`OFFLINE_RECORD_KEY`]; the
//! resolver reads it back when the liveness probe reports the datastore as
//! unreachable. Reads are tolerant: a field with the wrong type is treated as
//! absent and never fails the read.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::session::Session;

pub const OFFLINE_RECORD_KEY: &str = "usuario_offline";
/// Epoch millis at which the record was written.
pub const OFFLINE_RECORD_STORED_AT_KEY: &str = "usuario_offline_guardado";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub nombre_completo: Option<String>,
    #[serde(default)]
    pub rol_nombre: Option<String>,
    #[serde(default)]
    pub usuario_sistema_id: Option<i64>,
}

impl OfflineRecord {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.username.is_none()
            && self.nombre_completo.is_none()
            && self.rol_nombre.is_none()
            && self.usuario_sistema_id.is_none()
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        Self {
            id: int_field(obj, "id"),
            username: str_field(obj, "username"),
            nombre_completo: str_field(obj, "nombre_completo"),
            rol_nombre: str_field(obj, "rol_nombre"),
            usuario_sistema_id: int_field(obj, "usuario_sistema_id"),
        }
    }
}

fn int_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Returns the stored record, or `None` when nothing usable is there.
pub fn read_principal_record(session: &Session) -> Option<OfflineRecord> {
    let obj = session.get(OFFLINE_RECORD_KEY)?.as_object()?;
    let rec = OfflineRecord::from_object(obj);
    if rec.is_empty() { None } else { Some(rec) }
}

pub fn write_principal_record(session: &mut Session, record: &OfflineRecord, stored_at: DateTime<Utc>) {
    let value = serde_json::to_value(record).unwrap_or(Value::Null);
    session.insert(OFFLINE_RECORD_KEY, value);
    session.insert(OFFLINE_RECORD_STORED_AT_KEY, Value::from(stored_at.timestamp_millis()));
}

pub fn clear_principal_record(session: &mut Session) {
    session.remove(OFFLINE_RECORD_KEY);
    session.remove(OFFLINE_RECORD_STORED_AT_KEY);
}

pub fn record_stored_at(session: &Session) -> Option<DateTime<Utc>> {
    let ms = session.get(OFFLINE_RECORD_STORED_AT_KEY)?.as_i64()?;
    Utc.timestamp_millis_opt(ms).single()
}

/// Age of the stored record; a timestamp in the future counts as age zero.
pub fn record_age(session: &Session, now: DateTime<Utc>) -> Option<std::time::Duration> {
    let stored = record_stored_at(session)?;
    Some((now - stored).to_std().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionManager;
    use serde_json::json;

    fn session() -> Session {
        SessionManager::default().create().unwrap()
    }

    #[test]
    fn write_then_read() {
        let mut s = session();
        let rec = OfflineRecord {
            id: Some(7),
            username: Some("ana".into()),
            nombre_completo: Some("Ana Torres".into()),
            rol_nombre: Some("cajero".into()),
            usuario_sistema_id: None,
        };
        let at = Utc::now();
        write_principal_record(&mut s, &rec, at);
        assert_eq!(read_principal_record(&s), Some(rec));
        assert_eq!(s.get(OFFLINE_RECORD_KEY).unwrap()["usuario_sistema_id"], Value::Null);
        assert_eq!(record_stored_at(&s).unwrap().timestamp_millis(), at.timestamp_millis());
    }

    #[test]
    fn absent_null_and_empty_are_none() {
        let mut s = session();
        assert!(read_principal_record(&s).is_none());
        s.insert(OFFLINE_RECORD_KEY, Value::Null);
        assert!(read_principal_record(&s).is_none());
        s.insert(OFFLINE_RECORD_KEY, json!({}));
        assert!(read_principal_record(&s).is_none());
        s.insert(OFFLINE_RECORD_KEY, json!("ana"));
        assert!(read_principal_record(&s).is_none());
        s.insert(OFFLINE_RECORD_KEY, json!({"unrelated": true}));
        assert!(read_principal_record(&s).is_none());
    }

    #[test]
    fn malformed_fields_are_dropped() {
        let mut s = session();
        s.insert(OFFLINE_RECORD_KEY, json!({"id": "7", "username": "ana", "rol_nombre": ["x"], "usuario_sistema_id": 3.5}));
        let rec = read_principal_record(&s).unwrap();
        assert_eq!(rec.id, Some(7));
        assert_eq!(rec.username.as_deref(), Some("ana"));
        assert_eq!(rec.rol_nombre, None);
        assert_eq!(rec.usuario_sistema_id, None);
    }

    #[test]
    fn clear_removes_record_and_timestamp() {
        let mut s = session();
        write_principal_record(&mut s, &OfflineRecord { username: Some("ana".into()), ..Default::default() }, Utc::now());
        clear_principal_record(&mut s);
        assert!(read_principal_record(&s).is_none());
        assert!(record_stored_at(&s).is_none());
    }

    #[test]
    fn age_is_clamped_at_zero() {
        let mut s = session();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        write_principal_record(&mut s, &OfflineRecord { id: Some(1), ..Default::default() }, now + chrono::Duration::seconds(30));
        assert_eq!(record_age(&s, now), Some(std::time::Duration::ZERO));
        let later = now + chrono::Duration::seconds(90);
        assert_eq!(record_age(&s, later), Some(std::time::Duration::from_secs(60)));
    }
}
