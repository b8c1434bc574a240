use serde::{Deserialize, Serialize};

use super::offline_store::OfflineRecord;

/// Role name assumed when the datastore row has no role attached.
pub const DEFAULT_ROLE: &str = "Usuario";

/// A user resolved live against the `usuarios` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub linked_system_user_id: Option<i64>,
    pub active: bool,
}

impl DatastoreUser {
    /// Flat record persisted into the session at login so a later outage still
    /// has an identity to fall back on.
    pub fn to_offline_record(&self) -> OfflineRecord {
        OfflineRecord {
            id: Some(self.id),
            username: Some(self.username.clone()),
            nombre_completo: Some(self.full_name.clone().unwrap_or_else(|| self.username.clone())),
            rol_nombre: Some(self.role_name.clone().unwrap_or_else(|| DEFAULT_ROLE.to_string())),
            usuario_sistema_id: self.linked_system_user_id,
        }
    }
}

/// Identity reconstructed from the session while the datastore is unreachable.
/// Only built from a non-empty record; see [`super::offline_store::read_principal_record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflinePrincipal {
    pub id: Option<i64>,
    pub username: String,
    pub full_name: Option<String>,
    pub role_name: Option<String>,
    pub linked_system_user_id: Option<i64>,
}

impl From<&OfflineRecord> for OfflinePrincipal {
    fn from(rec: &OfflineRecord) -> Self {
        Self {
            id: rec.id,
            username: rec.username.clone().unwrap_or_default(),
            full_name: rec.nombre_completo.clone(),
            role_name: rec.rol_nombre.clone(),
            linked_system_user_id: rec.usuario_sistema_id,
        }
    }
}

/// The identity attached to a request.
///
/// | Variant | Produced by |
/// |---------|-------------|
/// | `Datastore` | live lookup while the datastore is reachable |
/// | `OfflineSession` | session record while the datastore is down |
/// | `Anonymous` | nobody logged in (either mode) |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    Datastore(DatastoreUser),
    OfflineSession(OfflinePrincipal),
    Anonymous,
}

impl Principal {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Principal::Anonymous)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }

    pub fn is_datastore_backed(&self) -> bool {
        matches!(self, Principal::Datastore(_))
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            Principal::Datastore(u) => Some(u.id),
            Principal::OfflineSession(p) => p.id,
            Principal::Anonymous => None,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Principal::Datastore(u) => &u.username,
            Principal::OfflineSession(p) => &p.username,
            Principal::Anonymous => "",
        }
    }

    /// Full name when known, otherwise the username.
    pub fn display_name(&self) -> &str {
        let full = match self {
            Principal::Datastore(u) => u.full_name.as_deref(),
            Principal::OfflineSession(p) => p.full_name.as_deref(),
            Principal::Anonymous => None,
        };
        match full {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.username(),
        }
    }

    pub fn role_name(&self) -> Option<&str> {
        match self {
            Principal::Datastore(u) => u.role_name.as_deref(),
            Principal::OfflineSession(p) => p.role_name.as_deref(),
            Principal::Anonymous => None,
        }
    }
}
