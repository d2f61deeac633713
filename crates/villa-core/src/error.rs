use std::fmt;
use thiserror::Error;

/// Unique keys enforced by the datastore. A write that collides with one of
/// these surfaces as [`VillaError::UniqueViolation`] from every repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueConstraint {
    ProfileAddress,
    ProfileNickname,
    ReservationNickname,
    AppId,
    ApiKey,
}

impl UniqueConstraint {
    /// Postgres constraint name for this key.
    pub fn constraint_name(&self) -> &'static str {
        match self {
            UniqueConstraint::ProfileAddress => "profiles_pkey",
            UniqueConstraint::ProfileNickname => "profiles_nickname_normalized_key",
            UniqueConstraint::ReservationNickname => "nickname_reservations_nickname_normalized_key",
            UniqueConstraint::AppId => "developer_apps_pkey",
            UniqueConstraint::ApiKey => "developer_apps_api_key_hash_key",
        }
    }

    /// Map a Postgres constraint name back to the key it guards.
    pub fn from_constraint_name(name: &str) -> Option<Self> {
        match name {
            "profiles_pkey" => Some(UniqueConstraint::ProfileAddress),
            "profiles_nickname_key" | "profiles_nickname_normalized_key" => {
                Some(UniqueConstraint::ProfileNickname)
            }
            "nickname_reservations_nickname_normalized_key" | "nickname_reservations_pkey" => {
                Some(UniqueConstraint::ReservationNickname)
            }
            "developer_apps_pkey" => Some(UniqueConstraint::AppId),
            "developer_apps_api_key_hash_key" => Some(UniqueConstraint::ApiKey),
            _ => None,
        }
    }
}

impl fmt::Display for UniqueConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.constraint_name())
    }
}

#[derive(Debug, Error)]
pub enum VillaError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unique constraint {constraint} violated by '{value}'")]
    UniqueViolation {
        constraint: UniqueConstraint,
        value: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage not initialized")]
    NotInitialized,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VillaError {
    /// True for failures of an external dependency (database down, pool
    /// exhausted) as opposed to a rejected request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, VillaError::Unavailable(_) | VillaError::NotInitialized)
    }
}

impl From<serde_json::Error> for VillaError {
    fn from(e: serde_json::Error) -> Self {
        VillaError::Serialization(e.to_string())
    }
}

pub type VillaResult<T> = Result<T, VillaError>;
