//! Postgres schema. Statements are idempotent and applied in order by
//! `PgRepository::migrate`.
//!
//! Constraint names are left to Postgres defaults so that they line up with
//! `UniqueConstraint::constraint_name`.

pub const CREATE_PROFILES: &str = "CREATE TABLE IF NOT EXISTS profiles (
    address TEXT PRIMARY KEY,
    nickname TEXT UNIQUE,
    nickname_normalized TEXT UNIQUE,
    avatar_style TEXT,
    avatar_selection TEXT,
    avatar_variant INTEGER,
    nickname_change_count INTEGER NOT NULL DEFAULT 0,
    last_nickname_change TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    CHECK (nickname_change_count >= 0)
)";

pub const CREATE_RESERVATIONS: &str = "CREATE TABLE IF NOT EXISTS nickname_reservations (
    nickname_normalized TEXT NOT NULL UNIQUE,
    address TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

pub const CREATE_RESERVATIONS_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS nickname_reservations_expires_at_idx
    ON nickname_reservations (expires_at)";

pub const CREATE_DEVELOPER_APPS: &str = "CREATE TABLE IF NOT EXISTS developer_apps (
    id TEXT PRIMARY KEY,
    api_key_hash TEXT NOT NULL UNIQUE,
    owner_address TEXT NOT NULL,
    allowed_origins TEXT[] NOT NULL DEFAULT '{}',
    rate_limit INTEGER NOT NULL DEFAULT 100,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

pub const CREATE_DEVELOPER_APPS_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS developer_apps_owner_address_idx
    ON developer_apps (owner_address)";

pub const MIGRATIONS: &[&str] = &[
    CREATE_PROFILES,
    CREATE_RESERVATIONS,
    CREATE_RESERVATIONS_EXPIRY_INDEX,
    CREATE_DEVELOPER_APPS,
    CREATE_DEVELOPER_APPS_OWNER_INDEX,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent_statements() {
        for stmt in MIGRATIONS {
            assert!(stmt.contains("IF NOT EXISTS"), "{}", stmt);
            assert!(!stmt.trim_end().ends_with(';'));
        }
    }

    #[test]
    fn test_key_hash_column_replaces_plaintext_key() {
        assert!(CREATE_DEVELOPER_APPS.contains("api_key_hash TEXT NOT NULL UNIQUE"));
        assert!(!CREATE_DEVELOPER_APPS.contains("api_key TEXT"));
    }
}
