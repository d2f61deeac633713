use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use villa_core::{
    Address, AppRepository, Avatar, ClaimCommit, DeveloperApp, Nickname, NicknameChangeCommit,
    NicknameReservation, NormalizedNickname, Profile, ProfileRepository, Timestamp,
    UniqueConstraint, VillaError, VillaResult,
};

use crate::schema::MIGRATIONS;

/// Connection settings for [`PgRepository::connect`].
#[derive(Debug, Clone)]
pub struct PgOptions {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

/// Postgres-backed repository. Uniqueness is enforced by the schema's unique
/// indexes; collisions are reported as `VillaError::UniqueViolation`.
pub struct PgRepository {
    pool: PgPool,
}

const PROFILE_COLUMNS: &str = "address, nickname, nickname_normalized, avatar_style, \
     avatar_selection, avatar_variant, nickname_change_count, last_nickname_change, \
     created_at, updated_at";

const APP_COLUMNS: &str =
    "id, api_key_hash, owner_address, allowed_origins, rate_limit, created_at, updated_at";

#[derive(Debug, Clone, sqlx::FromRow)]
struct ProfileRow {
    address: String,
    nickname: Option<String>,
    nickname_normalized: Option<String>,
    avatar_style: Option<String>,
    avatar_selection: Option<String>,
    avatar_variant: Option<i32>,
    nickname_change_count: i32,
    last_nickname_change: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ProfileRow {
    fn into_profile(self) -> VillaResult<Profile> {
        let avatar = match (self.avatar_style, self.avatar_selection) {
            (Some(style), Some(selection)) => Some(Avatar::from_columns(
                style,
                selection,
                self.avatar_variant.unwrap_or(0),
            )),
            _ => None,
        };
        Ok(Profile {
            address: Address::parse(&self.address)?,
            nickname: self.nickname.map(Nickname::from_stored),
            nickname_normalized: self.nickname_normalized.map(NormalizedNickname::from_stored),
            avatar,
            nickname_change_count: self.nickname_change_count.max(0) as u32,
            last_nickname_change_at: self.last_nickname_change.map(Timestamp::from),
            created_at: self.created_at.into(),
            updated_at: self.updated_at.into(),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReservationRow {
    nickname_normalized: String,
    address: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl ReservationRow {
    fn into_reservation(self) -> VillaResult<NicknameReservation> {
        Ok(NicknameReservation {
            nickname_normalized: NormalizedNickname::from_stored(self.nickname_normalized),
            address: Address::parse(&self.address)?,
            expires_at: self.expires_at.into(),
            created_at: self.created_at.into(),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AppRow {
    id: String,
    api_key_hash: String,
    owner_address: String,
    allowed_origins: Vec<String>,
    rate_limit: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AppRow {
    fn into_app(self) -> VillaResult<DeveloperApp> {
        Ok(DeveloperApp {
            app_id: self.id,
            api_key_hash: self.api_key_hash,
            owner_address: Address::parse(&self.owner_address)?,
            allowed_origins: self.allowed_origins,
            rate_limit: self.rate_limit.max(0) as u32,
            created_at: self.created_at.into(),
            updated_at: self.updated_at.into(),
        })
    }
}

/// Translate a driver error. Unique violations keep the colliding value so
/// callers can name it.
fn map_sqlx_error(e: sqlx::Error, value: &str) -> VillaError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            match db.constraint().and_then(UniqueConstraint::from_constraint_name) {
                Some(constraint) => VillaError::UniqueViolation {
                    constraint,
                    value: value.to_string(),
                },
                None => VillaError::Storage(format!("unique violation: {}", db)),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            VillaError::Unavailable(e.to_string())
        }
        other => VillaError::Storage(format!("query failed: {}", other)),
    }
}

fn query_error(e: sqlx::Error) -> VillaError {
    map_sqlx_error(e, "")
}

/// Lock `nickname`'s reservation row and refuse if someone else holds it live.
async fn ensure_not_reserved_by_other(
    conn: &mut sqlx::PgConnection,
    nickname: &NormalizedNickname,
    address: &Address,
    now: Timestamp,
) -> VillaResult<()> {
    let held: Option<(String,)> = sqlx::query_as(
        "SELECT address FROM nickname_reservations
         WHERE nickname_normalized = $1 AND address <> $2 AND expires_at > $3
         FOR UPDATE",
    )
    .bind(nickname.as_str())
    .bind(address.as_str())
    .bind(now.to_datetime())
    .fetch_optional(&mut *conn)
    .await
    .map_err(query_error)?;
    match held {
        Some(_) => Err(VillaError::UniqueViolation {
            constraint: UniqueConstraint::ReservationNickname,
            value: nickname.to_string(),
        }),
        None => Ok(()),
    }
}

impl PgRepository {
    /// Open a pool. Fails with `VillaError::Unavailable` if the database
    /// cannot be reached within `connect_timeout`.
    pub async fn connect(options: &PgOptions) -> VillaResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.connect_timeout)
            .connect(&options.url)
            .await
            .map_err(|e| VillaError::Unavailable(format!("failed to connect: {}", e)))?;
        tracing::info!(
            max_connections = options.max_connections,
            "connected to postgres"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> VillaResult<()> {
        for stmt in MIGRATIONS {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| VillaError::Storage(format!("migration failed: {}", e)))?;
        }
        tracing::info!(statements = MIGRATIONS.len(), "schema migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("postgres pool closed");
    }
}

#[async_trait]
impl ProfileRepository for PgRepository {
    async fn find_profile(&self, address: &Address) -> VillaResult<Option<Profile>> {
        let sql = format!("SELECT {} FROM profiles WHERE address = $1", PROFILE_COLUMNS);
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(address.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.map(ProfileRow::into_profile).transpose()
    }

    async fn find_profile_by_nickname(
        &self,
        nickname: &NormalizedNickname,
    ) -> VillaResult<Option<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE nickname_normalized = $1",
            PROFILE_COLUMNS
        );
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(nickname.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.map(ProfileRow::into_profile).transpose()
    }

    async fn find_reservation(
        &self,
        nickname: &NormalizedNickname,
    ) -> VillaResult<Option<NicknameReservation>> {
        let row: Option<ReservationRow> = sqlx::query_as(
            "SELECT nickname_normalized, address, expires_at, created_at
             FROM nickname_reservations WHERE nickname_normalized = $1",
        )
        .bind(nickname.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;
        row.map(ReservationRow::into_reservation).transpose()
    }

    async fn insert_reservation(
        &self,
        reservation: &NicknameReservation,
        now: Timestamp,
    ) -> VillaResult<NicknameReservation> {
        let key = reservation.nickname_normalized.as_str();

        let owned: Option<(String,)> =
            sqlx::query_as("SELECT address FROM profiles WHERE nickname_normalized = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_error)?;
        if owned.is_some() {
            return Err(VillaError::UniqueViolation {
                constraint: UniqueConstraint::ProfileNickname,
                value: key.to_string(),
            });
        }

        // The upsert only overwrites an expired row or the caller's own row;
        // a live reservation by someone else leaves RETURNING empty.
        let row: Option<ReservationRow> = sqlx::query_as(
            "INSERT INTO nickname_reservations (nickname_normalized, address, expires_at, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (nickname_normalized) DO UPDATE
               SET address = EXCLUDED.address,
                   expires_at = EXCLUDED.expires_at,
                   created_at = EXCLUDED.created_at
             WHERE nickname_reservations.expires_at <= $5
                OR nickname_reservations.address = EXCLUDED.address
             RETURNING nickname_normalized, address, expires_at, created_at",
        )
        .bind(key)
        .bind(reservation.address.as_str())
        .bind(reservation.expires_at.to_datetime())
        .bind(reservation.created_at.to_datetime())
        .bind(now.to_datetime())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, key))?;

        match row {
            Some(row) => row.into_reservation(),
            None => Err(VillaError::UniqueViolation {
                constraint: UniqueConstraint::ReservationNickname,
                value: key.to_string(),
            }),
        }
    }

    async fn delete_reservation(
        &self,
        nickname: &NormalizedNickname,
        address: &Address,
    ) -> VillaResult<bool> {
        let result = sqlx::query(
            "DELETE FROM nickname_reservations WHERE nickname_normalized = $1 AND address = $2",
        )
        .bind(nickname.as_str())
        .bind(address.as_str())
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit_claim(&self, claim: &ClaimCommit) -> VillaResult<Profile> {
        let normalized = claim.nickname.normalized();
        let mut tx = self.pool.begin().await.map_err(query_error)?;

        ensure_not_reserved_by_other(&mut tx, &normalized, &claim.address, claim.now).await?;

        sqlx::query(
            "DELETE FROM nickname_reservations WHERE nickname_normalized = $1 AND address = $2",
        )
        .bind(normalized.as_str())
        .bind(claim.address.as_str())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let sql = format!(
            "INSERT INTO profiles (address, nickname, nickname_normalized, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (address) DO UPDATE
               SET nickname = EXCLUDED.nickname,
                   nickname_normalized = EXCLUDED.nickname_normalized,
                   updated_at = EXCLUDED.updated_at
             WHERE profiles.nickname IS NULL
             RETURNING {}",
            PROFILE_COLUMNS
        );
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(claim.address.as_str())
            .bind(claim.nickname.as_str())
            .bind(normalized.as_str())
            .bind(claim.now.to_datetime())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, normalized.as_str()))?;

        let Some(row) = row else {
            // Dropping the transaction rolls back the reservation delete
            return Err(VillaError::UniqueViolation {
                constraint: UniqueConstraint::ProfileAddress,
                value: claim.address.to_string(),
            });
        };

        tx.commit().await.map_err(query_error)?;
        row.into_profile()
    }

    async fn commit_nickname_change(
        &self,
        change: &NicknameChangeCommit,
    ) -> VillaResult<Option<Profile>> {
        let normalized = change.nickname.normalized();
        let expected = i32::try_from(change.expected_change_count)
            .map_err(|_| VillaError::Validation("change count out of range".into()))?;
        let mut tx = self.pool.begin().await.map_err(query_error)?;

        ensure_not_reserved_by_other(&mut tx, &normalized, &change.address, change.now).await?;

        let sql = format!(
            "UPDATE profiles
             SET nickname = $2,
                 nickname_normalized = $3,
                 nickname_change_count = nickname_change_count + 1,
                 last_nickname_change = $4,
                 updated_at = $4
             WHERE address = $1 AND nickname_change_count = $5
             RETURNING {}",
            PROFILE_COLUMNS
        );
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(change.address.as_str())
            .bind(change.nickname.as_str())
            .bind(normalized.as_str())
            .bind(change.now.to_datetime())
            .bind(expected)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, normalized.as_str()))?;

        let Some(row) = row else {
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT address FROM profiles WHERE address = $1")
                    .bind(change.address.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_error)?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(VillaError::NotFound(format!("profile {}", change.address))),
            };
        };

        sqlx::query(
            "DELETE FROM nickname_reservations WHERE nickname_normalized = $1 AND address = $2",
        )
        .bind(normalized.as_str())
        .bind(change.address.as_str())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        row.into_profile().map(Some)
    }

    async fn upsert_avatar(
        &self,
        address: &Address,
        avatar: &Avatar,
        now: Timestamp,
    ) -> VillaResult<Profile> {
        let (style, selection, variant) = avatar.to_columns();
        let sql = format!(
            "INSERT INTO profiles (address, avatar_style, avatar_selection, avatar_variant, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (address) DO UPDATE
               SET avatar_style = EXCLUDED.avatar_style,
                   avatar_selection = EXCLUDED.avatar_selection,
                   avatar_variant = EXCLUDED.avatar_variant,
                   updated_at = EXCLUDED.updated_at
             RETURNING {}",
            PROFILE_COLUMNS
        );
        let row: ProfileRow = sqlx::query_as(&sql)
            .bind(address.as_str())
            .bind(style)
            .bind(selection)
            .bind(variant)
            .bind(now.to_datetime())
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;
        row.into_profile()
    }

    async fn delete_expired_reservations(&self, now: Timestamp) -> VillaResult<u64> {
        let result = sqlx::query("DELETE FROM nickname_reservations WHERE expires_at <= $1")
            .bind(now.to_datetime())
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> VillaResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| VillaError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AppRepository for PgRepository {
    async fn insert_app(&self, app: &DeveloperApp) -> VillaResult<()> {
        let rate_limit = i32::try_from(app.rate_limit)
            .map_err(|_| VillaError::Validation("rate limit out of range".into()))?;
        sqlx::query(
            "INSERT INTO developer_apps
               (id, api_key_hash, owner_address, allowed_origins, rate_limit, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&app.app_id)
        .bind(&app.api_key_hash)
        .bind(app.owner_address.as_str())
        .bind(&app.allowed_origins)
        .bind(rate_limit)
        .bind(app.created_at.to_datetime())
        .bind(app.updated_at.to_datetime())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, &app.app_id))?;
        Ok(())
    }

    async fn find_app(&self, app_id: &str) -> VillaResult<Option<DeveloperApp>> {
        let sql = format!("SELECT {} FROM developer_apps WHERE id = $1", APP_COLUMNS);
        let row: Option<AppRow> = sqlx::query_as(&sql)
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.map(AppRow::into_app).transpose()
    }

    async fn list_apps_by_owner(&self, owner: &Address) -> VillaResult<Vec<DeveloperApp>> {
        let sql = format!(
            "SELECT {} FROM developer_apps WHERE owner_address = $1 ORDER BY created_at",
            APP_COLUMNS
        );
        let rows: Vec<AppRow> = sqlx::query_as(&sql)
            .bind(owner.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.into_iter().map(AppRow::into_app).collect()
    }

    async fn update_app_origins(
        &self,
        app_id: &str,
        origins: &[String],
        now: Timestamp,
    ) -> VillaResult<Option<DeveloperApp>> {
        let sql = format!(
            "UPDATE developer_apps SET allowed_origins = $2, updated_at = $3
             WHERE id = $1 RETURNING {}",
            APP_COLUMNS
        );
        let row: Option<AppRow> = sqlx::query_as(&sql)
            .bind(app_id)
            .bind(origins)
            .bind(now.to_datetime())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.map(AppRow::into_app).transpose()
    }

    async fn update_api_key_hash(
        &self,
        app_id: &str,
        api_key_hash: &str,
        now: Timestamp,
    ) -> VillaResult<Option<DeveloperApp>> {
        let sql = format!(
            "UPDATE developer_apps SET api_key_hash = $2, updated_at = $3
             WHERE id = $1 RETURNING {}",
            APP_COLUMNS
        );
        let row: Option<AppRow> = sqlx::query_as(&sql)
            .bind(app_id)
            .bind(api_key_hash)
            .bind(now.to_datetime())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, app_id))?;
        row.map(AppRow::into_app).transpose()
    }

    async fn is_origin_registered(&self, origin: &str) -> VillaResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM developer_apps WHERE $1 = ANY(allowed_origins))",
        )
        .bind(origin)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(exists)
    }
}
