use std::sync::Arc;
use villa_core::{
    normalize_origin, validate_origin, validate_origins, Address, AppRepository, DeveloperApp,
    Timestamp, UniqueConstraint, VillaError,
};

use crate::error::{AppError, AppResult};
use crate::keys::{
    api_key_matches, generate_api_key, generate_app_id, hash_api_key, is_valid_api_key,
    is_valid_app_id, ApiKey,
};

pub const DEFAULT_RATE_LIMIT: u32 = 100;
const MAX_ID_ATTEMPTS: usize = 3;

/// An app together with its plaintext API key. Returned only at registration
/// and rotation; the key is not recoverable afterwards.
#[derive(Debug)]
pub struct IssuedApp {
    pub app: DeveloperApp,
    pub api_key: ApiKey,
}

pub struct AppRegistry {
    repo: Arc<dyn AppRepository>,
}

fn normalized_allowlist(origins: &[String]) -> AppResult<Vec<String>> {
    let check = validate_origins(origins);
    if !check.valid {
        return Err(AppError::InvalidOrigins(check));
    }
    Ok(origins.iter().map(|o| normalize_origin(o)).collect())
}

impl AppRegistry {
    pub fn new(repo: Arc<dyn AppRepository>) -> Self {
        Self { repo }
    }

    /// Register a new app for `owner`.
    pub async fn register(
        &self,
        owner: &Address,
        origins: &[String],
        rate_limit: Option<u32>,
        now: Timestamp,
    ) -> AppResult<IssuedApp> {
        let allowed_origins = normalized_allowlist(origins)?;
        let rate_limit = rate_limit.unwrap_or(DEFAULT_RATE_LIMIT);
        if rate_limit == 0 {
            return Err(AppError::Invalid("rate limit must be positive".into()));
        }

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let api_key = generate_api_key();
            let app = DeveloperApp {
                app_id: generate_app_id(),
                api_key_hash: hash_api_key(api_key.expose()),
                owner_address: owner.clone(),
                allowed_origins: allowed_origins.clone(),
                rate_limit,
                created_at: now,
                updated_at: now,
            };
            match self.repo.insert_app(&app).await {
                Ok(()) => {
                    tracing::info!(
                        app_id = %app.app_id,
                        owner = %owner,
                        api_key = %api_key,
                        origins = app.allowed_origins.len(),
                        "developer app registered"
                    );
                    return Ok(IssuedApp { app, api_key });
                }
                Err(VillaError::UniqueViolation {
                    constraint: UniqueConstraint::AppId | UniqueConstraint::ApiKey,
                    ..
                }) => {
                    tracing::warn!(attempt, "credential collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::CredentialCollision)
    }

    /// Resolve `app_id` if `api_key` belongs to it.
    ///
    /// Malformed ids and keys are rejected before any storage lookup.
    pub async fn authenticate(&self, app_id: &str, api_key: &str) -> AppResult<DeveloperApp> {
        if !is_valid_app_id(app_id) {
            return Err(AppError::MalformedAppId);
        }
        if !is_valid_api_key(api_key) {
            return Err(AppError::MalformedApiKey);
        }
        let app = self
            .repo
            .find_app(app_id)
            .await?
            .ok_or(AppError::Unauthorized)?;
        if !api_key_matches(api_key, &app.api_key_hash) {
            tracing::warn!(app_id = %app_id, "API key mismatch");
            return Err(AppError::Unauthorized);
        }
        Ok(app)
    }

    /// Replace the allowlist of an app the caller holds the key for.
    pub async fn update_origins(
        &self,
        app_id: &str,
        api_key: &str,
        origins: &[String],
        now: Timestamp,
    ) -> AppResult<DeveloperApp> {
        self.authenticate(app_id, api_key).await?;
        let allowed_origins = normalized_allowlist(origins)?;
        let app = self
            .repo
            .update_app_origins(app_id, &allowed_origins, now)
            .await?
            .ok_or(AppError::Unauthorized)?;
        tracing::info!(app_id = %app_id, origins = app.allowed_origins.len(), "app origins updated");
        Ok(app)
    }

    /// Issue a new key; the old one stops working immediately.
    pub async fn rotate_api_key(
        &self,
        app_id: &str,
        api_key: &str,
        now: Timestamp,
    ) -> AppResult<IssuedApp> {
        self.authenticate(app_id, api_key).await?;
        let new_key = generate_api_key();
        let app = self
            .repo
            .update_api_key_hash(app_id, &hash_api_key(new_key.expose()), now)
            .await?
            .ok_or(AppError::Unauthorized)?;
        tracing::info!(app_id = %app_id, api_key = %new_key, "API key rotated");
        Ok(IssuedApp {
            app,
            api_key: new_key,
        })
    }

    pub async fn find(&self, app_id: &str) -> AppResult<Option<DeveloperApp>> {
        if !is_valid_app_id(app_id) {
            return Ok(None);
        }
        Ok(self.repo.find_app(app_id).await?)
    }

    pub async fn list_for_owner(&self, owner: &Address) -> AppResult<Vec<DeveloperApp>> {
        Ok(self.repo.list_apps_by_owner(owner).await?)
    }

    /// True if some registered app allows `origin`. Invalid origins are never
    /// registered.
    pub async fn is_registered_origin(&self, origin: &str) -> AppResult<bool> {
        if !validate_origin(origin).valid {
            return Ok(false);
        }
        Ok(self.repo.is_origin_registered(&normalize_origin(origin)).await?)
    }
}
