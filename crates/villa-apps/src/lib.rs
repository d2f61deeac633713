//! Villa developer apps
//!
//! Opaque credentials for third-party integrations that open the auth
//! handshake, and the registry of their allowed origins.
//!
//! - `vk_live_` API keys (32 random bytes, lowercase hex) are shown once and
//!   stored only as a SHA-256 hash.
//! - `app_` ids (16 random bytes, lowercase hex) are public.
//! - Every allowlist goes through the origin validator before it is stored.

pub mod error;
pub mod keys;
pub mod registry;

pub use error::{AppError, AppResult};
pub use keys::{
    api_key_matches, generate_api_key, generate_app_id, hash_api_key, is_valid_api_key,
    is_valid_app_id, mask_api_key, ApiKey,
};
pub use registry::{AppRegistry, IssuedApp, DEFAULT_RATE_LIMIT};
