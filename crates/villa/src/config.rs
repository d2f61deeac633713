use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use villa_core::{validate_origin, NicknameRules};
use villa_handshake::resolver::{DEFAULT_DEV_ORIGINS, DEFAULT_LOCAL_FALLBACK, DEFAULT_VILLA_ORIGINS};
use villa_handshake::ResponderSettings;
use villa_profile::{NicknamePolicy, RegistryConfig};
use villa_store::PgOptions;

use crate::error::{RootError, RootResult};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Browser origins allowed to call the HTTP API. Empty disables CORS.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Which repository implementation backs the services.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            run_migrations: default_true(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default)]
    pub postgres: PostgresConfig,
}

/// Nickname format rules, reservation lifetime and change policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicknameConfig {
    #[serde(default = "default_max_changes")]
    pub max_changes: u32,

    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: u64,

    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,

    #[serde(default = "default_min_length")]
    pub min_length: usize,

    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_changes() -> u32 {
    villa_profile::policy::DEFAULT_MAX_CHANGES
}

fn default_cooldown_days() -> u64 {
    villa_profile::policy::DEFAULT_COOLDOWN_SECONDS / SECONDS_PER_DAY
}

fn default_reservation_ttl() -> u64 {
    villa_profile::registry::DEFAULT_RESERVATION_TTL_SECONDS
}

fn default_min_length() -> usize {
    NicknameRules::default().min_length
}

fn default_max_length() -> usize {
    NicknameRules::default().max_length
}

impl Default for NicknameConfig {
    fn default() -> Self {
        Self {
            max_changes: default_max_changes(),
            cooldown_days: default_cooldown_days(),
            reservation_ttl_secs: default_reservation_ttl(),
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

/// Allowlists and timing for the auth handshake responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_villa_origins")]
    pub villa_origins: Vec<String>,

    #[serde(default = "default_dev_origins")]
    pub dev_origins: Vec<String>,

    #[serde(default = "default_local_fallback")]
    pub local_fallback_origin: String,

    #[serde(default = "default_popup_close_delay")]
    pub popup_close_delay_ms: u64,

    /// Where consuming pages load the responder from.
    #[serde(default = "default_responder_url")]
    pub responder_url: String,
}

fn default_villa_origins() -> Vec<String> {
    DEFAULT_VILLA_ORIGINS.iter().map(|s| s.to_string()).collect()
}

fn default_dev_origins() -> Vec<String> {
    DEFAULT_DEV_ORIGINS.iter().map(|s| s.to_string()).collect()
}

fn default_local_fallback() -> String {
    DEFAULT_LOCAL_FALLBACK.to_string()
}

fn default_popup_close_delay() -> u64 {
    villa_handshake::responder::DEFAULT_POPUP_CLOSE_DELAY.as_millis() as u64
}

fn default_responder_url() -> String {
    "https://villa.cash/auth".to_string()
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            villa_origins: default_villa_origins(),
            dev_origins: default_dev_origins(),
            local_fallback_origin: default_local_fallback(),
            popup_close_delay_ms: default_popup_close_delay(),
            responder_url: default_responder_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofConfig {
    /// Name of the environment variable holding the passkey gateway's HMAC secret.
    #[serde(default = "default_gateway_secret_env")]
    pub gateway_secret_env: String,
}

fn default_gateway_secret_env() -> String {
    "VILLA_GATEWAY_SECRET".to_string()
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self {
            gateway_secret_env: default_gateway_secret_env(),
        }
    }
}

/// Top-level configuration for the Villa service.
///
/// Loaded from a TOML file (typically `~/.villa/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VillaConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub nickname: NicknameConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub proof: ProofConfig,
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

fn check_origin_list(section: &str, origins: &[String]) -> RootResult<()> {
    for origin in origins {
        let check = validate_origin(origin);
        if !check.valid {
            return Err(RootError::Config(format!(
                "{}: '{}' is not a valid origin: {}",
                section,
                origin,
                check.reason.unwrap_or_default()
            )));
        }
    }
    Ok(())
}

impl VillaConfig {
    /// Load configuration from a TOML file. If the file does not exist,
    /// returns a default configuration.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: VillaConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> RootResult<()> {
        let n = &self.nickname;
        if n.reservation_ttl_secs == 0 {
            return Err(RootError::Config("reservation_ttl_secs must be > 0".into()));
        }
        if n.max_changes == 0 {
            return Err(RootError::Config("max_changes must be > 0".into()));
        }
        if n.min_length == 0 || n.min_length > n.max_length {
            return Err(RootError::Config(format!(
                "nickname length bounds are inconsistent: min {} max {}",
                n.min_length, n.max_length
            )));
        }

        check_origin_list("server.cors_origins", &self.server.cors_origins)?;
        check_origin_list("handshake.villa_origins", &self.handshake.villa_origins)?;
        check_origin_list("handshake.dev_origins", &self.handshake.dev_origins)?;
        check_origin_list(
            "handshake.local_fallback_origin",
            std::slice::from_ref(&self.handshake.local_fallback_origin),
        )?;
        self.responder_settings()?;

        if self.storage.backend == StorageBackend::Postgres
            && self.storage.postgres.url.as_deref().map_or(true, str::is_empty)
        {
            return Err(RootError::Config(
                "storage.postgres.url is required for the postgres backend".into(),
            ));
        }
        if self.storage.postgres.max_connections == 0 {
            return Err(RootError::Config("max_connections must be > 0".into()));
        }
        if self.proof.gateway_secret_env.is_empty() {
            return Err(RootError::Config("gateway_secret_env must not be empty".into()));
        }
        Ok(())
    }

    /// Return the path to the default config file location.
    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".villa/config.toml")
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            rules: NicknameRules {
                min_length: self.nickname.min_length,
                max_length: self.nickname.max_length,
            },
            policy: NicknamePolicy {
                max_changes: self.nickname.max_changes,
                cooldown_seconds: self.nickname.cooldown_days.saturating_mul(SECONDS_PER_DAY),
            },
            reservation_ttl_seconds: self.nickname.reservation_ttl_secs,
        }
    }

    /// Pool settings, if a postgres URL is configured.
    pub fn pg_options(&self) -> Option<PgOptions> {
        let pg = &self.storage.postgres;
        pg.url.as_ref().map(|url| PgOptions {
            url: url.clone(),
            max_connections: pg.max_connections,
            connect_timeout: Duration::from_secs(pg.connect_timeout_secs),
        })
    }

    pub fn popup_close_delay(&self) -> Duration {
        Duration::from_millis(self.handshake.popup_close_delay_ms)
    }

    /// Responder location and close delay from `[handshake]`.
    pub fn responder_settings(&self) -> RootResult<ResponderSettings> {
        ResponderSettings::new(&self.handshake.responder_url, self.popup_close_delay()).map_err(|e| {
            RootError::Config(format!("handshake.responder_url: {}", e))
        })
    }
}
