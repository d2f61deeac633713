//! Villa Service Library
//!
//! Configuration, error handling, and the lifecycle that wires the identity
//! components together: the nickname registry, the developer app registry,
//! and the handshake origin resolver, over one repository chosen at startup.
//!
//! # Lifecycle
//!
//! `initialize` opens storage (in-memory or a Postgres pool) and builds the
//! services; `shutdown` closes the pool. Nothing is created lazily, and
//! using the services after shutdown fails with `RootError::NotInitialized`.

pub mod config;
pub mod error;
pub mod http;

pub use config::{
    HandshakeConfig, NicknameConfig, PostgresConfig, ProofConfig, ServerConfig, StorageBackend,
    StorageConfig, VillaConfig,
};
pub use error::{RootError, RootResult};

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use villa_apps::AppRegistry;
use villa_core::{AppRepository, ProfileRepository, Timestamp};
use villa_handshake::{OriginResolver, ResponderSettings};
use villa_profile::{GatewayProofVerifier, NicknameRegistry, OwnershipVerifier};
use villa_store::{InMemoryRepository, PgRepository};

// ---------------------------------------------------------------------------
// Storage selection
// ---------------------------------------------------------------------------

/// The repository behind every service. Both traits are served by the same
/// instance so a claim and an app lookup see one datastore.
pub enum Storage {
    Memory(Arc<InMemoryRepository>),
    Postgres(Arc<PgRepository>),
}

impl Storage {
    /// Open the backend named in `config`, applying migrations if configured.
    pub async fn open(config: &VillaConfig) -> RootResult<Self> {
        match config.storage.backend {
            StorageBackend::Memory => {
                warn!("using in-memory storage, data is lost on restart");
                Ok(Storage::Memory(Arc::new(InMemoryRepository::new())))
            }
            StorageBackend::Postgres => {
                let options = config.pg_options().ok_or_else(|| {
                    RootError::Config("storage.postgres.url is required".into())
                })?;
                let repo = PgRepository::connect(&options).await?;
                if config.storage.postgres.run_migrations {
                    repo.migrate().await?;
                }
                Ok(Storage::Postgres(Arc::new(repo)))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Storage::Memory(_) => "memory",
            Storage::Postgres(_) => "postgres",
        }
    }

    fn profiles(&self) -> Arc<dyn ProfileRepository> {
        match self {
            Storage::Memory(repo) => repo.clone(),
            Storage::Postgres(repo) => repo.clone(),
        }
    }

    fn apps(&self) -> Arc<dyn AppRepository> {
        match self {
            Storage::Memory(repo) => repo.clone(),
            Storage::Postgres(repo) => repo.clone(),
        }
    }

    async fn close(&self) {
        if let Storage::Postgres(repo) = self {
            repo.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Services and state
// ---------------------------------------------------------------------------

/// Initialized component services, shared by the HTTP handlers.
pub struct Services {
    pub nicknames: NicknameRegistry,
    pub apps: Arc<AppRegistry>,
    pub origins: OriginResolver,
    pub handshake: ResponderSettings,
    pub storage_kind: &'static str,
}

/// Runtime state for the Villa service. Created by `initialize` and torn
/// down by `shutdown`.
pub struct VillaState {
    pub config: VillaConfig,
    initialized: bool,
    storage: Option<Storage>,
    services: Option<Arc<Services>>,
}

impl VillaState {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn services(&self) -> RootResult<Arc<Services>> {
        match (&self.services, self.initialized) {
            (Some(services), true) => Ok(services.clone()),
            _ => Err(RootError::NotInitialized),
        }
    }
}

/// Initialize with the passkey gateway verifier, reading its secret from the
/// environment variable named in `config.proof.gateway_secret_env`.
pub async fn initialize(config: VillaConfig) -> RootResult<VillaState> {
    let verifier = GatewayProofVerifier::from_env(&config.proof.gateway_secret_env)?;
    initialize_with_verifier(config, Arc::new(verifier)).await
}

/// Initialize with an explicit ownership verifier.
///
/// # Contract
/// - Precondition: config must be valid
/// - Postcondition: services are ready to handle requests
pub async fn initialize_with_verifier(
    config: VillaConfig,
    verifier: Arc<dyn OwnershipVerifier>,
) -> RootResult<VillaState> {
    config.validate()?;
    let handshake = config.responder_settings()?;

    info!(
        backend = ?config.storage.backend,
        max_changes = config.nickname.max_changes,
        cooldown_days = config.nickname.cooldown_days,
        "initializing villa services"
    );

    let storage = Storage::open(&config).await?;

    let apps = Arc::new(AppRegistry::new(storage.apps()));
    let origins = OriginResolver::new(
        config.handshake.villa_origins.as_slice(),
        config.handshake.dev_origins.as_slice(),
        &config.handshake.local_fallback_origin,
        apps.clone(),
    )?;
    let nicknames = NicknameRegistry::new(storage.profiles(), verifier, config.registry_config());

    let services = Arc::new(Services {
        nicknames,
        apps,
        origins,
        handshake,
        storage_kind: storage.kind(),
    });

    info!(storage = storage.kind(), "villa services initialized");

    Ok(VillaState {
        config,
        initialized: true,
        storage: Some(storage),
        services: Some(services),
    })
}

/// Release storage and drop the services.
///
/// # Contract
/// - Idempotent: yes
pub async fn shutdown(state: &mut VillaState) -> RootResult<()> {
    if !state.initialized {
        return Ok(());
    }

    info!("shutting down villa services");

    state.initialized = false;
    state.services = None;
    if let Some(storage) = state.storage.take() {
        storage.close().await;
    }

    info!("villa services shut down");
    Ok(())
}

/// Apply the Postgres schema without starting any services.
pub async fn migrate(config: &VillaConfig) -> RootResult<()> {
    let options = config.pg_options().ok_or_else(|| {
        RootError::Config("migrate needs storage.postgres.url to be set".into())
    })?;
    let repo = PgRepository::connect(&options).await?;
    let result = repo.migrate().await;
    repo.close().await;
    Ok(result?)
}

/// Periodically delete expired reservations. Liveness is checked on every
/// read, so this only keeps the table small.
pub fn spawn_reservation_sweeper(
    services: Arc<Services>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = services
                .nicknames
                .sweep_expired_reservations(Timestamp::now())
                .await
            {
                warn!(error = %e, "reservation sweep failed");
            }
        }
    })
}
