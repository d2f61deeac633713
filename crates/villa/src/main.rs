use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use villa::http::{build_router, AppState};
use villa::{initialize, migrate, shutdown, spawn_reservation_sweeper, RootError, VillaConfig};
use villa_apps::{generate_api_key, generate_app_id, is_valid_api_key, is_valid_app_id, AppError};
use villa_core::{normalize_origin, validate_origin, validate_origins};

const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Villa identity service
///
/// Nickname registry, developer app credentials, and the trusted-origin
/// side of the cross-window auth handshake.
#[derive(Parser, Debug)]
#[command(name = "villa", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file if none exists
    Init,

    /// Start the HTTP server
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Port (overrides server.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Apply the Postgres schema
    Migrate,

    /// Validate origins as an app allowlist would
    CheckOrigins {
        /// Origins to check, e.g. https://app.example.com
        #[arg(required = true)]
        origins: Vec<String>,
    },

    /// Generate a fresh app id and API key
    IssueCredentials {
        /// Print the full API key instead of the masked form
        #[arg(long)]
        reveal: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new(
            "villa=debug,villa_profile=debug,villa_apps=debug,villa_handshake=debug,villa_store=debug,tower_http=debug",
        )
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("villa=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn config_path(path: Option<&PathBuf>) -> PathBuf {
    path.cloned().unwrap_or_else(VillaConfig::default_config_path)
}

fn load_config(path: Option<&PathBuf>) -> Result<VillaConfig, RootError> {
    VillaConfig::load(&config_path(path))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), RootError> {
    match cli.command {
        Commands::Init => cmd_init(cli.config.as_ref()),
        Commands::Serve { bind, port } => cmd_serve(cli.config.as_ref(), bind, port).await,
        Commands::Migrate => cmd_migrate(cli.config.as_ref()).await,
        Commands::CheckOrigins { origins } => cmd_check_origins(&origins),
        Commands::IssueCredentials { reveal } => cmd_issue_credentials(reveal),
    }
}

fn cmd_init(path: Option<&PathBuf>) -> Result<(), RootError> {
    let path = config_path(path);
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    VillaConfig::default().save(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn cmd_serve(
    path: Option<&PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<(), RootError> {
    let mut config = load_config(path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.bind, config.server.port);

    let mut state = initialize(config).await?;
    let app_state = Arc::new(AppState::from_state(&state)?);
    let sweeper = spawn_reservation_sweeper(app_state.services.clone(), SWEEP_PERIOD);
    let router = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "villa listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;

    sweeper.abort();
    shutdown(&mut state).await?;
    served.map_err(RootError::Io)
}

async fn cmd_migrate(path: Option<&PathBuf>) -> Result<(), RootError> {
    let config = load_config(path)?;
    migrate(&config).await?;
    println!("Schema is up to date.");
    Ok(())
}

fn cmd_check_origins(origins: &[String]) -> Result<(), RootError> {
    for origin in origins {
        let check = validate_origin(origin);
        match check.reason {
            None => println!("  ok       {} -> {}", origin, normalize_origin(origin)),
            Some(reason) => println!("  invalid  {} ({})", origin, reason),
        }
    }

    let list = validate_origins(origins);
    if !list.valid {
        return Err(AppError::InvalidOrigins(list).into());
    }
    println!("Origin list is valid ({} entries).", origins.len());
    Ok(())
}

fn cmd_issue_credentials(reveal: bool) -> Result<(), RootError> {
    let app_id = generate_app_id();
    let api_key = generate_api_key();

    if !is_valid_app_id(&app_id) || !is_valid_api_key(api_key.expose()) {
        return Err(RootError::Internal("generated credentials failed the shape check".into()));
    }

    println!("App id:  {}", app_id);
    if reveal {
        println!("API key: {}", api_key.expose());
    } else {
        println!("API key: {}", api_key.masked());
    }
    println!("Shape check: ok");
    Ok(())
}
