use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use parley_core::ids::{UserId, UuidV7Generator};
use parley_server::auth::{AllowAll, AuthVerifier, TokenTable};
use parley_server::{start, Backends, ServerConfig, Services};
use parley_settings::{LogFormat, Settings, StorageBackend};
use parley_store::{
    Database, GroupRepo, GroupStore, MemoryCache, MemoryQueue, MemoryStore, MessageRepo, MessageStore,
};
use parley_telemetry::TelemetryConfig;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time messaging server")]
struct Cli {
    /// Settings file (defaults to ~/.parley/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Seconds to wait for sessions and consumers on shutdown.
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    init_logging(&settings)?;
    tracing::info!("starting parley");

    let backends = build_backends(&settings)?;
    let services = Arc::new(Services::new(backends, &settings));
    let handle = start(ServerConfig::from(&settings.server), services)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "parley ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle
        .shutdown(Some(Duration::from_secs(cli.shutdown_timeout)))
        .await;
    Ok(())
}

fn init_logging(settings: &Settings) -> anyhow::Result<()> {
    let format = match settings.logging.format {
        LogFormat::Json => parley_telemetry::LogFormat::Json,
        LogFormat::Pretty => parley_telemetry::LogFormat::Pretty,
    };
    let config = TelemetryConfig::from_levels(
        &settings.logging.level,
        settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        format,
    )?;
    parley_telemetry::init_telemetry(&config)?;
    Ok(())
}

fn build_backends(settings: &Settings) -> anyhow::Result<Backends> {
    let auth: Arc<dyn AuthVerifier> = if settings.auth.tokens.is_empty() {
        tracing::warn!("no auth tokens configured, accepting every login");
        Arc::new(AllowAll)
    } else {
        Arc::new(TokenTable::new(settings.auth.tokens.iter().map(|(user, token)| {
            (UserId::from_raw(user.as_str()), SecretString::from(token.clone()))
        })))
    };

    let (messages, groups) = match settings.storage.backend {
        StorageBackend::Sqlite => {
            let path = PathBuf::from(&settings.storage.sqlite_path);
            let db = Database::open(&path)
                .with_context(|| format!("failed to open database at {}", path.display()))?;
            (
                Arc::new(MessageRepo::new(db.clone())) as Arc<dyn MessageStore>,
                Arc::new(GroupRepo::new(db)) as Arc<dyn GroupStore>,
            )
        }
        StorageBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            (
                store.clone() as Arc<dyn MessageStore>,
                store as Arc<dyn GroupStore>,
            )
        }
    };
    tracing::info!(backend = ?settings.storage.backend, "storage ready");
    Ok(Backends {
        messages,
        groups,
        cache: Arc::new(MemoryCache::new()),
        queue: Arc::new(MemoryQueue::new()),
        ids: Arc::new(UuidV7Generator),
        auth,
    })
}
