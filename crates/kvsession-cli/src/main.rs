mod config;

use clap::{Parser, Subcommand};
use config::{DEFAULT_ENV, ENV_VAR, SECRET_ENV_VAR};
use kvsession_gateway::GatewayServer;
use kvsession_security::generate_secret_key;
use kvsession_session::{spawn_gc_task, InMemoryKeyValueStore, SessionManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kvsession", about = "kvsession: HTTP sessions in a key-value store")]
struct Cli {
    /// Path to config file (default: looked up under ./config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment used to pick the config file (default: $KVSESSION_ENV or development)
    #[arg(short, long)]
    env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the session server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print a new random secret key
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen => {
            println!("{}", generate_secret_key()?);
        }
        Commands::Serve { host, port } => {
            let env = cli
                .env
                .or_else(|| std::env::var(ENV_VAR).ok())
                .unwrap_or_else(|| DEFAULT_ENV.to_string());
            let path = config::locate(cli.config.as_deref(), Path::new("."), &env);
            match &path {
                Some(path) => info!(env = %env, path = %path.display(), "Loading config"),
                None => info!(env = %env, "No config file found, using defaults"),
            }
            let config =
                config::load(path.as_deref(), std::env::var(SECRET_ENV_VAR).ok()).await?;

            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);
            let gc_interval = config.session.gc_interval_secs;

            let kv = Arc::new(InMemoryKeyValueStore::new());
            let manager = SessionManager::new(Arc::new(config.session), kv)?;
            info!(
                namespace = %manager.config().namespace,
                max_age_secs = manager.config().max_age_secs,
                strict = manager.config().strict_staleness,
                "Session manager ready"
            );

            if gc_interval > 0 {
                spawn_gc_task(Arc::new(manager.garbage_collector()), gc_interval);
                info!(interval_secs = gc_interval, "Session garbage collection scheduled");
            }

            let app = GatewayServer::build(Arc::new(manager));

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("kvsession listening on {}", addr);
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
