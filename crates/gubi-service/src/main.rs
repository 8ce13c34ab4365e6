use clap::{Parser, ValueEnum};
use gubi_core::{RetryPolicy, StoreConfig};
use gubi_service::{build_router, ServiceConfig, ServiceState, StoreBackend};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreMode {
    Auto,
    Memory,
    Postgres,
    File,
}

#[derive(Debug, Parser)]
#[command(name = "gubid", version, about = "cyber-gubi ledger REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "GUBI_LISTEN")]
    listen: SocketAddr,
    /// Document store backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StoreMode::Auto, env = "GUBI_STORE")]
    store: StoreMode,
    /// PostgreSQL url for the document store.
    #[arg(long, env = "GUBI_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "GUBI_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// JSON file used by the `file` backend.
    #[arg(long, default_value = "gubi/data/documents.json", env = "GUBI_STORE_FILE")]
    store_file: PathBuf,
    /// Per-attempt store operation timeout in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "GUBI_OP_TIMEOUT_MS")]
    op_timeout_ms: u64,
    /// Attempts per store operation before the failure is surfaced.
    #[arg(long, default_value_t = 4, env = "GUBI_MAX_ATTEMPTS")]
    max_attempts: u32,
}

fn resolve_store(cli: &Cli) -> anyhow::Result<StoreBackend> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let store = match cli.store {
        StoreMode::Memory => StoreBackend::Ledger(StoreConfig::Memory),
        StoreMode::File => StoreBackend::File(cli.store_file.clone()),
        StoreMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("store=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreBackend::Ledger(StoreConfig::postgres(database_url, cli.pg_max_connections))
        }
        StoreMode::Auto => match resolved_url {
            Some(database_url) => {
                StoreBackend::Ledger(StoreConfig::postgres(database_url, cli.pg_max_connections))
            }
            None => StoreBackend::Ledger(StoreConfig::Memory),
        },
    };

    Ok(store)
}

fn resolve_retry(cli: &Cli) -> anyhow::Result<RetryPolicy> {
    if cli.max_attempts == 0 {
        anyhow::bail!("--max-attempts must be at least 1");
    }
    Ok(RetryPolicy {
        max_attempts: cli.max_attempts,
        op_timeout: Duration::from_millis(cli.op_timeout_ms),
        ..RetryPolicy::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "gubi_service=info,gubi_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let store = resolve_store(&cli)?;
    let retry = resolve_retry(&cli)?;
    info!(backend = store.label(), max_attempts = retry.max_attempts, "starting gubi-service");

    let state = ServiceState::bootstrap(ServiceConfig { store, retry }).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("gubi-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
