use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, Parser)]
#[command(name = "keyledger-server", about = "Per-user API key and usage ledger service")]
struct Args {
    /// TOML or JSON config file.
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// SQLite database; without it state lives in memory only.
    #[arg(long)]
    sqlite: Option<PathBuf>,
    #[arg(long)]
    dotenv: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let config = keyledger::KeyledgerConfig::load(&args.config)?;
    let env = match args.dotenv.as_deref() {
        Some(path) => keyledger::SecretEnv::load_dotenv(path)?,
        None => keyledger::SecretEnv::process(),
    };

    let store = open_store(args.sqlite).await?;
    let service = keyledger::KeyService::from_config(&config, &env, store)?;
    let identity = config.identity(&env)?;
    if identity.is_empty() {
        tracing::warn!("no sessions configured; every request will be rejected as unauthenticated");
    }

    let state = keyledger::http::KeyledgerHttpState::new(service, Arc::new(identity))
        .with_authorizer(config.authorizer());
    let app = keyledger::http::router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(listen = %args.listen, "keyledger-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "store-sqlite")]
async fn open_store(
    sqlite: Option<PathBuf>,
) -> Result<Arc<dyn keyledger::ProfileStore>, Box<dyn std::error::Error>> {
    match sqlite {
        Some(path) => {
            let store = keyledger::SqliteStore::open(path).await?;
            tracing::info!(path = %store.path().display(), "using sqlite store");
            Ok(Arc::new(store))
        }
        None => Ok(memory_store()),
    }
}

#[cfg(not(feature = "store-sqlite"))]
async fn open_store(
    sqlite: Option<PathBuf>,
) -> Result<Arc<dyn keyledger::ProfileStore>, Box<dyn std::error::Error>> {
    if sqlite.is_some() {
        return Err("--sqlite requires the `store-sqlite` feature".into());
    }
    Ok(memory_store())
}

fn memory_store() -> Arc<dyn keyledger::ProfileStore> {
    tracing::warn!("no --sqlite path given; keys and usage are kept in memory and lost on exit");
    Arc::new(keyledger::MemoryStore::new())
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
