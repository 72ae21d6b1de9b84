/// Datastore Server — owns the encrypted relational file and serves the
/// Gateway's IPC requests: authentication, credit accounting, session
/// load/save, and conversation checkpointing.
///
/// Usage: datastore
/// Configuration is read entirely from the environment (§6): DB_PATH,
/// DB_ENCRYPTION_KEY, ZMQ_SOCKET_PATH, and optionally ZMQ_TIMEOUT_MS,
/// OPENAI_API_KEY, GEMINI_API_KEY.
mod config;
mod db;
mod ipc_server;
mod migrator;
mod service;

use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use config::DatastoreConfig;
use db::Db;
use service::{BusinessService, NullSummarizer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cfg = match DatastoreConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!("datastore starting");
    info!("  DB_PATH: {}", cfg.db_path);
    info!("  ZMQ_SOCKET_PATH: {}", cfg.socket_path);

    let db = Db::open(&cfg.db_path, &cfg.db_encryption_key)?;
    let service = Arc::new(BusinessService::new(db, Arc::new(NullSummarizer)));

    ipc_server::run(&cfg.socket_path, cfg.high_water_mark, service).await?;

    Ok(())
}
