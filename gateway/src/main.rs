mod accept;
mod checkpoint_handler;
mod client_stream;
mod config;
mod ipc_client;
mod orchestrator;
mod upstream;
mod usage_handler;

use std::sync::Arc;

use tracing::error;
use tracing_subscriber::FmtSubscriber;

use config::GatewayConfig;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to install tracing subscriber");

    let config = match GatewayConfig::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = accept::run(config).await {
        error!("gateway accept loop terminated: {e}");
        std::process::exit(1);
    }
}
