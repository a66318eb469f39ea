use std::sync::Arc;

use device_gateway::{build_client, serve, shutdown_signal, Config, Gateway, ServerState};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE_PATH: &str = "./Config.yml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| CONFIG_FILE_PATH.to_owned());

    let config = Config::load_from_file(&config_path)
        .and_then(|c| c.into_runtime())
        .unwrap_or_else(|e| {
            error!(path = %config_path, error = %e, "fatal: invalid configuration");
            std::process::exit(1);
        });
    let config = Arc::new(config);

    let client = build_client(&config);
    let gateway = Gateway::new(Arc::clone(&config), client).unwrap_or_else(|e| {
        error!(error = %e, "fatal: failed to build gateway");
        std::process::exit(1);
    });

    let listener = TcpListener::bind(config.listen).await.unwrap_or_else(|e| {
        error!(addr = %config.listen, error = %e, "fatal: failed to bind listener");
        std::process::exit(1);
    });

    info!(
        addr = %config.listen,
        target = %config.target_url,
        timeout_ms = config.response_timeout.as_millis() as u64,
        "listening"
    );

    serve(listener, ServerState::new(Arc::new(gateway)), shutdown_signal()).await;
}
