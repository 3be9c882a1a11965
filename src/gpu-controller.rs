use gpupool::admission::{server, Webhooks};
use gpupool::config::Config;
use gpupool::controller;
use gpupool::moduleconfig::SettingsStore;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG; defaults to info for our own crates.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));
    let client = kube::Client::try_default().await?;
    let settings = SettingsStore::default();

    info!(workers = config.workers, "starting the GPU control plane");
    let webhooks = Webhooks::new(client.clone(), settings.clone());
    let webhook_server = server::start(webhooks, &config.server_config);
    let reconciler = controller::start(client, settings, &config);

    // Both run forever; whichever returns first carries the error that
    // brings the process down. A signal wins over both.
    tokio::select! {
        result = webhook_server => result,
        result = reconciler => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    }
}
