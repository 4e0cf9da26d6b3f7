use anyhow::Context;
use roomcast::config::Config;
use roomcast::hooks::Hooks;
use roomcast::service::Service;
use roomcast::telemetry;
use roomcast::transport::MemoryTransport;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {path}"))?,
        None => Config::default(),
    };

    let transport = Arc::new(MemoryTransport::new());
    let service = Service::start(config, transport, Hooks::default())
        .await
        .context("starting service")?;
    info!(instance = service.instance(), "roomcastd up");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    service.close().await.context("closing service")?;
    Ok(())
}
