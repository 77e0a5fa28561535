use campaign_relay::{config::load_config, create_app, logging};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    logging::init(&config.logging);

    let (state, app) = create_app().await?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "campaign-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let grace = Duration::from_secs(state.engine.config.poller.shutdown_grace_seconds);
    state.engine.tasks.shutdown(grace).await;
    info!("campaign-relay stopped");
    Ok(())
}
