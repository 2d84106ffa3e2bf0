use anyhow::Context;
use shutterhub::{config::HubConfig, context::AppContext, jobs, server};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shutterhub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Shutterhub v{}", env!("CARGO_PKG_VERSION"));

    let config = HubConfig::from_env().context("Failed to load configuration")?;

    let ctx = AppContext::new(config)
        .await
        .context("Failed to initialize application context")?;
    let ctx = Arc::new(ctx);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    server::serve((*ctx).clone())
        .await
        .context("HTTP server stopped")?;

    Ok(())
}
