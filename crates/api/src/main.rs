use std::sync::Arc;

use anyhow::Context;

use storefront_infra::{CoreConfig, Runtime, Services};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    storefront_observability::init();

    let config = CoreConfig::from_env();
    let bind_addr = config.bind_addr.clone();
    let services = Services::from_config(&config).await?;
    let runtime = Arc::new(Runtime::start(config, services, Vec::new()).await?);

    let app = storefront_api::app::build_app(runtime.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    runtime.shutdown().await;
    Ok(())
}
