use backfill_infra::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    backfill_observability::init();

    let config = EngineConfig::from_env()?;
    let host = backfill_api::app::services::build_host(&config).await?;

    let resumed = host.resume_all().await?;
    if !resumed.is_empty() {
        tracing::info!(jobs = resumed.len(), "resumed jobs left running by a previous host");
    }

    let app = backfill_api::app::build_app(host.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Interrupted jobs stay Running and resume on the next start.
    host.shutdown().await;
    Ok(())
}
