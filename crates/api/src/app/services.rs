use std::sync::Arc;

use tracing::{info, warn};

use backfill_infra::EngineConfig;
use backfill_infra::JobHost;
use backfill_infra::checkpoint_store::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
use backfill_infra::collaborators::{InMemoryBlobStore, InMemoryCatalog, InMemoryIndexStore};

/// Build the job host described by `config`.
///
/// Checkpoints go to Postgres when `DATABASE_URL` is set. Catalog, blob and
/// index collaborators are the in-process adapters.
pub async fn build_host(config: &EngineConfig) -> anyhow::Result<JobHost> {
    let store: Arc<dyn CheckpointStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresCheckpointStore::connect(url).await?;
            store.migrate().await?;
            info!("using Postgres checkpoint store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; checkpoints are kept in memory");
            InMemoryCheckpointStore::arc()
        }
    };

    let host = JobHost::from_config(
        config,
        store,
        InMemoryCatalog::arc(),
        InMemoryBlobStore::arc(),
        InMemoryIndexStore::arc(),
    )?;
    info!(kinds = ?host.registry().names(), "job host ready");
    Ok(host)
}
