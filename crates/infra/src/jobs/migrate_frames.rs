//! Copy frame data of every record into the current storage layout.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use backfill_core::{BatchTarget, ConfigurationError};

use super::{JobKind, WorkMode, for_each_record};
use crate::activity::{ActivityError, BatchActivity};
use crate::collaborators::{BlobStore, WatermarkCatalog};
use crate::stream::StreamOptions;

pub struct MigrateFramesKind {
    catalog: Arc<dyn WatermarkCatalog>,
    blobs: Arc<dyn BlobStore>,
    stream: StreamOptions,
}

impl MigrateFramesKind {
    pub fn new(catalog: Arc<dyn WatermarkCatalog>, blobs: Arc<dyn BlobStore>, stream: StreamOptions) -> Self {
        Self {
            catalog,
            blobs,
            stream,
        }
    }
}

impl JobKind for MigrateFramesKind {
    fn name(&self) -> &'static str {
        "migrate_frames"
    }

    fn mode(&self) -> WorkMode {
        WorkMode::Range
    }

    fn activity(&self, _params: &serde_json::Value) -> Result<Arc<dyn BatchActivity>, ConfigurationError> {
        Ok(Arc::new(MigrateFramesActivity {
            catalog: Arc::clone(&self.catalog),
            blobs: Arc::clone(&self.blobs),
            stream: self.stream,
        }))
    }
}

pub struct MigrateFramesActivity {
    catalog: Arc<dyn WatermarkCatalog>,
    blobs: Arc<dyn BlobStore>,
    stream: StreamOptions,
}

#[async_trait]
impl BatchActivity for MigrateFramesActivity {
    fn name(&self) -> &str {
        "migrate_frames"
    }

    async fn process(&self, target: &BatchTarget, cancel: CancellationToken) -> Result<u64, ActivityError> {
        let range = target
            .as_range()
            .ok_or_else(|| ActivityError::permanent(format!("migrate_frames cannot process {target}")))?;
        let records = self.catalog.get_units_in_range(*range).await?;

        let blobs = Arc::clone(&self.blobs);
        for_each_record(records, self.stream, cancel, move |record, _cancel| {
            let blobs = Arc::clone(&blobs);
            async move {
                blobs.copy_frames(&record).await?;
                Ok::<_, ActivityError>(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_core::WatermarkRange;

    use crate::collaborators::{Fault, InMemoryBlobStore, InMemoryCatalog};

    #[tokio::test]
    async fn copies_each_record_of_the_range() {
        let catalog = InMemoryCatalog::arc();
        catalog.seed(1, 6);
        let blobs = InMemoryBlobStore::arc();
        let activity = MigrateFramesKind::new(catalog, blobs.clone(), StreamOptions::default())
            .activity(&serde_json::Value::Null)
            .unwrap();

        let processed = activity
            .process(&BatchTarget::range(WatermarkRange::new(2, 5).unwrap()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(processed, 4);
        assert_eq!(blobs.migrated_frames(), vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn unavailable_storage_is_transient() {
        let catalog = InMemoryCatalog::arc();
        catalog.seed(1, 3);
        let blobs = InMemoryBlobStore::arc();
        blobs.inject_fault(3, Fault::Transient(1));
        let activity = MigrateFramesKind::new(catalog, blobs.clone(), StreamOptions::new(1, 1).unwrap())
            .activity(&serde_json::Value::Null)
            .unwrap();
        let target = BatchTarget::range(WatermarkRange::new(1, 3).unwrap());

        let first = activity.process(&target, CancellationToken::new()).await;
        assert!(matches!(first, Err(ActivityError::Transient(_))));

        let second = activity.process(&target, CancellationToken::new()).await.unwrap();
        assert_eq!(second, 3);
        assert_eq!(blobs.migrated_frames(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unit_targets_are_rejected() {
        let activity = MigrateFramesKind::new(
            InMemoryCatalog::arc(),
            InMemoryBlobStore::arc(),
            StreamOptions::default(),
        )
        .activity(&serde_json::Value::Null)
        .unwrap();

        let err = activity
            .process(&BatchTarget::unit(backfill_core::JobUnit::new("1.2")), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Permanent(_)));
    }
}
