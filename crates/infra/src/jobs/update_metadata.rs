//! Rewrite instance metadata, one study per wave.
//!
//! Each instance gets a new watermark. The updated document is written under
//! the new version and the catalog publishes all versions of the study at
//! once. A study that fails leaves its new-version documents behind;
//! `cleanup` deletes them and drops the reservation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use backfill_core::{BatchTarget, ConfigurationError, JobUnit};

use super::{JobKind, WorkMode, for_each_record, parse_params};
use crate::activity::{ActivityError, BatchActivity};
use crate::collaborators::{BlobStore, Metadata, VersionedRecord, WatermarkCatalog};
use crate::stream::StreamOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMetadataParams {
    /// Attributes to set on every instance of the study.
    pub changes: Metadata,
}

pub struct UpdateMetadataKind {
    catalog: Arc<dyn WatermarkCatalog>,
    blobs: Arc<dyn BlobStore>,
    stream: StreamOptions,
}

impl UpdateMetadataKind {
    pub fn new(catalog: Arc<dyn WatermarkCatalog>, blobs: Arc<dyn BlobStore>, stream: StreamOptions) -> Self {
        Self {
            catalog,
            blobs,
            stream,
        }
    }
}

impl JobKind for UpdateMetadataKind {
    fn name(&self) -> &'static str {
        "update_metadata"
    }

    fn mode(&self) -> WorkMode {
        WorkMode::Units
    }

    fn activity(&self, params: &serde_json::Value) -> Result<Arc<dyn BatchActivity>, ConfigurationError> {
        let params: UpdateMetadataParams = parse_params(params)?;
        if params.changes.is_empty() {
            return Err(ConfigurationError::new("params.changes", "nothing to update"));
        }
        Ok(Arc::new(UpdateMetadataActivity {
            catalog: Arc::clone(&self.catalog),
            blobs: Arc::clone(&self.blobs),
            changes: Arc::new(params.changes),
            stream: self.stream,
        }))
    }
}

pub struct UpdateMetadataActivity {
    catalog: Arc<dyn WatermarkCatalog>,
    blobs: Arc<dyn BlobStore>,
    changes: Arc<Metadata>,
    stream: StreamOptions,
}

impl UpdateMetadataActivity {
    fn study<'a>(&self, target: &'a BatchTarget) -> Result<&'a JobUnit, ActivityError> {
        target
            .as_unit()
            .ok_or_else(|| ActivityError::permanent(format!("update_metadata cannot process {target}")))
    }

    /// Record count of `study` when its current documents already carry the
    /// changes.
    async fn already_applied(&self, study: &JobUnit) -> Result<Option<u64>, ActivityError> {
        let records = self.catalog.get_unit_records(study).await?;
        for record in &records {
            let metadata = self.blobs.read_metadata(&record.instance_uid, record.watermark).await?;
            if self.changes.iter().any(|(k, v)| metadata.get(k) != Some(v)) {
                return Ok(None);
            }
        }
        Ok(Some(records.len() as u64))
    }
}

#[async_trait]
impl BatchActivity for UpdateMetadataActivity {
    fn name(&self) -> &str {
        "update_metadata"
    }

    async fn process(&self, target: &BatchTarget, cancel: CancellationToken) -> Result<u64, ActivityError> {
        let study = self.study(target)?;
        let reserved = match self.catalog.pending_update(study).await? {
            Some(reserved) => reserved,
            None => {
                if let Some(records) = self.already_applied(study).await? {
                    debug!(study = %study, records, "study already up to date");
                    return Ok(records);
                }
                self.catalog.begin_update(study).await?
            }
        };

        let blobs = Arc::clone(&self.blobs);
        let changes = Arc::clone(&self.changes);
        let processed = for_each_record(reserved, self.stream, cancel, move |versioned: VersionedRecord, _cancel| {
            let blobs = Arc::clone(&blobs);
            let changes = Arc::clone(&changes);
            async move {
                let record = &versioned.record;
                let mut metadata = blobs.read_metadata(&record.instance_uid, record.watermark).await?;
                metadata.extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
                blobs
                    .write_metadata(&record.instance_uid, versioned.new_watermark, metadata)
                    .await?;
                Ok::<_, ActivityError>(())
            }
        })
        .await?;

        self.catalog.end_update(study).await?;
        Ok(processed)
    }

    async fn cleanup(&self, target: &BatchTarget) -> Result<(), ActivityError> {
        let study = self.study(target)?;
        let Some(reserved) = self.catalog.pending_update(study).await? else {
            return Ok(());
        };
        for versioned in &reserved {
            self.blobs
                .delete_metadata(&versioned.record.instance_uid, versioned.new_watermark)
                .await?;
        }
        self.catalog.abandon_update(study).await?;
        debug!(study = %study, versions = reserved.len(), "new-version metadata removed");
        Ok(())
    }
}
