//! Re-index newly searchable tags across a watermark range.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use backfill_core::{BatchTarget, ConfigurationError};

use super::{JobKind, WorkMode, for_each_record, parse_params};
use crate::activity::{ActivityError, BatchActivity};
use crate::collaborators::{IndexStore, WatermarkCatalog};
use crate::stream::StreamOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexParams {
    /// Tag keys to index, e.g. `"00100010"`.
    pub tags: Vec<String>,
}

pub struct ReindexKind {
    catalog: Arc<dyn WatermarkCatalog>,
    index: Arc<dyn IndexStore>,
    stream: StreamOptions,
}

impl ReindexKind {
    pub fn new(catalog: Arc<dyn WatermarkCatalog>, index: Arc<dyn IndexStore>, stream: StreamOptions) -> Self {
        Self {
            catalog,
            index,
            stream,
        }
    }
}

impl JobKind for ReindexKind {
    fn name(&self) -> &'static str {
        "reindex"
    }

    fn mode(&self) -> WorkMode {
        WorkMode::Range
    }

    fn activity(&self, params: &serde_json::Value) -> Result<Arc<dyn BatchActivity>, ConfigurationError> {
        let params: ReindexParams = parse_params(params)?;
        if params.tags.is_empty() {
            return Err(ConfigurationError::new("params.tags", "at least one tag is required"));
        }
        Ok(Arc::new(ReindexActivity {
            catalog: Arc::clone(&self.catalog),
            index: Arc::clone(&self.index),
            tags: params.tags.into(),
            stream: self.stream,
        }))
    }
}

pub struct ReindexActivity {
    catalog: Arc<dyn WatermarkCatalog>,
    index: Arc<dyn IndexStore>,
    tags: Arc<[String]>,
    stream: StreamOptions,
}

#[async_trait]
impl BatchActivity for ReindexActivity {
    fn name(&self) -> &str {
        "reindex"
    }

    async fn process(&self, target: &BatchTarget, cancel: CancellationToken) -> Result<u64, ActivityError> {
        let range = target
            .as_range()
            .ok_or_else(|| ActivityError::permanent(format!("reindex cannot process {target}")))?;
        let records = self.catalog.get_units_in_range(*range).await?;

        let index = Arc::clone(&self.index);
        let tags = Arc::clone(&self.tags);
        for_each_record(records, self.stream, cancel, move |record, _cancel| {
            let index = Arc::clone(&index);
            let tags = Arc::clone(&tags);
            async move {
                index.index_tags(&record, &tags).await?;
                Ok::<_, ActivityError>(())
            }
        })
        .await
    }

    /// The tag set becomes searchable only once every range was attempted.
    async fn complete(&self, _cancel: CancellationToken) -> Result<(), ActivityError> {
        self.index.mark_reindex_complete(&self.tags).await?;
        Ok(())
    }
}
