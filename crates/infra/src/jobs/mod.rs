//! Concrete batch jobs and the registry that builds them.
//!
//! ## Design
//!
//! - Every job is the same engine parameterized by a [`BatchActivity`]
//!   and a walk direction
//! - A [`JobKind`] rebuilds its activity from persisted parameters, so a
//!   resumed job gets exactly the work it started with
//! - Inside a batch, records are processed through a
//!   [`BoundedParallelStream`]
//!
//! ## Kinds
//!
//! - `reindex`: index new tag keys for every record in a range
//! - `migrate_frames`: copy frame data into the current storage layout
//! - `update_metadata`: rewrite metadata for one study per wave

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use backfill_core::ConfigurationError;

use crate::activity::{ActivityError, BatchActivity};
use crate::collaborators::{BlobStore, IndexStore, WatermarkCatalog};
use crate::stream::{BoundedParallelStream, StreamOptions};

pub mod migrate_frames;
pub mod reindex;
pub mod update_metadata;

pub use migrate_frames::{MigrateFramesActivity, MigrateFramesKind};
pub use reindex::{ReindexActivity, ReindexKind, ReindexParams};
pub use update_metadata::{UpdateMetadataActivity, UpdateMetadataKind, UpdateMetadataParams};

/// Shape of the work a job kind iterates over.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkMode {
    /// Partition a watermark range.
    Range,
    /// Walk a list of entities, one per wave.
    Units,
}

/// Factory for one kind of batch job.
pub trait JobKind: Send + Sync {
    fn name(&self) -> &'static str;

    fn mode(&self) -> WorkMode;

    /// Build the activity for a job from its persisted parameters.
    fn activity(&self, params: &serde_json::Value) -> Result<Arc<dyn BatchActivity>, ConfigurationError>;
}

/// Registered job kinds, by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    kinds: HashMap<&'static str, Arc<dyn JobKind>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind wired to the given collaborators.
    pub fn standard(
        catalog: Arc<dyn WatermarkCatalog>,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn IndexStore>,
        stream: StreamOptions,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReindexKind::new(
            Arc::clone(&catalog),
            index,
            stream,
        )));
        registry.register(Arc::new(MigrateFramesKind::new(
            Arc::clone(&catalog),
            Arc::clone(&blobs),
            stream,
        )));
        registry.register(Arc::new(UpdateMetadataKind::new(catalog, blobs, stream)));
        registry
    }

    pub fn register(&mut self, kind: Arc<dyn JobKind>) {
        self.kinds.insert(kind.name(), kind);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobKind>> {
        self.kinds.get(name).cloned()
    }

    /// Registered kind names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.kinds.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

pub(crate) fn parse_params<P: DeserializeOwned>(params: &serde_json::Value) -> Result<P, ConfigurationError> {
    // A job created without parameters stores JSON null.
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| ConfigurationError::new("params", e.to_string()))
}

/// Run `work` over every item with bounded parallelism, returning how many
/// items succeeded. The first failure fails the whole batch.
pub(crate) async fn for_each_record<T, F, Fut>(
    items: Vec<T>,
    options: StreamOptions,
    cancel: CancellationToken,
    work: F,
) -> Result<u64, ActivityError>
where
    T: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ActivityError>> + Send + 'static,
{
    let mut results = BoundedParallelStream::from_iter(items, work, options, cancel)?;
    let mut processed = 0u64;
    while let Some(result) = results.next().await {
        result?;
        processed += 1;
    }
    Ok(processed)
}
