//! External collaborators the engine reads ranges from and mutates through.
//!
//! The engine owns none of this state. Every mutation here must be safe to
//! repeat for the same input, because an interrupted wave is re-attempted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use backfill_core::{JobUnit, RecordIdentifier, RecordStatus, WatermarkRange};

use crate::retry::Retryable;

pub mod memory;

pub use memory::{Fault, InMemoryBlobStore, InMemoryCatalog, InMemoryIndexStore};

/// Instance metadata as stored in a blob.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("{0} unavailable")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    pub fn unavailable(what: impl Into<String>) -> Self {
        Self::Unavailable(what.into())
    }
}

impl Retryable for CollaboratorError {
    fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable(_))
    }
}

/// A record reserved for rewriting under a new watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub record: RecordIdentifier,
    pub new_watermark: u64,
}

/// The catalog that assigns watermarks and tracks record state.
#[async_trait]
pub trait WatermarkCatalog: Send + Sync {
    /// Up to `max_parallel` ranges, highest first, each spanning at most
    /// `size` records with `status` at or below `upper_bound`.
    async fn get_pending_batches(
        &self,
        size: u64,
        max_parallel: usize,
        status: RecordStatus,
        upper_bound: Option<u64>,
    ) -> Result<Vec<WatermarkRange>, CollaboratorError>;

    /// The records behind one batch, in watermark order.
    async fn get_units_in_range(
        &self,
        range: WatermarkRange,
    ) -> Result<Vec<RecordIdentifier>, CollaboratorError>;

    /// Highest watermark currently assigned, if any.
    async fn max_watermark(&self) -> Result<Option<u64>, CollaboratorError>;

    /// Current records of `unit`, in watermark order.
    async fn get_unit_records(&self, unit: &JobUnit) -> Result<Vec<RecordIdentifier>, CollaboratorError>;

    /// The open reservation for `unit`, without creating one.
    async fn pending_update(&self, unit: &JobUnit) -> Result<Option<Vec<VersionedRecord>>, CollaboratorError>;

    /// Reserve new watermarks for every record of `unit`. Repeated calls
    /// return the same reservation until it is ended or abandoned.
    async fn begin_update(&self, unit: &JobUnit) -> Result<Vec<VersionedRecord>, CollaboratorError>;

    /// Make the reserved versions current.
    async fn end_update(&self, unit: &JobUnit) -> Result<(), CollaboratorError>;

    /// Drop a reservation without publishing it.
    async fn abandon_update(&self, unit: &JobUnit) -> Result<(), CollaboratorError>;
}

/// Blob storage for frames and metadata documents.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Copy a record's frame data into the current storage layout.
    async fn copy_frames(&self, record: &RecordIdentifier) -> Result<(), CollaboratorError>;

    async fn read_metadata(
        &self,
        instance_uid: &str,
        watermark: u64,
    ) -> Result<Metadata, CollaboratorError>;

    /// Overwrites any existing document for the same version.
    async fn write_metadata(
        &self,
        instance_uid: &str,
        watermark: u64,
        metadata: Metadata,
    ) -> Result<(), CollaboratorError>;

    /// Succeeds when the document is already gone.
    async fn delete_metadata(&self, instance_uid: &str, watermark: u64) -> Result<(), CollaboratorError>;
}

/// Search index over record attributes.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Upsert the values of `tags` for one record.
    async fn index_tags(&self, record: &RecordIdentifier, tags: &[String]) -> Result<(), CollaboratorError>;

    /// Flag `tags` as fully indexed and searchable.
    async fn mark_reindex_complete(&self, tags: &[String]) -> Result<(), CollaboratorError>;
}
