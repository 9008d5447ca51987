//! In-memory collaborators for tests, benchmarks and local runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use backfill_core::{JobUnit, RecordIdentifier, RecordStatus, WatermarkRange};

use super::{BlobStore, CollaboratorError, IndexStore, Metadata, VersionedRecord, WatermarkCatalog};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

/// Injected failure for calls touching one watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call is rejected.
    Permanent,
    /// The next `n` calls report the store as unavailable.
    Transient(u32),
}

#[derive(Debug, Default)]
struct Faults(Mutex<HashMap<u64, Fault>>);

impl Faults {
    fn inject(&self, watermark: u64, fault: Fault) {
        self.0
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(watermark, fault);
    }

    fn check(&self, watermark: u64, store: &str) -> Result<(), CollaboratorError> {
        let mut faults = self.0.lock().unwrap_or_else(|p| p.into_inner());
        match faults.get_mut(&watermark) {
            None | Some(Fault::Transient(0)) => Ok(()),
            Some(Fault::Permanent) => Err(CollaboratorError::Rejected(format!(
                "{store} refused watermark {watermark}"
            ))),
            Some(Fault::Transient(left)) => {
                *left -= 1;
                Err(CollaboratorError::unavailable(store))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CatalogEntry {
    record: RecordIdentifier,
    status: RecordStatus,
}

#[derive(Debug, Default)]
struct CatalogState {
    entries: BTreeMap<u64, CatalogEntry>,
    last_watermark: u64,
    reservations: HashMap<JobUnit, Vec<VersionedRecord>>,
}

impl CatalogState {
    fn unit_records(&self, unit: &JobUnit) -> Vec<RecordIdentifier> {
        self.entries
            .values()
            .filter(|e| e.record.study_uid == unit.as_str() && e.status == RecordStatus::Created)
            .map(|e| e.record.clone())
            .collect()
    }
}

/// Catalog that assigns watermarks sequentially from 1.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, study: &str, series: &str, instance: &str) -> RecordIdentifier {
        self.insert_with_status(study, series, instance, RecordStatus::Created)
    }

    pub fn insert_with_status(
        &self,
        study: &str,
        series: &str,
        instance: &str,
        status: RecordStatus,
    ) -> RecordIdentifier {
        let mut state = write(&self.state);
        state.last_watermark += 1;
        let record = RecordIdentifier::new(study, series, instance, state.last_watermark);
        state.entries.insert(
            record.watermark,
            CatalogEntry {
                record: record.clone(),
                status,
            },
        );
        record
    }

    /// Insert `studies` studies of `instances_per_study` instances each
    /// (one series per study).
    pub fn seed(&self, studies: usize, instances_per_study: usize) -> Vec<RecordIdentifier> {
        let mut records = Vec::with_capacity(studies * instances_per_study);
        for s in 1..=studies {
            let study = format!("1.2.840.{s}");
            let series = format!("{study}.1");
            for i in 1..=instances_per_study {
                records.push(self.insert(&study, &series, &format!("{series}.{i}")));
            }
        }
        records
    }

    /// Current records in watermark order.
    pub fn records(&self) -> Vec<RecordIdentifier> {
        read(&self.state)
            .entries
            .values()
            .map(|e| e.record.clone())
            .collect()
    }
}

#[async_trait]
impl WatermarkCatalog for InMemoryCatalog {
    async fn get_pending_batches(
        &self,
        size: u64,
        max_parallel: usize,
        status: RecordStatus,
        upper_bound: Option<u64>,
    ) -> Result<Vec<WatermarkRange>, CollaboratorError> {
        let state = read(&self.state);
        let watermarks: Vec<u64> = state
            .entries
            .range(..=upper_bound.unwrap_or(u64::MAX))
            .rev()
            .filter(|(_, e)| e.status == status)
            .map(|(w, _)| *w)
            .collect();

        let chunk = usize::try_from(size).unwrap_or(usize::MAX).max(1);
        Ok(watermarks
            .chunks(chunk)
            .take(max_parallel)
            .filter_map(|batch| {
                let (highest, lowest) = (batch.first()?, batch.last()?);
                WatermarkRange::new(*lowest, *highest).ok()
            })
            .collect())
    }

    async fn get_units_in_range(
        &self,
        range: WatermarkRange,
    ) -> Result<Vec<RecordIdentifier>, CollaboratorError> {
        Ok(read(&self.state)
            .entries
            .range(range.start()..=range.end())
            .map(|(_, e)| e.record.clone())
            .collect())
    }

    async fn max_watermark(&self) -> Result<Option<u64>, CollaboratorError> {
        Ok(read(&self.state).entries.keys().next_back().copied())
    }

    async fn get_unit_records(&self, unit: &JobUnit) -> Result<Vec<RecordIdentifier>, CollaboratorError> {
        Ok(read(&self.state).unit_records(unit))
    }

    async fn pending_update(&self, unit: &JobUnit) -> Result<Option<Vec<VersionedRecord>>, CollaboratorError> {
        Ok(read(&self.state).reservations.get(unit).cloned())
    }

    async fn begin_update(&self, unit: &JobUnit) -> Result<Vec<VersionedRecord>, CollaboratorError> {
        let mut state = write(&self.state);
        if let Some(existing) = state.reservations.get(unit) {
            return Ok(existing.clone());
        }

        let records = state.unit_records(unit);
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut reserved = Vec::with_capacity(records.len());
        for record in records {
            state.last_watermark += 1;
            reserved.push(VersionedRecord {
                record,
                new_watermark: state.last_watermark,
            });
        }
        state.reservations.insert(unit.clone(), reserved.clone());
        Ok(reserved)
    }

    async fn end_update(&self, unit: &JobUnit) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        let Some(reserved) = state.reservations.remove(unit) else {
            return Ok(());
        };
        for versioned in reserved {
            let previous = state.entries.remove(&versioned.record.watermark);
            let status = previous.map(|e| e.status).unwrap_or_default();
            let mut record = versioned.record;
            record.watermark = versioned.new_watermark;
            state
                .entries
                .insert(versioned.new_watermark, CatalogEntry { record, status });
        }
        Ok(())
    }

    async fn abandon_update(&self, unit: &JobUnit) -> Result<(), CollaboratorError> {
        write(&self.state).reservations.remove(unit);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blob store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BlobState {
    frames: BTreeMap<u64, String>,
    metadata: HashMap<(String, u64), Metadata>,
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    state: RwLock<BlobState>,
    faults: Faults,
    frame_copies: AtomicU64,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Fail calls for the record stored under `watermark`.
    pub fn inject_fault(&self, watermark: u64, fault: Fault) {
        self.faults.inject(watermark, fault);
    }

    pub fn put_metadata(&self, instance_uid: &str, watermark: u64, metadata: Metadata) {
        write(&self.state)
            .metadata
            .insert((instance_uid.to_string(), watermark), metadata);
    }

    pub fn metadata(&self, instance_uid: &str, watermark: u64) -> Option<Metadata> {
        read(&self.state)
            .metadata
            .get(&(instance_uid.to_string(), watermark))
            .cloned()
    }

    /// Every stored metadata version of one instance, ascending.
    pub fn metadata_versions(&self, instance_uid: &str) -> Vec<u64> {
        let mut versions: Vec<u64> = read(&self.state)
            .metadata
            .keys()
            .filter(|(uid, _)| uid == instance_uid)
            .map(|(_, w)| *w)
            .collect();
        versions.sort_unstable();
        versions
    }

    /// Watermarks whose frames live in the current layout.
    pub fn migrated_frames(&self) -> Vec<u64> {
        read(&self.state).frames.keys().copied().collect()
    }

    /// Successful `copy_frames` calls, including repeats.
    pub fn frame_copies(&self) -> u64 {
        self.frame_copies.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn copy_frames(&self, record: &RecordIdentifier) -> Result<(), CollaboratorError> {
        self.faults.check(record.watermark, "blob store")?;
        write(&self.state)
            .frames
            .insert(record.watermark, record.instance_uid.clone());
        self.frame_copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_metadata(
        &self,
        instance_uid: &str,
        watermark: u64,
    ) -> Result<Metadata, CollaboratorError> {
        self.faults.check(watermark, "blob store")?;
        self.metadata(instance_uid, watermark)
            .ok_or_else(|| CollaboratorError::NotFound(format!("metadata {instance_uid}@{watermark}")))
    }

    async fn write_metadata(
        &self,
        instance_uid: &str,
        watermark: u64,
        metadata: Metadata,
    ) -> Result<(), CollaboratorError> {
        self.put_metadata(instance_uid, watermark, metadata);
        Ok(())
    }

    async fn delete_metadata(&self, instance_uid: &str, watermark: u64) -> Result<(), CollaboratorError> {
        write(&self.state)
            .metadata
            .remove(&(instance_uid.to_string(), watermark));
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Index store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct IndexState {
    values: BTreeMap<u64, BTreeSet<String>>,
    completed: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
pub struct InMemoryIndexStore {
    state: RwLock<IndexState>,
    faults: Faults,
    writes: AtomicU64,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn inject_fault(&self, watermark: u64, fault: Fault) {
        self.faults.inject(watermark, fault);
    }

    /// Indexed tag keys per watermark.
    pub fn indexed(&self) -> BTreeMap<u64, BTreeSet<String>> {
        read(&self.state).values.clone()
    }

    pub fn completed_tag_sets(&self) -> Vec<Vec<String>> {
        read(&self.state).completed.clone()
    }

    /// Successful `index_tags` calls, including repeats.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn index_tags(&self, record: &RecordIdentifier, tags: &[String]) -> Result<(), CollaboratorError> {
        self.faults.check(record.watermark, "index store")?;
        write(&self.state)
            .values
            .entry(record.watermark)
            .or_default()
            .extend(tags.iter().cloned());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn mark_reindex_complete(&self, tags: &[String]) -> Result<(), CollaboratorError> {
        let mut state = write(&self.state);
        if !state.completed.iter().any(|done| done == tags) {
            state.completed.push(tags.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> WatermarkRange {
        WatermarkRange::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn pending_batches_follow_the_records_downward() {
        let catalog = InMemoryCatalog::new();
        catalog.seed(1, 7);
        catalog.insert_with_status("9.9", "9.9.1", "9.9.1.1", RecordStatus::Creating);

        let batches = catalog
            .get_pending_batches(3, 5, RecordStatus::Created, None)
            .await
            .unwrap();
        assert_eq!(batches, vec![range(5, 7), range(2, 4), range(1, 1)]);

        let capped = catalog
            .get_pending_batches(2, 1, RecordStatus::Created, Some(4))
            .await
            .unwrap();
        assert_eq!(capped, vec![range(3, 4)]);
    }

    #[tokio::test]
    async fn update_reservations_are_stable_until_ended() {
        let catalog = InMemoryCatalog::new();
        catalog.seed(2, 2);
        let study = JobUnit::new("1.2.840.1");

        let first = catalog.begin_update(&study).await.unwrap();
        let again = catalog.begin_update(&study).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(
            first.iter().map(|v| v.new_watermark).collect::<Vec<_>>(),
            vec![5, 6]
        );

        catalog.end_update(&study).await.unwrap();
        catalog.end_update(&study).await.unwrap();
        assert_eq!(catalog.pending_update(&study).await.unwrap(), None);
        let watermarks: Vec<u64> = catalog.records().iter().map(|r| r.watermark).collect();
        assert_eq!(watermarks, vec![3, 4, 5, 6]);
        assert_eq!(catalog.max_watermark().await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn looking_up_a_reservation_does_not_create_one() {
        let catalog = InMemoryCatalog::new();
        catalog.seed(1, 3);
        let study = JobUnit::new("1.2.840.1");

        assert_eq!(catalog.pending_update(&study).await.unwrap(), None);
        assert_eq!(catalog.get_unit_records(&study).await.unwrap().len(), 3);

        let reserved = catalog.begin_update(&study).await.unwrap();
        assert_eq!(catalog.pending_update(&study).await.unwrap(), Some(reserved));

        catalog.abandon_update(&study).await.unwrap();
        assert_eq!(catalog.pending_update(&study).await.unwrap(), None);
        assert_eq!(catalog.max_watermark().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn transient_faults_wear_off() {
        let blobs = InMemoryBlobStore::new();
        let record = RecordIdentifier::new("1", "1.1", "1.1.1", 4);
        blobs.inject_fault(4, Fault::Transient(2));

        assert!(matches!(
            blobs.copy_frames(&record).await,
            Err(CollaboratorError::Unavailable(_))
        ));
        assert!(blobs.copy_frames(&record).await.is_err());
        blobs.copy_frames(&record).await.unwrap();
        blobs.copy_frames(&record).await.unwrap();

        assert_eq!(blobs.migrated_frames(), vec![4]);
        assert_eq!(blobs.frame_copies(), 2);
    }

    #[tokio::test]
    async fn completing_a_tag_set_twice_records_it_once() {
        let index = InMemoryIndexStore::new();
        let tags = vec!["00101010".to_string()];
        index.mark_reindex_complete(&tags).await.unwrap();
        index.mark_reindex_complete(&tags).await.unwrap();
        assert_eq!(index.completed_tag_sets(), vec![tags]);
    }
}
