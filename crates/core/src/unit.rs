//! Units of iteration: watermark ranges, entities, and the records behind them.

use serde::{Deserialize, Serialize};

use crate::range::WatermarkRange;

/// Opaque identifier of an entity a list-mode job iterates over (e.g. a study).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUnit(String);

impl JobUnit {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobUnit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What one batch activity operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchTarget {
    Range { range: WatermarkRange },
    Unit { unit: JobUnit },
}

impl BatchTarget {
    pub fn range(range: WatermarkRange) -> Self {
        Self::Range { range }
    }

    pub fn unit(unit: JobUnit) -> Self {
        Self::Unit { unit }
    }

    pub fn as_range(&self) -> Option<&WatermarkRange> {
        match self {
            BatchTarget::Range { range } => Some(range),
            BatchTarget::Unit { .. } => None,
        }
    }

    pub fn as_unit(&self) -> Option<&JobUnit> {
        match self {
            BatchTarget::Unit { unit } => Some(unit),
            BatchTarget::Range { .. } => None,
        }
    }
}

impl core::fmt::Display for BatchTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BatchTarget::Range { range } => write!(f, "range {range}"),
            BatchTarget::Unit { unit } => write!(f, "unit {unit}"),
        }
    }
}

/// Lifecycle state of a catalog record, used to filter pending batches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Ingestion still in progress.
    Creating,
    /// Fully stored and visible.
    #[default]
    Created,
}

/// Identity of one stored record (a single imaging instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordIdentifier {
    pub study_uid: String,
    pub series_uid: String,
    pub instance_uid: String,
    pub watermark: u64,
}

impl RecordIdentifier {
    pub fn new(
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        instance_uid: impl Into<String>,
        watermark: u64,
    ) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            instance_uid: instance_uid.into(),
            watermark,
        }
    }
}

impl core::fmt::Display for RecordIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.study_uid, self.series_uid, self.instance_uid, self.watermark
        )
    }
}
