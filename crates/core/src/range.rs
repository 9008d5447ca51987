//! Inclusive watermark ranges.
//!
//! A watermark is the monotonically increasing version number the catalog
//! assigns to every stored record. Batch jobs iterate over slices of that
//! version space; a [`WatermarkRange`] is one such slice.
//!
//! Empty ranges are not representable: "nothing left" is
//! `Option::<WatermarkRange>::None`.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Contiguous, inclusive `[start, end]` slice of the watermark space.
///
/// Invariant: `1 <= start <= end`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RangeRepr", into = "RangeRepr")]
pub struct WatermarkRange {
    start: u64,
    end: u64,
}

#[derive(Serialize, Deserialize)]
struct RangeRepr {
    start: u64,
    end: u64,
}

impl TryFrom<RangeRepr> for WatermarkRange {
    type Error = ConfigurationError;

    fn try_from(value: RangeRepr) -> Result<Self, Self::Error> {
        WatermarkRange::new(value.start, value.end)
    }
}

impl From<WatermarkRange> for RangeRepr {
    fn from(value: WatermarkRange) -> Self {
        Self {
            start: value.start,
            end: value.end,
        }
    }
}

impl WatermarkRange {
    pub fn new(start: u64, end: u64) -> Result<Self, ConfigurationError> {
        if start == 0 {
            return Err(ConfigurationError::new(
                "range",
                "watermarks start at 1",
            ));
        }
        if start > end {
            return Err(ConfigurationError::new(
                "range",
                format!("start {start} is greater than end {end}"),
            ));
        }
        Ok(Self { start, end })
    }

    pub(crate) fn from_bounds(start: u64, end: u64) -> Self {
        debug_assert!(start >= 1 && start <= end, "invalid range [{start}, {end}]");
        Self { start, end }
    }

    /// `[1, ceiling]`, or `None` when the ceiling is 0 (nothing stored yet).
    pub fn up_to(ceiling: u64) -> Option<Self> {
        (ceiling >= 1).then_some(Self {
            start: 1,
            end: ceiling,
        })
    }

    pub fn single(watermark: u64) -> Result<Self, ConfigurationError> {
        Self::new(watermark, watermark)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of watermarks covered (never zero).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, watermark: u64) -> bool {
        (self.start..=self.end).contains(&watermark)
    }

    pub fn is_disjoint(&self, other: &WatermarkRange) -> bool {
        self.end < other.start || other.end < self.start
    }

    pub fn intersect(&self, other: &WatermarkRange) -> Option<WatermarkRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(Self { start, end })
    }

    /// The part of this range strictly below `watermark`.
    pub fn below(&self, watermark: u64) -> Option<WatermarkRange> {
        if watermark <= self.start {
            return None;
        }
        Some(Self {
            start: self.start,
            end: self.end.min(watermark - 1),
        })
    }

    /// The part of this range strictly above `watermark`.
    pub fn above(&self, watermark: u64) -> Option<WatermarkRange> {
        if watermark >= self.end {
            return None;
        }
        Some(Self {
            start: self.start.max(watermark + 1),
            end: self.end,
        })
    }

    pub fn iter(&self) -> core::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl core::fmt::Display for WatermarkRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> WatermarkRange {
        WatermarkRange::new(start, end).unwrap()
    }

    #[test]
    fn rejects_inverted_and_zero_ranges() {
        assert!(WatermarkRange::new(5, 4).is_err());
        assert!(WatermarkRange::new(0, 4).is_err());
        assert!(WatermarkRange::new(4, 4).is_ok());
    }

    #[test]
    fn up_to_zero_is_empty() {
        assert_eq!(WatermarkRange::up_to(0), None);
        assert_eq!(WatermarkRange::up_to(3), Some(range(1, 3)));
    }

    #[test]
    fn below_and_above_clip() {
        let r = range(10, 20);
        assert_eq!(r.below(15), Some(range(10, 14)));
        assert_eq!(r.below(10), None);
        assert_eq!(r.below(99), Some(r));
        assert_eq!(r.above(15), Some(range(16, 20)));
        assert_eq!(r.above(20), None);
        assert_eq!(r.above(1), Some(r));
    }

    #[test]
    fn intersection_and_disjointness() {
        assert_eq!(range(1, 10).intersect(&range(5, 15)), Some(range(5, 10)));
        assert_eq!(range(1, 4).intersect(&range(5, 15)), None);
        assert!(range(1, 4).is_disjoint(&range(5, 15)));
        assert!(!range(1, 5).is_disjoint(&range(5, 15)));
    }

    #[test]
    fn deserializing_an_inverted_range_fails() {
        let err = serde_json::from_str::<WatermarkRange>(r#"{"start":9,"end":3}"#);
        assert!(err.is_err());

        let ok: WatermarkRange = serde_json::from_str(r#"{"start":3,"end":9}"#).unwrap();
        assert_eq!(ok.len(), 7);
    }
}
