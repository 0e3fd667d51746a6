//! Distinct-item representations stored on daily summaries.
//!
//! A day's distinct content items are kept either as the exact set of ids or
//! as a HyperLogLog sketch. Both support `union`, which is how range queries
//! rebuild cardinality across days without touching raw page views.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// 14 index bits: 16 384 registers, ~0.8% standard error, 16 KiB per sketch.
const PRECISION: u32 = 14;
const NUM_REGISTERS: usize = 1 << PRECISION;

/// Bias correction for m = 16 384.
const ALPHA: f64 = 0.7213 / (1.0 + 1.079 / NUM_REGISTERS as f64);

#[derive(Clone, PartialEq, Eq)]
pub struct HllSketch {
    registers: Vec<u8>,
}

impl std::fmt::Debug for HllSketch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HllSketch")
            .field("cardinality", &self.cardinality())
            .finish()
    }
}

impl Default for HllSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl HllSketch {
    pub fn new() -> Self {
        Self {
            registers: vec![0u8; NUM_REGISTERS],
        }
    }

    pub fn add(&mut self, item: &str) {
        let hash = hash_to_u64(item);
        let index = (hash >> (64 - PRECISION)) as usize;
        // Force a set bit so rho is bounded for all-zero suffixes.
        let remaining = (hash << PRECISION) | (1 << (PRECISION - 1));
        let rho = remaining.leading_zeros() as u8 + 1;
        if rho > self.registers[index] {
            self.registers[index] = rho;
        }
    }

    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a str>) -> Self {
        let mut sketch = Self::new();
        for item in items {
            sketch.add(item);
        }
        sketch
    }

    /// Register-wise max; the sketch of the union of both input sets.
    pub fn merge(&mut self, other: &HllSketch) {
        for (mine, theirs) in self.registers.iter_mut().zip(&other.registers) {
            if *theirs > *mine {
                *mine = *theirs;
            }
        }
    }

    pub fn cardinality(&self) -> u64 {
        let m = NUM_REGISTERS as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2.0_f64.powi(-(r as i32)))
            .sum();
        let raw_estimate = ALPHA * m * m / sum;

        // Linear counting for the small range.
        if raw_estimate <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count() as f64;
            if zeros > 0.0 {
                return (m * (m / zeros).ln()).round() as u64;
            }
        }
        raw_estimate as u64
    }

    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&r| r == 0)
    }

    pub fn to_base64(&self) -> String {
        B64.encode(&self.registers)
    }

    pub fn from_base64(s: &str) -> CoreResult<Self> {
        let bytes = B64.decode(s).map_err(|_| CoreError::InvalidSketch)?;
        if bytes.len() != NUM_REGISTERS {
            return Err(CoreError::InvalidSketch);
        }
        Ok(Self { registers: bytes })
    }
}

fn hash_to_u64(item: &str) -> u64 {
    let digest = Sha256::digest(item.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// The distinct content items seen for one summary row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistinctItems {
    Exact(BTreeSet<String>),
    Sketch(HllSketch),
}

impl DistinctItems {
    pub fn cardinality(&self) -> u64 {
        match self {
            DistinctItems::Exact(ids) => ids.len() as u64,
            DistinctItems::Sketch(sketch) => sketch.cardinality(),
        }
    }

    pub fn is_sketch(&self) -> bool {
        matches!(self, DistinctItems::Sketch(_))
    }

    /// Merge `other` into `self`. Mixing representations is refused: an
    /// exact set cannot absorb a sketch and a sketch must not silently
    /// downgrade an exact set.
    pub fn union(&mut self, other: &DistinctItems) -> CoreResult<()> {
        match (self, other) {
            (DistinctItems::Exact(mine), DistinctItems::Exact(theirs)) => {
                mine.extend(theirs.iter().cloned());
                Ok(())
            }
            (DistinctItems::Sketch(mine), DistinctItems::Sketch(theirs)) => {
                mine.merge(theirs);
                Ok(())
            }
            _ => Err(CoreError::InconsistentSketchState),
        }
    }

    /// Union every representation in `parts`. `None` for an empty input.
    pub fn union_all<'a>(
        parts: impl IntoIterator<Item = &'a DistinctItems>,
    ) -> CoreResult<Option<DistinctItems>> {
        let mut acc: Option<DistinctItems> = None;
        for part in parts {
            match acc.as_mut() {
                None => acc = Some(part.clone()),
                Some(acc) => acc.union(part)?,
            }
        }
        Ok(acc)
    }

    /// Sorted JSON array for exact sets. `None` for sketches.
    pub fn exact_json(&self) -> CoreResult<Option<String>> {
        match self {
            DistinctItems::Exact(ids) => Ok(Some(serde_json::to_string(ids)?)),
            DistinctItems::Sketch(_) => Ok(None),
        }
    }

    pub fn sketch_base64(&self) -> Option<String> {
        match self {
            DistinctItems::Sketch(sketch) => Some(sketch.to_base64()),
            DistinctItems::Exact(_) => None,
        }
    }

    /// Rebuild from the two persisted columns. Exactly one must be present.
    pub fn from_columns(item_ids: Option<&str>, item_sketch: Option<&str>) -> CoreResult<Self> {
        match (item_ids, item_sketch) {
            (Some(json), None) => Ok(DistinctItems::Exact(serde_json::from_str(json)?)),
            (None, Some(b64)) => Ok(DistinctItems::Sketch(HllSketch::from_base64(b64)?)),
            _ => Err(CoreError::InconsistentSketchState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(ids: &[&str]) -> DistinctItems {
        DistinctItems::Exact(ids.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_empty_sketch() {
        let sketch = HllSketch::new();
        assert_eq!(sketch.cardinality(), 0);
        assert!(sketch.is_empty());
    }

    #[test]
    fn test_accuracy_10k() {
        let items: Vec<String> = (0..10_000).map(|i| format!("item_{i}")).collect();
        let sketch = HllSketch::from_items(items.iter().map(String::as_str));
        let error = (sketch.cardinality() as f64 - 10_000.0).abs() / 10_000.0;
        assert!(error < 0.03, "estimate off by {:.2}%", error * 100.0);
    }

    #[test]
    fn test_merge_overlapping_counts_shared_items_once() {
        let a: Vec<String> = (0..3_000).map(|i| format!("item_{i}")).collect();
        let b: Vec<String> = (2_000..5_000).map(|i| format!("item_{i}")).collect();
        let mut merged = HllSketch::from_items(a.iter().map(String::as_str));
        merged.merge(&HllSketch::from_items(b.iter().map(String::as_str)));
        let error = (merged.cardinality() as f64 - 5_000.0).abs() / 5_000.0;
        assert!(error < 0.03, "merged estimate off by {:.2}%", error * 100.0);
    }

    #[test]
    fn test_small_sets_are_exact_enough() {
        let sketch = HllSketch::from_items(["1", "2", "3"]);
        assert_eq!(sketch.cardinality(), 3);
    }

    #[test]
    fn test_base64_roundtrip_is_stable() {
        let sketch = HllSketch::from_items(["a", "b"]);
        let encoded = sketch.to_base64();
        let decoded = HllSketch::from_base64(&encoded).expect("decode");
        assert_eq!(decoded, sketch);
        assert_eq!(decoded.to_base64(), encoded);
    }

    #[test]
    fn test_from_base64_rejects_wrong_length() {
        let short = B64.encode([0u8; 10]);
        assert!(matches!(
            HllSketch::from_base64(&short),
            Err(CoreError::InvalidSketch)
        ));
    }

    #[test]
    fn test_exact_union_deduplicates() {
        let mut day1 = exact(&["1", "2"]);
        day1.union(&exact(&["1"])).expect("union");
        assert_eq!(day1.cardinality(), 2);
    }

    #[test]
    fn test_mixed_union_is_an_error() {
        let mut day1 = exact(&["1"]);
        let day2 = DistinctItems::Sketch(HllSketch::from_items(["1"]));
        assert!(matches!(
            day1.union(&day2),
            Err(CoreError::InconsistentSketchState)
        ));
        assert!(matches!(
            DistinctItems::union_all([&day2, &exact(&["2"])]),
            Err(CoreError::InconsistentSketchState)
        ));
    }

    #[test]
    fn test_exact_json_is_sorted() {
        let items = exact(&["b", "a", "c"]);
        assert_eq!(
            items.exact_json().expect("json").as_deref(),
            Some(r#"["a","b","c"]"#)
        );
    }

    #[test]
    fn test_from_columns_requires_exactly_one_representation() {
        assert!(DistinctItems::from_columns(Some("[\"1\"]"), None).is_ok());
        assert!(matches!(
            DistinctItems::from_columns(None, None),
            Err(CoreError::InconsistentSketchState)
        ));
        let b64 = HllSketch::new().to_base64();
        assert!(matches!(
            DistinctItems::from_columns(Some("[]"), Some(&b64)),
            Err(CoreError::InconsistentSketchState)
        ));
    }
}
