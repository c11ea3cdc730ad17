//! Latency summaries: DDSketch with a fixed, explicitly shared index mapping.
//!
//! Every encode/decode goes through a [`SketchMapping`] so producers and the
//! aggregator agree on relative accuracy and bin limits. Summaries encoded with
//! a different mapping are rejected at decode time.

use std::panic::{self, AssertUnwindSafe};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sketches_ddsketch::{Config, DDSketch};

/// Relative accuracy guaranteed for every quantile (1%).
pub const DEFAULT_RELATIVE_ACCURACY: f64 = 0.01;
pub const DEFAULT_MAX_BINS: u32 = 2048;

/// Smallest value tracked with full accuracy; anything below falls in the zero bin.
const MIN_INDEXABLE_VALUE: f64 = 1e-9;

/// Bound on store keys. Real keys for any finite f64 stay well below this.
const MAX_KEY_MAGNITUDE: i64 = 1 << 20;

#[derive(Debug)]
pub enum SketchError {
    Decode(String),
    Encode(String),
    MappingMismatch { expected: f64, found: f64 },
    Merge(String),
}

impl std::fmt::Display for SketchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SketchError::Decode(msg) => write!(f, "sketch decode error: {}", msg),
            SketchError::Encode(msg) => write!(f, "sketch encode error: {}", msg),
            SketchError::MappingMismatch { expected, found } => write!(
                f,
                "sketch mapping mismatch: expected relative accuracy {}, found {}",
                expected, found
            ),
            SketchError::Merge(msg) => write!(f, "sketch merge error: {}", msg),
        }
    }
}

impl std::error::Error for SketchError {}

/// Immutable index mapping parameters shared by all summaries of a process.
#[derive(Clone, Copy, Debug)]
pub struct SketchMapping {
    relative_accuracy: f64,
    max_bins: u32,
}

impl Default for SketchMapping {
    fn default() -> Self {
        Self::new(DEFAULT_RELATIVE_ACCURACY, DEFAULT_MAX_BINS)
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    relative_accuracy: f64,
    max_bins: u32,
    sketch: &'a DDSketch,
}

#[derive(Deserialize)]
struct Envelope<S> {
    relative_accuracy: f64,
    max_bins: u32,
    sketch: S,
}

/// Field-for-field view of a serialized `DDSketch`, decoded first so the
/// store invariants can be checked before the sketch is ever merged.
#[derive(Deserialize)]
struct SketchLayout {
    config: Config,
    store: StoreLayout,
    negative_store: StoreLayout,
    #[allow(dead_code)]
    min: f64,
    #[allow(dead_code)]
    max: f64,
    #[allow(dead_code)]
    sum: f64,
    zero_count: u64,
}

#[derive(Deserialize)]
struct StoreLayout {
    bins: Vec<u64>,
    count: u64,
    min_key: i32,
    max_key: i32,
    offset: i32,
    bin_limit: usize,
    #[allow(dead_code)]
    is_collapsed: bool,
}

impl SketchLayout {
    fn validate(&self, config: &Config) -> Result<(), String> {
        if self.config != *config {
            return Err("sketch config does not match mapping".to_string());
        }
        self.store.validate(config.max_num_bins)?;
        self.negative_store.validate(config.max_num_bins)?;
        self.store
            .count
            .checked_add(self.negative_store.count)
            .and_then(|c| c.checked_add(self.zero_count))
            .map(|_| ())
            .ok_or_else(|| "total count overflows".to_string())
    }
}

impl StoreLayout {
    fn validate(&self, max_bins: u32) -> Result<(), String> {
        if self.bin_limit != max_bins as usize || self.bins.len() > self.bin_limit {
            return Err(format!(
                "store holds {} bins, limit {}",
                self.bins.len(),
                self.bin_limit
            ));
        }
        let total = self
            .bins
            .iter()
            .try_fold(0u64, |acc, b| acc.checked_add(*b))
            .ok_or_else(|| "bin counts overflow".to_string())?;
        if total != self.count {
            return Err(format!(
                "bin total {} does not match count {}",
                total, self.count
            ));
        }
        if self.count == 0 {
            return Ok(());
        }
        let (min_key, max_key, offset) = (
            i64::from(self.min_key),
            i64::from(self.max_key),
            i64::from(self.offset),
        );
        if [min_key, max_key, offset]
            .iter()
            .any(|k| k.abs() > MAX_KEY_MAGNITUDE)
        {
            return Err("store key out of range".to_string());
        }
        if min_key < offset || min_key > max_key || max_key - offset >= self.bins.len() as i64 {
            return Err(format!(
                "keys {}..={} do not fit {} bins at offset {}",
                min_key,
                max_key,
                self.bins.len(),
                offset
            ));
        }
        Ok(())
    }
}

impl SketchMapping {
    pub fn new(relative_accuracy: f64, max_bins: u32) -> Self {
        Self {
            relative_accuracy,
            max_bins,
        }
    }

    pub fn relative_accuracy(&self) -> f64 {
        self.relative_accuracy
    }

    fn config(&self) -> Config {
        Config::new(self.relative_accuracy, self.max_bins, MIN_INDEXABLE_VALUE)
    }

    /// Empty summary using this mapping.
    pub fn new_summary(&self) -> DDSketch {
        DDSketch::new(self.config())
    }

    /// Summary built from a set of observed values.
    pub fn summary_of(&self, values: &[f64]) -> DDSketch {
        let mut summary = self.new_summary();
        for v in values {
            summary.add(*v);
        }
        summary
    }

    pub fn encode(&self, summary: &DDSketch) -> Result<Bytes, SketchError> {
        let envelope = EnvelopeRef {
            relative_accuracy: self.relative_accuracy,
            max_bins: self.max_bins,
            sketch: summary,
        };
        rmp_serde::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| SketchError::Encode(e.to_string()))
    }

    /// Decode a summary produced by [`encode`](Self::encode) with the same
    /// mapping. The sketch store is checked for internal consistency, so a
    /// decoded summary is always safe to merge.
    pub fn decode(&self, bytes: &[u8]) -> Result<DDSketch, SketchError> {
        if bytes.is_empty() {
            return Err(SketchError::Decode("empty sketch".to_string()));
        }
        let layout: Envelope<SketchLayout> =
            rmp_serde::from_slice(bytes).map_err(|e| SketchError::Decode(e.to_string()))?;
        if !self.matches(layout.relative_accuracy, layout.max_bins) {
            return Err(SketchError::MappingMismatch {
                expected: self.relative_accuracy,
                found: layout.relative_accuracy,
            });
        }
        layout
            .sketch
            .validate(&self.config())
            .map_err(SketchError::Decode)?;

        let envelope: Envelope<DDSketch> =
            rmp_serde::from_slice(bytes).map_err(|e| SketchError::Decode(e.to_string()))?;
        Ok(envelope.sketch)
    }

    fn matches(&self, relative_accuracy: f64, max_bins: u32) -> bool {
        self.relative_accuracy.to_bits() == relative_accuracy.to_bits()
            && self.max_bins == max_bins
    }
}

/// Merge `other` into `into`. On error `into` is left untouched.
///
/// The merge runs on a copy, so a panic inside the sketch store surfaces as
/// `SketchError::Merge` instead of tearing down the caller.
pub fn merge(into: &mut DDSketch, other: &DDSketch) -> Result<(), SketchError> {
    let mut merged = into.clone();
    match panic::catch_unwind(AssertUnwindSafe(|| merged.merge(other))) {
        Ok(Ok(())) => {
            *into = merged;
            Ok(())
        }
        Ok(Err(e)) => Err(SketchError::Merge(e.to_string())),
        Err(_) => Err(SketchError::Merge("sketch store panicked".to_string())),
    }
}

/// Quantile estimate, `None` for an empty summary.
pub fn quantile(summary: &DDSketch, q: f64) -> Option<f64> {
    summary.quantile(q).ok().flatten()
}
