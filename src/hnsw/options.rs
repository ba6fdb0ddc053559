//! Per-index tuning knobs.

use super::codec::{Quantization, HNSW_MAX_DIM};
use super::distance::Metric;
use crate::types::{HnswError, Result};

/// Options fixed when an index is created.
///
/// Every field except `memory_budget_bytes` is copied into the header page
/// on first build and read back from there afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexOptions {
    /// Declared dimensionality. `None` defers it to the first vector.
    pub dimensions: Option<u32>,
    /// Neighbors per upper tier; the base tier holds twice as many.
    pub m: u16,
    /// Candidate beam while linking a new node.
    pub ef_construction: u16,
    /// Default candidate beam while searching.
    pub ef_search: u16,
    /// Distance metric.
    pub metric: Metric,
    /// Payload encoding.
    pub quantization: Quantization,
    /// Soft cap on the projected size of the node storage.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            dimensions: None,
            m: 16,
            ef_construction: 128,
            ef_search: 64,
            metric: Metric::L2sq,
            quantization: Quantization::None,
            memory_budget_bytes: None,
        }
    }
}

impl IndexOptions {
    /// Options with a declared dimensionality.
    pub fn with_dimensions(dimensions: u32) -> Self {
        Self {
            dimensions: Some(dimensions),
            ..Self::default()
        }
    }

    /// Small graph, cheap inserts. Used by tests and the demo build.
    pub fn compact() -> Self {
        Self {
            m: 4,
            ef_construction: 32,
            ef_search: 32,
            ..Self::default()
        }
    }

    /// Rejects values the index cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(HnswError::Invalid("m must be at least 2"));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(HnswError::Invalid("ef values must be positive"));
        }
        if let Some(dim) = self.dimensions {
            if dim == 0 {
                return Err(HnswError::Invalid("declared dimensions must be positive"));
            }
            if dim > HNSW_MAX_DIM {
                return Err(HnswError::DimensionTooLarge {
                    actual: dim,
                    max: HNSW_MAX_DIM,
                });
            }
        }
        Ok(())
    }
}
