//! Full index build from the rows of a heap.

use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, info};

use super::graph::GraphLibrary;
use super::header::IndexHeader;
use super::insert::{insert_locked, validate_vector, InsertOutcome};
use super::options::IndexOptions;
use crate::primitives::pager::Pager;
use crate::types::{page::PageKind, HnswError, PageId, Result};

/// Source of the rows an index covers. `None` marks a row without a vector.
pub trait HeapSource: Send + Sync {
    /// Visits every row in heap order, stopping at the first error.
    fn scan(&self, visit: &mut dyn FnMut(u64, Option<&[f32]>) -> Result<()>) -> Result<()>;
}

/// Rows kept in memory.
#[derive(Debug, Default)]
pub struct MemoryHeap {
    rows: RwLock<Vec<(u64, Option<Vec<f32>>)>>,
}

impl MemoryHeap {
    /// Empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row.
    pub fn push(&self, key: u64, vector: Option<Vec<f32>>) {
        self.rows.write().push((key, vector));
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True when no row was pushed.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl HeapSource for MemoryHeap {
    fn scan(&self, visit: &mut dyn FnMut(u64, Option<&[f32]>) -> Result<()>) -> Result<()> {
        let rows = self.rows.read();
        for (key, vector) in rows.iter() {
            visit(*key, vector.as_deref())?;
        }
        Ok(())
    }
}

/// Summary of a full build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Rows linked into the graph.
    pub tuples_indexed: u64,
    /// Rows without a vector.
    pub tuples_skipped: u64,
    /// Dimensionality written to the header.
    pub dimensions: u32,
}

/// Keys a build indexed, kept so a racing inserter can tell its row was
/// already covered.
#[derive(Debug, Default)]
pub(crate) struct BuildRecord {
    pub(crate) keys: FxHashSet<u64>,
    pub(crate) report: BuildReport,
}

/// Dimensionality a build would use: declared, or the first vector's.
pub fn infer_dimensions(options: &IndexOptions, heap: &dyn HeapSource) -> Result<Option<u32>> {
    if let Some(dim) = options.dimensions {
        return Ok(Some(dim));
    }
    let mut found = None;
    heap.scan(&mut |_, vector| {
        if found.is_none() {
            if let Some(vector) = vector {
                found = Some(u32::try_from(vector.len()).unwrap_or(u32::MAX));
            }
        }
        Ok(())
    })?;
    Ok(found)
}

/// Writes the header page of an empty index.
pub(crate) fn create_header(pager: &Pager, dimensions: u32, options: &IndexOptions) -> Result<()> {
    if pager.page_count() != 0 {
        return Err(HnswError::Invalid("index already has pages"));
    }
    let header = IndexHeader::new(dimensions, options);
    header.layout()?;
    let mut txn = pager.begin_txn();
    let page = txn.allocate_page(PageKind::IndexHeader)?;
    if page.id() != PageId::HEADER {
        return Err(HnswError::Corruption("header page allocated past page 0"));
    }
    header.encode(&mut page.write()?)?;
    drop(page);
    txn.commit()?;
    debug!(dimensions, m = options.m, "hnsw.build.header");
    Ok(())
}

/// Builds the index over every row of `heap`. `dimensions` overrides
/// inference, as when an insert supplies the first vector. Returns `None`
/// when the dimensionality is still unknown; the index then stays empty.
pub(crate) fn build_index<L, R, F>(
    pager: &Pager,
    options: &IndexOptions,
    heap: &dyn HeapSource,
    dimensions: Option<u32>,
    make_library: F,
    rng: &mut R,
) -> Result<Option<BuildRecord>>
where
    L: GraphLibrary,
    R: Rng + ?Sized,
    F: FnOnce(&IndexHeader) -> Result<L>,
{
    let dimensions = match dimensions.or(options.dimensions) {
        Some(dim) => Some(dim),
        None => infer_dimensions(options, heap)?,
    };
    let Some(dimensions) = dimensions else {
        debug!("hnsw.build.postponed");
        return Ok(None);
    };
    create_header(pager, dimensions, options)?;
    let mut library = make_library(&IndexHeader::new(dimensions, options))?;

    let mut record = BuildRecord {
        report: BuildReport {
            dimensions,
            ..BuildReport::default()
        },
        ..BuildRecord::default()
    };
    heap.scan(&mut |key, vector| {
        let Some(vector) = validate_vector(vector, Some(dimensions))? else {
            record.report.tuples_skipped += 1;
            return Ok(());
        };
        if let InsertOutcome::Inserted { .. } =
            insert_locked(pager, options, &mut library, rng, key, vector)?
        {
            record.report.tuples_indexed += 1;
            record.keys.insert(key);
        }
        Ok(())
    })?;
    info!(
        indexed = record.report.tuples_indexed,
        skipped = record.report.tuples_skipped,
        dimensions,
        pages = pager.page_count(),
        "hnsw.build.done"
    );
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_come_from_options_then_first_vector() {
        let heap = MemoryHeap::new();
        assert_eq!(infer_dimensions(&IndexOptions::default(), &heap).unwrap(), None);
        heap.push(1, None);
        heap.push(2, Some(vec![1.0, 2.0, 3.0]));
        heap.push(3, Some(vec![1.0]));
        assert_eq!(
            infer_dimensions(&IndexOptions::default(), &heap).unwrap(),
            Some(3)
        );
        assert_eq!(
            infer_dimensions(&IndexOptions::with_dimensions(8), &heap).unwrap(),
            Some(8)
        );
    }

    #[test]
    fn scan_stops_at_first_error() {
        let heap = MemoryHeap::new();
        for key in 0..5 {
            heap.push(key, None);
        }
        let mut seen = 0;
        let result = heap.scan(&mut |key, _| {
            seen += 1;
            if key == 2 {
                Err(HnswError::NotFound)
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        assert_eq!(seen, 3);
    }
}
