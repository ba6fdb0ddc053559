//! The index handle tying the pager, the heap and the graph together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use super::blockmap::{BlockHeader, BlockMap, BLOCK_DATA_START};
use super::build::{build_index, BuildRecord, BuildReport, HeapSource};
use super::codec::{clear_key, read_node, TOMBSTONE_KEY};
use super::graph::{GraphLibrary, Hnsw, Quantizer, SearchHit};
use super::header::IndexHeader;
use super::insert::{insert_locked, validate_vector, InsertOutcome};
use super::options::IndexOptions;
use super::retriever::RetrieverCtx;
use super::verify::{verify_index, VerifyReport};
use crate::primitives::pager::{Pager, PinMode};
use crate::types::{HnswError, PageId, Result, SlotId};

/// Outcome of [`HnswIndex::bulk_delete`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteStats {
    /// Node blocks walked.
    pub blocks_visited: u64,
    /// Nodes tombstoned by this call.
    pub tuples_removed: u64,
    /// Transactions committed, one per modified block.
    pub commits: u64,
}

/// An HNSW index stored in one pager.
pub struct HnswIndex {
    pager: Arc<Pager>,
    options: IndexOptions,
    heap: Arc<dyn HeapSource>,
    quantizer: Option<Arc<dyn Quantizer>>,
    build: Mutex<Option<BuildRecord>>,
    /// Set once a build has written the header and released `build`.
    build_settled: AtomicBool,
    /// Inserts that may still consult the build record.
    postponed_inserts: AtomicUsize,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("path", &self.pager.path())
            .field("options", &self.options)
            .finish()
    }
}

impl HnswIndex {
    /// Opens the index over `pager`. An existing header must agree with the
    /// declared dimensionality.
    pub fn open(pager: Arc<Pager>, options: IndexOptions, heap: Arc<dyn HeapSource>) -> Result<Self> {
        options.validate()?;
        let index = Self {
            pager,
            options,
            heap,
            quantizer: None,
            build: Mutex::new(None),
            build_settled: AtomicBool::new(false),
            postponed_inserts: AtomicUsize::new(0),
        };
        index
            .build_settled
            .store(!index.is_postponed(), AtomicOrdering::SeqCst);
        if index.pager.page_count() > 0 {
            let header = index.header()?;
            if let Some(expected) = index.options.dimensions {
                if expected != header.vector_dim {
                    return Err(HnswError::DimensionMismatch {
                        expected,
                        actual: header.vector_dim,
                    });
                }
            }
            debug!(
                path = %index.pager.path().display(),
                num_vectors = header.num_vectors,
                dim = header.vector_dim,
                "hnsw.index.open"
            );
        }
        Ok(index)
    }

    /// Sets the quantizer for product-quantized payloads.
    pub fn with_quantizer(mut self, quantizer: Arc<dyn Quantizer>) -> Self {
        self.quantizer = Some(quantizer);
        self
    }

    /// Underlying pager.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Options the index was opened with.
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// True until the first build writes the header page.
    pub fn is_postponed(&self) -> bool {
        self.pager.page_count() == 0
    }

    /// Snapshot of the header page, read under its shared latch.
    pub fn header(&self) -> Result<IndexHeader> {
        if self.is_postponed() {
            return Err(HnswError::NotFound);
        }
        let page = self.pager.pin_page(PageId::HEADER, PinMode::Shared)?;
        let _latch = page.latch_shared();
        let header = IndexHeader::decode(&page.read())?;
        Ok(header)
    }

    /// Graph library configured for `header`.
    pub fn library(&self, header: &IndexHeader) -> Result<Hnsw> {
        let graph = Hnsw::from_header(header)?;
        Ok(match &self.quantizer {
            Some(quantizer) => graph.with_quantizer(Arc::clone(quantizer)),
            None => graph,
        })
    }

    /// Builds the index from the heap. Returns `None` when no vector is
    /// known yet and no dimensionality was declared.
    pub fn build<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Option<BuildReport>> {
        let mut record = self.build.lock();
        if !self.is_postponed() {
            return Err(HnswError::Invalid("index is already built"));
        }
        let built = build_index(
            &self.pager,
            &self.options,
            self.heap.as_ref(),
            None,
            |header| self.library(header),
            rng,
        )?;
        let report = built.as_ref().map(|b| b.report.clone());
        *record = built;
        self.build_settled
            .store(!self.is_postponed(), AtomicOrdering::SeqCst);
        Ok(report)
    }

    /// Inserts one row using the bundled graph and a thread-local RNG.
    pub fn insert(&self, key: u64, vector: Option<&[f32]>) -> Result<InsertOutcome> {
        let mut rng = rand::thread_rng();
        self.insert_inner(None::<&mut Hnsw>, &mut rng, key, vector)
    }

    /// Inserts one row through `library` with an explicit RNG.
    pub fn insert_with<L, R>(
        &self,
        library: &mut L,
        rng: &mut R,
        key: u64,
        vector: Option<&[f32]>,
    ) -> Result<InsertOutcome>
    where
        L: GraphLibrary,
        R: Rng + ?Sized,
    {
        self.insert_inner(Some(library), rng, key, vector)
    }

    fn insert_inner<L, R>(
        &self,
        library: Option<&mut L>,
        rng: &mut R,
        key: u64,
        vector: Option<&[f32]>,
    ) -> Result<InsertOutcome>
    where
        L: GraphLibrary,
        R: Rng + ?Sized,
    {
        debug!(key, phase = "validating", "hnsw.insert.phase");
        let Some(vector) = validate_vector(vector, self.options.dimensions)? else {
            debug!(key, "hnsw.insert.skipped");
            return Ok(InsertOutcome::Skipped);
        };

        if let Some(report) = self.settle_postponed(key, vector.len() as u32, rng)? {
            return Ok(InsertOutcome::Postponed(report));
        }

        match library {
            Some(library) => insert_locked(&self.pager, &self.options, library, rng, key, vector),
            None => {
                let mut graph = self.library(&self.header()?)?;
                insert_locked(&self.pager, &self.options, &mut graph, rng, key, vector)
            }
        }
    }

    /// Runs the deferred build for an insert that arrives before the index
    /// is built. Returns the build report when the build's heap scan already
    /// indexed `key`. Only inserts that began before the build finished
    /// consult the record, and each key is answered once, so a row inserted
    /// after the build is never mistaken for one the scan covered.
    fn settle_postponed<R: Rng + ?Sized>(
        &self,
        key: u64,
        dimensions: u32,
        rng: &mut R,
    ) -> Result<Option<BuildReport>> {
        self.postponed_inserts.fetch_add(1, AtomicOrdering::SeqCst);
        if self.build_settled.load(AtomicOrdering::SeqCst) {
            self.postponed_inserts.fetch_sub(1, AtomicOrdering::SeqCst);
            if self.postponed_inserts.load(AtomicOrdering::SeqCst) == 0 {
                if let Some(mut record) = self.build.try_lock() {
                    if record.take().is_some() {
                        debug!("hnsw.build.record_released");
                    }
                }
            }
            return Ok(None);
        }

        let settled = {
            let mut record = self.build.lock();
            let built = if self.is_postponed() {
                build_index(
                    &self.pager,
                    &self.options,
                    self.heap.as_ref(),
                    Some(dimensions),
                    |header| self.library(header),
                    rng,
                )
                .map(|built| *record = built)
            } else {
                Ok(())
            };
            self.build_settled
                .store(!self.is_postponed(), AtomicOrdering::SeqCst);
            built.map(|()| {
                let done = record.as_mut()?;
                done.keys.remove(&key).then(|| done.report.clone())
            })
        };
        self.postponed_inserts.fetch_sub(1, AtomicOrdering::SeqCst);
        let report = settled?;
        if let Some(report) = &report {
            info!(key, indexed = report.tuples_indexed, "hnsw.insert.postponed");
        }
        Ok(report)
    }

    /// The `k` nearest live rows, exploring the header's `ef_search`
    /// candidates.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.is_postponed() {
            return Ok(Vec::new());
        }
        let header = self.header()?;
        let ef = header.ef_search as usize;
        self.search_with_ef(query, k, ef)
    }

    /// Like [`search`](Self::search) with an explicit beam width.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<SearchHit>> {
        if self.is_postponed() {
            return Ok(Vec::new());
        }
        let header = self.header()?;
        if query.len() != header.vector_dim as usize {
            return Err(HnswError::DimensionMismatch {
                expected: header.vector_dim,
                actual: query.len() as u32,
            });
        }
        let graph = self.library(&header)?;
        let mut ctx = RetrieverCtx::reader(&self.pager, header)?;
        let hits = graph.search(&mut ctx, query, k, ef)?;
        ctx.release_all();
        Ok(hits)
    }

    /// Raw block-map lookup for `slot`. `None` for unset entries and slots
    /// past the last block-map page.
    pub fn block_map_entry(&self, slot: SlotId) -> Result<Option<PageId>> {
        let header = self.header()?;
        let map = BlockMap::new(self.pager.page_size());
        let (dir, entry) = map.locate(slot);
        let Some(&page_id) = header.blockmap_pages.get(dir) else {
            return Ok(None);
        };
        let page = self.pager.pin_page(page_id, PinMode::Shared)?;
        let image = page.read();
        map.read_entry(&image, entry)
    }

    /// Tombstones every node whose key matches `predicate`, one transaction
    /// per modified block, under the exclusive header latch.
    pub fn bulk_delete<F>(&self, mut predicate: F) -> Result<BulkDeleteStats>
    where
        F: FnMut(u64) -> bool,
    {
        let mut stats = BulkDeleteStats::default();
        if self.is_postponed() {
            return Ok(stats);
        }
        let header_page = self.pager.pin_page(PageId::HEADER, PinMode::Exclusive)?;
        let _latch = header_page.latch_exclusive();
        let header = IndexHeader::decode(&header_page.read())?;
        if header.num_vectors == 0 {
            return Ok(stats);
        }
        let layout = header.layout()?;
        let map = BlockMap::new(self.pager.page_size());
        let (dir, entry) = map.locate(SlotId(0));
        let first_map = *header
            .blockmap_pages
            .get(dir)
            .ok_or(HnswError::Corruption("slot has no block-map page"))?;
        let mut next = {
            let page = self.pager.pin_page(first_map, PinMode::Shared)?;
            let image = page.read();
            map.read_entry(&image, entry)?
        };

        while let Some(block) = next {
            stats.blocks_visited += 1;
            let page = self.pager.pin_page(block, PinMode::Exclusive)?;
            let mut txn = self.pager.begin_txn();
            txn.register(&page)?;
            let mut removed = 0u64;
            {
                let mut image = page.write()?;
                let block_header = BlockHeader::decode(&image)?;
                let mut offset = BLOCK_DATA_START;
                for _ in 0..block_header.node_count {
                    let (view, size, _) = read_node(&image, offset, &layout)?;
                    let key = view.key();
                    if key != TOMBSTONE_KEY && predicate(key) {
                        clear_key(&mut image[offset..offset + size])?;
                        removed += 1;
                    }
                    offset += size;
                }
                next = block_header.next_block;
            }
            if removed > 0 {
                txn.commit()?;
                stats.commits += 1;
                stats.tuples_removed += removed;
            }
        }
        info!(
            blocks = stats.blocks_visited,
            removed = stats.tuples_removed,
            commits = stats.commits,
            "hnsw.bulk_delete"
        );
        Ok(stats)
    }

    /// Integrity check of the whole index.
    pub fn verify(&self) -> Result<VerifyReport> {
        verify_index(&self.pager)
    }
}
