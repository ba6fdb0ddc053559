#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use paged_hnsw::hnsw::{
    GraphLibrary, Hnsw, HnswIndex, IndexOptions, InsertOutcome, MemoryHeap, NodeStore,
};
use paged_hnsw::primitives::pager::{Pager, PagerOptions, PinMode};
use paged_hnsw::types::page::PAGE_HDR_LEN;
use paged_hnsw::{HnswError, PageId, Result, SlotId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn small_pager(path: &Path, max_pages: Option<u32>) -> Result<Arc<Pager>> {
    let options = PagerOptions {
        page_size: 1024,
        cache_pages: 32,
        max_pages,
        ..PagerOptions::default()
    };
    Ok(Arc::new(Pager::create(path, options)?))
}

fn compact(dim: u32) -> IndexOptions {
    IndexOptions {
        dimensions: Some(dim),
        ..IndexOptions::compact()
    }
}

fn random_vector(rng: &mut impl Rng, dim: u32) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn open_index(pager: &Arc<Pager>, options: IndexOptions) -> Result<HnswIndex> {
    let index = HnswIndex::open(Arc::clone(pager), options, Arc::new(MemoryHeap::new()))?;
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    index.build(&mut rng)?;
    Ok(index)
}

fn page_images(pager: &Pager) -> Result<Vec<Vec<u8>>> {
    (0..pager.page_count())
        .map(|id| {
            let page = pager.pin_page(PageId(id), PinMode::Shared)?;
            let image = page.read().to_vec();
            Ok(image)
        })
        .collect()
}

/// Links the node, then fails as if the library ran out of memory.
struct FailingLibrary {
    inner: Hnsw,
}

impl GraphLibrary for FailingLibrary {
    fn load_header(&mut self, blob: &[u8]) -> Result<()> {
        self.inner.load_header(blob)
    }

    fn header_blob(&self) -> Vec<u8> {
        self.inner.header_blob()
    }

    fn connectivity(&self) -> u16 {
        self.inner.connectivity()
    }

    fn add<S: NodeStore>(
        &mut self,
        store: &mut S,
        slot: SlotId,
        key: u64,
        vector: &[f32],
        level: u16,
    ) -> Result<()> {
        self.inner.add(store, slot, key, vector, level)?;
        Err(HnswError::Invalid("injected link failure"))
    }
}

#[test]
fn slots_grow_by_one_per_insert() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("grow.idx"), None)?;
    let index = open_index(&pager, compact(4))?;
    let mut library = index.library(&index.header()?)?;
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let mut vectors = Vec::new();
    for key in 0..60u64 {
        let vector = random_vector(&mut rng, 4);
        let outcome = index.insert_with(&mut library, &mut rng, key, Some(vector.as_slice()))?;
        match outcome {
            InsertOutcome::Inserted { slot, .. } => assert_eq!(slot, SlotId(key as u32)),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(index.header()?.num_vectors, key as u32 + 1);
        vectors.push(vector);
    }
    let header = index.header()?;
    assert!(header.blockmap_pages.len() == 1);
    assert!(pager.page_count() > 4, "nodes should spill over several blocks");

    let mut exact = 0;
    for (key, vector) in vectors.iter().enumerate() {
        let hits = index.search_with_ef(vector, 1, 64)?;
        if hits.first().map(|h| h.key) == Some(key as u64) {
            exact += 1;
        }
    }
    assert!(exact >= 54, "only {exact} of 60 vectors found themselves");
    assert!(index.verify()?.is_clean());
    assert_eq!(pager.outstanding_pins(), 0);
    Ok(())
}

#[test]
fn block_map_spills_to_new_pages_within_commit_limit() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("spill.idx"), None)?;
    let index = open_index(&pager, compact(2))?;
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let mut library = index.library(&index.header()?)?;
    // 1024-byte pages map 250 slots per block-map page.
    for key in 0..260u64 {
        let vector = random_vector(&mut rng, 2);
        index.insert_with(&mut library, &mut rng, key, Some(vector.as_slice()))?;
    }
    let header = index.header()?;
    assert_eq!(header.num_vectors, 260);
    assert_eq!(header.blockmap_pages.len(), 2);
    for slot in [0u32, 249, 250, 259] {
        assert!(index.block_map_entry(SlotId(slot))?.is_some());
    }
    assert_eq!(index.block_map_entry(SlotId(260))?, None);
    assert_eq!(index.block_map_entry(SlotId(5000))?, None);
    assert!(index.verify()?.is_clean());
    Ok(())
}

#[test]
fn library_failure_leaves_no_footprint() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("fault.idx"), None)?;
    let index = open_index(&pager, compact(4))?;
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let mut library = index.library(&index.header()?)?;
    for key in 0..40u64 {
        let vector = random_vector(&mut rng, 4);
        index.insert_with(&mut library, &mut rng, key, Some(vector.as_slice()))?;
    }
    let before_header = index.header()?;
    let before_pages = page_images(&pager)?;
    let before_count = pager.page_count();

    let mut failing = FailingLibrary {
        inner: index.library(&before_header)?,
    };
    let vector = random_vector(&mut rng, 4);
    let err = index
        .insert_with(&mut failing, &mut rng, 999, Some(vector.as_slice()))
        .unwrap_err();
    assert!(matches!(err, HnswError::LibraryLink(_)), "{err}");

    assert_eq!(index.header()?, before_header);
    assert_eq!(pager.page_count(), before_count);
    assert_eq!(page_images(&pager)?, before_pages);
    assert_eq!(pager.outstanding_pins(), 0);
    assert!(index.verify()?.is_clean());

    let outcome = index.insert_with(&mut library, &mut rng, 41, Some(vector.as_slice()))?;
    assert!(matches!(outcome, InsertOutcome::Inserted { slot: SlotId(40), .. }));
    Ok(())
}

#[test]
fn dimensions_are_enforced() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("dims.idx"), None)?;
    let index = open_index(&pager, compact(3))?;
    assert!(matches!(
        index.insert(1, Some(&[1.0, 2.0][..])),
        Err(HnswError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
    let wide = vec![0.5; 2001];
    assert!(matches!(
        index.insert(2, Some(wide.as_slice())),
        Err(HnswError::DimensionMismatch { .. })
    ));
    assert_eq!(index.insert(3, None)?, InsertOutcome::Skipped);
    assert!(matches!(
        index.insert(4, Some(&[1.0, 2.0, 3.0][..]))?,
        InsertOutcome::Inserted { .. }
    ));

    // Without a declared width the header decides.
    let undeclared = HnswIndex::open(
        Arc::clone(&pager),
        IndexOptions::compact(),
        Arc::new(MemoryHeap::new()),
    )?;
    assert!(matches!(
        undeclared.insert(5, Some(&[1.0; 4][..])),
        Err(HnswError::DimensionMismatch {
            expected: 3,
            actual: 4
        })
    ));
    assert_eq!(index.header()?.num_vectors, 1);
    Ok(())
}

#[test]
fn memory_budget_rejects_before_reserving() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("budget.idx"), None)?;
    let options = IndexOptions {
        memory_budget_bytes: Some(4 * 1024),
        ..compact(2)
    };
    let index = open_index(&pager, options)?;
    index.insert(1, Some(&[0.0, 1.0][..]))?;
    let pages = pager.page_count();
    let err = index.insert(2, Some(&[1.0, 0.0][..])).unwrap_err();
    assert!(matches!(err, HnswError::MemoryBudgetExceeded { .. }), "{err}");
    assert_eq!(pager.page_count(), pages);
    assert_eq!(index.header()?.num_vectors, 1);
    Ok(())
}

#[test]
fn page_quota_exhaustion_rolls_back() -> Result<()> {
    let dir = tempdir()?;
    // Header, one node block and one block-map page.
    let pager = small_pager(&dir.path().join("quota.idx"), Some(3))?;
    let index = open_index(&pager, compact(4))?;
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let mut inserted = 0u32;
    let err = loop {
        let vector = random_vector(&mut rng, 4);
        match index.insert(inserted as u64, Some(vector.as_slice())) {
            Ok(_) => inserted += 1,
            Err(err) => break err,
        }
        assert!(inserted < 100, "quota never reached");
    };
    assert!(matches!(err, HnswError::StorageExhausted(_)), "{err}");
    assert!(inserted > 0);
    assert_eq!(pager.page_count(), 3);
    assert_eq!(index.header()?.num_vectors, inserted);
    assert_eq!(pager.outstanding_pins(), 0);
    assert!(index.verify()?.is_clean());
    Ok(())
}

#[test]
fn corrupt_header_magic_is_detected() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("magic.idx"), None)?;
    let index = open_index(&pager, compact(2))?;
    index.insert(1, Some(&[0.0, 1.0][..]))?;
    {
        let page = pager.pin_page(PageId::HEADER, PinMode::Exclusive)?;
        let mut txn = pager.begin_txn();
        txn.register(&page)?;
        page.write()?[PAGE_HDR_LEN..PAGE_HDR_LEN + 4].copy_from_slice(b"XXXX");
        txn.commit()?;
    }
    assert!(matches!(
        index.insert(2, Some(&[1.0, 0.0][..])),
        Err(HnswError::CorruptHeader(_))
    ));
    assert!(matches!(
        HnswIndex::open(Arc::clone(&pager), compact(2), Arc::new(MemoryHeap::new())),
        Err(HnswError::CorruptHeader(_))
    ));
    let report = index.verify()?;
    assert!(!report.is_clean());
    assert!(report.findings[0].starts_with("header"));
    Ok(())
}

#[test]
fn bulk_delete_tombstones_matching_keys() -> Result<()> {
    let dir = tempdir()?;
    let pager = small_pager(&dir.path().join("delete.idx"), None)?;
    let index = open_index(&pager, compact(2))?;
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    for key in 0..80u64 {
        let vector = random_vector(&mut rng, 2);
        index.insert(key, Some(vector.as_slice()))?;
    }
    let stats = index.bulk_delete(|key| key % 2 == 0)?;
    assert_eq!(stats.tuples_removed, 40);
    assert!(stats.commits <= stats.blocks_visited);
    assert!(stats.blocks_visited > 1);

    for _ in 0..20 {
        let query = random_vector(&mut rng, 2);
        let hits = index.search(&query, 10)?;
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.key % 2 == 1));
    }
    let again = index.bulk_delete(|key| key % 2 == 0)?;
    assert_eq!(again.tuples_removed, 0);
    assert_eq!(again.commits, 0);

    let report = index.verify()?;
    assert!(report.is_clean());
    assert_eq!(report.tombstones, 40);
    Ok(())
}
