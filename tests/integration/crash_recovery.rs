#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use paged_hnsw::hnsw::{HnswIndex, IndexOptions, MemoryHeap};
use paged_hnsw::primitives::pager::{Pager, PagerOptions};
use paged_hnsw::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn pager_options() -> PagerOptions {
    PagerOptions {
        page_size: 1024,
        cache_pages: 8,
        autocheckpoint_frames: 100_000,
        ..PagerOptions::default()
    }
}

fn index_options() -> IndexOptions {
    IndexOptions {
        dimensions: Some(4),
        ..IndexOptions::compact()
    }
}

fn open(path: &Path) -> Result<HnswIndex> {
    let pager = Arc::new(Pager::open(path, pager_options())?);
    HnswIndex::open(pager, index_options(), Arc::new(MemoryHeap::new()))
}

fn vectors(seed: u64, rows: usize) -> Vec<Vec<f32>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..rows)
        .map(|_| (0..4).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

/// Drops every handle without the checkpoint a clean close performs.
fn crash(index: HnswIndex) {
    std::mem::forget(index);
}

#[test]
fn committed_inserts_survive_without_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("crash.idx");
    let rows = vectors(21, 80);
    {
        let pager = Arc::new(Pager::create(&path, pager_options())?);
        let index = HnswIndex::open(pager, index_options(), Arc::new(MemoryHeap::new()))?;
        let mut rng = ChaCha8Rng::seed_from_u64(22);
        index.build(&mut rng)?;
        for (key, vector) in rows.iter().enumerate() {
            index.insert(key as u64, Some(vector.as_slice()))?;
        }
        crash(index);
    }

    let index = open(&path)?;
    let header = index.header()?;
    assert_eq!(header.num_vectors, 80);
    let report = index.verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    assert_eq!(report.nodes_checked, 80);
    for slot in 0..80 {
        assert!(index.block_map_entry(paged_hnsw::SlotId(slot))?.is_some());
    }
    let hits = index.search_with_ef(&rows[17], 5, 80)?;
    assert_eq!(hits.len(), 5);
    assert!(hits.iter().all(|hit| hit.key < 80));
    Ok(())
}

#[test]
fn recovery_continues_after_checkpoint_and_reopen() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("reopen.idx");
    let rows = vectors(31, 60);
    {
        let pager = Arc::new(Pager::create(&path, pager_options())?);
        let index = HnswIndex::open(
            Arc::clone(&pager),
            index_options(),
            Arc::new(MemoryHeap::new()),
        )?;
        let mut rng = ChaCha8Rng::seed_from_u64(32);
        index.build(&mut rng)?;
        for (key, vector) in rows.iter().take(30).enumerate() {
            index.insert(key as u64, Some(vector.as_slice()))?;
        }
        assert!(pager.checkpoint()?);
        for (key, vector) in rows.iter().enumerate().skip(30) {
            index.insert(key as u64, Some(vector.as_slice()))?;
        }
        drop(pager);
        crash(index);
    }

    {
        let index = open(&path)?;
        assert_eq!(index.header()?.num_vectors, 60);
        index.insert(60, Some(&[0.0, 0.0, 0.0, 0.0][..]))?;
        // Clean close checkpoints.
    }
    let index = open(&path)?;
    assert_eq!(index.header()?.num_vectors, 61);
    assert!(index.verify()?.is_clean());
    Ok(())
}
