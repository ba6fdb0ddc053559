#![allow(missing_docs)]

use std::sync::Arc;

use paged_hnsw::hnsw::{HnswIndex, IndexOptions, MemoryHeap, RetrieverCtx};
use paged_hnsw::primitives::pager::{Pager, PagerOptions};
use paged_hnsw::{HnswError, Result, SlotId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::{tempdir, TempDir};

fn filled_index(rows: u64) -> Result<(TempDir, Arc<Pager>, HnswIndex)> {
    let dir = tempdir()?;
    let options = PagerOptions {
        page_size: 1024,
        cache_pages: 16,
        ..PagerOptions::default()
    };
    let pager = Arc::new(Pager::create(dir.path().join("pins.idx"), options)?);
    let index = HnswIndex::open(
        Arc::clone(&pager),
        IndexOptions {
            dimensions: Some(3),
            ..IndexOptions::compact()
        },
        Arc::new(MemoryHeap::new()),
    )?;
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    index.build(&mut rng)?;
    let mut library = index.library(&index.header()?)?;
    for key in 0..rows {
        let vector: Vec<f32> = (0..3).map(|_| rng.gen_range(-1.0..1.0)).collect();
        index.insert_with(&mut library, &mut rng, key, Some(vector.as_slice()))?;
    }
    Ok((dir, pager, index))
}

#[test]
fn operations_leave_no_pins_behind() -> Result<()> {
    let (_dir, pager, index) = filled_index(120)?;
    assert_eq!(pager.outstanding_pins(), 0);
    index.search(&[0.1, 0.2, 0.3], 5)?;
    assert_eq!(pager.outstanding_pins(), 0);
    assert!(index.insert(500, Some(&[1.0, 2.0][..])).is_err());
    assert_eq!(pager.outstanding_pins(), 0);
    index.verify()?;
    assert_eq!(pager.outstanding_pins(), 0);
    Ok(())
}

#[test]
fn reader_pins_each_page_once_and_releases_idempotently() -> Result<()> {
    let (_dir, pager, index) = filled_index(120)?;
    let header = index.header()?;
    let mut ctx = RetrieverCtx::reader(&pager, header.clone())?;
    let first = {
        let node = ctx.fetch_immutable(SlotId(7))?;
        node.view().as_bytes().to_vec()
    };
    let again = {
        let node = ctx.fetch_immutable(SlotId(7))?;
        node.view().as_bytes().to_vec()
    };
    assert_eq!(first, again);
    assert_eq!(ctx.stats().node_hits, 1);

    for slot in 0..header.num_vectors {
        ctx.fetch_immutable(SlotId(slot))?;
    }
    let pinned = ctx.outstanding_pins();
    assert_eq!(pinned as u64, ctx.stats().pages_pinned);
    assert_eq!(pager.outstanding_pins(), pinned as u64);
    // Every node block plus every block-map page, each pinned once.
    assert!(pinned >= 1 + header.blockmap_pages.len());

    ctx.release_all();
    assert_eq!(pager.outstanding_pins(), 0);
    ctx.release_all();
    assert_eq!(ctx.outstanding_pins(), 0);
    assert_eq!(pager.outstanding_pins(), 0);
    Ok(())
}

#[test]
fn block_lookup_agrees_with_block_map() -> Result<()> {
    let (_dir, pager, index) = filled_index(90)?;
    let header = index.header()?;
    let mut ctx = RetrieverCtx::reader(&pager, header.clone())?;
    for slot in (0..header.num_vectors).map(SlotId) {
        assert_eq!(Some(ctx.block_of(slot)?), index.block_map_entry(slot)?);
    }
    Ok(())
}

#[test]
fn snapshot_hides_later_slots() -> Result<()> {
    let (_dir, pager, index) = filled_index(40)?;
    let snapshot = index.header()?;
    let mut rng = ChaCha8Rng::seed_from_u64(12);
    for key in 40..60u64 {
        let vector: Vec<f32> = (0..3).map(|_| rng.gen_range(-1.0..1.0)).collect();
        index.insert(key, Some(vector.as_slice()))?;
    }
    let library = index.library(&snapshot)?;
    let mut ctx = RetrieverCtx::reader(&pager, snapshot)?;
    assert!(matches!(
        ctx.fetch_immutable(SlotId(45)),
        Err(HnswError::Invalid(_))
    ));
    let hits = library.search(&mut ctx, &[0.0, 0.0, 0.0], 60, 128)?;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.slot.0 < 40 && hit.key < 40));
    Ok(())
}
