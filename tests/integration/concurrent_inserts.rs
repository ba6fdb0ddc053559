#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;

use paged_hnsw::hnsw::{HnswIndex, IndexOptions, MemoryHeap, RetrieverCtx};
use paged_hnsw::primitives::pager::{Pager, PagerOptions};
use paged_hnsw::{Result, SlotId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashSet;
use tempfile::tempdir;

const WRITERS: u64 = 4;
const PER_WRITER: u64 = 50;

#[test]
fn parallel_writers_and_readers_keep_index_consistent() -> Result<()> {
    let dir = tempdir()?;
    let options = PagerOptions {
        page_size: 2048,
        cache_pages: 24,
        ..PagerOptions::default()
    };
    let pager = Arc::new(Pager::create(dir.path().join("parallel.idx"), options)?);
    let index = Arc::new(HnswIndex::open(
        Arc::clone(&pager),
        IndexOptions {
            dimensions: Some(8),
            ..IndexOptions::compact()
        },
        Arc::new(MemoryHeap::new()),
    )?);
    let mut rng = ChaCha8Rng::seed_from_u64(41);
    index.build(&mut rng)?;

    thread::scope(|scope| -> Result<()> {
        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let index = Arc::clone(&index);
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(100 + writer);
                    for n in 0..PER_WRITER {
                        let vector: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
                        index.insert(writer * PER_WRITER + n, Some(vector.as_slice()))?;
                    }
                    Ok(())
                })
            })
            .collect();
        let readers: Vec<_> = (0..2u64)
            .map(|reader| {
                let index = Arc::clone(&index);
                scope.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(200 + reader);
                    for _ in 0..100 {
                        let query: Vec<f32> = (0..8).map(|_| rng.gen_range(-1.0..1.0)).collect();
                        let hits = index.search(&query, 5)?;
                        assert!(hits.len() <= 5);
                        assert!(hits.iter().all(|hit| hit.key < WRITERS * PER_WRITER));
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in writers.into_iter().chain(readers) {
            handle.join().expect("worker panicked")?;
        }
        Ok(())
    })?;

    let header = index.header()?;
    assert_eq!(header.num_vectors as u64, WRITERS * PER_WRITER);
    assert_eq!(pager.outstanding_pins(), 0);

    let mut ctx = RetrieverCtx::reader(&pager, header.clone())?;
    let mut keys = FxHashSet::default();
    for slot in 0..header.num_vectors {
        keys.insert(ctx.fetch_immutable(SlotId(slot))?.key());
    }
    ctx.release_all();
    assert_eq!(keys, (0..WRITERS * PER_WRITER).collect());

    let report = index.verify()?;
    assert!(report.is_clean(), "{:?}", report.findings);
    Ok(())
}
