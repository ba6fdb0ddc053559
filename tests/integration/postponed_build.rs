#![allow(missing_docs)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use paged_hnsw::hnsw::{
    BuildReport, HeapSource, HnswIndex, IndexOptions, InsertOutcome, MemoryHeap,
};
use paged_hnsw::primitives::pager::{Pager, PagerOptions};
use paged_hnsw::{HnswError, Result};
use rustc_hash::FxHashSet;
use tempfile::tempdir;

fn open(path: &Path, heap: &Arc<MemoryHeap>) -> Result<(Arc<Pager>, HnswIndex)> {
    open_with(path, Arc::clone(heap) as Arc<dyn HeapSource>)
}

fn open_with(path: &Path, heap: Arc<dyn HeapSource>) -> Result<(Arc<Pager>, HnswIndex)> {
    let options = PagerOptions {
        page_size: 1024,
        cache_pages: 32,
        ..PagerOptions::default()
    };
    let pager = Arc::new(Pager::create(path, options)?);
    let index = HnswIndex::open(Arc::clone(&pager), IndexOptions::compact(), heap)?;
    Ok((pager, index))
}

/// Heap whose first scan holds the build open until the other writers
/// have arrived.
struct GatedHeap {
    rows: MemoryHeap,
    gate: Barrier,
    opened: AtomicBool,
}

impl HeapSource for GatedHeap {
    fn scan(&self, visit: &mut dyn FnMut(u64, Option<&[f32]>) -> Result<()>) -> Result<()> {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.gate.wait();
            // Writers released by the gate queue up behind the build.
            thread::sleep(Duration::from_millis(100));
        }
        self.rows.scan(visit)
    }
}

#[test]
fn first_vector_fixes_dimensions() -> Result<()> {
    let dir = tempdir()?;
    let heap = Arc::new(MemoryHeap::new());
    let (pager, index) = open(&dir.path().join("first.idx"), &heap)?;
    assert!(index.is_postponed());
    assert!(matches!(index.header(), Err(HnswError::NotFound)));
    assert!(index.search(&[1.0, 2.0, 3.0], 3)?.is_empty());

    heap.push(1, None);
    assert_eq!(index.insert(1, None)?, InsertOutcome::Skipped);
    assert_eq!(pager.page_count(), 0);

    heap.push(2, Some(vec![1.0, 2.0, 3.0]));
    let outcome = index.insert(2, Some(&[1.0, 2.0, 3.0][..]))?;
    assert_eq!(
        outcome,
        InsertOutcome::Postponed(BuildReport {
            tuples_indexed: 1,
            tuples_skipped: 1,
            dimensions: 3,
        })
    );
    let header = index.header()?;
    assert_eq!(header.vector_dim, 3);
    assert_eq!(header.num_vectors, 1);

    heap.push(3, Some(vec![3.0, 2.0, 1.0]));
    let outcome = index.insert(3, Some(&[3.0, 2.0, 1.0][..]))?;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    assert_eq!(index.header()?.num_vectors, 2);
    assert!(matches!(
        index.insert(4, Some(&[1.0, 2.0][..])),
        Err(HnswError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
    Ok(())
}

#[test]
fn deferred_build_covers_earlier_rows() -> Result<()> {
    let dir = tempdir()?;
    let heap = Arc::new(MemoryHeap::new());
    let (_pager, index) = open(&dir.path().join("earlier.idx"), &heap)?;
    for key in 0..10u64 {
        heap.push(key, Some(vec![key as f32, 0.5]));
    }
    heap.push(10, None);
    heap.push(11, Some(vec![11.0, 0.5]));
    let outcome = index.insert(11, Some(&[11.0, 0.5][..]))?;
    let InsertOutcome::Postponed(report) = outcome else {
        panic!("expected the build to absorb the row, got {outcome:?}");
    };
    assert_eq!(report.tuples_indexed, 11);
    assert_eq!(report.tuples_skipped, 1);
    assert_eq!(index.header()?.num_vectors, 11);

    let hits = index.search(&[4.1, 0.5], 1)?;
    assert_eq!(hits[0].key, 4);
    assert!(index.verify()?.is_clean());
    Ok(())
}

#[test]
fn row_missing_from_heap_is_inserted_after_build() -> Result<()> {
    let dir = tempdir()?;
    let heap = Arc::new(MemoryHeap::new());
    let (_pager, index) = open(&dir.path().join("missing.idx"), &heap)?;
    let outcome = index.insert(77, Some(&[0.5; 6][..]))?;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    let header = index.header()?;
    assert_eq!(header.vector_dim, 6);
    assert_eq!(header.num_vectors, 1);
    Ok(())
}

#[test]
fn racing_first_inserts_index_each_row_once() -> Result<()> {
    let dir = tempdir()?;
    let writers = 4u64;
    let rows = MemoryHeap::new();
    for key in 0..writers {
        rows.push(key, Some(vec![key as f32, 1.0, 2.0]));
    }
    let heap = Arc::new(GatedHeap {
        rows,
        gate: Barrier::new(writers as usize),
        opened: AtomicBool::new(false),
    });
    let shared: Arc<dyn HeapSource> = Arc::clone(&heap) as Arc<dyn HeapSource>;
    let (_pager, index) = open_with(&dir.path().join("race.idx"), shared)?;

    let outcomes = thread::scope(|scope| {
        let handles: Vec<_> = (0..writers)
            .map(|key| {
                let heap = &heap;
                let index = &index;
                scope.spawn(move || {
                    if key > 0 {
                        heap.gate.wait();
                    }
                    let vector = vec![key as f32, 1.0, 2.0];
                    index.insert(key, Some(vector.as_slice()))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("insert thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    assert!(outcomes
        .iter()
        .all(|o| matches!(o, InsertOutcome::Postponed(report) if report.tuples_indexed == 4)));
    assert_eq!(index.header()?.num_vectors, 4);

    // Rows arriving after the build go through the normal insert path.
    heap.rows.push(9, Some(vec![9.0, 1.0, 2.0]));
    let outcome = index.insert(9, Some(&[9.0, 1.0, 2.0][..]))?;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));

    let keys: FxHashSet<u64> = index
        .search_with_ef(&[0.0, 1.0, 2.0], 10, 32)?
        .into_iter()
        .map(|hit| hit.key)
        .collect();
    assert_eq!(keys, [0, 1, 2, 3, 9].into_iter().collect());
    assert!(index.verify()?.is_clean());
    Ok(())
}

#[test]
fn key_reinserted_after_delete_is_indexed_again() -> Result<()> {
    let dir = tempdir()?;
    let heap = Arc::new(MemoryHeap::new());
    let (_pager, index) = open(&dir.path().join("reinsert.idx"), &heap)?;
    heap.push(1, Some(vec![0.0, 0.0]));
    let outcome = index.insert(1, Some(&[0.0, 0.0][..]))?;
    assert!(matches!(outcome, InsertOutcome::Postponed(_)));
    assert_eq!(index.header()?.num_vectors, 1);

    let deleted = index.bulk_delete(|key| key == 1)?;
    assert_eq!(deleted.tuples_removed, 1);
    assert!(index.search(&[0.0, 0.0], 1)?.is_empty());

    let outcome = index.insert(1, Some(&[9.0, 9.0][..]))?;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    assert_eq!(index.header()?.num_vectors, 2);
    let hits = index.search(&[9.0, 9.0], 1)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, 1);
    Ok(())
}

#[test]
fn explicit_build_does_not_absorb_later_inserts() -> Result<()> {
    let dir = tempdir()?;
    let heap = Arc::new(MemoryHeap::new());
    let (_pager, index) = open(&dir.path().join("explicit.idx"), &heap)?;
    for key in 0..5u64 {
        heap.push(key, Some(vec![key as f32, 1.0]));
    }
    let mut rng = rand::thread_rng();
    let report = index.build(&mut rng)?.expect("heap has vectors");
    assert_eq!(report.tuples_indexed, 5);

    index.bulk_delete(|key| key == 3)?;
    let outcome = index.insert(3, Some(&[30.0, 1.0][..]))?;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    assert_eq!(index.header()?.num_vectors, 6);
    assert_eq!(index.search(&[30.0, 1.0], 1)?[0].key, 3);
    Ok(())
}

#[test]
fn explicit_build_refuses_to_run_twice() -> Result<()> {
    let dir = tempdir()?;
    let heap = Arc::new(MemoryHeap::new());
    let (pager, index) = open(&dir.path().join("twice.idx"), &heap)?;
    let mut rng = rand::thread_rng();
    assert_eq!(index.build(&mut rng)?, None);
    assert_eq!(pager.page_count(), 0);

    heap.push(5, Some(vec![1.0, 1.0]));
    let report = index.build(&mut rng)?.expect("heap has a vector");
    assert_eq!(report.dimensions, 2);
    assert!(matches!(index.build(&mut rng), Err(HnswError::Invalid(_))));
    Ok(())
}
