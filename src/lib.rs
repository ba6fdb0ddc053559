//! HNSW proximity graph stored in a paged, WAL-backed file.
//!
//! ```no_run
//! use std::sync::Arc;
//! use paged_hnsw::hnsw::{HnswIndex, IndexOptions, MemoryHeap};
//! use paged_hnsw::primitives::pager::{Pager, PagerOptions};
//!
//! # fn main() -> paged_hnsw::Result<()> {
//! let pager = Arc::new(Pager::create("vectors.idx", PagerOptions::default())?);
//! let heap = Arc::new(MemoryHeap::new());
//! let index = HnswIndex::open(pager, IndexOptions::with_dimensions(3), heap.clone())?;
//! heap.push(1, Some(vec![0.1, 0.2, 0.3]));
//! index.insert(1, Some(&[0.1, 0.2, 0.3][..]))?;
//! let hits = index.search(&[0.1, 0.2, 0.25], 1)?;
//! assert_eq!(hits[0].key, 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod hnsw;
pub mod logging;
pub mod primitives;
pub mod types;

pub use types::{HnswError, Lsn, PageId, Result, SlotId};
