//! HNSW graph persisted in pager pages.
//!
//! Page 0 holds the [`IndexHeader`]; node blocks and block-map pages follow
//! in allocation order. Insertions go through [`HnswIndex::insert`], which
//! links one node per bounded transaction.

pub mod blockmap;
pub mod build;
pub mod codec;
pub mod distance;
pub mod graph;
pub mod header;
pub mod index;
pub mod insert;
pub mod options;
pub mod retriever;
pub mod store;
pub mod verify;

pub use blockmap::{BlockHeader, BlockMap};
pub use build::{BuildReport, HeapSource, MemoryHeap};
pub use codec::{NodeLayout, NodeView, NodeViewMut, Quantization, HNSW_MAX_DIM, TOMBSTONE_KEY};
pub use distance::Metric;
pub use graph::{GraphLibrary, Hnsw, MeanQuantizer, Quantizer, SearchHit};
pub use header::IndexHeader;
pub use index::{BulkDeleteStats, HnswIndex};
pub use insert::{generate_new_level, InsertOutcome, InsertPhase};
pub use options::IndexOptions;
pub use retriever::{AccessMode, RetrieverCtx, RetrieverStats};
pub use store::{NodeMut, NodeRef, NodeStore};
pub use verify::VerifyReport;
