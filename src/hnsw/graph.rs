//! Graph library contract and the bundled HNSW implementation.
//!
//! The library owns the traversal and linking logic; node bytes live behind
//! a [`NodeStore`]. Its in-memory synopsis (entry point, top level, element
//! count) round-trips through an opaque blob the index keeps in its header
//! page and never parses.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::convert::TryInto;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::trace;

use super::codec::Quantization;
use super::distance::Metric;
use super::header::IndexHeader;
use super::store::NodeStore;
use crate::types::{HnswError, Result, SlotId};

/// Bytes of the blob written by [`Hnsw::header_blob`].
pub const HNSW_BLOB_LEN: usize = 20;

const NO_ENTRY: u32 = u32::MAX;

/// What the insertion protocol needs from a graph library.
pub trait GraphLibrary {
    /// Restores the synopsis saved by [`header_blob`](Self::header_blob).
    /// An empty blob means an empty graph.
    fn load_header(&mut self, blob: &[u8]) -> Result<()>;

    /// Serializes the synopsis.
    fn header_blob(&self) -> Vec<u8>;

    /// Upper tier capacity; drives level sampling.
    fn connectivity(&self) -> u16;

    /// Links the reserved node `slot` into the graph and stores its payload.
    fn add<S: NodeStore>(
        &mut self,
        store: &mut S,
        slot: SlotId,
        key: u64,
        vector: &[f32],
        level: u16,
    ) -> Result<()>;
}

/// Encodes vectors into the fixed-size codes stored in quantized nodes.
pub trait Quantizer: Send + Sync {
    /// Code bytes per vector.
    fn num_subvectors(&self) -> u16;

    /// Vector to codes.
    fn encode(&self, vector: &[f32]) -> Vec<u8>;

    /// Codes back to an approximate vector.
    fn decode(&self, codes: &[u8]) -> Vec<f32>;
}

/// Quantizer storing one byte per subvector: the subvector mean mapped
/// linearly onto `[lo, hi]`.
#[derive(Clone, Debug)]
pub struct MeanQuantizer {
    dim: usize,
    subvectors: u16,
    lo: f32,
    hi: f32,
}

impl MeanQuantizer {
    /// Quantizer for `dim`-dimensional vectors with components in `[lo, hi]`.
    pub fn new(dim: u32, subvectors: u16, lo: f32, hi: f32) -> Result<Self> {
        if subvectors == 0 || subvectors as u32 > dim || hi <= lo {
            return Err(HnswError::InvalidLayout(format!(
                "cannot quantize {dim} dimensions into {subvectors} subvectors"
            )));
        }
        Ok(Self {
            dim: dim as usize,
            subvectors,
            lo,
            hi,
        })
    }

    fn bounds(&self, index: usize) -> (usize, usize) {
        let count = self.subvectors as usize;
        (index * self.dim / count, (index + 1) * self.dim / count)
    }
}

impl Quantizer for MeanQuantizer {
    fn num_subvectors(&self) -> u16 {
        self.subvectors
    }

    fn encode(&self, vector: &[f32]) -> Vec<u8> {
        (0..self.subvectors as usize)
            .map(|index| {
                let (start, end) = self.bounds(index);
                let part = &vector[start.min(vector.len())..end.min(vector.len())];
                let mean = if part.is_empty() {
                    self.lo
                } else {
                    part.iter().sum::<f32>() / part.len() as f32
                };
                let scaled = (mean - self.lo) / (self.hi - self.lo) * 255.0;
                scaled.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = vec![0.0; self.dim];
        for (index, &code) in codes.iter().enumerate().take(self.subvectors as usize) {
            let value = self.lo + code as f32 / 255.0 * (self.hi - self.lo);
            let (start, end) = self.bounds(index);
            out[start..end].fill(value);
        }
        out
    }
}

/// One search result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchHit {
    /// Slot of the node.
    pub slot: SlotId,
    /// External key.
    pub key: u64,
    /// Distance to the query.
    pub distance: f32,
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    distance: f32,
    slot: SlotId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.slot.cmp(&other.slot))
    }
}

type SlotList = SmallVec<[SlotId; 32]>;

/// Hierarchical navigable small world graph over a [`NodeStore`].
#[derive(Clone)]
pub struct Hnsw {
    metric: Metric,
    m: u16,
    ef_construction: u16,
    entry: Option<SlotId>,
    max_level: u16,
    size: u64,
    quantizer: Option<Arc<dyn Quantizer>>,
}

impl std::fmt::Debug for Hnsw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hnsw")
            .field("metric", &self.metric)
            .field("m", &self.m)
            .field("ef_construction", &self.ef_construction)
            .field("entry", &self.entry)
            .field("max_level", &self.max_level)
            .field("size", &self.size)
            .field("quantized", &self.quantizer.is_some())
            .finish()
    }
}

impl Hnsw {
    /// Empty graph.
    pub fn new(metric: Metric, m: u16, ef_construction: u16) -> Self {
        Self {
            metric,
            m,
            ef_construction,
            entry: None,
            max_level: 0,
            size: 0,
            quantizer: None,
        }
    }

    /// Graph described by an index header, synopsis included.
    pub fn from_header(header: &IndexHeader) -> Result<Self> {
        let mut graph = Self::new(header.metric, header.m, header.ef_construction);
        graph.load_header(&header.library_header)?;
        Ok(graph)
    }

    /// Attaches the quantizer used for quantized payloads.
    pub fn with_quantizer(mut self, quantizer: Arc<dyn Quantizer>) -> Self {
        self.quantizer = Some(quantizer);
        self
    }

    /// Entry point, if any node was added.
    pub fn entry(&self) -> Option<SlotId> {
        self.entry
    }

    /// Highest level in the graph.
    pub fn max_level(&self) -> u16 {
        self.max_level
    }

    /// Nodes added over the graph's lifetime.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The `k` nearest live nodes to `query`, exploring `ef` candidates on
    /// the base tier.
    pub fn search<S: NodeStore>(
        &self,
        store: &mut S,
        query: &[f32],
        k: usize,
        ef: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(entry) = self.entry.filter(|e| e.0 < store.len()) else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut nearest = Candidate {
            distance: self.distance(store, query, entry)?,
            slot: entry,
        };
        for level in (1..=self.max_level).rev() {
            nearest = self.greedy(store, query, nearest, level)?;
        }
        let found = self.search_layer(store, query, &[nearest], ef.max(k), 0)?;
        let mut hits = Vec::with_capacity(k);
        for candidate in found {
            if hits.len() == k {
                break;
            }
            let node = store.get(candidate.slot)?;
            if node.view().is_tombstone() {
                continue;
            }
            hits.push(SearchHit {
                slot: candidate.slot,
                key: node.key(),
                distance: candidate.distance,
            });
        }
        Ok(hits)
    }

    fn quantizer(&self) -> Result<&dyn Quantizer> {
        self.quantizer
            .as_deref()
            .ok_or_else(|| HnswError::InvalidLayout("quantized index needs a quantizer".into()))
    }

    fn load_vector<S: NodeStore>(&self, store: &mut S, slot: SlotId) -> Result<Vec<f32>> {
        let quantized = store.layout().quantization() != Quantization::None;
        let node = store.get(slot)?;
        let view = node.view();
        if quantized {
            Ok(self.quantizer()?.decode(view.payload()))
        } else {
            Ok(view.vector().collect())
        }
    }

    fn distance<S: NodeStore>(&self, store: &mut S, query: &[f32], slot: SlotId) -> Result<f32> {
        let quantized = store.layout().quantization() != Quantization::None;
        let node = store.get(slot)?;
        let view = node.view();
        if quantized {
            let decoded = self.quantizer()?.decode(view.payload());
            Ok(self.metric.distance(query, decoded))
        } else {
            Ok(self.metric.distance(query, view.vector()))
        }
    }

    fn neighbors<S: NodeStore>(&self, store: &mut S, slot: SlotId, level: u16) -> Result<SlotList> {
        let len = store.len();
        let node = store.get(slot)?;
        if node.level() < level {
            return Ok(SlotList::new());
        }
        // Links to slots past the visible range belong to uncommitted nodes.
        let visible = node.neighbors(level)?.filter(|n| n.0 < len).collect();
        Ok(visible)
    }

    fn greedy<S: NodeStore>(
        &self,
        store: &mut S,
        query: &[f32],
        mut best: Candidate,
        level: u16,
    ) -> Result<Candidate> {
        loop {
            let mut improved = false;
            for neighbor in self.neighbors(store, best.slot, level)? {
                let distance = self.distance(store, query, neighbor)?;
                if distance < best.distance {
                    best = Candidate {
                        distance,
                        slot: neighbor,
                    };
                    improved = true;
                }
            }
            if !improved {
                return Ok(best);
            }
        }
    }

    /// Beam search on one tier. Results are sorted nearest first.
    fn search_layer<S: NodeStore>(
        &self,
        store: &mut S,
        query: &[f32],
        entries: &[Candidate],
        ef: usize,
        level: u16,
    ) -> Result<Vec<Candidate>> {
        let mut visited: FxHashSet<SlotId> = entries.iter().map(|c| c.slot).collect();
        let mut frontier: BinaryHeap<Reverse<Candidate>> =
            entries.iter().copied().map(Reverse).collect();
        let mut results: BinaryHeap<Candidate> = entries.iter().copied().collect();

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |c| c.distance);
            if current.distance > worst && results.len() >= ef {
                break;
            }
            for neighbor in self.neighbors(store, current.slot, level)? {
                if !visited.insert(neighbor) {
                    continue;
                }
                let distance = self.distance(store, query, neighbor)?;
                let worst = results.peek().map_or(f32::INFINITY, |c| c.distance);
                if results.len() < ef || distance < worst {
                    let candidate = Candidate {
                        distance,
                        slot: neighbor,
                    };
                    frontier.push(Reverse(candidate));
                    results.push(candidate);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        Ok(results.into_sorted_vec())
    }

    /// Keeps candidates closer to the base than to any already kept
    /// neighbor, then tops up with the rest. `candidates` is nearest first.
    fn select_neighbors<S: NodeStore>(
        &self,
        store: &mut S,
        candidates: &[Candidate],
        capacity: usize,
    ) -> Result<SlotList> {
        let mut kept: Vec<(Candidate, Vec<f32>)> = Vec::with_capacity(capacity);
        let mut pruned = Vec::new();
        for &candidate in candidates {
            if kept.len() >= capacity {
                break;
            }
            let vector = self.load_vector(store, candidate.slot)?;
            let diverse = kept.iter().all(|(_, other)| {
                self.metric.distance(&vector, other.iter().copied()) > candidate.distance
            });
            if diverse {
                kept.push((candidate, vector));
            } else {
                pruned.push(candidate);
            }
        }
        let mut selected: SlotList = kept.into_iter().map(|(c, _)| c.slot).collect();
        for candidate in pruned {
            if selected.len() >= capacity {
                break;
            }
            selected.push(candidate.slot);
        }
        Ok(selected)
    }

    fn link_back<S: NodeStore>(
        &self,
        store: &mut S,
        neighbor: SlotId,
        slot: SlotId,
        level: u16,
    ) -> Result<()> {
        {
            let mut node = store.get_mut(neighbor)?;
            if node.level() < level {
                return Ok(());
            }
            if node.view_mut().push_neighbor(level, slot)? {
                return Ok(());
            }
        }
        let capacity = tier_capacity(store, level);
        let base = self.load_vector(store, neighbor)?;
        let mut candidates = Vec::with_capacity(capacity + 1);
        let existing = self.neighbors(store, neighbor, level)?;
        for other in existing.into_iter().chain(std::iter::once(slot)) {
            let vector = self.load_vector(store, other)?;
            candidates.push(Candidate {
                distance: self.metric.distance(&base, vector),
                slot: other,
            });
        }
        candidates.sort();
        let selected = self.select_neighbors(store, &candidates, capacity)?;
        trace!(
            node = neighbor.0,
            level,
            kept = selected.len(),
            "hnsw.graph.prune"
        );
        store.get_mut(neighbor)?.view_mut().set_neighbors(level, &selected)
    }
}

fn tier_capacity<S: NodeStore>(store: &S, level: u16) -> usize {
    let layout = store.layout();
    if level == 0 {
        layout.connectivity_base()
    } else {
        layout.connectivity()
    }
}

impl GraphLibrary for Hnsw {
    fn load_header(&mut self, blob: &[u8]) -> Result<()> {
        if blob.is_empty() {
            self.entry = None;
            self.max_level = 0;
            self.size = 0;
            return Ok(());
        }
        if blob.len() != HNSW_BLOB_LEN {
            return Err(HnswError::CorruptHeader("graph synopsis has the wrong length"));
        }
        let u16_at = |at: usize| u16::from_le_bytes([blob[at], blob[at + 1]]);
        let entry = u32::from_le_bytes(blob[0..4].try_into().unwrap_or([0xFF; 4]));
        let m = u16_at(6);
        if m != self.m {
            return Err(HnswError::CorruptHeader("graph synopsis disagrees on m"));
        }
        self.entry = (entry != NO_ENTRY).then_some(SlotId(entry));
        self.max_level = u16_at(4);
        self.ef_construction = u16_at(8);
        self.metric = Metric::try_from(blob[10])?;
        self.size = u64::from_le_bytes(blob[12..20].try_into().unwrap_or_default());
        Ok(())
    }

    fn header_blob(&self) -> Vec<u8> {
        let mut blob = vec![0u8; HNSW_BLOB_LEN];
        blob[0..4].copy_from_slice(&self.entry.map_or(NO_ENTRY, |e| e.0).to_le_bytes());
        blob[4..6].copy_from_slice(&self.max_level.to_le_bytes());
        blob[6..8].copy_from_slice(&self.m.to_le_bytes());
        blob[8..10].copy_from_slice(&self.ef_construction.to_le_bytes());
        blob[10] = self.metric.as_u8();
        blob[12..20].copy_from_slice(&self.size.to_le_bytes());
        blob
    }

    fn connectivity(&self) -> u16 {
        self.m
    }

    fn add<S: NodeStore>(
        &mut self,
        store: &mut S,
        slot: SlotId,
        key: u64,
        vector: &[f32],
        level: u16,
    ) -> Result<()> {
        let quantized = store.layout().quantization() != Quantization::None;
        let codes = if quantized {
            Some(self.quantizer()?.encode(vector))
        } else {
            None
        };
        {
            let mut node = store.get_mut(slot)?;
            if node.level() != level {
                return Err(HnswError::Invalid("reserved node has another level"));
            }
            let mut view = node.view_mut();
            match &codes {
                Some(codes) => view.write_codes(codes)?,
                None => view.write_vector(vector)?,
            }
        }

        let entry = self.entry.filter(|e| e.0 < store.len() && *e != slot);
        let Some(entry) = entry else {
            self.entry = Some(slot);
            self.max_level = level;
            self.size += 1;
            trace!(slot = slot.0, key, level, "hnsw.graph.first_node");
            return Ok(());
        };

        let mut nearest = Candidate {
            distance: self.distance(store, vector, entry)?,
            slot: entry,
        };
        for tier in (level.saturating_add(1)..=self.max_level).rev() {
            nearest = self.greedy(store, vector, nearest, tier)?;
        }
        let mut entries = vec![nearest];
        for tier in (0..=level.min(self.max_level)).rev() {
            let found =
                self.search_layer(store, vector, &entries, self.ef_construction as usize, tier)?;
            let found: Vec<Candidate> = found.into_iter().filter(|c| c.slot != slot).collect();
            let capacity = tier_capacity(store, tier);
            let selected = self.select_neighbors(store, &found, capacity)?;
            store.get_mut(slot)?.view_mut().set_neighbors(tier, &selected)?;
            for &neighbor in &selected {
                self.link_back(store, neighbor, slot, tier)?;
            }
            if !found.is_empty() {
                entries = found;
            }
        }

        if level > self.max_level {
            self.entry = Some(slot);
            self.max_level = level;
        }
        self.size += 1;
        trace!(slot = slot.0, key, level, "hnsw.graph.add");
        Ok(())
    }
}
