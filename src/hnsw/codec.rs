//! Byte layout of a single graph node.
//!
//! ```text
//! key u64 | level u16 | base tier | upper tier * level | payload
//! tier = count u32 | slot u32 * capacity
//! ```
//!
//! Nodes carry no length prefix: the size is recomputed from the level and
//! the index-wide [`NodeLayout`].

use std::convert::TryInto;

use tracing::trace;

use crate::types::{HnswError, Result, SlotId};

/// Bytes before the first neighbor tier: key and level.
pub const NODE_HEAD_BYTES: usize = 8 + 2;
/// Key stamped into logically removed nodes.
pub const TOMBSTONE_KEY: u64 = u64::MAX;
/// Longest vector an index accepts.
pub const HNSW_MAX_DIM: u32 = 2000;

const KEY: std::ops::Range<usize> = 0..8;
const LEVEL: std::ops::Range<usize> = 8..10;
const SLOT_BYTES: usize = 4;

/// How vector payloads are stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Quantization {
    /// Raw little-endian `f32` components.
    #[default]
    None,
    /// One code byte per subvector.
    Product {
        /// Number of subvectors; must divide into the vector at least four
        /// bytes apiece.
        subvectors: u16,
    },
}

/// Neighbor tier capacities.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NeighborLayout {
    /// Neighbors per upper tier (`M`).
    pub connectivity: u16,
    /// Neighbors in the base tier, twice `connectivity`.
    pub connectivity_base: u16,
}

impl NeighborLayout {
    /// Derives the base tier capacity from `connectivity`.
    pub fn new(connectivity: u16) -> Self {
        Self {
            connectivity,
            connectivity_base: connectivity.saturating_mul(2),
        }
    }

    /// Bytes of the base tier, count included.
    pub fn base_bytes(&self) -> u32 {
        4 + SLOT_BYTES as u32 * self.connectivity_base as u32
    }

    /// Bytes of one upper tier, count included.
    pub fn tier_bytes(&self) -> u32 {
        4 + SLOT_BYTES as u32 * self.connectivity as u32
    }
}

/// Total bytes of a node at `level`.
pub fn node_size(
    neighbors: NeighborLayout,
    level: u16,
    vector_bytes: u32,
    quantization: Quantization,
) -> Result<u32> {
    let payload = match quantization {
        Quantization::None => vector_bytes,
        Quantization::Product { subvectors } => {
            if subvectors == 0 || subvectors as u32 > vector_bytes / 4 {
                return Err(HnswError::InvalidLayout(format!(
                    "{subvectors} subvectors cannot split a {vector_bytes}-byte vector"
                )));
            }
            subvectors as u32
        }
    };
    Ok(NODE_HEAD_BYTES as u32
        + neighbors.base_bytes()
        + neighbors.tier_bytes() * level as u32
        + payload)
}

/// Validated, index-wide node geometry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeLayout {
    neighbors: NeighborLayout,
    dim: u32,
    quantization: Quantization,
    payload_bytes: usize,
}

impl NodeLayout {
    /// Validates the geometry once so later size computations cannot fail.
    pub fn new(dim: u32, connectivity: u16, quantization: Quantization) -> Result<Self> {
        if dim == 0 {
            return Err(HnswError::InvalidLayout("vector dimension is zero".into()));
        }
        if connectivity < 2 {
            return Err(HnswError::InvalidLayout(format!(
                "connectivity {connectivity} is below 2"
            )));
        }
        let neighbors = NeighborLayout::new(connectivity);
        let vector_bytes = dim * 4;
        let base = node_size(neighbors, 0, vector_bytes, quantization)?;
        let payload_bytes = base as usize - NODE_HEAD_BYTES - neighbors.base_bytes() as usize;
        Ok(Self {
            neighbors,
            dim,
            quantization,
            payload_bytes,
        })
    }

    /// Vector dimensionality.
    pub fn dim(&self) -> u32 {
        self.dim
    }

    /// Upper tier capacity.
    pub fn connectivity(&self) -> usize {
        self.neighbors.connectivity as usize
    }

    /// Base tier capacity.
    pub fn connectivity_base(&self) -> usize {
        self.neighbors.connectivity_base as usize
    }

    /// Payload encoding.
    pub fn quantization(&self) -> Quantization {
        self.quantization
    }

    /// Tier capacities.
    pub fn neighbors(&self) -> NeighborLayout {
        self.neighbors
    }

    /// Bytes of an unquantized vector.
    pub fn vector_bytes(&self) -> usize {
        self.dim as usize * 4
    }

    /// Bytes of the stored payload.
    pub fn payload_bytes(&self) -> usize {
        self.payload_bytes
    }

    /// Total bytes of a node at `level`.
    pub fn node_size(&self, level: u16) -> usize {
        NODE_HEAD_BYTES
            + self.neighbors.base_bytes() as usize
            + self.neighbors.tier_bytes() as usize * level as usize
            + self.payload_bytes
    }

    /// Highest level whose node still fits in `capacity` bytes, or `None`
    /// when not even a level-0 node fits.
    pub fn max_level_within(&self, capacity: usize) -> Option<u16> {
        let base = self.node_size(0);
        if base > capacity {
            return None;
        }
        let extra = (capacity - base) / self.neighbors.tier_bytes() as usize;
        Some(extra.min(u16::MAX as usize) as u16)
    }

    fn tier_capacity(&self, level: u16) -> usize {
        if level == 0 {
            self.connectivity_base()
        } else {
            self.connectivity()
        }
    }

    fn tier_offset(&self, level: u16) -> usize {
        if level == 0 {
            NODE_HEAD_BYTES
        } else {
            NODE_HEAD_BYTES
                + self.neighbors.base_bytes() as usize
                + self.neighbors.tier_bytes() as usize * (level as usize - 1)
        }
    }

    fn payload_offset(&self, level: u16) -> usize {
        self.node_size(level) - self.payload_bytes
    }
}

/// Zero-fills a node of `level` at the start of `buf` and stamps its key and
/// level. Returns the node size.
pub fn init_node(
    buf: &mut [u8],
    layout: &NodeLayout,
    key: u64,
    level: u16,
    slot: SlotId,
) -> Result<usize> {
    let size = layout.node_size(level);
    let node = buf
        .get_mut(..size)
        .ok_or(HnswError::Invalid("buffer too small for node"))?;
    node.fill(0);
    node[LEVEL].copy_from_slice(&level.to_le_bytes());
    node[KEY].copy_from_slice(&key.to_le_bytes());
    trace!(slot = slot.0, key, level, size, "codec.init_node");
    Ok(size)
}

/// Decodes the node starting at `offset` of a page image.
pub fn read_node<'a>(
    page: &'a [u8],
    offset: usize,
    layout: &'a NodeLayout,
) -> Result<(NodeView<'a>, usize, u16)> {
    let tail = page
        .get(offset..)
        .ok_or(HnswError::Corruption("node offset past end of page"))?;
    let level = node_level(tail)?;
    let size = layout.node_size(level);
    let bytes = tail
        .get(..size)
        .ok_or(HnswError::Corruption("node truncated by end of page"))?;
    Ok((NodeView { bytes, layout, level }, size, level))
}

/// Reads the key of a node.
pub fn node_key(bytes: &[u8]) -> Result<u64> {
    bytes
        .get(KEY)
        .and_then(|raw| raw.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(HnswError::Corruption("node shorter than its header"))
}

/// Reads the level of a node.
pub fn node_level(bytes: &[u8]) -> Result<u16> {
    bytes
        .get(LEVEL)
        .and_then(|raw| raw.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(HnswError::Corruption("node shorter than its header"))
}

/// Stamps the tombstone key; the node stays in the graph for traversal.
pub fn clear_key(bytes: &mut [u8]) -> Result<()> {
    let raw = bytes
        .get_mut(KEY)
        .ok_or(HnswError::Corruption("node shorter than its header"))?;
    raw.copy_from_slice(&TOMBSTONE_KEY.to_le_bytes());
    Ok(())
}

/// Read-only view of one encoded node.
#[derive(Clone, Copy, Debug)]
pub struct NodeView<'a> {
    bytes: &'a [u8],
    layout: &'a NodeLayout,
    level: u16,
}

impl<'a> NodeView<'a> {
    /// Wraps exactly one encoded node.
    pub fn new(bytes: &'a [u8], layout: &'a NodeLayout) -> Result<Self> {
        let level = node_level(bytes)?;
        if bytes.len() != layout.node_size(level) {
            return Err(HnswError::Corruption("node length disagrees with level"));
        }
        Ok(Self {
            bytes,
            layout,
            level,
        })
    }

    /// Wraps bytes already checked by [`read_node`].
    pub(crate) fn from_checked(bytes: &'a [u8], layout: &'a NodeLayout, level: u16) -> Self {
        Self {
            bytes,
            layout,
            level,
        }
    }

    /// External key.
    pub fn key(&self) -> u64 {
        u64::from_le_bytes(self.bytes[KEY].try_into().unwrap_or([0xFF; 8]))
    }

    /// Top level of the node.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// True once [`clear_key`] ran on the node.
    pub fn is_tombstone(&self) -> bool {
        self.key() == TOMBSTONE_KEY
    }

    /// Neighbor list of tier `level`.
    pub fn neighbors(&self, level: u16) -> Result<Neighbors<'a>> {
        tier(self.bytes, self.layout, self.level, level)
    }

    /// Stored payload bytes.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.layout.payload_offset(self.level)..]
    }

    /// Vector components of an unquantized node.
    pub fn vector(&self) -> impl Iterator<Item = f32> + 'a {
        self.payload()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// The whole node.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Mutable view of one encoded node.
#[derive(Debug)]
pub struct NodeViewMut<'a> {
    bytes: &'a mut [u8],
    layout: &'a NodeLayout,
    level: u16,
}

impl<'a> NodeViewMut<'a> {
    /// Wraps exactly one encoded node.
    pub fn new(bytes: &'a mut [u8], layout: &'a NodeLayout) -> Result<Self> {
        let level = node_level(bytes)?;
        if bytes.len() != layout.node_size(level) {
            return Err(HnswError::Corruption("node length disagrees with level"));
        }
        Ok(Self {
            bytes,
            layout,
            level,
        })
    }

    /// Wraps bytes already checked by [`read_node`].
    pub(crate) fn from_checked(bytes: &'a mut [u8], layout: &'a NodeLayout, level: u16) -> Self {
        Self {
            bytes,
            layout,
            level,
        }
    }

    /// Read-only reborrow.
    pub fn view(&self) -> NodeView<'_> {
        NodeView {
            bytes: &self.bytes[..],
            layout: self.layout,
            level: self.level,
        }
    }

    /// Top level of the node.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Overwrites the external key.
    pub fn set_key(&mut self, key: u64) {
        self.bytes[KEY].copy_from_slice(&key.to_le_bytes());
    }

    /// Marks the node removed.
    pub fn clear_key(&mut self) {
        self.set_key(TOMBSTONE_KEY);
    }

    /// Replaces the neighbor list of tier `level`.
    pub fn set_neighbors(&mut self, level: u16, slots: &[SlotId]) -> Result<()> {
        if level > self.level {
            return Err(HnswError::Invalid("tier above node level"));
        }
        let capacity = self.layout.tier_capacity(level);
        if slots.len() > capacity {
            return Err(HnswError::Invalid("neighbor list exceeds tier capacity"));
        }
        let start = self.layout.tier_offset(level);
        let tier = &mut self.bytes[start..start + 4 + capacity * SLOT_BYTES];
        tier[..4].copy_from_slice(&(slots.len() as u32).to_le_bytes());
        for (chunk, slot) in tier[4..].chunks_exact_mut(SLOT_BYTES).zip(slots) {
            chunk.copy_from_slice(&slot.0.to_le_bytes());
        }
        tier[4 + slots.len() * SLOT_BYTES..].fill(0);
        Ok(())
    }

    /// Appends one neighbor. Returns `false` when the tier is full.
    pub fn push_neighbor(&mut self, level: u16, slot: SlotId) -> Result<bool> {
        let current = tier(&self.bytes[..], self.layout, self.level, level)?;
        let count = current.len();
        if count >= self.layout.tier_capacity(level) {
            return Ok(false);
        }
        let start = self.layout.tier_offset(level);
        let at = start + 4 + count * SLOT_BYTES;
        self.bytes[at..at + SLOT_BYTES].copy_from_slice(&slot.0.to_le_bytes());
        self.bytes[start..start + 4].copy_from_slice(&(count as u32 + 1).to_le_bytes());
        Ok(true)
    }

    /// Stores an unquantized vector.
    pub fn write_vector(&mut self, vector: &[f32]) -> Result<()> {
        if self.layout.quantization != Quantization::None {
            return Err(HnswError::Invalid("quantized node needs codes, not a vector"));
        }
        if vector.len() != self.layout.dim as usize {
            return Err(HnswError::DimensionMismatch {
                expected: self.layout.dim,
                actual: vector.len() as u32,
            });
        }
        let start = self.layout.payload_offset(self.level);
        for (chunk, value) in self.bytes[start..].chunks_exact_mut(4).zip(vector) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Stores quantized codes.
    pub fn write_codes(&mut self, codes: &[u8]) -> Result<()> {
        if codes.len() != self.layout.payload_bytes {
            return Err(HnswError::Invalid("code length does not match layout"));
        }
        let start = self.layout.payload_offset(self.level);
        self.bytes[start..].copy_from_slice(codes);
        Ok(())
    }
}

/// Neighbor slots of one tier.
#[derive(Clone, Debug)]
pub struct Neighbors<'a> {
    raw: std::slice::ChunksExact<'a, u8>,
}

impl<'a> Neighbors<'a> {
    /// Number of neighbors left to yield.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// True when the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }
}

impl Iterator for Neighbors<'_> {
    type Item = SlotId;

    fn next(&mut self) -> Option<SlotId> {
        self.raw
            .next()
            .map(|c| SlotId(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.raw.len();
        (len, Some(len))
    }
}

impl ExactSizeIterator for Neighbors<'_> {}

fn tier<'a>(
    bytes: &'a [u8],
    layout: &NodeLayout,
    node_level: u16,
    level: u16,
) -> Result<Neighbors<'a>> {
    if level > node_level {
        return Err(HnswError::Invalid("tier above node level"));
    }
    let start = layout.tier_offset(level);
    let capacity = layout.tier_capacity(level);
    let count = bytes
        .get(start..start + 4)
        .and_then(|raw| raw.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(HnswError::Corruption("neighbor tier out of range"))? as usize;
    if count > capacity {
        return Err(HnswError::Corruption("neighbor count exceeds tier capacity"));
    }
    let slots = &bytes[start + 4..start + 4 + count * SLOT_BYTES];
    Ok(Neighbors {
        raw: slots.chunks_exact(SLOT_BYTES),
    })
}
