//! Index header page (page 0).
//!
//! The header records the vector geometry, the insertion count, the tail node
//! block, the block-map directory and the graph library's own header blob.
//! The magic number is checked before any other field is trusted.

use std::convert::{TryFrom, TryInto};

use super::codec::{NodeLayout, Quantization};
use super::distance::Metric;
use super::options::IndexOptions;
use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    HnswError, PageId, Result,
};

/// Identifies an initialized index header.
pub const INDEX_MAGIC: u32 = 0x4C48_4E53;
/// Current header layout version.
pub const INDEX_VERSION: u32 = 1;
/// Bytes reserved for the graph library's header blob.
pub const LIBRARY_HEADER_CAPACITY: usize = 128;

mod field {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const VERSION: Range<usize> = 4..8;
    pub const VECTOR_DIM: Range<usize> = 8..12;
    pub const NUM_VECTORS: Range<usize> = 12..16;
    pub const METRIC: usize = 16;
    pub const M: Range<usize> = 18..20;
    pub const EF_CONSTRUCTION: Range<usize> = 20..22;
    pub const EF_SEARCH: Range<usize> = 22..24;
    pub const PQ_SUBVECTORS: Range<usize> = 24..26;
    pub const TAIL_BLOCK: Range<usize> = 28..32;
    pub const LIBRARY_LEN: Range<usize> = 32..34;
    pub const LIBRARY_BLOB: usize = 36;
    pub const BLOCKMAP_COUNT: Range<usize> = 164..168;
    pub const BLOCKMAP_PAGES: usize = 168;
}

/// Decoded index header.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexHeader {
    /// Fixed vector dimensionality.
    pub vector_dim: u32,
    /// Committed node count; slots at or past it are invisible.
    pub num_vectors: u32,
    /// Distance metric.
    pub metric: Metric,
    /// Upper tier connectivity.
    pub m: u16,
    /// Beam width while inserting.
    pub ef_construction: u16,
    /// Default beam width while searching.
    pub ef_search: u16,
    /// Product quantization subvectors, 0 when vectors are stored raw.
    pub pq_subvectors: u16,
    /// Block receiving the next node.
    pub tail_block: Option<PageId>,
    /// Opaque graph library state.
    pub library_header: Vec<u8>,
    /// Block-map pages, in slot order.
    pub blockmap_pages: Vec<PageId>,
}

impl IndexHeader {
    /// Header of an empty index with dimensionality `vector_dim`.
    pub fn new(vector_dim: u32, options: &IndexOptions) -> Self {
        let pq_subvectors = match options.quantization {
            Quantization::None => 0,
            Quantization::Product { subvectors } => subvectors,
        };
        Self {
            vector_dim,
            num_vectors: 0,
            metric: options.metric,
            m: options.m,
            ef_construction: options.ef_construction,
            ef_search: options.ef_search,
            pq_subvectors,
            tail_block: None,
            library_header: Vec::new(),
            blockmap_pages: Vec::new(),
        }
    }

    /// Payload encoding recorded in the header.
    pub fn quantization(&self) -> Quantization {
        match self.pq_subvectors {
            0 => Quantization::None,
            subvectors => Quantization::Product { subvectors },
        }
    }

    /// Node geometry implied by the header.
    pub fn layout(&self) -> Result<NodeLayout> {
        NodeLayout::new(self.vector_dim, self.m, self.quantization())
    }

    /// Number of block-map pages a header page of `page_size` can list.
    pub fn max_blockmap_pages(page_size: usize) -> usize {
        page_size.saturating_sub(PAGE_HDR_LEN + field::BLOCKMAP_PAGES) / 4
    }

    /// Parses the header out of the page 0 image.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let page_header = PageHeader::decode(page)
            .map_err(|_| HnswError::CorruptHeader("page 0 has no valid page header"))?;
        if page_header.kind != PageKind::IndexHeader {
            return Err(HnswError::CorruptHeader("page 0 is not an index header"));
        }
        let body = page
            .get(PAGE_HDR_LEN..)
            .ok_or(HnswError::CorruptHeader("header page truncated"))?;
        if read_u32(body, field::MAGIC)? != INDEX_MAGIC {
            return Err(HnswError::CorruptHeader("index magic mismatch"));
        }
        if read_u32(body, field::VERSION)? != INDEX_VERSION {
            return Err(HnswError::CorruptHeader("unsupported index version"));
        }
        let metric = Metric::try_from(body[field::METRIC])?;
        let library_len = read_u16(body, field::LIBRARY_LEN)? as usize;
        if library_len > LIBRARY_HEADER_CAPACITY {
            return Err(HnswError::CorruptHeader("library header length out of range"));
        }
        let library_header =
            body[field::LIBRARY_BLOB..field::LIBRARY_BLOB + library_len].to_vec();
        let blockmap_count = read_u32(body, field::BLOCKMAP_COUNT)? as usize;
        if blockmap_count > Self::max_blockmap_pages(page.len()) {
            return Err(HnswError::CorruptHeader("block-map directory overflows page"));
        }
        let blockmap_pages = body[field::BLOCKMAP_PAGES..]
            .chunks_exact(4)
            .take(blockmap_count)
            .map(|c| PageId(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        let tail = read_u32(body, field::TAIL_BLOCK)?;
        Ok(Self {
            vector_dim: read_u32(body, field::VECTOR_DIM)?,
            num_vectors: read_u32(body, field::NUM_VECTORS)?,
            metric,
            m: read_u16(body, field::M)?,
            ef_construction: read_u16(body, field::EF_CONSTRUCTION)?,
            ef_search: read_u16(body, field::EF_SEARCH)?,
            pq_subvectors: read_u16(body, field::PQ_SUBVECTORS)?,
            tail_block: (tail != 0).then_some(PageId(tail)),
            library_header,
            blockmap_pages,
        })
    }

    /// Writes the header into the page 0 image, keeping its page header.
    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        if self.library_header.len() > LIBRARY_HEADER_CAPACITY {
            return Err(HnswError::Invalid("library header exceeds reserved space"));
        }
        if self.blockmap_pages.len() > Self::max_blockmap_pages(page.len()) {
            return Err(HnswError::StorageExhausted("block-map directory is full"));
        }
        let body = page
            .get_mut(PAGE_HDR_LEN..)
            .ok_or(HnswError::Invalid("header page too small"))?;
        body.fill(0);
        body[field::MAGIC].copy_from_slice(&INDEX_MAGIC.to_le_bytes());
        body[field::VERSION].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        body[field::VECTOR_DIM].copy_from_slice(&self.vector_dim.to_le_bytes());
        body[field::NUM_VECTORS].copy_from_slice(&self.num_vectors.to_le_bytes());
        body[field::METRIC] = self.metric.as_u8();
        body[field::M].copy_from_slice(&self.m.to_le_bytes());
        body[field::EF_CONSTRUCTION].copy_from_slice(&self.ef_construction.to_le_bytes());
        body[field::EF_SEARCH].copy_from_slice(&self.ef_search.to_le_bytes());
        body[field::PQ_SUBVECTORS].copy_from_slice(&self.pq_subvectors.to_le_bytes());
        let tail = self.tail_block.map_or(0, |p| p.0);
        body[field::TAIL_BLOCK].copy_from_slice(&tail.to_le_bytes());
        body[field::LIBRARY_LEN].copy_from_slice(&(self.library_header.len() as u16).to_le_bytes());
        body[field::LIBRARY_BLOB..field::LIBRARY_BLOB + self.library_header.len()]
            .copy_from_slice(&self.library_header);
        body[field::BLOCKMAP_COUNT]
            .copy_from_slice(&(self.blockmap_pages.len() as u32).to_le_bytes());
        for (chunk, page_id) in body[field::BLOCKMAP_PAGES..]
            .chunks_exact_mut(4)
            .zip(&self.blockmap_pages)
        {
            chunk.copy_from_slice(&page_id.0.to_le_bytes());
        }
        Ok(())
    }
}

fn read_u32(body: &[u8], range: core::ops::Range<usize>) -> Result<u32> {
    body.get(range)
        .and_then(|raw| raw.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(HnswError::CorruptHeader("header field out of range"))
}

fn read_u16(body: &[u8], range: core::ops::Range<usize>) -> Result<u16> {
    body.get(range)
        .and_then(|raw| raw.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(HnswError::CorruptHeader("header field out of range"))
}
