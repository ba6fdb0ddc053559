//! Node blocks and the slot → block directory.
//!
//! A node block packs consecutive slots starting at `first_slot`; blocks are
//! chained through `next_block` in allocation order. Block-map pages hold a
//! dense `u32` array where entry `s` names the block of slot `s`. Entry 0
//! means unset, page 0 being the header.

use std::convert::TryInto;

use crate::types::{page::PAGE_HDR_LEN, HnswError, PageId, Result, SlotId};

/// Bytes of the node block header following the page header.
pub const BLOCK_HDR_LEN: usize = 12;

/// Offset of the first node in a block.
pub const BLOCK_DATA_START: usize = PAGE_HDR_LEN + BLOCK_HDR_LEN;

/// Bytes available to nodes in one block.
pub fn block_capacity(page_size: usize) -> usize {
    page_size - BLOCK_DATA_START
}

/// Header of a node block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    /// Block allocated after this one.
    pub next_block: Option<PageId>,
    /// Slot of the first node.
    pub first_slot: SlotId,
    /// Nodes stored.
    pub node_count: u16,
    /// Offset of the first unused byte.
    pub free_offset: u16,
}

impl BlockHeader {
    /// Header of an empty block whose first node will be `first_slot`.
    pub fn empty(first_slot: SlotId) -> Self {
        Self {
            next_block: None,
            first_slot,
            node_count: 0,
            free_offset: BLOCK_DATA_START as u16,
        }
    }

    /// Reads the block header of a node block image.
    pub fn decode(page: &[u8]) -> Result<Self> {
        let raw = page
            .get(PAGE_HDR_LEN..BLOCK_DATA_START)
            .ok_or(HnswError::Corruption("node block truncated"))?;
        let next = u32::from_le_bytes(raw[0..4].try_into().unwrap_or_default());
        let header = Self {
            next_block: (next != 0).then_some(PageId(next)),
            first_slot: SlotId(u32::from_le_bytes(raw[4..8].try_into().unwrap_or_default())),
            node_count: u16::from_le_bytes(raw[8..10].try_into().unwrap_or_default()),
            free_offset: u16::from_le_bytes(raw[10..12].try_into().unwrap_or_default()),
        };
        if (header.free_offset as usize) < BLOCK_DATA_START
            || header.free_offset as usize > page.len()
        {
            return Err(HnswError::Corruption("node block free offset out of range"));
        }
        Ok(header)
    }

    /// Writes the block header into a node block image.
    pub fn encode(&self, page: &mut [u8]) -> Result<()> {
        let raw = page
            .get_mut(PAGE_HDR_LEN..BLOCK_DATA_START)
            .ok_or(HnswError::Invalid("node block too small"))?;
        raw[0..4].copy_from_slice(&self.next_block.map_or(0, |p| p.0).to_le_bytes());
        raw[4..8].copy_from_slice(&self.first_slot.0.to_le_bytes());
        raw[8..10].copy_from_slice(&self.node_count.to_le_bytes());
        raw[10..12].copy_from_slice(&self.free_offset.to_le_bytes());
        Ok(())
    }

    /// Bytes still free in a block of `page_size`.
    pub fn remaining(&self, page_size: usize) -> usize {
        page_size.saturating_sub(self.free_offset as usize)
    }

    /// True when `slot` is stored in this block.
    pub fn holds(&self, slot: SlotId) -> bool {
        slot.0 >= self.first_slot.0 && slot.0 < self.first_slot.0 + self.node_count as u32
    }
}

/// Arithmetic over block-map pages of one page size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockMap {
    entries_per_page: usize,
}

impl BlockMap {
    /// Block map for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            entries_per_page: (page_size - PAGE_HDR_LEN) / 4,
        }
    }

    /// Slots mapped by one block-map page.
    pub fn entries_per_page(&self) -> usize {
        self.entries_per_page
    }

    /// Directory index and entry index of `slot`.
    pub fn locate(&self, slot: SlotId) -> (usize, usize) {
        let slot = slot.0 as usize;
        (slot / self.entries_per_page, slot % self.entries_per_page)
    }

    /// Reads one entry; `None` when unset.
    pub fn read_entry(&self, page: &[u8], entry: usize) -> Result<Option<PageId>> {
        let at = PAGE_HDR_LEN + entry * 4;
        let raw: [u8; 4] = page
            .get(at..at + 4)
            .and_then(|raw| raw.try_into().ok())
            .ok_or(HnswError::Corruption("block-map entry out of range"))?;
        let block = u32::from_le_bytes(raw);
        Ok((block != 0).then_some(PageId(block)))
    }

    /// Sets one entry. Entries are written once.
    pub fn write_entry(&self, page: &mut [u8], entry: usize, block: PageId) -> Result<()> {
        if block == PageId::HEADER {
            return Err(HnswError::Invalid("header page cannot hold nodes"));
        }
        if self.read_entry(page, entry)?.is_some() {
            return Err(HnswError::Corruption("block-map entry already set"));
        }
        let at = PAGE_HDR_LEN + entry * 4;
        page[at..at + 4].copy_from_slice(&block.0.to_le_bytes());
        Ok(())
    }
}
