//! Per-operation bridge from node slots to pinned cache pages.
//!
//! A [`RetrieverCtx`] lives for one insertion or one search. Every page it
//! touches stays pinned in its arena until [`RetrieverCtx::release_all`],
//! which also runs on drop. Pages written outside the insertion transaction
//! ("extra dirtied", typically back-links added to older nodes) get an undo
//! image on first write: they are marked dirty when the operation commits
//! and restored when it does not.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use super::blockmap::{block_capacity, BlockHeader, BlockMap, BLOCK_DATA_START};
use super::codec::{init_node, read_node, NodeLayout};
use super::header::IndexHeader;
use super::store::{NodeMut, NodeRef, NodeStore};
use crate::primitives::pager::{Pager, PinMode, PinnedPage, Txn};
use crate::types::{page::PageKind, HnswError, PageId, Result, SlotId};

/// What the context may do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// Fetch nodes only.
    Read,
    /// Fetch, modify and reserve nodes.
    Write,
}

/// Counters for one context.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RetrieverStats {
    /// Lookups answered from the node cache.
    pub node_hits: u64,
    /// Lookups that walked a node block.
    pub node_misses: u64,
    /// Distinct pages pinned.
    pub pages_pinned: u64,
    /// Pages modified outside the transaction.
    pub extra_dirtied: u64,
}

#[derive(Clone, Copy, Debug)]
struct NodeLoc {
    block: PageId,
    offset: usize,
    level: u16,
}

/// Node storage backed by the page cache for the duration of one operation.
pub struct RetrieverCtx<'p> {
    pager: &'p Pager,
    mode: AccessMode,
    layout: NodeLayout,
    header: IndexHeader,
    blockmap: BlockMap,
    pending: u32,
    taken: FxHashMap<PageId, PinnedPage<'p>>,
    node_cache: FxHashMap<SlotId, NodeLoc>,
    block_cache: FxHashMap<SlotId, PageId>,
    txn_pages: FxHashSet<PageId>,
    extra_dirtied: FxHashMap<PageId, Box<[u8]>>,
    committed: bool,
    stats: RetrieverStats,
}

impl<'p> RetrieverCtx<'p> {
    /// Read-only context over a header snapshot.
    pub fn reader(pager: &'p Pager, header: IndexHeader) -> Result<Self> {
        Self::new(pager, header, AccessMode::Read)
    }

    /// Context allowed to reserve and modify nodes. The caller must hold the
    /// header latch for its whole life.
    pub fn writer(pager: &'p Pager, header: IndexHeader) -> Result<Self> {
        Self::new(pager, header, AccessMode::Write)
    }

    fn new(pager: &'p Pager, header: IndexHeader, mode: AccessMode) -> Result<Self> {
        let layout = header.layout()?;
        Ok(Self {
            pager,
            mode,
            layout,
            blockmap: BlockMap::new(pager.page_size()),
            header,
            pending: 0,
            taken: FxHashMap::default(),
            node_cache: FxHashMap::default(),
            block_cache: FxHashMap::default(),
            txn_pages: FxHashSet::default(),
            extra_dirtied: FxHashMap::default(),
            committed: false,
            stats: RetrieverStats::default(),
        })
    }

    /// Header snapshot in use, including block-map and tail changes made by
    /// [`reserve_new`](Self::reserve_new).
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Slots reserved by this context and not yet counted in the header.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Pages currently pinned by this context.
    pub fn outstanding_pins(&self) -> usize {
        self.taken.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> RetrieverStats {
        self.stats
    }

    /// Read access to `slot`. Repeated calls hit the node cache and pin
    /// nothing new.
    pub fn fetch_immutable(&mut self, slot: SlotId) -> Result<NodeRef<'_>> {
        let loc = self.locate(slot)?;
        let page = self
            .taken
            .get(&loc.block)
            .ok_or(HnswError::Corruption("node block not pinned"))?;
        let end = loc.offset + self.layout.node_size(loc.level);
        let bytes = RwLockReadGuard::map(page.read(), |buf| &buf[loc.offset..end]);
        Ok(NodeRef::new(bytes, &self.layout, loc.level))
    }

    /// Write access to `slot`. Pages outside the transaction are recorded as
    /// extra dirtied.
    pub fn fetch_mutable(&mut self, slot: SlotId) -> Result<NodeMut<'_>> {
        if self.mode != AccessMode::Write {
            return Err(HnswError::Invalid("read-only retriever cannot modify nodes"));
        }
        let loc = self.locate(slot)?;
        self.pin(loc.block, PinMode::Exclusive)?;
        if !self.txn_pages.contains(&loc.block) && !self.extra_dirtied.contains_key(&loc.block) {
            let page = self
                .taken
                .get(&loc.block)
                .ok_or(HnswError::Corruption("node block not pinned"))?;
            let undo = page.read().clone();
            self.extra_dirtied.insert(loc.block, undo);
            self.stats.extra_dirtied += 1;
            trace!(page = loc.block.0, slot = slot.0, "retriever.extra_dirtied");
        }
        let page = self
            .taken
            .get(&loc.block)
            .ok_or(HnswError::Corruption("node block not pinned"))?;
        let end = loc.offset + self.layout.node_size(loc.level);
        let bytes = RwLockWriteGuard::map(page.write()?, |buf| &mut buf[loc.offset..end]);
        Ok(NodeMut::new(bytes, &self.layout, loc.level))
    }

    /// Places a fresh node of `level` for `key` and returns its slot.
    ///
    /// The node goes into the tail block when it fits, otherwise into a newly
    /// allocated block linked from the old tail. The block-map entry is
    /// written in the same transaction; a block-map page is allocated when the
    /// slot opens a new one. The header's node count is left alone: the
    /// caller bumps it when it commits.
    pub fn reserve_new(&mut self, txn: &mut Txn<'p>, key: u64, level: u16) -> Result<SlotId> {
        if self.mode != AccessMode::Write {
            return Err(HnswError::Invalid("read-only retriever cannot reserve nodes"));
        }
        let slot = SlotId(
            self.header
                .num_vectors
                .checked_add(self.pending)
                .filter(|&next| next < u32::MAX)
                .ok_or(HnswError::StorageExhausted("slot space exhausted"))?,
        );
        let page_size = self.pager.page_size();
        let size = self.layout.node_size(level);
        if size > block_capacity(page_size) {
            return Err(HnswError::InvalidLayout(format!(
                "level {level} node of {size} bytes exceeds block capacity"
            )));
        }
        let (dir, entry) = self.blockmap.locate(slot);
        if dir > self.header.blockmap_pages.len() {
            return Err(HnswError::Corruption("block-map directory has a gap"));
        }
        if dir == self.header.blockmap_pages.len()
            && dir >= IndexHeader::max_blockmap_pages(page_size)
        {
            return Err(HnswError::StorageExhausted("block-map directory is full"));
        }

        let (block, mut block_header) = match self.header.tail_block {
            Some(tail) => {
                self.join_txn(txn, tail)?;
                let tail_header = {
                    let page = self.page(tail)?;
                    let image = page.read();
                    BlockHeader::decode(&image)?
                };
                if tail_header.remaining(page_size) >= size {
                    (tail, tail_header)
                } else {
                    let fresh = self.grow_block(txn, slot)?;
                    let linked = BlockHeader {
                        next_block: Some(fresh),
                        ..tail_header
                    };
                    linked.encode(&mut self.page(tail)?.write()?)?;
                    (fresh, BlockHeader::empty(slot))
                }
            }
            None => (self.grow_block(txn, slot)?, BlockHeader::empty(slot)),
        };

        let offset = block_header.free_offset as usize;
        {
            let page = self.page(block)?;
            let mut image = page.write()?;
            init_node(&mut image[offset..], &self.layout, key, level, slot)?;
            block_header.free_offset += size as u16;
            block_header.node_count += 1;
            block_header.encode(&mut image)?;
        }
        self.header.tail_block = Some(block);

        let map_page = match self.header.blockmap_pages.get(dir).copied() {
            Some(existing) => {
                self.join_txn(txn, existing)?;
                existing
            }
            None => {
                let page = txn.allocate_page(PageKind::BlockMap)?;
                let id = page.id();
                self.txn_pages.insert(id);
                self.taken.insert(id, page);
                self.stats.pages_pinned += 1;
                self.header.blockmap_pages.push(id);
                id
            }
        };
        {
            let page = self.page(map_page)?;
            let mut image = page.write()?;
            self.blockmap.write_entry(&mut image, entry, block)?;
        }

        self.node_cache.insert(
            slot,
            NodeLoc {
                block,
                offset,
                level,
            },
        );
        self.block_cache.insert(slot, block);
        self.pending += 1;
        debug!(
            slot = slot.0,
            key,
            level,
            block = block.0,
            offset,
            blockmap_page = map_page.0,
            "retriever.reserve_new"
        );
        Ok(slot)
    }

    /// Marks the surrounding operation committed; extra dirtied pages will be
    /// kept instead of restored.
    pub fn mark_committed(&mut self) {
        self.committed = true;
    }

    /// Unpins everything not carrying uncommitted writes and clears both
    /// caches. Used between phases that would otherwise accumulate pins.
    pub fn reset(&mut self) {
        let keep: FxHashSet<PageId> = self
            .extra_dirtied
            .keys()
            .chain(self.txn_pages.iter())
            .copied()
            .collect();
        self.taken.retain(|id, _| keep.contains(id));
        self.node_cache.clear();
        self.block_cache.clear();
    }

    /// Settles extra dirtied pages, drops every pin and clears the caches.
    /// Safe to call more than once.
    pub fn release_all(&mut self) {
        if self.taken.is_empty() && self.extra_dirtied.is_empty() {
            self.node_cache.clear();
            self.block_cache.clear();
            return;
        }
        let extra = self.extra_dirtied.len();
        for (id, undo) in self.extra_dirtied.drain() {
            let Some(page) = self.taken.get(&id) else {
                continue;
            };
            if self.committed {
                page.mark_dirty();
            } else if let Ok(mut image) = page.write() {
                image.copy_from_slice(&undo);
            }
        }
        debug!(
            pins = self.taken.len(),
            extra_dirtied = extra,
            committed = self.committed,
            node_hits = self.stats.node_hits,
            node_misses = self.stats.node_misses,
            "retriever.release"
        );
        self.taken.clear();
        self.txn_pages.clear();
        self.node_cache.clear();
        self.block_cache.clear();
    }

    /// Block holding `slot`, through the block map.
    pub fn block_of(&mut self, slot: SlotId) -> Result<PageId> {
        if let Some(&block) = self.block_cache.get(&slot) {
            return Ok(block);
        }
        let (dir, entry) = self.blockmap.locate(slot);
        let map_page = *self
            .header
            .blockmap_pages
            .get(dir)
            .ok_or(HnswError::Corruption("slot has no block-map page"))?;
        self.pin(map_page, PinMode::Shared)?;
        let block = {
            let page = self.page(map_page)?;
            let image = page.read();
            self.blockmap
                .read_entry(&image, entry)?
                .ok_or(HnswError::Corruption("block-map entry missing"))?
        };
        self.block_cache.insert(slot, block);
        Ok(block)
    }

    fn locate(&mut self, slot: SlotId) -> Result<NodeLoc> {
        if slot.0 >= self.len() {
            return Err(HnswError::Invalid("slot is not visible"));
        }
        if let Some(&loc) = self.node_cache.get(&slot) {
            self.stats.node_hits += 1;
            return Ok(loc);
        }
        self.stats.node_misses += 1;
        let block = self.block_of(slot)?;
        self.pin(block, PinMode::Shared)?;
        let page = self
            .taken
            .get(&block)
            .ok_or(HnswError::Corruption("node block not pinned"))?;
        let image = page.read();
        let header = BlockHeader::decode(&image)?;
        if !header.holds(slot) {
            return Err(HnswError::Corruption("block does not hold slot"));
        }
        let mut found = None;
        let mut offset = BLOCK_DATA_START;
        for index in 0..header.node_count as u32 {
            let current = SlotId(header.first_slot.0 + index);
            let (_, size, level) = read_node(&image, offset, &self.layout)?;
            if offset + size > header.free_offset as usize {
                return Err(HnswError::Corruption("node overruns block free offset"));
            }
            let loc = NodeLoc {
                block,
                offset,
                level,
            };
            self.node_cache.insert(current, loc);
            if current == slot {
                found = Some(loc);
            }
            offset += size;
        }
        found.ok_or(HnswError::Corruption("slot missing from its block"))
    }

    fn pin(&mut self, id: PageId, mode: PinMode) -> Result<()> {
        if let Some(page) = self.taken.get_mut(&id) {
            if mode == PinMode::Exclusive && page.mode() == PinMode::Shared {
                page.upgrade();
            }
            return Ok(());
        }
        let page = self.pager.pin_page(id, mode)?;
        self.taken.insert(id, page);
        self.stats.pages_pinned += 1;
        Ok(())
    }

    fn page(&self, id: PageId) -> Result<&PinnedPage<'p>> {
        self.taken
            .get(&id)
            .ok_or(HnswError::Corruption("page not pinned by retriever"))
    }

    fn join_txn(&mut self, txn: &mut Txn<'p>, id: PageId) -> Result<()> {
        debug_assert!(
            !self.extra_dirtied.contains_key(&id),
            "page joined the transaction after an untracked write"
        );
        self.pin(id, PinMode::Exclusive)?;
        let page = self.page(id)?;
        txn.register(page)?;
        self.txn_pages.insert(id);
        Ok(())
    }

    fn grow_block(&mut self, txn: &mut Txn<'p>, first_slot: SlotId) -> Result<PageId> {
        let page = txn.allocate_page(PageKind::NodeBlock)?;
        BlockHeader::empty(first_slot).encode(&mut page.write()?)?;
        let id = page.id();
        self.txn_pages.insert(id);
        self.taken.insert(id, page);
        self.stats.pages_pinned += 1;
        Ok(id)
    }
}

impl NodeStore for RetrieverCtx<'_> {
    fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    fn len(&self) -> u32 {
        match self.mode {
            AccessMode::Read => self.header.num_vectors,
            AccessMode::Write => self.header.num_vectors + self.pending,
        }
    }

    fn get(&mut self, slot: SlotId) -> Result<NodeRef<'_>> {
        self.fetch_immutable(slot)
    }

    fn get_mut(&mut self, slot: SlotId) -> Result<NodeMut<'_>> {
        self.fetch_mutable(slot)
    }

    fn reserve(&mut self, total: u32) -> Result<()> {
        if total == u32::MAX {
            return Err(HnswError::StorageExhausted("slot space exhausted"));
        }
        let expected = (total as usize).min(self.blockmap.entries_per_page());
        self.node_cache.reserve(expected.saturating_sub(self.node_cache.len()));
        Ok(())
    }
}

impl Drop for RetrieverCtx<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
