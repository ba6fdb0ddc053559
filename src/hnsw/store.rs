//! The storage seam between the graph library and the page cache.

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use super::codec::{Neighbors, NodeLayout, NodeView, NodeViewMut};
use crate::types::{Result, SlotId};

/// Node storage the graph library traverses and links through.
///
/// Slots at or past [`len`](NodeStore::len) are invisible: implementations
/// reject them and the library must skip neighbor entries pointing there.
pub trait NodeStore {
    /// Geometry shared by every node.
    fn layout(&self) -> &NodeLayout;

    /// Number of visible slots.
    fn len(&self) -> u32;

    /// True when no slot is visible.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read access to one node.
    fn get(&mut self, slot: SlotId) -> Result<NodeRef<'_>>;

    /// Write access to one node.
    fn get_mut(&mut self, slot: SlotId) -> Result<NodeMut<'_>>;

    /// Capacity hint issued before a node is added; fails when the store
    /// cannot grow to `total` nodes.
    fn reserve(&mut self, total: u32) -> Result<()>;
}

/// A node borrowed under its page's content read lock.
pub struct NodeRef<'a> {
    bytes: MappedRwLockReadGuard<'a, [u8]>,
    layout: &'a NodeLayout,
    level: u16,
}

impl<'a> NodeRef<'a> {
    pub(crate) fn new(
        bytes: MappedRwLockReadGuard<'a, [u8]>,
        layout: &'a NodeLayout,
        level: u16,
    ) -> Self {
        Self {
            bytes,
            layout,
            level,
        }
    }

    /// Codec view over the node bytes.
    pub fn view(&self) -> NodeView<'_> {
        NodeView::from_checked(&self.bytes, self.layout, self.level)
    }

    /// External key.
    pub fn key(&self) -> u64 {
        self.view().key()
    }

    /// Top level.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Neighbors on tier `level`.
    pub fn neighbors(&self, level: u16) -> Result<Neighbors<'_>> {
        self.view().neighbors(level)
    }
}

/// A node borrowed under its page's content write lock.
pub struct NodeMut<'a> {
    bytes: MappedRwLockWriteGuard<'a, [u8]>,
    layout: &'a NodeLayout,
    level: u16,
}

impl<'a> NodeMut<'a> {
    pub(crate) fn new(
        bytes: MappedRwLockWriteGuard<'a, [u8]>,
        layout: &'a NodeLayout,
        level: u16,
    ) -> Self {
        Self {
            bytes,
            layout,
            level,
        }
    }

    /// Read-only codec view.
    pub fn view(&self) -> NodeView<'_> {
        NodeView::from_checked(&self.bytes, self.layout, self.level)
    }

    /// Mutable codec view.
    pub fn view_mut(&mut self) -> NodeViewMut<'_> {
        NodeViewMut::from_checked(&mut self.bytes[..], self.layout, self.level)
    }

    /// Top level.
    pub fn level(&self) -> u16 {
        self.level
    }
}
