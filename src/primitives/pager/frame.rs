use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::PageId;

/// One buffer-cache slot.
///
/// `buf` is the content lock, held only while bytes are read or written.
/// `latch` is the long-lived page lock callers may hold across a whole
/// operation; it does not protect the bytes by itself.
pub(crate) struct Frame {
    pub id: Option<PageId>,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub latch: Arc<RwLock<()>>,
    pub pin_count: u32,
    pub dirty: bool,
    pub txn_owner: Option<u64>,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            id: None,
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            latch: Arc::new(RwLock::new(())),
            pin_count: 0,
            dirty: false,
            txn_owner: None,
        }
    }

    /// Frames may only be recycled when nobody pins them and no open
    /// transaction holds their undo image.
    pub fn evictable(&self) -> bool {
        self.pin_count == 0 && self.txn_owner.is_none()
    }

    pub fn detach(&mut self) {
        self.id = None;
        self.pin_count = 0;
        self.dirty = false;
        self.txn_owner = None;
    }
}
