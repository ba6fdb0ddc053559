use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, info, warn};

use super::frame::Frame;
use crate::primitives::{
    io::{is_eof, FileIo, StdFileIo},
    wal::{wal_path, Wal},
};
use crate::types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    page_crc32, HnswError, Lsn, PageId, Result,
};

/// Largest number of pages a single transaction may register.
pub const MAX_TXN_PAGES: usize = 4;

/// Configuration options for the pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Number of frames kept in memory. Pinned frames never count against
    /// eviction, so the cache grows past this when every frame is pinned.
    pub cache_pages: usize,
    /// Optional quota on the number of pages in the file.
    pub max_pages: Option<u32>,
    /// Durability mode for WAL commits and checkpoints.
    pub synchronous: Synchronous,
    /// Verify page checksums when pages are read from disk.
    pub verify_checksums: bool,
    /// WAL frame count that triggers an automatic checkpoint.
    pub autocheckpoint_frames: u32,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache_pages: 256,
            max_pages: None,
            synchronous: Synchronous::Full,
            verify_checksums: true,
            autocheckpoint_frames: 1024,
        }
    }
}

impl PagerOptions {
    /// Rejects option combinations the pager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < page::MIN_PAGE_SIZE || self.page_size > page::MAX_PAGE_SIZE {
            return Err(HnswError::Invalid("page size out of supported range"));
        }
        if !self.page_size.is_power_of_two() {
            return Err(HnswError::Invalid("page size must be a power of two"));
        }
        if self.cache_pages < MAX_TXN_PAGES {
            return Err(HnswError::Invalid("cache must hold at least one transaction"));
        }
        if self.max_pages == Some(0) {
            return Err(HnswError::Invalid("page quota must be positive"));
        }
        Ok(())
    }
}

/// Durability mode for write-ahead log synchronization.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Synchronous {
    /// Sync the WAL on every commit and the data file on checkpoint.
    #[default]
    Full,
    /// Leave syncing to the operating system.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the synchronous mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Off => "off",
        }
    }

    /// Parses a synchronous mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

/// How a page is pinned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinMode {
    /// Bytes may be read.
    Shared,
    /// Bytes may be read and written, and the page may join a transaction.
    Exclusive,
}

/// Statistics tracking pager operations.
#[derive(Default, Clone, Debug)]
pub struct PagerStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of page evictions from cache.
    pub evictions: u64,
    /// Number of dirty pages written back.
    pub dirty_writebacks: u64,
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back.
    pub aborts: u64,
    /// Checkpoints completed.
    pub checkpoints: u64,
    /// Sum of pin counts over all frames.
    pub outstanding_pins: u64,
    /// Frames currently allocated.
    pub frames: usize,
    /// Pages in the file, including pages allocated by open transactions.
    pub page_count: u32,
}

struct PagerInner {
    frames: Vec<Frame>,
    free_frames: Vec<usize>,
    page_table: LruCache<PageId, usize>,
    page_count: u32,
    open_txns: u32,
    stats: PagerStats,
}

/// Page cache over a single index file with WAL-backed transactions.
pub struct Pager {
    path: PathBuf,
    db_io: StdFileIo,
    wal: Mutex<Wal>,
    page_size: usize,
    options: PagerOptions,
    inner: Mutex<PagerInner>,
    next_txn_id: AtomicU64,
    next_lsn: AtomicU64,
}

impl Pager {
    /// Creates an empty index file, discarding any previous contents.
    pub fn create(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let path = path.as_ref();
        let wal_file = wal_path(path);
        if wal_file.exists() {
            fs::remove_file(&wal_file)?;
        }
        let io = StdFileIo::open(path)?;
        io.truncate(0)?;
        drop(io);
        Self::open(path, options)
    }

    /// Opens an index file, replaying committed WAL transactions first.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let page_size = options.page_size as usize;
        let db_io = StdFileIo::open(&path)?;
        let mut wal = Wal::open(&path, page_size)?;
        let replay = wal.replay(|page_id, image| {
            let mut image = image.to_vec();
            stamp_page_crc(page_id, &mut image)?;
            db_io.write_at(page_offset(page_id, page_size), &image)
        })?;
        if replay.frames_applied > 0 {
            db_io.sync_all()?;
            info!(
                path = %path.display(),
                txns = replay.txns_applied,
                frames = replay.frames_applied,
                "pager.recovery.replayed"
            );
        }
        wal.reset()?;

        let file_len = db_io.len()?;
        let page_count = u32::try_from(file_len.div_ceil(page_size as u64))
            .map_err(|_| HnswError::Corruption("index file too large"))?;
        let inner = PagerInner {
            frames: Vec::with_capacity(options.cache_pages),
            free_frames: Vec::new(),
            page_table: LruCache::unbounded(),
            page_count,
            open_txns: 0,
            stats: PagerStats::default(),
        };
        debug!(path = %path.display(), page_count, page_size, "pager.open");
        Ok(Self {
            path,
            db_io,
            wal: Mutex::new(wal),
            page_size,
            options,
            inner: Mutex::new(inner),
            next_txn_id: AtomicU64::new(1),
            next_lsn: AtomicU64::new(1),
        })
    }

    /// Returns the path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the options the pager was opened with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Number of pages in the file, counting pages allocated by open
    /// transactions.
    pub fn page_count(&self) -> u32 {
        self.inner.lock().page_count
    }

    /// Returns a snapshot of current pager statistics.
    pub fn stats(&self) -> PagerStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.outstanding_pins = inner.frames.iter().map(|f| f.pin_count as u64).sum();
        stats.frames = inner.frames.len();
        stats.page_count = inner.page_count;
        stats
    }

    /// Sum of pin counts over all frames.
    pub fn outstanding_pins(&self) -> u64 {
        self.stats().outstanding_pins
    }

    /// Pins `id` in the cache, loading it from disk on a miss.
    pub fn pin_page(&self, id: PageId, mode: PinMode) -> Result<PinnedPage<'_>> {
        let mut inner = self.inner.lock();
        if id.0 >= inner.page_count {
            return Err(HnswError::Invalid("page not allocated"));
        }
        let idx = match inner.page_table.get(&id).copied() {
            Some(idx) => {
                inner.stats.hits += 1;
                idx
            }
            None => {
                inner.stats.misses += 1;
                self.load_frame(&mut inner, id)?
            }
        };
        let frame = &mut inner.frames[idx];
        frame.pin_count += 1;
        Ok(PinnedPage {
            pager: self,
            id,
            frame_idx: idx,
            mode,
            buf: Arc::clone(&frame.buf),
            latch: Arc::clone(&frame.latch),
        })
    }

    /// Starts a transaction holding at most [`MAX_TXN_PAGES`] pages.
    pub fn begin_txn(&self) -> Txn<'_> {
        self.inner.lock().open_txns += 1;
        let id = self.next_txn_id.fetch_add(1, AtomicOrdering::Relaxed);
        Txn {
            pager: self,
            id,
            pages: Vec::with_capacity(MAX_TXN_PAGES),
            allocated: Vec::new(),
            finished: false,
        }
    }

    /// Writes every committed dirty page to the data file and truncates the
    /// WAL. Returns `false` without doing anything while a transaction is
    /// open, since its pages may share frames with committed state.
    pub fn checkpoint(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.open_txns > 0 {
            debug!(open_txns = inner.open_txns, "pager.checkpoint.deferred");
            return Ok(false);
        }
        let mut written = 0u32;
        for idx in 0..inner.frames.len() {
            if inner.frames[idx].dirty {
                self.write_back(&mut inner, idx)?;
                written += 1;
            }
        }
        if self.options.synchronous == Synchronous::Full {
            self.db_io.sync_all()?;
        }
        self.wal.lock().reset()?;
        inner.stats.checkpoints += 1;
        debug!(pages = written, "pager.checkpoint");
        Ok(true)
    }

    fn maybe_autocheckpoint(&self) -> Result<()> {
        let frames = self.wal.lock().frame_count();
        if frames >= self.options.autocheckpoint_frames {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn load_frame(&self, inner: &mut PagerInner, id: PageId) -> Result<usize> {
        let idx = self.obtain_frame(inner)?;
        if let Err(err) = self.read_page_into(&inner.frames[idx], id) {
            inner.free_frames.push(idx);
            return Err(err);
        }
        let frame = &mut inner.frames[idx];
        frame.id = Some(id);
        frame.dirty = false;
        frame.pin_count = 0;
        frame.txn_owner = None;
        inner.page_table.put(id, idx);
        Ok(idx)
    }

    fn read_page_into(&self, frame: &Frame, id: PageId) -> Result<()> {
        let mut guard = frame.buf.write();
        guard.fill(0);
        match self.db_io.read_at(page_offset(id, self.page_size), &mut guard) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => {
                // Allocated but never written: an all-zero page is valid.
                guard.fill(0);
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        if page::is_blank(&guard) {
            return Ok(());
        }
        let header = PageHeader::decode(&guard[..PAGE_HDR_LEN])?;
        if header.page_no != id {
            return Err(HnswError::Corruption("page number mismatch"));
        }
        if header.page_size as usize != self.page_size {
            return Err(HnswError::Corruption("page size mismatch"));
        }
        if self.options.verify_checksums {
            let mut scratch = guard.clone();
            page::clear_crc32(&mut scratch[..PAGE_HDR_LEN])?;
            if page_crc32(id.0, &scratch) != header.crc32 {
                warn!(page = id.0, "pager.checksum_mismatch");
                return Err(HnswError::Corruption("page crc mismatch"));
            }
        }
        Ok(())
    }

    fn obtain_frame(&self, inner: &mut PagerInner) -> Result<usize> {
        if let Some(idx) = inner.free_frames.pop() {
            return Ok(idx);
        }
        if inner.frames.len() < self.options.cache_pages {
            inner.frames.push(Frame::new(self.page_size));
            return Ok(inner.frames.len() - 1);
        }
        let victim = inner
            .page_table
            .iter()
            .rev()
            .find(|entry| inner.frames[*entry.1].evictable())
            .map(|(&id, &idx)| (id, idx));
        match victim {
            Some((id, idx)) => {
                if inner.frames[idx].dirty {
                    self.write_back(inner, idx)?;
                }
                inner.page_table.pop(&id);
                inner.frames[idx].detach();
                inner.stats.evictions += 1;
                Ok(idx)
            }
            None => {
                debug!(frames = inner.frames.len(), "pager.cache.overflow");
                inner.frames.push(Frame::new(self.page_size));
                Ok(inner.frames.len() - 1)
            }
        }
    }

    fn write_back(&self, inner: &mut PagerInner, idx: usize) -> Result<()> {
        let frame = &mut inner.frames[idx];
        let Some(page_id) = frame.id else {
            frame.dirty = false;
            return Ok(());
        };
        if page_id.0 >= inner.page_count {
            frame.dirty = false;
            return Ok(());
        }
        let mut image = frame.buf.read().to_vec();
        stamp_page_crc(page_id, &mut image)?;
        self.db_io
            .write_at(page_offset(page_id, self.page_size), &image)?;
        frame.dirty = false;
        inner.stats.dirty_writebacks += 1;
        Ok(())
    }

    fn unpin(&self, frame_idx: usize) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(frame_idx) {
            if frame.pin_count > 0 {
                frame.pin_count -= 1;
            }
        }
    }

    fn mark_dirty(&self, frame_idx: usize) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(frame_idx) {
            frame.dirty = true;
        }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(err) = self.checkpoint() {
            warn!(path = %self.path.display(), error = %err, "pager.close.checkpoint_failed");
        }
    }
}

fn page_offset(id: PageId, page_size: usize) -> u64 {
    id.0 as u64 * page_size as u64
}

/// Writes the page checksum into the header of `image`. Blank pages stay
/// all-zero so allocated-but-unused pages read back as valid.
fn stamp_page_crc(page_id: PageId, image: &mut [u8]) -> Result<()> {
    if page::is_blank(image) {
        return Ok(());
    }
    page::clear_crc32(&mut image[..PAGE_HDR_LEN])?;
    let crc = page_crc32(page_id.0, image);
    image[page::header::CRC32].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// A page held in the cache. The frame cannot be evicted while any
/// `PinnedPage` for it is alive; dropping the handle unpins it.
pub struct PinnedPage<'p> {
    pager: &'p Pager,
    id: PageId,
    frame_idx: usize,
    mode: PinMode,
    buf: Arc<RwLock<Box<[u8]>>>,
    latch: Arc<RwLock<()>>,
}

impl<'p> PinnedPage<'p> {
    /// Page identifier.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Mode the page is pinned in.
    pub fn mode(&self) -> PinMode {
        self.mode
    }

    /// Takes the content lock for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read()
    }

    /// Takes the content lock for writing. Only exclusive pins may write.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Box<[u8]>>> {
        if self.mode != PinMode::Exclusive {
            return Err(HnswError::Invalid("page is pinned shared"));
        }
        Ok(self.buf.write())
    }

    /// Promotes a shared pin to an exclusive one.
    pub fn upgrade(&mut self) {
        self.mode = PinMode::Exclusive;
    }

    /// Blocks until the page latch is held shared.
    pub fn latch_shared(&self) -> PageLatch {
        PageLatch::Shared(self.latch.read_arc())
    }

    /// Blocks until the page latch is held exclusively.
    pub fn latch_exclusive(&self) -> PageLatch {
        PageLatch::Exclusive(self.latch.write_arc())
    }

    /// Takes the exclusive latch if nobody holds the latch.
    pub fn try_latch_exclusive(&self) -> Option<PageLatch> {
        self.latch.try_write_arc().map(PageLatch::Exclusive)
    }

    /// Schedules the page for lazy write-back outside any transaction.
    pub fn mark_dirty(&self) {
        self.pager.mark_dirty(self.frame_idx);
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pager.unpin(self.frame_idx);
    }
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}

/// A held page latch. Independent of pins: the holder must keep the page
/// pinned for as long as the latch is held.
pub enum PageLatch {
    /// Shared latch.
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    /// Exclusive latch.
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

impl PageLatch {
    /// Returns true for an exclusive latch.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, PageLatch::Exclusive(_))
    }
}

struct TxnPage {
    id: PageId,
    frame_idx: usize,
    buf: Arc<RwLock<Box<[u8]>>>,
    original: Box<[u8]>,
}

/// A bounded atomic multi-page update.
///
/// Pages join through [`register`](Txn::register) or
/// [`allocate_page`](Txn::allocate_page) and are snapshotted on entry.
/// Dropping the transaction without committing restores every snapshot and
/// gives back allocated pages.
pub struct Txn<'p> {
    pager: &'p Pager,
    id: u64,
    pages: Vec<TxnPage>,
    allocated: Vec<PageId>,
    finished: bool,
}

impl<'p> Txn<'p> {
    /// Transaction identifier, unique within this pager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pages registered so far, in registration order.
    pub fn registered(&self) -> impl Iterator<Item = PageId> + '_ {
        self.pages.iter().map(|p| p.id)
    }

    /// Returns true when `id` already belongs to this transaction.
    pub fn contains(&self, id: PageId) -> bool {
        self.pages.iter().any(|p| p.id == id)
    }

    /// Adds an exclusively pinned page to the transaction. Registering the
    /// same page twice is a no-op.
    pub fn register(&mut self, page: &PinnedPage<'p>) -> Result<()> {
        if page.mode != PinMode::Exclusive {
            return Err(HnswError::Invalid(
                "page must be pinned exclusive to join a transaction",
            ));
        }
        if self.contains(page.id) {
            return Ok(());
        }
        if self.pages.len() >= MAX_TXN_PAGES {
            warn!(txn_id = self.id, page = page.id.0, "pager.txn.page_limit");
            return Err(HnswError::StorageExhausted("transaction page limit reached"));
        }
        {
            let mut inner = self.pager.inner.lock();
            let frame = &mut inner.frames[page.frame_idx];
            match frame.txn_owner {
                Some(owner) if owner != self.id => {
                    return Err(HnswError::Invalid("page belongs to another transaction"));
                }
                _ => frame.txn_owner = Some(self.id),
            }
        }
        let original = page.buf.read().clone();
        self.pages.push(TxnPage {
            id: page.id,
            frame_idx: page.frame_idx,
            buf: Arc::clone(&page.buf),
            original,
        });
        Ok(())
    }

    /// Extends the file by one page of `kind`, pinned exclusive and
    /// registered in this transaction.
    pub fn allocate_page(&mut self, kind: PageKind) -> Result<PinnedPage<'p>> {
        if self.pages.len() >= MAX_TXN_PAGES {
            warn!(txn_id = self.id, "pager.txn.page_limit");
            return Err(HnswError::StorageExhausted("transaction page limit reached"));
        }
        let pager = self.pager;
        let mut inner = pager.inner.lock();
        if let Some(quota) = pager.options.max_pages {
            if inner.page_count >= quota {
                warn!(quota, "pager.quota_exhausted");
                return Err(HnswError::StorageExhausted("page quota exhausted"));
            }
        }
        let id = PageId(inner.page_count);
        let idx = match inner.page_table.get(&id).copied() {
            // Left behind by a rolled back allocation that was still pinned.
            Some(idx) => idx,
            None => {
                let idx = pager.obtain_frame(&mut inner)?;
                inner.page_table.put(id, idx);
                idx
            }
        };
        inner.page_count += 1;
        let header = PageHeader::new(id, kind, pager.page_size as u32)?;
        let frame = &mut inner.frames[idx];
        {
            let mut guard = frame.buf.write();
            guard.fill(0);
            header.encode(&mut guard)?;
        }
        frame.id = Some(id);
        frame.dirty = false;
        frame.pin_count += 1;
        frame.txn_owner = Some(self.id);
        let handle = PinnedPage {
            pager,
            id,
            frame_idx: idx,
            mode: PinMode::Exclusive,
            buf: Arc::clone(&frame.buf),
            latch: Arc::clone(&frame.latch),
        };
        drop(inner);
        self.pages.push(TxnPage {
            id,
            frame_idx: idx,
            buf: Arc::clone(&handle.buf),
            original: vec![0u8; pager.page_size].into_boxed_slice(),
        });
        self.allocated.push(id);
        debug!(txn_id = self.id, page = id.0, kind = ?kind, "pager.txn.allocate");
        Ok(handle)
    }

    /// Logs every registered page image and a commit record to the WAL.
    /// On error the transaction is rolled back when `self` drops.
    pub fn commit(mut self) -> Result<Lsn> {
        let images: Vec<(PageId, Vec<u8>)> = self
            .pages
            .iter()
            .map(|p| (p.id, p.buf.read().to_vec()))
            .collect();
        let lsn = {
            let mut wal = self.pager.wal.lock();
            let frames: Vec<(PageId, &[u8])> = images
                .iter()
                .map(|(id, image)| (*id, image.as_slice()))
                .collect();
            wal.append_txn(self.id, &frames)?;
            if self.pager.options.synchronous == Synchronous::Full {
                wal.sync()?;
            }
            Lsn(self.pager.next_lsn.fetch_add(1, AtomicOrdering::Relaxed))
        };
        {
            let mut inner = self.pager.inner.lock();
            for page in &self.pages {
                let frame = &mut inner.frames[page.frame_idx];
                frame.txn_owner = None;
                frame.dirty = true;
            }
            inner.open_txns = inner.open_txns.saturating_sub(1);
            inner.stats.commits += 1;
        }
        self.finished = true;
        debug!(
            txn_id = self.id,
            lsn = lsn.0,
            pages = self.pages.len(),
            allocated = self.allocated.len(),
            "pager.commit"
        );
        // The commit is durable at this point; a failed checkpoint leaves
        // the frames in the WAL for the next attempt or for recovery.
        if let Err(err) = self.pager.maybe_autocheckpoint() {
            warn!(txn_id = self.id, error = %err, "pager.autocheckpoint_failed");
        }
        Ok(lsn)
    }

    fn rollback(&mut self) {
        for page in self.pages.iter().rev() {
            page.buf.write().copy_from_slice(&page.original);
        }
        let mut inner = self.pager.inner.lock();
        for page in &self.pages {
            inner.frames[page.frame_idx].txn_owner = None;
        }
        for id in self.allocated.iter().rev() {
            if inner.page_count == id.0 + 1 {
                inner.page_count -= 1;
            }
            if let Some(&idx) = inner.page_table.peek(id) {
                if inner.frames[idx].pin_count == 0 {
                    inner.page_table.pop(id);
                    inner.frames[idx].detach();
                    inner.free_frames.push(idx);
                }
            }
        }
        inner.open_txns = inner.open_txns.saturating_sub(1);
        inner.stats.aborts += 1;
        debug!(
            txn_id = self.id,
            pages = self.pages.len(),
            allocated = self.allocated.len(),
            "pager.rollback"
        );
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}
