#![forbid(unsafe_code)]

//! Redo log of full page images.
//!
//! Every committed transaction appends one frame per registered page followed
//! by a header-only commit frame. Replay applies a transaction only once its
//! commit frame has been read; a torn or checksum-failing tail ends the log.

use std::collections::HashMap;
use std::convert::TryInto;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{frame_crc32, HnswError, PageId, Result};

const WAL_MAGIC: &[u8; 8] = b"HNSWWAL\0";
const WAL_VERSION: u16 = 1;
/// Size of the fixed header at the start of the WAL file.
pub const WAL_HEADER_LEN: usize = 32;
/// Size of the header preceding every frame.
pub const WAL_FRAME_HEADER_LEN: usize = 24;

const FRAME_FLAG_COMMIT: u32 = 0x1;

/// Outcome of a recovery pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    /// Transactions whose commit frame was found.
    pub txns_applied: u32,
    /// Page images handed to the apply callback.
    pub frames_applied: u32,
    /// Page frames dropped because their transaction never committed.
    pub frames_discarded: u32,
    /// True when the log ended in a partial or corrupt frame.
    pub torn_tail: bool,
}

/// Append-only write-ahead log living next to the index file.
#[derive(Debug)]
pub struct Wal {
    io: StdFileIo,
    path: PathBuf,
    page_size: usize,
    end: u64,
    next_frame_no: u32,
}

struct FrameHeader {
    page_id: PageId,
    frame_no: u32,
    crc32: u32,
    txn_id: u64,
    flags: u32,
}

impl FrameHeader {
    fn encode(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        dst[4..8].copy_from_slice(&self.frame_no.to_le_bytes());
        dst[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        dst[12..20].copy_from_slice(&self.txn_id.to_le_bytes());
        dst[20..24].copy_from_slice(&self.flags.to_le_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        Ok(Self {
            page_id: PageId(read_u32(src, 0)?),
            frame_no: read_u32(src, 4)?,
            crc32: read_u32(src, 8)?,
            txn_id: read_u64(src, 12)?,
            flags: read_u32(src, 20)?,
        })
    }

    fn is_commit(&self) -> bool {
        self.flags & FRAME_FLAG_COMMIT != 0
    }
}

impl Wal {
    /// Opens (or creates) the WAL belonging to the index file at `db_path`.
    pub fn open(db_path: &Path, page_size: usize) -> Result<Self> {
        let path = wal_path(db_path);
        let io = StdFileIo::open(&path)?;
        let len = io.len()?;
        let mut wal = Self {
            io,
            path,
            page_size,
            end: WAL_HEADER_LEN as u64,
            next_frame_no: 1,
        };
        if len < WAL_HEADER_LEN as u64 {
            wal.write_header()?;
        } else {
            wal.validate_header()?;
            wal.end = len;
        }
        Ok(wal)
    }

    /// Location of the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of frames appended since the last reset.
    pub fn frame_count(&self) -> u32 {
        self.next_frame_no - 1
    }

    /// Appends the page images of one transaction plus its commit frame.
    ///
    /// The frames are written with a single positioned write; the caller
    /// decides whether to [`sync`](Self::sync) afterwards.
    pub fn append_txn(&mut self, txn_id: u64, pages: &[(PageId, &[u8])]) -> Result<()> {
        let frame_len = WAL_FRAME_HEADER_LEN + self.page_size;
        let mut buf = Vec::with_capacity(frame_len * pages.len() + WAL_FRAME_HEADER_LEN);
        let mut frame_no = self.next_frame_no;
        for (page_id, image) in pages {
            if image.len() != self.page_size {
                return Err(HnswError::Invalid("WAL frame size does not match page size"));
            }
            let header = FrameHeader {
                page_id: *page_id,
                frame_no,
                crc32: frame_crc32(page_id.0, txn_id, 0, image),
                txn_id,
                flags: 0,
            };
            let start = buf.len();
            buf.resize(start + WAL_FRAME_HEADER_LEN, 0);
            header.encode(&mut buf[start..]);
            buf.extend_from_slice(image);
            frame_no = next_frame(frame_no)?;
        }
        let commit = FrameHeader {
            page_id: PageId(0),
            frame_no,
            crc32: frame_crc32(0, txn_id, FRAME_FLAG_COMMIT, &[]),
            txn_id,
            flags: FRAME_FLAG_COMMIT,
        };
        let start = buf.len();
        buf.resize(start + WAL_FRAME_HEADER_LEN, 0);
        commit.encode(&mut buf[start..]);

        self.io.write_at(self.end, &buf)?;
        self.end += buf.len() as u64;
        self.next_frame_no = next_frame(frame_no)?;
        debug!(
            txn_id,
            pages = pages.len(),
            bytes = buf.len(),
            "wal.append_txn"
        );
        Ok(())
    }

    /// Forces appended frames to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Discards every frame; called once their pages reached the data file.
    pub fn reset(&mut self) -> Result<()> {
        self.io.truncate(WAL_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        self.end = WAL_HEADER_LEN as u64;
        self.next_frame_no = 1;
        Ok(())
    }

    /// Feeds every committed page image to `apply`, in log order.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<ReplayStats>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut stats = ReplayStats::default();
        let mut pending: HashMap<u64, Vec<(PageId, Vec<u8>)>> = HashMap::new();
        let mut off = WAL_HEADER_LEN as u64;
        let mut expected = 1u32;
        let len = self.io.len()?;
        let mut header_buf = [0u8; WAL_FRAME_HEADER_LEN];

        while off + WAL_FRAME_HEADER_LEN as u64 <= len {
            self.io.read_at(off, &mut header_buf)?;
            let header = FrameHeader::decode(&header_buf)?;
            if header.frame_no != expected {
                stats.torn_tail = true;
                break;
            }
            let payload_len = if header.is_commit() { 0 } else { self.page_size };
            let frame_end = off + (WAL_FRAME_HEADER_LEN + payload_len) as u64;
            if frame_end > len {
                stats.torn_tail = true;
                break;
            }
            let mut payload = vec![0u8; payload_len];
            self.io
                .read_at(off + WAL_FRAME_HEADER_LEN as u64, &mut payload)?;
            let crc = frame_crc32(header.page_id.0, header.txn_id, header.flags, &payload);
            if crc != header.crc32 {
                stats.torn_tail = true;
                break;
            }
            if header.is_commit() {
                if let Some(frames) = pending.remove(&header.txn_id) {
                    for (page_id, image) in frames {
                        apply(page_id, &image)?;
                        stats.frames_applied += 1;
                    }
                }
                stats.txns_applied += 1;
            } else {
                pending
                    .entry(header.txn_id)
                    .or_default()
                    .push((header.page_id, payload));
            }
            off = frame_end;
            expected = next_frame(expected)?;
        }

        stats.frames_discarded = pending.values().map(|frames| frames.len() as u32).sum();
        if stats.torn_tail || stats.frames_discarded > 0 {
            warn!(
                path = %self.path.display(),
                torn_tail = stats.torn_tail,
                frames_discarded = stats.frames_discarded,
                "wal.replay.incomplete_tail"
            );
        }
        self.end = off;
        self.next_frame_no = expected;
        Ok(stats)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_LEN];
        header[..WAL_MAGIC.len()].copy_from_slice(WAL_MAGIC);
        header[8..10].copy_from_slice(&WAL_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        self.io.truncate(0)?;
        self.io.write_at(0, &header)?;
        self.io.sync_all()
    }

    fn validate_header(&self) -> Result<()> {
        let mut header = [0u8; WAL_HEADER_LEN];
        self.io.read_at(0, &mut header)?;
        if &header[..WAL_MAGIC.len()] != WAL_MAGIC {
            return Err(HnswError::Corruption("invalid WAL magic"));
        }
        if u16::from_le_bytes([header[8], header[9]]) != WAL_VERSION {
            return Err(HnswError::Corruption("unsupported WAL version"));
        }
        if read_u32(&header, 12)? as usize != self.page_size {
            return Err(HnswError::Corruption(
                "WAL page size differs from pager configuration",
            ));
        }
        Ok(())
    }
}

fn next_frame(frame_no: u32) -> Result<u32> {
    frame_no
        .checked_add(1)
        .ok_or(HnswError::Corruption("WAL frame number overflow"))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    buf.get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(HnswError::Corruption("WAL field out of range"))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64> {
    buf.get(offset..offset + 8)
        .and_then(|slice| slice.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(HnswError::Corruption("WAL field out of range"))
}

/// Path of the WAL that belongs to `db_path`.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_owned();
    os_string.push(".wal");
    PathBuf::from(os_string)
}
