//! Core identifiers, the on-disk page header and the crate error type.

#![forbid(unsafe_code)]

use std::fmt;

/// Checksum helpers for pages and WAL frames.
pub mod checksum;

pub use checksum::{frame_crc32, page_crc32};

/// Identifier of a fixed-size page inside the index file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u32);

/// Dense, monotonically assigned identifier of a graph node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SlotId(pub u32);

/// Log sequence number returned by a committed transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl PageId {
    /// The index header always lives on the first page.
    pub const HEADER: PageId = PageId(0);
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SlotId {
    fn from(value: u32) -> Self {
        SlotId(value)
    }
}

impl From<SlotId> for u32 {
    fn from(value: SlotId) -> Self {
        value.0
    }
}

/// Errors surfaced by the pager and the index layers.
#[derive(thiserror::Error, Debug)]
pub enum HnswError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A page or WAL frame failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The index header page failed validation.
    #[error("corrupt index header: {0}")]
    CorruptHeader(&'static str),
    /// The caller passed an argument the index cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The configured node layout cannot be represented.
    #[error("invalid node layout: {0}")]
    InvalidLayout(String),
    /// Vector length differs from the dimensionality fixed for the index.
    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        /// Dimensionality stored in the header or declared in options.
        expected: u32,
        /// Length of the rejected vector.
        actual: u32,
    },
    /// Vector is longer than the index supports.
    #[error("vector has {actual} dimensions, maximum is {max}")]
    DimensionTooLarge {
        /// Length of the rejected vector.
        actual: u32,
        /// Supported maximum.
        max: u32,
    },
    /// Page allocation or transaction registration ran out of room.
    #[error("storage exhausted: {0}")]
    StorageExhausted(&'static str),
    /// The graph library failed while linking a node.
    #[error("graph library failed to link node: {0}")]
    LibraryLink(String),
    /// Projected index memory exceeds the configured budget.
    #[error("projected index memory {projected} bytes exceeds budget of {budget} bytes")]
    MemoryBudgetExceeded {
        /// Bytes the index would occupy after the insertion.
        projected: u64,
        /// Configured budget.
        budget: u64,
    },
    /// The requested item does not exist.
    #[error("not found")]
    NotFound,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HnswError>;

pub mod page {
    //! Shared on-disk page metadata used by pager components.

    use core::convert::{TryFrom, TryInto};

    use super::{HnswError, PageId, Result};

    /// Magic bytes opening every initialized page.
    pub const PAGE_MAGIC: [u8; 4] = *b"HNSP";
    /// Current page header format.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Page size used when no option overrides it.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 1024;
    /// Largest supported page size; in-block offsets are 16-bit.
    pub const MAX_PAGE_SIZE: u32 = 32 * 1024;
    /// Length of the fixed header at the start of each page.
    pub const PAGE_HDR_LEN: usize = 24;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// Page magic.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// [`super::PageKind`] tag.
        pub const PAGE_KIND: usize = 6;
        /// Must be zero.
        pub const RESERVED: usize = 7;
        /// Page size the page was written with.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// Page number, checked on load.
        pub const PAGE_NO: Range<usize> = 12..16;
        /// CRC32 over the page with this field zeroed.
        pub const CRC32: Range<usize> = 16..20;
        /// Padding up to the header length.
        pub const PADDING: Range<usize> = 20..24;
    }

    /// Role of a page inside the index file.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Page 0: index-wide header.
        IndexHeader = 1,
        /// Packed graph nodes.
        NodeBlock = 2,
        /// Slot to block directory.
        BlockMap = 3,
    }

    impl PageKind {
        /// Returns the on-disk tag.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = HnswError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::IndexHeader),
                2 => Ok(PageKind::NodeBlock),
                3 => Ok(PageKind::BlockMap),
                _ => Err(HnswError::Corruption("unknown page kind")),
            }
        }
    }

    /// Decoded form of the fixed page header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version.
        pub format_version: u16,
        /// Page role.
        pub kind: PageKind,
        /// Page size in bytes.
        pub page_size: u32,
        /// Page number.
        pub page_no: PageId,
        /// Stored checksum.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Builds a header with a zero checksum.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(HnswError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                crc32: 0,
            })
        }

        /// Returns the header with the checksum replaced.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(HnswError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_le_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_le_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_le_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_le_bytes());
            hdr[header::PADDING].fill(0);
            Ok(())
        }

        /// Parses and validates a page header.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(HnswError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            if hdr[header::MAGIC] != PAGE_MAGIC {
                return Err(HnswError::Corruption("invalid page magic"));
            }
            let format_version = u16::from_le_bytes(read_array(hdr, header::FORMAT_VERSION)?);
            if format_version != PAGE_FORMAT_VERSION {
                return Err(HnswError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(HnswError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_le_bytes(read_array(hdr, header::PAGE_SIZE)?);
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(HnswError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u32::from_le_bytes(read_array(hdr, header::PAGE_NO)?));
            let crc32 = u32::from_le_bytes(read_array(hdr, header::CRC32)?);
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                crc32,
            })
        }
    }

    /// Zeroes the checksum field ahead of checksum computation.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(HnswError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Returns true when the page has never been written (all-zero header).
    pub fn is_blank(buf: &[u8]) -> bool {
        buf.len() >= PAGE_HDR_LEN && buf[..PAGE_HDR_LEN].iter().all(|&b| b == 0)
    }

    fn read_array<const N: usize>(src: &[u8], range: core::ops::Range<usize>) -> Result<[u8; N]> {
        src.get(range)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(HnswError::Corruption("page header field out of range"))
    }
}
