//! Storage substrate: positioned file I/O, the write-ahead log and the
//! page cache with bounded transactions.

/// Positioned reads and writes on the index file.
pub mod io;

/// Page cache, pins, latches and transactions.
pub mod pager;

/// Write-ahead log of committed page images.
pub mod wal;
