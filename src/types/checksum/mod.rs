#![forbid(unsafe_code)]

/// CRC32 of a page image, seeded with its page number so that a page
/// written to the wrong offset fails verification.
pub fn page_crc32(page_no: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// CRC32 of a WAL frame: the frame header fields followed by the payload.
pub fn frame_crc32(page_no: u32, txn_id: u64, flags: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_le_bytes());
    hasher.update(&txn_id.to_le_bytes());
    hasher.update(&flags.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
