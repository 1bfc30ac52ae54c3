#![forbid(unsafe_code)]

/// Checksum over a page payload, seeded with the page number so that a page
/// copied to the wrong slot does not validate.
pub fn page_crc32(page_no: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
