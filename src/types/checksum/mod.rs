//! CRC32 helpers shared by the primary file and WAL segment codecs.

use crc32fast::Hasher;

/// CRC32 over `chunks` as if they were one contiguous buffer.
pub fn crc32_of(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// Checksum binding a WAL payload to its sequence number, so a frame copied to
/// another position fails validation.
pub fn frame_crc32(seq: u64, payload: &[u8]) -> u32 {
    crc32_of(&[&seq.to_be_bytes(), payload])
}
