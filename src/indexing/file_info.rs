//! File hashing and timestamps for cache validation.

use std::path::Path;

/// Content hash of a file, hex encoded.
///
/// MD5 by contract: the cache needs content sufficiency, not collision
/// resistance, and the hash appears in the on-disk layout.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Current UTC timestamp in seconds since UNIX_EPOCH.
pub fn utc_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
