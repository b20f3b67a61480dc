use crate::{Error, Result};

const OFFSET_BASIS: u32 = 0x811c_9dc5;
const PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over `bytes`.
///
/// Used for shard routing only: it is fast on short keys and spreads them well,
/// but offers no collision resistance.
#[inline]
pub const fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(PRIME);
        i += 1;
    }
    hash
}

/// Maps `key` to a shard index in `[0, shard_count)`.
///
/// # Errors
///
/// Returns [`Error::EmptyKey`] if `key` is empty.
///
/// # Panics
///
/// Panics if `shard_count` is zero.
///
/// # Examples
/// ```
/// use shardmap::shard_index;
///
/// assert_eq!(shard_index("alice", 4).unwrap(), 3);
/// assert_eq!(shard_index("alice", 1).unwrap(), 0);
/// assert!(shard_index("", 4).is_err());
/// ```
#[inline]
pub fn shard_index(key: &str, shard_count: usize) -> Result<usize> {
    assert_ne!(shard_count, 0, "shard count must be non-zero");
    if key.is_empty() {
        tracing::trace!("rejected empty key");
        return Err(Error::EmptyKey);
    }
    Ok(fnv1a32(key.as_bytes()) as usize % shard_count)
}
