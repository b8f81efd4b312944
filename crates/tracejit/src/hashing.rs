use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Serializes `value` with bincode and hashes the bytes.
///
/// Returns `None` when the value cannot be encoded, which callers treat as "do not cache".
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Option<u64> {
    bincode::serialize(value).ok().map(|bytes| fnv1a_hash(&bytes))
}

/// Folds several fingerprints into one, order-sensitive.
pub fn combine(parts: &[u64]) -> u64 {
    parts
        .iter()
        .fold(fnv1a_init(), |hash, part| fnv1a_bytes(hash, &part.to_le_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vector() {
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn combine_is_order_sensitive() {
        assert_ne!(combine(&[1, 2]), combine(&[2, 1]));
    }
}
