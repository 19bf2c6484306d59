//! FNV-1a content hashing used to key the Uniform Cache.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Renders the FNV-1a hash of `bytes` as a fixed-width 8-character hex key.
pub fn content_key(bytes: &[u8]) -> String {
    format!("{:08x}", fnv1a(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_the_offset_basis() {
        assert_eq!(fnv1a(&[]), FNV_OFFSET_BASIS);
    }

    #[test]
    fn content_key_is_eight_hex_chars() {
        let key = content_key(&[0, 1, 2, 3]);
        assert_eq!(key.len(), 8);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_payloads_hash_differently() {
        assert_ne!(content_key(&[0, 1, 2, 3]), content_key(&[0, 1, 2, 4]));
    }

    #[test]
    fn identical_payloads_hash_identically() {
        assert_eq!(content_key(&[0, 1, 2, 3]), content_key(&[0, 1, 2, 3]));
    }
}
