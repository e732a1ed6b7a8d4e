// Content hash used as the primary lookup key for map, set and cache tables.
use sha2::{Digest, Sha256};

/// Width in hex characters of every key hash.
pub(crate) const KEY_HASH_LEN: usize = 64;

/// SHA-256 over the encoded bytes, rendered as lowercase hex.
pub(crate) fn key_hash(encoded: &[u8]) -> String {
    let digest = Sha256::digest(encoded);
    let mut out = String::with_capacity(KEY_HASH_LEN);
    for byte in digest {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

const HEX: &[u8; 16] = b"0123456789abcdef";

#[cfg(test)]
mod tests {
    use super::{KEY_HASH_LEN, key_hash};
    use crate::core::codec::encode;

    #[test]
    fn hash_is_fixed_width_lowercase_hex() {
        let hash = key_hash(b"\"name1\"");
        assert_eq!(hash.len(), KEY_HASH_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            key_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn same_logical_key_hashes_identically() {
        let a = key_hash(&encode("user:1").expect("encode"));
        let b = key_hash(&encode(&String::from("user:1")).expect("encode"));
        let c = key_hash(&encode("user:2").expect("encode"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
