use sha2::{Digest, Sha256};

/// Content fingerprint of a payload: lowercase hex SHA-256.
pub fn fingerprint(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Fingerprint over several labelled parts, order-sensitive.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn fingerprint_parts<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}
