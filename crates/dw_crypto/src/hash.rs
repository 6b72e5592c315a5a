//! BLAKE3-based hash utilities
//!
//! - Deterministic message IDs
//! - Safety numbers (numeric fingerprints over both parties' identity keys)

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Derive a deterministic message ID from content.
pub fn message_id(sender_id: &str, room_id: &str, plaintext: &[u8], ts_millis: i64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dw-msg-id-v1\x00");
    hasher.update(sender_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(room_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(&ts_millis.to_le_bytes());
    hasher.update(b"\x00");
    hasher.update(plaintext);
    hex::encode(hasher.finalize().as_bytes())
}

/// Safety number for manual verification: 12 groups of 5 digits (60 digits),
/// derived from both parties' identity public keys. Order-independent, so
/// both ends render the identical string.
pub fn safety_number(ours: &[u8], theirs: &[u8]) -> String {
    let (lo, hi) = if ours <= theirs { (ours, theirs) } else { (theirs, ours) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dw-safety-v1\x00");
    hasher.update(lo);
    hasher.update(b"\x00");
    hasher.update(hi);
    numeric_groups(hasher.finalize().as_bytes())
}

/// Pack hash bytes into 12 groups of 5 decimal digits (20 bits per group).
fn numeric_groups(bytes: &[u8; 32]) -> String {
    let mut groups = Vec::with_capacity(12);
    for i in 0..12 {
        let offset = i * 5 / 2;
        let val = if i % 2 == 0 {
            ((bytes[offset] as u32) << 12)
                | ((bytes[offset + 1] as u32) << 4)
                | ((bytes[offset + 2] as u32) >> 4)
        } else {
            (((bytes[offset] & 0x0F) as u32) << 16)
                | ((bytes[offset + 1] as u32) << 8)
                | (bytes[offset + 2] as u32)
        };
        groups.push(format!("{:05}", val % 100_000));
    }
    groups.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_is_deterministic() {
        let a = message_id("alice", "room-1", b"hi", 1_700_000_000_000);
        let b = message_id("alice", "room-1", b"hi", 1_700_000_000_000);
        assert_eq!(a, b);
        let c = message_id("alice", "room-1", b"hi", 1_700_000_000_001);
        assert_ne!(a, c);
    }

    #[test]
    fn safety_number_is_symmetric() {
        let a = safety_number(b"key-one", b"key-two");
        let b = safety_number(b"key-two", b"key-one");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12 * 5 + 11, "12 groups of 5 digits, space-joined");
    }

    #[test]
    fn safety_number_differs_per_pair() {
        let a = safety_number(b"key-one", b"key-two");
        let b = safety_number(b"key-one", b"key-three");
        assert_ne!(a, b);
    }
}
