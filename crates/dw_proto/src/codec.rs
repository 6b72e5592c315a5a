//! Plaintext padding — size-bucket shaping applied BEFORE encryption.
//!
//! The relay stores ciphertext lengths, and length alone leaks a lot
//! ("ok" vs a paragraph). Padding happens inside the plaintext so the
//! AEAD output lands on one of a handful of fixed sizes.
//!
//! Layout: `[original_len: u32 LE] [plaintext] [random fill]`. Random fill
//! rather than zeros, so a compressing transport cannot squeeze the buckets
//! back into distinguishable sizes.
//!
//! Buckets (bytes): 256, 512, 1024, 4096, 16384, 65536. Payloads larger
//! than the top bucket go through unpadded apart from the prefix —
//! attachments travel a separate blob channel and never hit this path.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// How aggressively outgoing plaintext is padded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only. Minimal bandwidth, maximal length leak.
    None,
    /// Round up to the next bucket.
    #[default]
    Buckets,
    /// Every message padded to the top bucket (64 KiB).
    Maximum,
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];

/// Pad plaintext according to `mode`. Never fails; oversize input simply
/// skips bucketing.
pub fn pad_plaintext(plaintext: &[u8], mode: PaddingMode) -> Vec<u8> {
    let needed = 4 + plaintext.len();
    let target = match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES
            .iter()
            .copied()
            .find(|&b| b >= needed)
            .unwrap_or(needed),
        PaddingMode::Maximum => needed.max(*BUCKET_SIZES.last().unwrap()),
    };

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    let fill = target.saturating_sub(out.len());
    if fill > 0 {
        let mut padding = vec![0u8; fill];
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}

/// Strip padding from decrypted plaintext.
///
/// The length prefix is attacker-influenced only through an AEAD that
/// already authenticated it, but we still refuse prefixes that point past
/// the buffer rather than panic on a slice.
pub fn unpad_plaintext(padded: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if padded.len() < 4 {
        return Err(ProtoError::InvalidPadding(
            "too short for length prefix".into(),
        ));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(ProtoError::InvalidPadding(format!(
            "length prefix {len} exceeds padded size {}",
            padded.len()
        )));
    }
    Ok(padded[4..4 + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_lands_in_smallest_bucket() {
        let padded = pad_plaintext(b"hey", PaddingMode::Buckets);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad_plaintext(&padded).unwrap(), b"hey");
    }

    #[test]
    fn exact_fit_does_not_spill_to_next_bucket() {
        // 252 payload + 4 prefix = exactly 256.
        let msg = vec![0xA5u8; 252];
        let padded = pad_plaintext(&msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad_plaintext(&padded).unwrap(), msg);
    }

    #[test]
    fn mid_size_message_skips_to_matching_bucket() {
        let msg = vec![0x42u8; 5000];
        let padded = pad_plaintext(&msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 16384);
        assert_eq!(unpad_plaintext(&padded).unwrap(), msg);
    }

    #[test]
    fn oversize_message_passes_through() {
        let msg = vec![0x13u8; 70_000];
        let padded = pad_plaintext(&msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 4 + msg.len());
        assert_eq!(unpad_plaintext(&padded).unwrap(), msg);
    }

    #[test]
    fn maximum_mode_always_tops_out() {
        let padded = pad_plaintext(b"tiny", PaddingMode::Maximum);
        assert_eq!(padded.len(), 65536);
        assert_eq!(unpad_plaintext(&padded).unwrap(), b"tiny");
    }

    #[test]
    fn none_mode_keeps_only_prefix() {
        let padded = pad_plaintext(b"plain", PaddingMode::None);
        assert_eq!(padded.len(), 4 + 5);
        assert_eq!(unpad_plaintext(&padded).unwrap(), b"plain");
    }

    #[test]
    fn truncated_prefix_rejected() {
        assert!(matches!(
            unpad_plaintext(&[0x01, 0x02]),
            Err(ProtoError::InvalidPadding(_))
        ));
    }

    #[test]
    fn lying_prefix_rejected() {
        let mut padded = pad_plaintext(b"abc", PaddingMode::None);
        padded[0] = 0xFF; // claims a far longer payload than present
        assert!(matches!(
            unpad_plaintext(&padded),
            Err(ProtoError::InvalidPadding(_))
        ));
    }
}
