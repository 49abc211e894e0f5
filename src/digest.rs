//! Payload digest collaborator.
//!
//! Both sides of the wire agree on this rendering: the SHA-1 digest of a
//! payload as lowercase hex with leading zeros stripped, left-padded with
//! `-` to the configured display width. The stripped-zero form is shorter
//! than the full 40 hex characters roughly 1 in 16 times, which is why the
//! padding step exists at all.

use sha1::{Digest, Sha1};

/// Filler character used to left-pad short digests to the display width.
pub const PAD_FILLER: char = '-';

/// SHA-1 digest of `data` as lowercase hex, leading zeros stripped.
///
/// An all-zero digest renders as a single `"0"`.
pub fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    let full = hex::encode(digest);
    let trimmed = full.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Left-pad `digest` with [`PAD_FILLER`] to exactly `width` characters.
///
/// A digest already at `width` is returned unchanged; a digest longer than
/// `width` is never truncated.
pub fn pad_digest(digest: &str, width: usize) -> String {
    if digest.len() >= width {
        return digest.to_string();
    }
    let mut padded = String::with_capacity(width);
    for _ in 0..width - digest.len() {
        padded.push(PAD_FILLER);
    }
    padded.push_str(digest);
    padded
}

/// Digest of `data` normalized to the fixed wire width.
pub fn wire_digest(data: &[u8], width: usize) -> String {
    pad_digest(&sha1_hex(data), width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // SHA-1("abc") has no leading zero, so no trimming happens
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_leading_zeros_stripped() {
        // SHA-1 of this input starts with a zero nibble
        let mut found = None;
        for i in 0u32..4096 {
            let data = i.to_be_bytes();
            let digest = Sha1::digest(data);
            if digest[0] < 0x10 {
                found = Some(data);
                break;
            }
        }
        let data = found.expect("some input in range digests to a leading zero");
        let rendered = sha1_hex(&data);
        assert!(rendered.len() < 40);
        assert!(!rendered.starts_with('0'));
    }

    #[test]
    fn test_pad_noop_at_width() {
        let s = "a".repeat(40);
        assert_eq!(pad_digest(&s, 40), s);
    }

    #[test]
    fn test_pad_fills_left() {
        assert_eq!(pad_digest("abc", 6), "---abc");
    }

    #[test]
    fn test_pad_never_truncates() {
        let s = "a".repeat(50);
        assert_eq!(pad_digest(&s, 40), s);
    }

    #[test]
    fn test_wire_digest_fixed_width() {
        for payload in [vec![0u8; 8192], vec![0xFFu8; 8192], make_varied(8192)] {
            let wire = wire_digest(&payload, 40);
            assert_eq!(wire.len(), 40);
            assert!(wire.is_ascii());
        }
    }

    #[test]
    fn test_wire_digest_deterministic() {
        let payload = make_varied(1024);
        assert_eq!(wire_digest(&payload, 40), wire_digest(&payload, 40));
    }

    fn make_varied(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }
}
