//! Content hashing, hex/bit conversion, the keyed position mask, and BER.
//!
//! Everything here is a pure function of its inputs so it can be
//! exercised from any thread; none of it touches the filesystem.
//!
//! Glossary
//! --------
//! * **Content hash** – SHA-256 of an [`ImageMatrix`](crate::image_io::ImageMatrix)'s
//!   raw little-endian row-major pixel bytes. Used to key ledger
//!   lookups, so it must be stable across platforms and across the
//!   lifetime of the persisted chain.
//! * **Position mask** – a per-pixel-window Bernoulli(0.5) sequence
//!   derived from a secret key string, reproduced identically by
//!   embed and extract.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use crate::image_io::ImageMatrix;

/// SHA-256 content hash of `image`, as a lowercase hex digest.
///
/// The matrix is hashed in row-major order, each sample as a 2-byte
/// little-endian pair regardless of bit depth, so an 8-bit PNG and a
/// 12-bit DICOM slice hash consistently under the same rule.
pub fn content_hash(image: &ImageMatrix) -> String {
    let mut hasher = Sha256::new();
    for sample in &image.data {
        hasher.update(sample.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Converts a lowercase/uppercase hex string into its bits,
/// most-significant-bit first per nibble.
///
/// `hex_to_bits("a1")` yields `[1,0,1,0, 0,0,0,1]`.
pub fn hex_to_bits(hex: &str) -> Vec<u8> {
    let mut bits = Vec::with_capacity(hex.len() * 4);
    for c in hex.chars() {
        let nibble = c.to_digit(16).expect("hex_to_bits: non-hex character");
        bits.push(((nibble >> 3) & 1) as u8);
        bits.push(((nibble >> 2) & 1) as u8);
        bits.push(((nibble >> 1) & 1) as u8);
        bits.push((nibble & 1) as u8);
    }
    bits
}

/// Inverse of [`hex_to_bits`]. Left-pads `bits` with zeros to a
/// multiple of 4 before packing into nibbles.
pub fn bits_to_hex(bits: &[u8]) -> String {
    let pad = (4 - bits.len() % 4) % 4;
    let mut padded = vec![0u8; pad];
    padded.extend_from_slice(bits);

    let mut out = String::with_capacity(padded.len() / 4);
    for nibble in padded.chunks(4) {
        let value = nibble.iter().fold(0u8, |acc, &b| (acc << 1) | (b & 1));
        out.push(std::char::from_digit(value as u32, 16).expect("nibble in range"));
    }
    out
}

/// Deterministic position mask of length `n`, seeded from `key`.
///
/// The key string is first hashed with SHA-256 to produce a 32-byte
/// seed for a `ChaCha8` generator, then `n` independent `Bernoulli(0.5)`
/// draws are taken. `ChaCha8` is used (rather than the platform
/// default RNG) specifically because its output is specified and
/// identical on every target, which is load-bearing: embed and
/// extract must reproduce the exact same mask.
pub fn position_mask(key: &str, n: usize) -> Vec<bool> {
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&Sha256::digest(key.as_bytes()));
    let mut rng = ChaCha8Rng::from_seed(seed);
    (0..n).map(|_| rng.gen_bool(0.5)).collect()
}

/// Bit error rate between `a` and `b`: Hamming distance over
/// `min(a.len(), b.len())`, divided by that shorter length.
///
/// When the sequences differ in length, only the shared prefix is
/// compared; callers that need length-equalized comparison (e.g. the
/// 256-bit aggregate watermark) should truncate/pad before calling.
pub fn bit_error_rate(a: &[u8], b: &[u8]) -> f64 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let mismatches = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
    mismatches as f64 / len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_bits_roundtrip() {
        let hex = "a1b2c3";
        let bits = hex_to_bits(hex);
        assert_eq!(bits.len(), 24);
        assert_eq!(bits_to_hex(&bits), hex);
    }

    #[test]
    fn hex_to_bits_msb_first() {
        assert_eq!(hex_to_bits("a"), vec![1, 0, 1, 0]);
    }

    #[test]
    fn bits_to_hex_left_pads() {
        // 6 bits -> padded to 8 -> 2 hex digits
        assert_eq!(bits_to_hex(&[1, 1, 0, 1, 0, 1]), "35");
    }

    #[test]
    fn position_mask_is_reproducible() {
        let a = position_mask("k0", 1000);
        let b = position_mask("k0", 1000);
        assert_eq!(a, b);
    }

    #[test]
    fn position_mask_differs_across_keys() {
        let a = position_mask("k0", 1000);
        let b = position_mask("k1", 1000);
        assert_ne!(a, b);
    }

    #[test]
    fn ber_identical_sequences_is_zero() {
        let bits = vec![1, 0, 1, 1, 0];
        assert_eq!(bit_error_rate(&bits, &bits), 0.0);
    }

    #[test]
    fn ber_counts_mismatches_over_shorter_length() {
        let a = vec![1, 1, 1, 1];
        let b = vec![1, 0, 1, 0, 0, 0]; // only first 4 compared
        assert_eq!(bit_error_rate(&a, &b), 0.5);
    }
}
