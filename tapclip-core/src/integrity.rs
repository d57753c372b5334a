//! Integrity: cheap per-chunk hash (one hop) and MD5 digest over the whole payload (end to end).

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

/// Size of the chunk hash prefix on every chunk message.
pub const CHUNK_HASH_LEN: u32 = 4;

/// Length of a hex digest string.
pub const DIGEST_HEX_LEN: usize = 32;

/// Order-sensitive polynomial hash over a chunk: `h = 31 * h + b`, seeded with 1,
/// bytes taken as signed, wrapping on overflow. Catches corruption and reordering
/// within a single chunk; not collision resistant.
pub fn chunk_hash(bytes: &[u8]) -> i32 {
    bytes.iter().fold(1i32, |h, &b| {
        h.wrapping_mul(31).wrapping_add(b as i8 as i32)
    })
}

/// Verify a chunk against the hash its sender claimed.
pub fn verify_chunk(bytes: &[u8], claimed: i32) -> bool {
    chunk_hash(bytes) == claimed
}

/// MD5 digest of an in-memory payload as 32 lowercase hex chars.
pub fn digest_of(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// MD5 digest of a stream, read in 8 KiB blocks.
pub fn digest_of_reader<R: Read>(mut source: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn digest_of_file(path: &Path) -> io::Result<String> {
    digest_of_reader(File::open(path)?)
}

/// True if `s` looks like a digest this crate produced.
pub fn is_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_hash_known_values() {
        assert_eq!(chunk_hash(&[]), 1);
        assert_eq!(chunk_hash(&[1]), 32);
        assert_eq!(chunk_hash(&[1, 2]), 31 * 32 + 2);
        // High bytes count as negative.
        assert_eq!(chunk_hash(&[0xFF]), 31 - 1);
    }

    #[test]
    fn chunk_hash_is_order_sensitive() {
        assert_ne!(chunk_hash(b"ab"), chunk_hash(b"ba"));
        assert!(verify_chunk(b"hello chunk", chunk_hash(b"hello chunk")));
        assert!(!verify_chunk(b"tampered", chunk_hash(b"hello chunk")));
    }

    #[test]
    fn chunk_hash_wraps_without_panicking() {
        let big = vec![0x7Fu8; 100_000];
        let _ = chunk_hash(&big);
    }

    #[test]
    fn digest_known_vectors() {
        assert_eq!(digest_of(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(digest_of(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn digest_keeps_leading_zeros() {
        // MD5("363") starts with a zero nibble.
        let d = digest_of(b"363");
        assert_eq!(d, "00411460f7c92d2124a67ea0f4cb5f85");
        assert!(is_digest(&d));
    }

    #[test]
    fn digest_is_deterministic_and_distinguishes_inputs() {
        assert_eq!(digest_of(b"payload"), digest_of(b"payload"));
        assert_ne!(digest_of(b"payload-1"), digest_of(b"payload-2"));
    }

    #[test]
    fn stream_digest_matches_buffer_digest() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = digest_of_reader(&data[..]).unwrap();
        assert_eq!(streamed, digest_of(&data));
    }

    #[test]
    fn is_digest_rejects_uppercase_and_short() {
        assert!(!is_digest("5D41402ABC4B2A76B9719D911017C592"));
        assert!(!is_digest("5d41"));
    }
}
