//! Content addressing for certificate blobs.
//!
//! Digests are plain SHA-256 values held as a single `[u8; 32]`. They identify
//! a byte blob by content only and carry no trust semantics.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CertificateDigest([u8; DIGEST_LEN]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestParseError {
    #[error("digest must be {expected} hex characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid hex in digest: {0}")]
    Hex(String),
}

impl CertificateDigest {
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        CertificateDigest(bytes)
    }

    /// Digest of a complete buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Accepts upper or lower case hex.
    pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        let s = s.trim();
        if s.len() != DIGEST_LEN * 2 {
            return Err(DigestParseError::Length { expected: DIGEST_LEN * 2, actual: s.len() });
        }
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|e| DigestParseError::Hex(e.to_string()))?;
        Ok(CertificateDigest(out))
    }
}

impl fmt::Display for CertificateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for CertificateDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CertificateDigest::from_hex(s)
    }
}

impl AsRef<[u8]> for CertificateDigest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Streaming SHA-256 over arbitrary-length input.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        ContentHasher { inner: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> CertificateDigest {
        CertificateDigest(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer_vectors() {
        assert_eq!(
            CertificateDigest::of(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            CertificateDigest::of(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            CertificateDigest::of(b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq").to_hex(),
            "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"
        );
    }

    #[test]
    fn million_a_streamed_in_uneven_chunks() {
        let data = vec![b'a'; 1_000_000];
        let mut hasher = ContentHasher::new();
        for chunk in data.chunks(997) {
            hasher.update(chunk);
        }
        assert_eq!(
            hasher.finish().to_hex(),
            "cdc76e5c9914fb9281a1c7e284d73e67f1809a48a497200e046d39ccc7112cd0"
        );
    }

    #[test]
    fn streaming_matches_one_shot_around_block_boundaries() {
        for len in [55usize, 56, 63, 64, 65, 119, 120, 128] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            let one_shot = CertificateDigest::of(&data);
            let mut hasher = ContentHasher::new();
            let (a, b) = data.split_at(len / 3);
            hasher.update(a);
            hasher.update(b);
            assert_eq!(hasher.finish(), one_shot, "len {len}");
        }
    }

    #[test]
    fn identical_input_gives_identical_digest() {
        let a = CertificateDigest::of(b"certificate bytes");
        let b = CertificateDigest::of(b"certificate bytes");
        let c = CertificateDigest::of(b"certificate byteS");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hex_round_trip_accepts_upper_case() {
        let d = CertificateDigest::of(b"abc");
        let upper = d.to_hex().to_uppercase();
        assert_eq!(CertificateDigest::from_hex(&upper).unwrap(), d);
        assert_eq!(upper.parse::<CertificateDigest>().unwrap(), d);
        assert_eq!(d.to_string(), d.to_hex());
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(matches!(
            CertificateDigest::from_hex("abcd"),
            Err(DigestParseError::Length { expected: 64, actual: 4 })
        ));
        let bad = "zz".repeat(32);
        assert!(matches!(CertificateDigest::from_hex(&bad), Err(DigestParseError::Hex(_))));
    }
}
