//! Content fingerprinting.
//!
//! Every checksum in deltasync is a BLAKE3-256 digest. Chunk checksums are
//! content addresses: identical bytes hash to the identical digest no matter
//! where they sit in a file. Whole-file checksums gate every write.

/// A 256-bit BLAKE3 digest.
pub type Digest = [u8; 32];

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Hash a byte slice.
pub fn hash(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Incremental hasher for data that arrives in pieces.
///
/// Produces the same digest as [`hash`] over the concatenation of every
/// `update` call.
#[derive(Default, Clone)]
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finalize(&self) -> Digest {
        *self.0.finalize().as_bytes()
    }
}

/// First 8 bytes of a digest as hex, for log lines.
pub fn short_hex(digest: &Digest) -> String {
    hex::encode(&digest[..8])
}
