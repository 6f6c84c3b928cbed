//! Content hashing for Brisk.
//!
//! Every digest in the incremental-build core is a SHA-256 [`HashCode`]. Plain byte streams are
//! hashed with [`hash_bytes`] / [`hash_reader`] / [`hash_file`]; structured values (fingerprint
//! entries, class ABIs, archive listings) are folded with a [`Hasher`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashCode([u8; 32]);

impl HashCode {
    pub const LEN: usize = 32;

    pub const fn from_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a lowercase (or uppercase) hex string produced by [`HashCode::to_hex`].
    pub fn from_hex(text: &str) -> Option<Self> {
        let mut out = [0_u8; 32];
        hex::decode_to_slice(text, &mut out).ok()?;
        Some(Self(out))
    }

    /// A fixed signature derived from a type tag, used for entries that carry no content.
    pub fn signature(tag: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.put_str("SIGNATURE");
        hasher.put_str(tag);
        hasher.finish()
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({})", self.to_hex())
    }
}

/// Incremental hasher for structured values.
///
/// Variable-length inputs are length-prefixed so that `("ab", "c")` and `("a", "bc")` never
/// collide.
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update((bytes.len() as u64).to_be_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn put_str(&mut self, text: &str) -> &mut Self {
        self.put_bytes(text.as_bytes())
    }

    pub fn put_hash(&mut self, hash: &HashCode) -> &mut Self {
        self.inner.update(hash.as_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(value.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.inner.update(value.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.inner.update([u8::from(value)]);
        self
    }

    pub fn finish(self) -> HashCode {
        HashCode(self.inner.finalize().into())
    }
}

/// Hash an arbitrary byte slice.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> HashCode {
    HashCode(Sha256::digest(bytes.as_ref()).into())
}

/// Hash bytes read from `reader` using a bounded buffer.
pub fn hash_reader(mut reader: impl Read) -> io::Result<HashCode> {
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..read]);
    }
    Ok(HashCode(hasher.finalize().into()))
}

/// Hash a file's contents without reading it into memory all at once.
pub fn hash_file(path: impl AsRef<Path>) -> io::Result<HashCode> {
    let file = std::fs::File::open(path)?;
    hash_reader(file)
}
