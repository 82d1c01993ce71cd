use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content-addressed identifier for any stored object.
///
/// An `ObjectId` is the BLAKE3 hash of an object's content. Identical content
/// always produces the same `ObjectId`, which is what makes objects
/// deduplicatable and usable as change-detection fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Length of the digest in bytes.
    pub const LEN: usize = 32;

    /// The empty object ID (all zeros). Represents "no object".
    pub const EMPTY: Self = Self([0u8; 32]);

    /// Compute an `ObjectId` from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create an `ObjectId` from a pre-computed hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns `true` if this is the empty object ID.
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for ObjectId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<ObjectId> for [u8; 32] {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// ObjectIdBuilder
// ---------------------------------------------------------------------------

/// Incremental `ObjectId` computation over a sequence of byte chunks.
///
/// The digest only depends on the concatenated bytes, never on how they were
/// split across `write` calls. `compute_hash` does not consume the state, so
/// it can be called at any point to fingerprint the bytes seen so far.
#[derive(Clone, Default)]
pub struct ObjectIdBuilder {
    hasher: blake3::Hasher,
    written: u64,
}

impl ObjectIdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes.
    pub fn write(&mut self, buffer: &[u8]) {
        self.hasher.update(buffer);
        self.written += buffer.len() as u64;
    }

    /// Feed a single byte.
    pub fn write_byte(&mut self, value: u8) {
        self.write(&[value]);
    }

    /// Feed a length-prefixed string, so that adjacent strings cannot alias.
    pub fn write_str(&mut self, value: &str) {
        self.write(&(value.len() as u64).to_le_bytes());
        self.write(value.as_bytes());
    }

    /// Feed the bincode encoding of a value.
    pub fn write_serialized<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), TypeError> {
        let bytes =
            bincode::serialize(value).map_err(|e| TypeError::Serialization(e.to_string()))?;
        self.write(&bytes);
        Ok(())
    }

    /// The id of everything written since creation or the last `reset`.
    pub fn compute_hash(&self) -> ObjectId {
        ObjectId::from_hash(*self.hasher.finalize().as_bytes())
    }

    /// Clear the accumulated state, keeping the hasher allocation.
    pub fn reset(&mut self) {
        self.hasher.reset();
        self.written = 0;
    }

    /// Number of bytes fed so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

impl io::Write for ObjectIdBuilder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ObjectIdBuilder::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for ObjectIdBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectIdBuilder")
            .field("written", &self.written)
            .finish()
    }
}
