//! Bundle header layout.
//!
//! ```text
//! "FBDL" | version: u32 BE
//! dependencies:  varint count, then (varint len, utf-8 name)*
//! incrementals:  varint count, then id[32]*
//! objects:       varint count, then (id[32], offset u64, raw_size u64,
//!                stored_size u64, flags u8, crc32 u32)*   (all BE)
//! assets:        varint count, then (varint len, utf-8 url, id[32])*
//! data section   (object offsets are relative to its start)
//! blake3 checksum of everything above: [32]
//! ```

use forge_types::ObjectId;

use crate::error::{PackError, PackResult};

pub const MAGIC: &[u8; 4] = b"FBDL";
pub const VERSION: u32 = 1;
pub const CHECKSUM_LEN: usize = 32;

/// Flag bit set when the stored bytes are zstd-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Location and encoding of one object inside the data section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub offset: u64,
    pub raw_size: u64,
    pub stored_size: u64,
    pub flags: u8,
    pub crc32: u32,
}

impl ObjectRecord {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Everything a bundle declares ahead of its data section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BundleDescription {
    /// Bundles that must be loaded before this one.
    pub dependencies: Vec<String>,
    /// Incremental bundles chained onto this one, applied in order.
    pub incremental_bundles: Vec<ObjectId>,
    pub objects: Vec<ObjectRecord>,
    pub assets: Vec<(String, ObjectId)>,
}

impl BundleDescription {
    /// Serialize the header (magic through asset records).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_be_bytes());

        encode_varint(&mut buf, self.dependencies.len() as u64);
        for dep in &self.dependencies {
            encode_str(&mut buf, dep);
        }

        encode_varint(&mut buf, self.incremental_bundles.len() as u64);
        for id in &self.incremental_bundles {
            buf.extend_from_slice(id.as_bytes());
        }

        encode_varint(&mut buf, self.objects.len() as u64);
        for rec in &self.objects {
            buf.extend_from_slice(rec.id.as_bytes());
            buf.extend_from_slice(&rec.offset.to_be_bytes());
            buf.extend_from_slice(&rec.raw_size.to_be_bytes());
            buf.extend_from_slice(&rec.stored_size.to_be_bytes());
            buf.push(rec.flags);
            buf.extend_from_slice(&rec.crc32.to_be_bytes());
        }

        encode_varint(&mut buf, self.assets.len() as u64);
        for (url, id) in &self.assets {
            encode_str(&mut buf, url);
            buf.extend_from_slice(id.as_bytes());
        }
        buf
    }

    /// Parse a header. Returns the description and the header length, which
    /// is where the data section starts.
    pub fn decode(data: &[u8]) -> PackResult<(Self, usize)> {
        if data.len() < 8 {
            return Err(PackError::CorruptEntry {
                offset: 0,
                reason: "bundle data too short".into(),
            });
        }
        if &data[0..4] != MAGIC {
            return Err(PackError::InvalidMagic {
                expected: String::from_utf8_lossy(MAGIC).into(),
                actual: String::from_utf8_lossy(&data[0..4]).into(),
            });
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }

        let mut cursor = Cursor { data, pos: 8 };
        let mut desc = BundleDescription::default();

        for _ in 0..cursor.varint()? {
            desc.dependencies.push(cursor.string()?);
        }
        for _ in 0..cursor.varint()? {
            desc.incremental_bundles.push(cursor.object_id()?);
        }
        for _ in 0..cursor.varint()? {
            desc.objects.push(ObjectRecord {
                id: cursor.object_id()?,
                offset: cursor.u64()?,
                raw_size: cursor.u64()?,
                stored_size: cursor.u64()?,
                flags: cursor.take(1)?[0],
                crc32: {
                    let b = cursor.take(4)?;
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
                },
            });
        }
        for _ in 0..cursor.varint()? {
            let url = cursor.string()?;
            let id = cursor.object_id()?;
            desc.assets.push((url, id));
        }

        Ok((desc, cursor.pos))
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> PackResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(PackError::CorruptEntry {
                offset: self.pos as u64,
                reason: "header extends beyond bundle".into(),
            }),
        }
    }

    fn varint(&mut self) -> PackResult<u64> {
        let (value, consumed) = decode_varint(&self.data[self.pos..]).map_err(|e| match e {
            PackError::CorruptEntry { reason, .. } => PackError::CorruptEntry {
                offset: self.pos as u64,
                reason,
            },
            other => other,
        })?;
        self.pos += consumed;
        Ok(value)
    }

    fn u64(&mut self) -> PackResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn object_id(&mut self) -> PackResult<ObjectId> {
        let b = self.take(ObjectId::LEN)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(ObjectId::from_hash(arr))
    }

    fn string(&mut self) -> PackResult<String> {
        let offset = self.pos as u64;
        let len = self.varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| PackError::CorruptEntry {
            offset,
            reason: e.to_string(),
        })
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    encode_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Encode a u64 as a variable-length integer.
pub(crate) fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a variable-length integer. Returns (value, bytes_consumed).
pub(crate) fn decode_varint(data: &[u8]) -> PackResult<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if shift >= 64 {
            return Err(PackError::CorruptEntry {
                offset: 0,
                reason: "varint overflow".into(),
            });
        }
    }
    Err(PackError::CorruptEntry {
        offset: 0,
        reason: "truncated varint".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip_large() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, 1_000_000);
        let (val, consumed) = decode_varint(&buf).unwrap();
        assert_eq!(val, 1_000_000);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn varint_max_u64() {
        let mut buf = Vec::new();
        encode_varint(&mut buf, u64::MAX);
        let (val, _) = decode_varint(&buf).unwrap();
        assert_eq!(val, u64::MAX);
    }

    #[test]
    fn decode_varint_truncated() {
        let err = decode_varint(&[0x80]).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { .. }));
    }

    #[test]
    fn description_header_decodes_what_it_encodes() {
        let desc = BundleDescription {
            dependencies: vec!["core".into(), "shared".into()],
            incremental_bundles: vec![ObjectId::from_bytes(b"inc")],
            objects: vec![ObjectRecord {
                id: ObjectId::from_bytes(b"obj"),
                offset: 0,
                raw_size: 10,
                stored_size: 7,
                flags: FLAG_COMPRESSED,
                crc32: 0xDEADBEEF,
            }],
            assets: vec![("textures/a.bin".into(), ObjectId::from_bytes(b"obj"))],
        };
        let bytes = desc.encode();
        let (decoded, len) = BundleDescription::decode(&bytes).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(len, bytes.len());
        assert!(decoded.objects[0].is_compressed());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = BundleDescription::default().encode();
        bytes[0] = b'X';
        let err = BundleDescription::decode(&bytes).unwrap_err();
        assert!(matches!(err, PackError::InvalidMagic { .. }));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = BundleDescription::default().encode();
        bytes[7] = 9;
        let err = BundleDescription::decode(&bytes).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedVersion(9)));
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let desc = BundleDescription {
            dependencies: vec!["dep".into()],
            ..Default::default()
        };
        let bytes = desc.encode();
        let err = BundleDescription::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { .. }));
    }
}
