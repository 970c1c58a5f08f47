//! On-disk formats of the data file: the CRC-guarded file header, the entry
//! records appended after it, and the hint records plus fixed-size footer
//! that seal the file. All integers are little-endian; variable-width
//! integers use the standard 7-bit continuation encoding.

use bytes::Buf;

use super::Error;

/// Version stamped into every data file header.
pub(super) const DATAFILE_VERSION: u32 = 1;

/// File type bit for a regular data file that has not been merged.
pub(super) const FILETYPE_UNCOMPACTED: u32 = 0x1;

/// File type bit for the output of a merge pass.
pub(super) const FILETYPE_COMPACTED: u32 = 0x2;

/// Entry flag marking a tombstone.
const FLAG_DELETE: u32 = 0x1;

/// Entry flag marking a record rewritten by a merge pass.
const FLAG_MERGED: u32 = 0x2;

/// Footer flag set when the file is known to contain undecodable records.
const FOOTER_FLAG_HAS_INVALID_ENTRIES: u32 = 0x1;

pub(super) fn put_varint64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push(v as u8 | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(super) fn put_varint32(buf: &mut Vec<u8>, v: u32) {
    put_varint64(buf, u64::from(v));
}

pub(super) fn get_varint64(buf: &mut &[u8]) -> Result<u64, Error> {
    let mut out = 0u64;
    let mut shift = 0u32;
    loop {
        if buf.is_empty() {
            return Err(Error::Corruption("truncated varint".to_string()));
        }
        if shift > 63 {
            return Err(Error::Corruption("varint overflows 64 bits".to_string()));
        }
        let byte = buf.get_u8();
        out |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(out);
        }
        shift += 7;
    }
}

pub(super) fn get_varint32(buf: &mut &[u8]) -> Result<u32, Error> {
    let v = get_varint64(buf)?;
    u32::try_from(v).map_err(|_| Error::Corruption("varint overflows 32 bits".to_string()))
}

/// The prefix of every entry record. The checksum covers the key and value
/// bytes that follow the header; `hash` repeats the hashed key stored in the
/// hint footer so records are self-describing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct EntryHeader {
    pub(super) crc32: u32,
    pub(super) flags: u32,
    pub(super) timestamp: u64,
    pub(super) size_key: u64,
    pub(super) size_value: u64,
    pub(super) hash: u64,
}

impl EntryHeader {
    pub(super) fn set_delete(&mut self) {
        self.flags |= FLAG_DELETE;
    }

    pub(super) fn is_delete(&self) -> bool {
        self.flags & FLAG_DELETE != 0
    }

    pub(super) fn is_merged(&self) -> bool {
        self.flags & FLAG_MERGED != 0
    }

    /// Append the encoded header to `buf` and return its serialized size.
    pub(super) fn encode_to(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.extend_from_slice(&self.crc32.to_le_bytes());
        put_varint32(buf, self.flags);
        put_varint64(buf, self.timestamp);
        put_varint64(buf, self.size_key);
        put_varint64(buf, self.size_value);
        buf.extend_from_slice(&self.hash.to_le_bytes());
        buf.len() - start
    }

    /// Decode a header from the front of `buf`, returning it along with its
    /// serialized size.
    pub(super) fn decode_from(mut buf: &[u8]) -> Result<(Self, usize), Error> {
        let total = buf.len();
        if buf.remaining() < 4 {
            return Err(Error::Corruption("truncated entry header".to_string()));
        }
        let crc32 = buf.get_u32_le();
        let flags = get_varint32(&mut buf)?;
        let timestamp = get_varint64(&mut buf)?;
        let size_key = get_varint64(&mut buf)?;
        let size_value = get_varint64(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(Error::Corruption("truncated entry header".to_string()));
        }
        let hash = buf.get_u64_le();
        let header = Self {
            crc32,
            flags,
            timestamp,
            size_key,
            size_value,
            hash,
        };
        Ok((header, total - buf.remaining()))
    }
}

/// The fixed prefix of every data file, padded out to the configured header
/// size. The leading checksum covers the 16 bytes that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DataFileHeader {
    pub(super) version: u32,
    pub(super) filetype: u32,
    pub(super) timestamp: u64,
}

impl DataFileHeader {
    pub(super) const FIXED_SIZE: usize = 20;

    /// Encode the header into the first [`Self::FIXED_SIZE`] bytes of `buf`.
    pub(super) fn encode_to(&self, buf: &mut [u8]) {
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.filetype.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_le_bytes());
        let crc32 = crc32fast::hash(&buf[4..20]);
        buf[0..4].copy_from_slice(&crc32.to_le_bytes());
    }

    pub(super) fn decode_from(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(Error::Corruption("truncated data file header".to_string()));
        }
        let mut reader = buf;
        let crc32 = reader.get_u32_le();
        let version = reader.get_u32_le();
        let filetype = reader.get_u32_le();
        let timestamp = reader.get_u64_le();
        if crc32fast::hash(&buf[4..20]) != crc32 {
            return Err(Error::Corruption(
                "data file header checksum mismatch".to_string(),
            ));
        }
        Ok(Self {
            version,
            filetype,
            timestamp,
        })
    }
}

/// The fixed-size trailer sealing a data file. `offset_indexes` is the byte
/// offset where the hint records begin; `crc32` occupies the last 4 bytes of
/// the file and covers everything from `offset_indexes` up to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DataFileFooter {
    pub(super) filetype: u32,
    pub(super) flags: u32,
    pub(super) offset_indexes: u64,
    pub(super) num_entries: u64,
    pub(super) crc32: u32,
}

impl DataFileFooter {
    pub(super) const FIXED_SIZE: usize = 36;

    pub(super) fn is_compacted(&self) -> bool {
        self.filetype & FILETYPE_COMPACTED != 0
    }

    pub(super) fn has_invalid_entries(&self) -> bool {
        self.flags & FOOTER_FLAG_HAS_INVALID_ENTRIES != 0
    }

    /// Append the encoded footer to `buf`. The checksum field is written
    /// as-is; the sealing code computes it over the finished hint region and
    /// patches the last 4 bytes.
    pub(super) fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.filetype.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.offset_indexes.to_le_bytes());
        buf.extend_from_slice(&self.num_entries.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
    }

    /// Decode a footer from the last [`Self::FIXED_SIZE`] bytes of a file.
    pub(super) fn decode_from(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(Error::Corruption("truncated data file footer".to_string()));
        }
        let mut reader = buf;
        let filetype = reader.get_u32_le();
        let flags = reader.get_u32_le();
        let offset_indexes = reader.get_u64_le();
        let num_entries = reader.get_u64_le();
        reader.advance(8);
        let crc32 = reader.get_u32_le();
        Ok(Self {
            filetype,
            flags,
            offset_indexes,
            num_entries,
            crc32,
        })
    }
}

/// One hint per entry record, written contiguously before the footer so the
/// in-memory index can be rebuilt without scanning the records themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct HintRecord {
    pub(super) hashed_key: u64,
    pub(super) offset_entry: u32,
}

impl HintRecord {
    pub(super) fn encode_to(&self, buf: &mut Vec<u8>) {
        put_varint64(buf, self.hashed_key);
        put_varint32(buf, self.offset_entry);
    }

    /// Decode a hint record from the front of `buf`, advancing it.
    pub(super) fn decode_from(buf: &mut &[u8]) -> Result<Self, Error> {
        let hashed_key = get_varint64(buf)?;
        let offset_entry = get_varint32(buf)?;
        Ok(Self {
            hashed_key,
            offset_entry,
        })
    }
}
