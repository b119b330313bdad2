//! Binary encoding for cached post records.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "IFXR" (u32) | version (u16) | media count (u32)
//! post_id | username | caption            (u32 length + UTF-8 bytes each)
//! media[i].type_name | media[i].url       (repeated media count times)
//! crc32 of everything above (u32)
//! ```
//!
//! Decoding borrows string slices out of the input buffer; call
//! [`PostRecordRef::into_owned`] to detach from it.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::types::{MediaItem, PostRecord};

/// Magic bytes: "IFXR"
const RECORD_MAGIC: u32 = 0x4946_5852;

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// magic + version + media count
const HEADER_SIZE: usize = 10;

const CHECKSUM_SIZE: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic: expected 0x{RECORD_MAGIC:08X}, got 0x{0:08X}")]
    BadMagic(u32),

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("Truncated record: needed {needed} bytes at offset {offset}")]
    Truncated { needed: usize, offset: usize },

    #[error("Checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    Checksum { stored: u32, computed: u32 },

    #[error("Invalid UTF-8 in record: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Field too large to encode: {0} bytes")]
    TooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded record whose strings borrow from the encoded buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecordRef<'a> {
    pub post_id: &'a str,
    pub username: &'a str,
    pub caption: &'a str,
    pub media: Vec<MediaItemRef<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaItemRef<'a> {
    pub type_name: &'a str,
    pub url: &'a str,
}

impl PostRecordRef<'_> {
    pub fn into_owned(self) -> PostRecord {
        PostRecord {
            post_id: self.post_id.to_string(),
            username: self.username.to_string(),
            caption: self.caption.to_string(),
            media: self
                .media
                .into_iter()
                .map(|m| MediaItem::new(m.type_name, m.url))
                .collect(),
        }
    }
}

/// Encode a record into a fresh buffer.
pub fn encode(record: &PostRecord) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(encoded_len(record));
    write_to(record, &mut buf)?;
    let checksum = crc32(&buf);
    buf.write_u32::<LittleEndian>(checksum)?;
    Ok(buf)
}

/// Write the record body (everything except the trailing checksum).
fn write_to<W: Write>(record: &PostRecord, w: &mut W) -> Result<(), CodecError> {
    w.write_u32::<LittleEndian>(RECORD_MAGIC)?;
    w.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    w.write_u32::<LittleEndian>(len_u32(record.media.len())?)?;
    write_str(w, &record.post_id)?;
    write_str(w, &record.username)?;
    write_str(w, &record.caption)?;
    for media in &record.media {
        write_str(w, &media.type_name)?;
        write_str(w, &media.url)?;
    }
    Ok(())
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<(), CodecError> {
    w.write_u32::<LittleEndian>(len_u32(s.len())?)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn len_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge(len))
}

fn encoded_len(record: &PostRecord) -> usize {
    let strings = record.post_id.len()
        + record.username.len()
        + record.caption.len()
        + record
            .media
            .iter()
            .map(|m| m.type_name.len() + m.url.len())
            .sum::<usize>();
    let prefixes = 4 * (3 + 2 * record.media.len());
    HEADER_SIZE + prefixes + strings + CHECKSUM_SIZE
}

/// Decode a record, borrowing its strings from `buf`.
pub fn decode_ref(buf: &[u8]) -> Result<PostRecordRef<'_>, CodecError> {
    if buf.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE + CHECKSUM_SIZE,
            offset: 0,
        });
    }

    let magic = LittleEndian::read_u32(&buf[0..4]);
    if magic != RECORD_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = LittleEndian::read_u16(&buf[4..6]);
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let (body, tail) = buf.split_at(buf.len() - CHECKSUM_SIZE);
    let stored = LittleEndian::read_u32(tail);
    let computed = crc32(body);
    if stored != computed {
        return Err(CodecError::Checksum { stored, computed });
    }

    let media_count = LittleEndian::read_u32(&body[6..10]) as usize;
    let mut cursor = Cursor {
        buf: body,
        pos: HEADER_SIZE,
    };
    let post_id = cursor.str()?;
    let username = cursor.str()?;
    let caption = cursor.str()?;

    // Each media entry needs at least two length prefixes.
    if media_count > cursor.remaining() / 8 {
        return Err(CodecError::Truncated {
            needed: media_count * 8,
            offset: cursor.pos,
        });
    }
    let mut media = Vec::with_capacity(media_count);
    for _ in 0..media_count {
        let type_name = cursor.str()?;
        let url = cursor.str()?;
        media.push(MediaItemRef { type_name, url });
    }

    Ok(PostRecordRef {
        post_id,
        username,
        caption,
        media,
    })
}

/// Decode a record into an owned [`PostRecord`].
pub fn decode(buf: &[u8]) -> Result<PostRecord, CodecError> {
    decode_ref(buf).map(PostRecordRef::into_owned)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                offset: self.pos,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn str(&mut self) -> Result<&'a str, CodecError> {
        let len = LittleEndian::read_u32(self.take(4)?) as usize;
        Ok(std::str::from_utf8(self.take(len)?)?)
    }
}

/// CRC32 (IEEE) of `data`.
pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC32_TABLE[index] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

/// Lookup table for the reflected polynomial 0xEDB88320.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                0xEDB8_8320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record() -> PostRecord {
        PostRecord {
            post_id: "Cabc123".to_string(),
            username: "alice".to_string(),
            caption: "line one\nline two ✨".to_string(),
            media: vec![
                MediaItem::new("GraphImage", "https://scontent.cdninstagram.com/a.jpg"),
                MediaItem::new("GraphVideo", "https://scontent.cdninstagram.com/b.mp4"),
            ],
        }
    }

    #[test]
    fn test_roundtrip_preserves_media_order() {
        let record = make_record();
        let buf = encode(&record).unwrap();
        assert_eq!(buf.len(), encoded_len(&record));

        let borrowed = decode_ref(&buf).unwrap();
        assert_eq!(borrowed.username, "alice");
        assert_eq!(borrowed.media[0].type_name, "GraphImage");
        assert_eq!(borrowed.media[1].url, "https://scontent.cdninstagram.com/b.mp4");
        assert_eq!(borrowed.into_owned(), record);
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = encode(&make_record()).unwrap();
        buf[0] = 0;
        assert!(matches!(decode(&buf), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = encode(&make_record()).unwrap();
        buf[4] = 9;
        assert!(matches!(
            decode(&buf),
            Err(CodecError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_corruption_detected_by_checksum() {
        let mut buf = encode(&make_record()).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0x40;
        assert!(matches!(decode(&buf), Err(CodecError::Checksum { .. })));
    }

    #[test]
    fn test_truncated_input() {
        let buf = encode(&make_record()).unwrap();
        assert!(decode(&buf[..8]).is_err());
        assert!(decode(&buf[..buf.len() - 6]).is_err());
    }

    #[test]
    fn test_inflated_media_count_rejected() {
        let record = PostRecord::new("Cx");
        let mut buf = Vec::new();
        write_to(&record, &mut buf).unwrap();
        LittleEndian::write_u32(&mut buf[6..10], u32::MAX);
        let checksum = crc32(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        assert!(matches!(decode(&buf), Err(CodecError::Truncated { .. })));
    }
}
