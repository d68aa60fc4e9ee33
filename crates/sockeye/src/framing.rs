//! Length-prefixed message framing for the test vocabulary.
//!
//! A fixed header carries identity, transform tags, timestamps, and section
//! sizes; an optional pragma section and an optional entity section follow.
//! Section payloads pass through the [`Serialization`] and [`Compression`]
//! seams; this module only frames bytes.

use bitflags::bitflags;
use sockeye_timing::Nanos;

use crate::{
    error::{Error, ErrorKind, Result},
    session::{Compression, Serialization},
};

pub const FRAME_MAGIC: u32 = 0x534B_4659; // "SKFY"
pub const FRAME_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 52;

/// Pragma sections describe the request out-of-band; bounded well below
/// entities.
pub const MAX_PRAGMA_SIZE: usize = 8 * 1024 * 1024;
/// Entities carry the payload proper.
pub const MAX_ENTITY_SIZE: usize = 1024 * 1024 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        const HAS_PRAGMA = 0b001;
        const HAS_ENTITY = 0b010;
        const COMPRESSED = 0b100;
    }
}

/// CRC-32 (IEEE) over the header bytes with the checksum field zeroed.
fn crc32(bytes: &[u8]) -> u32 {
    const TABLE: [u32; 256] = build_crc_table();
    let mut crc = u32::MAX;
    for byte in bytes {
        let index = ((crc ^ u32::from(*byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[index];
    }
    !crc
}

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// The fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u16,
    pub flags: FrameFlags,
    pub serialization: u16,
    pub compression: u16,
    pub transaction: u64,
    pub client_timestamp: Nanos,
    pub server_timestamp: Nanos,
    pub pragma_size: u32,
    pub entity_size: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        out[4..6].copy_from_slice(&FRAME_VERSION.to_be_bytes());
        out[6..8].copy_from_slice(&self.message_type.to_be_bytes());
        out[8..10].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[10..12].copy_from_slice(&self.serialization.to_be_bytes());
        out[12..14].copy_from_slice(&self.compression.to_be_bytes());
        // out[14..16] reserved.
        out[16..24].copy_from_slice(&self.transaction.to_be_bytes());
        out[24..32].copy_from_slice(&self.client_timestamp.0.to_be_bytes());
        out[32..40].copy_from_slice(&self.server_timestamp.0.to_be_bytes());
        out[40..44].copy_from_slice(&self.pragma_size.to_be_bytes());
        out[44..48].copy_from_slice(&self.entity_size.to_be_bytes());
        let crc = crc32(&out[..48]);
        out[48..52].copy_from_slice(&crc.to_be_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        fn u16_at(bytes: &[u8], at: usize) -> u16 {
            u16::from_be_bytes(bytes[at..at + 2].try_into().expect("sized"))
        }
        fn u32_at(bytes: &[u8], at: usize) -> u32 {
            u32::from_be_bytes(bytes[at..at + 4].try_into().expect("sized"))
        }
        fn u64_at(bytes: &[u8], at: usize) -> u64 {
            u64::from_be_bytes(bytes[at..at + 8].try_into().expect("sized"))
        }

        if u32_at(bytes, 0) != FRAME_MAGIC {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        if u16_at(bytes, 4) != FRAME_VERSION {
            return Err(Error::new(ErrorKind::Unsupported));
        }
        if u32_at(bytes, 48) != crc32(&bytes[..48]) {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }

        let header = Self {
            message_type: u16_at(bytes, 6),
            flags: FrameFlags::from_bits_truncate(u16_at(bytes, 8)),
            serialization: u16_at(bytes, 10),
            compression: u16_at(bytes, 12),
            transaction: u64_at(bytes, 16),
            client_timestamp: Nanos(u64_at(bytes, 24)),
            server_timestamp: Nanos(u64_at(bytes, 32)),
            pragma_size: u32_at(bytes, 40),
            entity_size: u32_at(bytes, 44),
        };
        if header.pragma_size as usize > MAX_PRAGMA_SIZE
            || header.entity_size as usize > MAX_ENTITY_SIZE
        {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }
        Ok(header)
    }
}

/// One framed message: header plus optional sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: u16,
    pub serialization: u16,
    pub compression: u16,
    pub transaction: u64,
    pub client_timestamp: Nanos,
    pub server_timestamp: Nanos,
    pub pragma: Option<Vec<u8>>,
    pub entity: Option<Vec<u8>>,
}

impl Frame {
    /// Frames the message, running sections through `serialization` and,
    /// when a session is supplied, `compression`.
    pub fn encode(
        &self,
        serialization: &dyn Serialization,
        compression: Option<&dyn Compression>,
    ) -> Result<Vec<u8>> {
        let mut flags = FrameFlags::default();
        let pragma = match &self.pragma {
            Some(pragma) => {
                flags |= FrameFlags::HAS_PRAGMA;
                Some(transform(pragma, serialization, compression, Direction::Out)?)
            }
            None => None,
        };
        let entity = match &self.entity {
            Some(entity) => {
                flags |= FrameFlags::HAS_ENTITY;
                Some(transform(entity, serialization, compression, Direction::Out)?)
            }
            None => None,
        };
        if compression.is_some() {
            flags |= FrameFlags::COMPRESSED;
        }

        let pragma_size = pragma.as_ref().map_or(0, Vec::len);
        let entity_size = entity.as_ref().map_or(0, Vec::len);
        if pragma_size > MAX_PRAGMA_SIZE || entity_size > MAX_ENTITY_SIZE {
            return Err(Error::new(ErrorKind::InvalidArgument));
        }

        let header = FrameHeader {
            message_type: self.message_type,
            flags,
            serialization: self.serialization,
            compression: self.compression,
            transaction: self.transaction,
            client_timestamp: self.client_timestamp,
            server_timestamp: self.server_timestamp,
            pragma_size: pragma_size as u32,
            entity_size: entity_size as u32,
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + pragma_size + entity_size);
        out.extend_from_slice(&header.encode());
        if let Some(pragma) = pragma {
            out.extend_from_slice(&pragma);
        }
        if let Some(entity) = entity {
            out.extend_from_slice(&entity);
        }
        Ok(out)
    }

    /// Parses one frame from `bytes`, returning it with the total bytes
    /// consumed. Oversized sections and bad magic are `InvalidArgument`.
    pub fn decode(
        bytes: &[u8],
        serialization: &dyn Serialization,
        compression: Option<&dyn Compression>,
    ) -> Result<(Self, usize)> {
        let header = FrameHeader::decode(bytes)?;
        let total =
            HEADER_SIZE + header.pragma_size as usize + header.entity_size as usize;
        if bytes.len() < total {
            return Err(Error::new(ErrorKind::WouldBlock));
        }
        if header.flags.contains(FrameFlags::COMPRESSED) && compression.is_none() {
            return Err(Error::new(ErrorKind::Unsupported));
        }

        let mut cursor = HEADER_SIZE;
        let pragma = if header.flags.contains(FrameFlags::HAS_PRAGMA) {
            let raw = &bytes[cursor..cursor + header.pragma_size as usize];
            cursor += header.pragma_size as usize;
            Some(transform(raw, serialization, compression, Direction::In)?)
        } else {
            cursor += header.pragma_size as usize;
            None
        };
        let entity = if header.flags.contains(FrameFlags::HAS_ENTITY) {
            let raw = &bytes[cursor..cursor + header.entity_size as usize];
            Some(transform(raw, serialization, compression, Direction::In)?)
        } else {
            None
        };

        Ok((
            Self {
                message_type: header.message_type,
                serialization: header.serialization,
                compression: header.compression,
                transaction: header.transaction,
                client_timestamp: header.client_timestamp,
                server_timestamp: header.server_timestamp,
                pragma,
                entity,
            },
            total,
        ))
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Out,
    In,
}

fn transform(
    input: &[u8],
    serialization: &dyn Serialization,
    compression: Option<&dyn Compression>,
    direction: Direction,
) -> Result<Vec<u8>> {
    let mut staged = Vec::with_capacity(input.len());
    match direction {
        Direction::Out => {
            serialization.encode(&mut staged, input)?;
            match compression {
                Some(compression) => {
                    let mut compressed = Vec::with_capacity(staged.len());
                    compression.deflate(&mut compressed, &staged)?;
                    Ok(compressed)
                }
                None => Ok(staged),
            }
        }
        Direction::In => {
            let inflated = match compression {
                Some(compression) => {
                    let mut inflated = Vec::with_capacity(input.len());
                    compression.inflate(&mut inflated, input)?;
                    inflated
                }
                None => input.to_vec(),
            };
            serialization.decode(&mut staged, &inflated)?;
            Ok(staged)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::session::Identity;

    use super::*;

    fn sample() -> Frame {
        Frame {
            message_type: 2,
            serialization: 1,
            compression: 0,
            transaction: 0xDEAD_BEEF,
            client_timestamp: Nanos(111),
            server_timestamp: Nanos(222),
            pragma: Some(b"deadline=5s".to_vec()),
            entity: Some(vec![0x42; 1024]),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = sample();
        let bytes = frame.encode(&Identity, None).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 11 + 1024);

        let (decoded, consumed) = Frame::decode(&bytes, &Identity, None).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_with_compression_session() {
        let frame = sample();
        let bytes = frame.encode(&Identity, Some(&Identity)).unwrap();
        let (decoded, _) = Frame::decode(&bytes, &Identity, Some(&Identity)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let frame = sample();
        let mut bytes = frame.encode(&Identity, None).unwrap();
        bytes[0] ^= 0xFF;
        let err = Frame::decode(&bytes, &Identity, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn corrupted_header_fails_the_checksum() {
        let frame = sample();
        let mut bytes = frame.encode(&Identity, None).unwrap();
        bytes[20] ^= 0x01;
        let err = Frame::decode(&bytes, &Identity, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn oversized_sections_are_rejected() {
        let frame = sample();
        let mut bytes = frame.encode(&Identity, None).unwrap();
        // Forge an entity size beyond the 1 GiB cap and re-sign the header.
        bytes[44..48].copy_from_slice(&((MAX_ENTITY_SIZE as u32) + 1).to_be_bytes());
        let crc = crc32(&bytes[..48]);
        bytes[48..52].copy_from_slice(&crc.to_be_bytes());

        let err = Frame::decode(&bytes, &Identity, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn short_input_reports_would_block() {
        let frame = sample();
        let bytes = frame.encode(&Identity, None).unwrap();
        let err = Frame::decode(&bytes[..bytes.len() - 1], &Identity, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }
}
