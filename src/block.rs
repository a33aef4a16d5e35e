//! IEEE-488.2 binary block encoding.
//!
//! A definite-length block is `#`, one digit `n`, `n` digits giving the payload
//! length in bytes, then the payload: `#3400<400 bytes>`. The indefinite form
//! `#0<payload>` runs until the message terminator.
//!
//! Element types use the single-letter codes instruments and VISA libraries
//! share (`b B h H i I q Q f d`).

use crate::error::{DriverError, DriverResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Element type of a binary block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BlockDataType {
    /// Signed 8-bit integer (`b`).
    #[serde(rename = "b")]
    I8,
    /// Unsigned 8-bit integer (`B`).
    #[serde(rename = "B")]
    U8,
    /// Signed 16-bit integer (`h`).
    #[serde(rename = "h")]
    I16,
    /// Unsigned 16-bit integer (`H`).
    #[serde(rename = "H")]
    U16,
    /// Signed 32-bit integer (`i`).
    #[serde(rename = "i")]
    I32,
    /// Unsigned 32-bit integer (`I`).
    #[serde(rename = "I")]
    U32,
    /// Signed 64-bit integer (`q`).
    #[serde(rename = "q")]
    I64,
    /// Unsigned 64-bit integer (`Q`).
    #[serde(rename = "Q")]
    U64,
    /// 32-bit float (`f`), the default.
    #[default]
    #[serde(rename = "f")]
    F32,
    /// 64-bit float (`d`).
    #[serde(rename = "d")]
    F64,
}

impl BlockDataType {
    /// Parses a single-letter type code.
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'b' => Self::I8,
            'B' => Self::U8,
            'h' => Self::I16,
            'H' => Self::U16,
            'i' | 'l' => Self::I32,
            'I' | 'L' => Self::U32,
            'q' => Self::I64,
            'Q' => Self::U64,
            'f' => Self::F32,
            'd' => Self::F64,
            _ => return None,
        })
    }

    /// Single-letter type code, the inverse of [`BlockDataType::from_code`].
    pub fn code(self) -> char {
        match self {
            Self::I8 => 'b',
            Self::U8 => 'B',
            Self::I16 => 'h',
            Self::U16 => 'H',
            Self::I32 => 'i',
            Self::U32 => 'I',
            Self::I64 => 'q',
            Self::U64 => 'Q',
            Self::F32 => 'f',
            Self::F64 => 'd',
        }
    }

    /// Size of one element in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

/// How a binary block payload is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BinaryFormat {
    /// Element type.
    pub datatype: BlockDataType,
    /// Byte order; little-endian unless set.
    #[serde(default)]
    pub big_endian: bool,
}

impl BinaryFormat {
    /// Format for `datatype` elements in the given byte order.
    pub fn new(datatype: BlockDataType, big_endian: bool) -> Self {
        Self {
            datatype,
            big_endian,
        }
    }
}

/// Location of the payload inside a received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Bytes taken by `#`, the digit count and the length digits.
    pub header_len: usize,
    /// Declared payload length; `None` for the indefinite `#0` form.
    pub data_len: Option<usize>,
}

impl BlockHeader {
    /// Number of header digits needed after `#` to decode the header, given
    /// the first two bytes. Used by stream readers to know how much to fetch.
    pub fn digit_count(prefix: &[u8]) -> DriverResult<usize> {
        match prefix {
            [b'#', d, ..] if d.is_ascii_digit() => Ok(usize::from(d - b'0')),
            [b'#', other, ..] => Err(DriverError::Block(format!(
                "invalid length digit {:?}",
                char::from(*other)
            ))),
            [b'#'] | [] => Err(DriverError::Block("truncated header".into())),
            _ => Err(DriverError::Block("block does not start with '#'".into())),
        }
    }
}

/// True when `data` opens with `#` followed by a length digit. Text replies
/// that merely start with `#` do not qualify.
pub fn starts_block(data: &[u8]) -> bool {
    matches!(data, [b'#', d, ..] if d.is_ascii_digit())
}

/// Builds the `#<n><len>` header for a payload of `len` bytes.
pub fn block_header(len: usize) -> String {
    let digits = len.to_string();
    format!("#{}{}", digits.len(), digits)
}

/// Encodes `values` as a definite-length block.
///
/// Returns the full block (header followed by payload) and the header on its
/// own, which callers use for logging instead of the payload.
pub fn encode_block(
    values: &[f64],
    datatype: BlockDataType,
    big_endian: bool,
) -> DriverResult<(Vec<u8>, String)> {
    let payload = if big_endian {
        encode_payload::<BigEndian>(values, datatype)?
    } else {
        encode_payload::<LittleEndian>(values, datatype)?
    };

    let header = block_header(payload.len());
    let mut block = Vec::with_capacity(header.len() + payload.len());
    block.extend_from_slice(header.as_bytes());
    block.extend_from_slice(&payload);
    Ok((block, header))
}

fn encode_payload<E: ByteOrder>(values: &[f64], datatype: BlockDataType) -> DriverResult<Vec<u8>> {
    let mut out = Vec::with_capacity(values.len() * datatype.width());
    for &v in values {
        match datatype {
            BlockDataType::I8 => out.write_i8(v as i8)?,
            BlockDataType::U8 => out.write_u8(v as u8)?,
            BlockDataType::I16 => out.write_i16::<E>(v as i16)?,
            BlockDataType::U16 => out.write_u16::<E>(v as u16)?,
            BlockDataType::I32 => out.write_i32::<E>(v as i32)?,
            BlockDataType::U32 => out.write_u32::<E>(v as u32)?,
            BlockDataType::I64 => out.write_i64::<E>(v as i64)?,
            BlockDataType::U64 => out.write_u64::<E>(v as u64)?,
            BlockDataType::F32 => out.write_f32::<E>(v as f32)?,
            BlockDataType::F64 => out.write_f64::<E>(v)?,
        }
    }
    Ok(out)
}

/// Parses the block header at the start of `data`.
///
/// Leading whitespace, which some instruments emit before the `#`, is not
/// accepted here; callers trim it first.
pub fn parse_header(data: &[u8]) -> DriverResult<BlockHeader> {
    let digits = BlockHeader::digit_count(data)?;
    if digits == 0 {
        return Ok(BlockHeader {
            header_len: 2,
            data_len: None,
        });
    }

    let end = 2 + digits;
    let len_field = data
        .get(2..end)
        .ok_or_else(|| DriverError::Block(format!("expected {digits} length digits")))?;
    let len = std::str::from_utf8(len_field)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| DriverError::Block(format!("invalid length field {len_field:?}")))?;

    Ok(BlockHeader {
        header_len: end,
        data_len: Some(len),
    })
}

/// Returns the payload of the block at the start of `data`.
///
/// For the indefinite form, a single trailing `\n` is not part of the payload.
pub fn block_payload(data: &[u8]) -> DriverResult<&[u8]> {
    let header = parse_header(data)?;
    let body = &data[header.header_len..];
    match header.data_len {
        Some(len) => body.get(..len).ok_or_else(|| {
            DriverError::Block(format!(
                "declared {len} payload bytes, received {}",
                body.len()
            ))
        }),
        None => Ok(body.strip_suffix(b"\n").unwrap_or(body)),
    }
}

/// Decodes the block at the start of `data` into numbers.
pub fn decode_block(data: &[u8], datatype: BlockDataType, big_endian: bool) -> DriverResult<Vec<f64>> {
    let payload = block_payload(data)?;
    if payload.len() % datatype.width() != 0 {
        return Err(DriverError::Block(format!(
            "payload of {} bytes is not a multiple of {}-byte '{}' elements",
            payload.len(),
            datatype.width(),
            datatype.code()
        )));
    }
    if big_endian {
        decode_payload::<BigEndian>(payload, datatype)
    } else {
        decode_payload::<LittleEndian>(payload, datatype)
    }
}

fn decode_payload<E: ByteOrder>(payload: &[u8], datatype: BlockDataType) -> DriverResult<Vec<f64>> {
    let count = payload.len() / datatype.width();
    let mut cursor = Cursor::new(payload);
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match datatype {
            BlockDataType::I8 => f64::from(cursor.read_i8()?),
            BlockDataType::U8 => f64::from(cursor.read_u8()?),
            BlockDataType::I16 => f64::from(cursor.read_i16::<E>()?),
            BlockDataType::U16 => f64::from(cursor.read_u16::<E>()?),
            BlockDataType::I32 => f64::from(cursor.read_i32::<E>()?),
            BlockDataType::U32 => f64::from(cursor.read_u32::<E>()?),
            BlockDataType::I64 => cursor.read_i64::<E>()? as f64,
            BlockDataType::U64 => cursor.read_u64::<E>()? as f64,
            BlockDataType::F32 => f64::from(cursor.read_f32::<E>()?),
            BlockDataType::F64 => cursor.read_f64::<E>()?,
        };
        values.push(v);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_format() {
        assert_eq!(block_header(400), "#3400");
        assert_eq!(block_header(8), "#18");
        assert_eq!(block_header(0), "#10");
    }

    #[test]
    fn test_encode_recovers_count_and_type() {
        let values = [0.5, -1.25, 3.0];
        let (block, header) = encode_block(&values, BlockDataType::F32, false).unwrap();
        assert_eq!(header, "#212");
        assert!(block.starts_with(b"#212"));

        let parsed = parse_header(&block).unwrap();
        let len = parsed.data_len.unwrap();
        assert_eq!(len / BlockDataType::F32.width(), values.len());
        assert_eq!(BlockDataType::from_code(BlockDataType::F32.code()), Some(BlockDataType::F32));

        let decoded = decode_block(&block, BlockDataType::F32, false).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_big_endian_i16_layout() {
        let (block, _) = encode_block(&[1.0, -2.0], BlockDataType::I16, true).unwrap();
        assert_eq!(&block[3..], &[0x00, 0x01, 0xff, 0xfe]);
    }

    #[test]
    fn test_indefinite_block() {
        let data = b"#0\x01\x02\x03\n";
        assert_eq!(block_payload(data).unwrap(), &[1, 2, 3]);
        let values = decode_block(data, BlockDataType::U8, false).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let err = decode_block(b"#15\x01\x02", BlockDataType::U8, false).unwrap_err();
        assert!(matches!(err, DriverError::Block(_)));
    }

    #[test]
    fn test_misaligned_payload_is_error() {
        let err = decode_block(b"#13\x00\x00\x00", BlockDataType::I16, false).unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_block_start_needs_length_digit() {
        assert!(starts_block(b"#3400"));
        assert!(starts_block(b"#0\x01"));
        assert!(!starts_block(b"#hashtag"));
        assert!(!starts_block(b"#"));
        assert!(!starts_block(b"1.0"));
    }

    #[test]
    fn test_missing_hash_is_error() {
        assert!(parse_header(b"1,2,3").is_err());
        assert!(parse_header(b"#x12").is_err());
    }
}
