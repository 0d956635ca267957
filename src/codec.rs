//! Wire codec primitives.
//!
//! All multi-byte integers on the wire are big-endian. Strings are
//! length-prefixed with a `u32` byte count and encoded in the connection's
//! negotiated [`Encoding`] (UTF-8 unless operational modes select otherwise).
//! Guids travel in the GEP layout; see [`crate::guid`] for the .NET variant.

use uuid::Uuid;

use crate::constants::operational_modes;
use crate::error::{PublisherError, Result};
use crate::guid;

/// String encoding negotiated through the operational-modes bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Ascii,
}

impl Encoding {
    /// Derives the encoding from operational-mode bits 0-7 (one-hot).
    pub fn from_operational_modes(modes: u32) -> Self {
        match modes & operational_modes::ENCODING_MASK {
            operational_modes::UTF16_LE => Encoding::Utf16Le,
            operational_modes::UTF16_BE => Encoding::Utf16Be,
            operational_modes::ANSI => Encoding::Ascii,
            _ => Encoding::Utf8,
        }
    }

    /// Encodes a string to raw bytes in this encoding.
    ///
    /// ASCII encoding replaces non-ASCII characters with `?`, matching the
    /// lossy behavior of legacy ANSI peers.
    pub fn encode(&self, value: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => value.as_bytes().to_vec(),
            Encoding::Utf16Le => value
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
            Encoding::Utf16Be => value
                .encode_utf16()
                .flat_map(|unit| unit.to_be_bytes())
                .collect(),
            Encoding::Ascii => value
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    /// Decodes raw bytes in this encoding to a string.
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| PublisherError::ProtocolViolation(format!("invalid UTF-8: {e}"))),
            Encoding::Utf16Le | Encoding::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(PublisherError::ProtocolViolation(
                        "odd byte count for UTF-16 string".to_string(),
                    ));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        if *self == Encoding::Utf16Le {
                            u16::from_le_bytes([pair[0], pair[1]])
                        } else {
                            u16::from_be_bytes([pair[0], pair[1]])
                        }
                    })
                    .collect();
                String::from_utf16(&units)
                    .map_err(|e| PublisherError::ProtocolViolation(format!("invalid UTF-16: {e}")))
            }
            Encoding::Ascii => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

pub fn write_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u64(buffer: &mut Vec<u8>, value: u64) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_i32(buffer: &mut Vec<u8>, value: i32) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_i64(buffer: &mut Vec<u8>, value: i64) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_f32(buffer: &mut Vec<u8>, value: f32) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_f64(buffer: &mut Vec<u8>, value: f64) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn write_guid(buffer: &mut Vec<u8>, value: &Uuid) {
    buffer.extend_from_slice(&guid::to_gep_bytes(value));
}

/// Writes a `u32` byte-count prefix followed by the encoded string bytes.
pub fn write_string(buffer: &mut Vec<u8>, value: &str, encoding: Encoding) {
    let bytes = encoding.encode(value);
    write_u32(buffer, bytes.len() as u32);
    buffer.extend_from_slice(&bytes);
}

/// Sequential big-endian reader over a received buffer.
///
/// Every read checks the remaining length and reports truncation as a
/// [`PublisherError::ProtocolViolation`].
pub struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(PublisherError::ProtocolViolation(format!(
                "buffer truncated: needed {count} bytes, {} remain",
                self.remaining()
            )));
        }
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_guid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(guid::from_gep_bytes(&raw))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.take(count)
    }

    /// Reads a `u32`-prefixed string in the given encoding.
    pub fn read_string(&mut self, encoding: Encoding) -> Result<String> {
        let length = self.read_u32()? as usize;
        let bytes = self.take(length)?;
        encoding.decode(bytes)
    }
}
