//! Primitive wire types used by the game protocol.
//!
//! Everything is big-endian. Varints and varlongs are LEB128-style: 7 data
//! bits per byte with the continuation bit in the high bit, at most 5 and 10
//! bytes respectively. Negative values wrap through the unsigned
//! representation of their width.

use std::string::FromUtf8Error;

use thiserror::Error;
use uuid::Uuid;

pub const MAX_VARINT_BYTES: usize = 5;
pub const MAX_VARLONG_BYTES: usize = 10;

#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended before the declared width of a field.
    #[error("data ended with {missing} bytes remaining")]
    Eof { missing: usize },
    #[error("varint is longer than {MAX_VARINT_BYTES} bytes")]
    VarintTooLarge,
    #[error("varlong is longer than {MAX_VARLONG_BYTES} bytes")]
    VarlongTooLarge,
    #[error("length prefix is negative: {0}")]
    NegativeLength(i32),
    #[error("string is not valid utf-8")]
    InvalidUtf8(#[from] FromUtf8Error),
}

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut remaining = value as u32;
    loop {
        if remaining & !0x7F == 0 {
            buf.push(remaining as u8);
            return;
        }
        buf.push((remaining as u8 & 0x7F) | 0x80);
        remaining >>= 7;
    }
}

pub fn write_varlong(buf: &mut Vec<u8>, value: i64) {
    let mut remaining = value as u64;
    loop {
        if remaining & !0x7F == 0 {
            buf.push(remaining as u8);
            return;
        }
        buf.push((remaining as u8 & 0x7F) | 0x80);
        remaining >>= 7;
    }
}

pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

pub fn write_ushort(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_short(buf: &mut Vec<u8>, value: i16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_ulong(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_long(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Writes the 128-bit uuid as two big-endian 64-bit halves.
pub fn write_uuid(buf: &mut Vec<u8>, value: Uuid) {
    buf.extend_from_slice(&value.as_u128().to_be_bytes());
}

pub fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(value as u8);
}

pub fn write_byte_array(buf: &mut Vec<u8>, value: &[u8]) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value);
}

/// A cursor over a received packet body. Every read consumes exactly the
/// declared width of the field and fails with [`CodecError::Eof`] naming the
/// missing byte count when the body is shorter than that.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Eof {
                missing: len - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Reads everything left in the body.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn read_byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(CodecError::VarintTooLarge)
    }

    pub fn read_varlong(&mut self) -> Result<i64, CodecError> {
        let mut result: u64 = 0;
        for i in 0..MAX_VARLONG_BYTES {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i64);
            }
        }
        Err(CodecError::VarlongTooLarge)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        let bytes = self.read_bytes(len as usize)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_ushort(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_short(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_ulong(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_long(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, CodecError> {
        let bytes: [u8; 16] = self.read_bytes(16)?.try_into().unwrap();
        Ok(Uuid::from_u128(u128::from_be_bytes(bytes)))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_byte_array(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(CodecError::NegativeLength(len));
        }
        self.read_bytes(len as usize)
    }
}
