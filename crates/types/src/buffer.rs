//! Byte-level serialisation used by every persistent structure.
//!
//! Conventions: little-endian fixed-width scalars, strings length-prefixed
//! with `u32`, lists length-prefixed with `u64`, all multi-byte integers
//! unaligned, no padding.

use thiserror::Error;

/// Error returned when decoding serialised bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("invalid tag byte: {0}")]
    InvalidTag(u8),
    #[error("length prefix {0} exceeds remaining buffer")]
    BadLength(u64),
    #[error("string is not valid utf-8")]
    Utf8,
}

/// Append-only little-endian byte writer.
#[derive(Default)]
pub struct Serializer {
    buf: Vec<u8>,
}

macro_rules! write_scalar {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, v: $ty) {
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    };
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    write_scalar!(write_u8, u8);
    write_scalar!(write_u16, u16);
    write_scalar!(write_u32, u32);
    write_scalar!(write_u64, u64);
    write_scalar!(write_u128, u128);
    write_scalar!(write_i8, i8);
    write_scalar!(write_i16, i16);
    write_scalar!(write_i32, i32);
    write_scalar!(write_i64, i64);
    write_scalar!(write_i128, i128);
    write_scalar!(write_f32, f32);
    write_scalar!(write_f64, f64);

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A `u32` length prefix followed by the raw bytes.
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// The `u64` length prefix of a list.
    pub fn write_list_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }
}

/// Cursor over serialised bytes.
pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_scalar {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty, DecodeError> {
            const N: usize = size_of::<$ty>();
            let bytes = self.take(N)?;
            Ok(<$ty>::from_le_bytes(bytes.try_into().unwrap()))
        }
    };
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    read_scalar!(read_u8, u8);
    read_scalar!(read_u16, u16);
    read_scalar!(read_u32, u32);
    read_scalar!(read_u64, u64);
    read_scalar!(read_u128, u128);
    read_scalar!(read_i8, i8);
    read_scalar!(read_i16, i16);
    read_scalar!(read_i32, i32);
    read_scalar!(read_i64, i64);
    read_scalar!(read_i128, i128);
    read_scalar!(read_f32, f32);
    read_scalar!(read_f64, f64);

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }

    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Utf8)
    }

    pub fn read_list_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(DecodeError::BadLength(len));
        }
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_roundtrip() {
        let mut ser = Serializer::new();
        ser.write_u8(0xab);
        ser.write_u64(u64::MAX - 1);
        ser.write_i128(-42);
        ser.write_f64(1.5);
        ser.write_bool(true);
        ser.write_string("quiver");
        ser.write_list_len(3);

        let bytes = ser.into_bytes();
        let mut de = Deserializer::new(&bytes);
        assert_eq!(de.read_u8().unwrap(), 0xab);
        assert_eq!(de.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(de.read_i128().unwrap(), -42);
        assert_eq!(de.read_f64().unwrap(), 1.5);
        assert!(de.read_bool().unwrap());
        assert_eq!(de.read_string().unwrap(), "quiver");
        assert_eq!(de.read_list_len().unwrap(), 3);
        assert!(de.is_empty());
    }

    #[test]
    fn eof_is_reported() {
        let mut de = Deserializer::new(&[1, 2]);
        assert_eq!(
            de.read_u32(),
            Err(DecodeError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn little_endian_layout() {
        let mut ser = Serializer::new();
        ser.write_u32(0x0403_0201);
        assert_eq!(ser.bytes(), &[1, 2, 3, 4]);
    }
}
