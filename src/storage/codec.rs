//! Payload encoding: length-prefixed strings and fixed-width scalars
//!
//! Strings are stored as a `u16` byte length that includes a trailing NUL,
//! followed by that many bytes. Scalars are little-endian.

use bytes::Buf;

use crate::{FdrError, Result};

/// Longest prefix of `s` within `width` bytes that ends on a char boundary
#[must_use]
pub fn truncate_utf8(s: &str, width: usize) -> &str {
    if s.len() <= width {
        return s;
    }
    let mut end = width;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Encoded size of a string (length prefix + bytes + NUL)
#[must_use]
pub fn encoded_string_len(s: &str) -> usize {
    std::mem::size_of::<u16>() + s.len() + 1
}

macro_rules! push_le {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Push a little-endian `", stringify!($ty), "`")]
            pub fn $name(&mut self, val: $ty) -> bool {
                self.push_buffer(&val.to_le_bytes())
            }
        )*
    };
}

/// Bounds-checked write cursor over a caller-provided buffer
///
/// Every push either writes completely or leaves the cursor untouched and
/// returns `false`, so a producer that runs out of room can retry after a
/// flush.
pub struct LogData<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> LogData<'a> {
    /// Wrap a buffer, starting at its first byte
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far
    #[must_use]
    pub fn used(&self) -> usize {
        self.pos
    }

    /// Bytes still available
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Written part of the buffer
    #[must_use]
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// Unwritten tail, for producers that fill it in place then `skip`
    pub fn current(&mut self) -> &mut [u8] {
        &mut self.buf[self.pos..]
    }

    /// Skip `count` bytes
    pub fn skip(&mut self, count: usize) -> bool {
        if count > self.remaining() {
            return false;
        }
        self.pos += count;
        true
    }

    /// Rewind `count` bytes
    pub fn rewind(&mut self, count: usize) -> bool {
        if count > self.pos {
            return false;
        }
        self.pos -= count;
        true
    }

    /// Push raw bytes
    pub fn push_buffer(&mut self, data: &[u8]) -> bool {
        if data.len() > self.remaining() {
            return false;
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        true
    }

    push_le! {
        push_u8: u8,
        push_u16: u16,
        push_u32: u32,
        push_u64: u64,
        push_i32: i32,
        push_i64: i64,
        push_f64: f64,
    }

    /// Push a string with its length prefix and NUL terminator
    pub fn push_string(&mut self, s: &str) -> bool {
        self.push_raw_string(s.as_bytes(), s.len())
    }

    /// Push a string padded with NULs to exactly `width` bytes (plus the
    /// terminator), truncating longer values. The encoded size only depends
    /// on `width`, so the field can be rewritten in place later.
    pub fn push_string_padded(&mut self, s: &str, width: usize) -> bool {
        self.push_raw_string(truncate_utf8(s, width).as_bytes(), width)
    }

    /// Push an integer formatted as a decimal string
    pub fn push_int_as_string(&mut self, value: i32) -> bool {
        self.push_string(&value.to_string())
    }

    fn push_raw_string(&mut self, bytes: &[u8], width: usize) -> bool {
        let Ok(slen) = u16::try_from(width + 1) else {
            return false;
        };
        if std::mem::size_of::<u16>() + usize::from(slen) > self.remaining() {
            return false;
        }
        let ok = self.push_u16(slen) && self.push_buffer(bytes);
        let pad = usize::from(slen) - bytes.len();
        self.buf[self.pos..self.pos + pad].fill(0);
        self.pos += pad;
        ok
    }
}

/// Fail-closed read cursor over an entry payload
#[derive(Debug, Clone)]
pub struct DataReader<'a> {
    buf: &'a [u8],
}

macro_rules! read_le {
    ($($name:ident: $ty:ty => $get:ident),* $(,)?) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`")]
            ///
            /// # Errors
            ///
            /// Returns error if not enough bytes remain
            pub fn $name(&mut self) -> Result<$ty> {
                self.ensure(std::mem::size_of::<$ty>())?;
                Ok(self.buf.$get())
            }
        )*
    };
}

impl<'a> DataReader<'a> {
    /// Wrap a payload
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left to read
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// True once everything has been consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if needed > self.buf.len() {
            return Err(FdrError::Truncated {
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    read_le! {
        read_u8: u8 => get_u8,
        read_u16: u16 => get_u16_le,
        read_u32: u32 => get_u32_le,
        read_u64: u64 => get_u64_le,
        read_i32: i32 => get_i32_le,
        read_i64: i64 => get_i64_le,
        read_f64: f64 => get_f64_le,
    }

    /// Borrow the next `len` bytes
    ///
    /// # Errors
    ///
    /// Returns error if not enough bytes remain
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a `(sec: u32, nsec: u32)` timestamp as microseconds
    ///
    /// # Errors
    ///
    /// Returns error if not enough bytes remain
    pub fn read_timespec_us(&mut self) -> Result<i64> {
        let sec = self.read_u32()?;
        let nsec = self.read_u32()?;
        Ok(i64::from(sec) * 1_000_000 + i64::from(nsec / 1000))
    }

    /// Read a length-prefixed, NUL-terminated string
    ///
    /// The value stops at the first NUL, so padded fields decode to their
    /// meaningful prefix.
    ///
    /// # Errors
    ///
    /// Returns error on a zero length, a length past the end of the payload
    /// or a missing terminator
    pub fn read_string(&mut self) -> Result<String> {
        let len = usize::from(self.read_u16()?);
        if len == 0 {
            return Err(FdrError::InvalidFormat("string length is 0".to_string()));
        }
        let bytes = self.read_bytes(len)?;
        if bytes[len - 1] != 0 {
            return Err(FdrError::InvalidFormat(
                "string is not nul-terminated".to_string(),
            ));
        }
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(len - 1);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}
