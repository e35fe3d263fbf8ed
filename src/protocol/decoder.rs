use std::{num::TryFromIntError, str::Utf8Error};
use uuid::Uuid;

/// An error while decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} more bytes")]
    EndOfStream(usize),
    #[error("invalid boolean pattern {0} - expected either 0 or 1")]
    InvalidBool(u8),
    #[error("varint / varlong is too long")]
    VarIntTooLong,
    #[error("string exceeds max allowed length")]
    StringTooLong,
    #[error("unknown NBT tag type {0}")]
    UnknownNbtTag(u8),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    IntConversion(#[from] TryFromIntError),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

const MAX_STRING_LENGTH: usize = i16::MAX as usize;

/// A raw decoder for a Minecraft bitstream.
#[derive(Debug)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    /// Creates a decoder from the buffer it will read from.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Gets the remaining buffer.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Returns if there is no data left in the buffer.
    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes `n` bytes from the buffer, returning them as a slice.
    pub fn consume_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n <= self.buffer.len() {
            let (data, buffer) = self.buffer.split_at(n);
            self.buffer = buffer;
            Ok(data)
        } else {
            Err(DecodeError::EndOfStream(n - self.buffer.len()))
        }
    }

    /// Consumes `N` bytes into an array.
    pub fn consume<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.consume_slice(N)?;
        Ok(<[u8; N]>::try_from(data).unwrap())
    }

    /// Reads an unsigned byte from the stream.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.consume::<1>().map(|[x]| x)
    }

    /// Reads a signed byte from the stream.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.consume().map(i8::from_be_bytes)
    }

    /// Reads an unsigned short from the stream.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.consume().map(u16::from_be_bytes)
    }

    /// Reads a signed short from the stream.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.consume().map(i16::from_be_bytes)
    }

    /// Reads a signed int from the stream.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.consume().map(i32::from_be_bytes)
    }

    /// Reads a signed long from the stream.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.consume().map(i64::from_be_bytes)
    }

    /// Reads a boolean from the stream.
    pub fn read_bool(&mut self) -> Result<bool> {
        let x = self.read_u8()?;
        match x {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidBool(x)),
        }
    }

    /// Reads a VarInt from the stream.
    pub fn read_var_int(&mut self) -> Result<i32> {
        let mut num_read = 0;
        let mut result = 0;

        loop {
            let read = self.read_u8()?;
            let value = i32::from(read & 0b0111_1111);
            result |= value.overflowing_shl(7 * num_read).0;

            num_read += 1;

            if num_read > 5 {
                return Err(DecodeError::VarIntTooLong);
            }
            if read & 0b1000_0000 == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// Reads a varint-prefixed string from the stream.
    pub fn read_string(&mut self) -> Result<&'a str> {
        let length = usize::try_from(self.read_var_int()?)?;

        if length > MAX_STRING_LENGTH {
            return Err(DecodeError::StringTooLong);
        }

        let bytes = std::str::from_utf8(self.consume_slice(length)?)?;
        Ok(bytes)
    }

    /// Reads a UUID as 16 big-endian bytes.
    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes = self.consume::<16>()?;
        Ok(Uuid::from_bytes(bytes))
    }

    /// Reads a varint-prefixed byte array.
    pub fn read_byte_array(&mut self) -> Result<&'a [u8]> {
        let length = usize::try_from(self.read_var_int()?)?;
        self.consume_slice(length)
    }

    /// Reads a short-prefixed byte array (the pre-1.8 framing).
    pub fn read_short_byte_array(&mut self) -> Result<&'a [u8]> {
        let length = usize::try_from(self.read_i16()?)?;
        self.consume_slice(length)
    }

    /// Reads a varint-prefixed list of strings.
    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let count = usize::try_from(self.read_var_int()?)?;
        let mut out = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            out.push(self.read_string()?.to_owned());
        }
        Ok(out)
    }

    /// Structurally skips one root NBT compound and returns the raw bytes
    /// that make it up, so they can be re-emitted verbatim. The proxy never
    /// interprets dimension registry data, it only carries it.
    pub fn read_raw_nbt(&mut self) -> Result<&'a [u8]> {
        let start = self.buffer;
        let tag = self.read_u8()?;
        if tag != 0 {
            // Root tag name.
            let name_len = usize::from(self.read_u16()?);
            self.consume_slice(name_len)?;
            self.skip_nbt_payload(tag)?;
        }
        let consumed = start.len() - self.buffer.len();
        Ok(&start[..consumed])
    }

    fn skip_nbt_payload(&mut self, tag: u8) -> Result<()> {
        match tag {
            1 => {
                self.consume_slice(1)?;
            }
            2 => {
                self.consume_slice(2)?;
            }
            3 | 5 => {
                self.consume_slice(4)?;
            }
            4 | 6 => {
                self.consume_slice(8)?;
            }
            7 => {
                let len = usize::try_from(self.read_i32()?)?;
                self.consume_slice(len)?;
            }
            8 => {
                let len = usize::from(self.read_u16()?);
                self.consume_slice(len)?;
            }
            9 => {
                let elem = self.read_u8()?;
                let len = usize::try_from(self.read_i32()?.max(0))?;
                for _ in 0..len {
                    self.skip_nbt_payload(elem)?;
                }
            }
            10 => loop {
                let child = self.read_u8()?;
                if child == 0 {
                    break;
                }
                let name_len = usize::from(self.read_u16()?);
                self.consume_slice(name_len)?;
                self.skip_nbt_payload(child)?;
            },
            11 => {
                let len = usize::try_from(self.read_i32()?)?;
                self.consume_slice(len * 4)?;
            }
            12 => {
                let len = usize::try_from(self.read_i32()?)?;
                self.consume_slice(len * 8)?;
            }
            other => return Err(DecodeError::UnknownNbtTag(other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encoder::Encoder;

    #[test]
    fn var_int_roundtrip() {
        for value in [0, 1, 127, 128, 300, -1, i32::MAX, i32::MIN] {
            let mut buf = Vec::new();
            Encoder::new(&mut buf).write_var_int(value);
            assert_eq!(Decoder::new(&buf).read_var_int().unwrap(), value);
        }
    }

    #[test]
    fn string_too_long_rejected() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).write_var_int(i16::MAX as i32 + 1);
        buf.extend(std::iter::repeat(b'a').take(64));
        assert!(matches!(
            Decoder::new(&buf).read_string(),
            Err(DecodeError::StringTooLong)
        ));
    }

    #[test]
    fn end_of_stream_reports_missing_bytes() {
        let mut dec = Decoder::new(&[1, 2]);
        assert!(matches!(
            dec.read_i64(),
            Err(DecodeError::EndOfStream(6))
        ));
    }

    #[test]
    fn raw_nbt_skips_nested_compound() {
        // {"": {list: [1s, 2s], name: "x"}} encoded by hand.
        let mut nbt = vec![10, 0, 0];
        nbt.extend([9, 0, 4]);
        nbt.extend(b"list");
        nbt.extend([2, 0, 0, 0, 2, 0, 1, 0, 2]);
        nbt.extend([8, 0, 4]);
        nbt.extend(b"name");
        nbt.extend([0, 1]);
        nbt.push(b'x');
        nbt.push(0);

        let mut with_trailer = nbt.clone();
        with_trailer.extend([0xAA, 0xBB]);

        let mut dec = Decoder::new(&with_trailer);
        let raw = dec.read_raw_nbt().unwrap();
        assert_eq!(raw, &nbt[..]);
        assert_eq!(dec.buffer(), &[0xAA, 0xBB]);
    }
}
