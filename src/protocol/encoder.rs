use uuid::Uuid;

/// A raw encoder for a Minecraft bitstream.
#[derive(Debug)]
pub struct Encoder<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder that will append to the provided
    /// byte buffer.
    ///
    /// Any existing contents of `buffer` are left untouched.
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    /// Writes an unsigned byte to the stream.
    pub fn write_u8(&mut self, x: u8) {
        self.buffer.push(x);
    }

    /// Writes a signed byte to the stream.
    pub fn write_i8(&mut self, x: i8) {
        self.write_u8(bytemuck::cast(x));
    }

    /// Writes an unsigned short to the stream.
    pub fn write_u16(&mut self, x: u16) {
        self.buffer.extend(x.to_be_bytes());
    }

    /// Writes a signed short to the stream.
    pub fn write_i16(&mut self, x: i16) {
        self.buffer.extend(x.to_be_bytes());
    }

    /// Writes a signed int to the stream.
    pub fn write_i32(&mut self, x: i32) {
        self.buffer.extend(x.to_be_bytes());
    }

    /// Writes a signed long to the stream.
    pub fn write_i64(&mut self, x: i64) {
        self.buffer.extend(x.to_be_bytes());
    }

    /// Writes a boolean to the stream.
    pub fn write_bool(&mut self, x: bool) {
        self.write_u8(if x { 0x01 } else { 0x00 });
    }

    /// Writes a series of bytes to the stream. Does not write
    /// any sort of length prefix.
    pub fn write_slice(&mut self, slice: &[u8]) {
        self.buffer.extend_from_slice(slice);
    }

    /// Writes a VarInt to the stream. Returns the number of bytes written.
    pub fn write_var_int(&mut self, x: i32) -> usize {
        let mut x: u32 = bytemuck::cast(x);
        let mut bytes_written = 0;
        loop {
            let mut temp = (x & 0b0111_1111) as u8;
            x >>= 7;
            if x != 0 {
                temp |= 0b1000_0000;
            }

            self.buffer.push(temp);
            bytes_written += 1;

            if x == 0 {
                break bytes_written;
            }
        }
    }

    /// Writes a varint-prefixed string to the stream.
    pub fn write_string(&mut self, x: &str) {
        self.write_var_int(x.len().try_into().unwrap_or(i32::MAX));
        self.buffer.extend_from_slice(x.as_bytes());
    }

    /// Writes a UUID as 16 big-endian bytes.
    pub fn write_uuid(&mut self, x: Uuid) {
        self.buffer.extend_from_slice(x.as_bytes());
    }

    /// Writes a varint-prefixed byte array.
    pub fn write_byte_array(&mut self, x: &[u8]) {
        self.write_var_int(x.len().try_into().unwrap_or(i32::MAX));
        self.buffer.extend_from_slice(x);
    }

    /// Writes a short-prefixed byte array (the pre-1.8 framing).
    pub fn write_short_byte_array(&mut self, x: &[u8]) {
        self.write_i16(x.len().try_into().unwrap_or(i16::MAX));
        self.buffer.extend_from_slice(x);
    }

    /// Writes a varint-prefixed list of strings.
    pub fn write_string_list(&mut self, x: &[String]) {
        self.write_var_int(x.len().try_into().unwrap_or(i32::MAX));
        for s in x {
            self.write_string(s);
        }
    }
}

/// Size in bytes of `x` in VarInt encoding.
pub fn var_int_size(x: i32) -> usize {
    Encoder::new(&mut Vec::new()).write_var_int(x)
}
