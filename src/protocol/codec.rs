//! Frame codec for the vanilla TCP transport.
//!
//! A frame is a varint-length-prefixed payload (packet id + body). Above a
//! negotiated threshold payloads are zlib compressed, and after login the
//! whole stream may be AES/CFB8 encrypted.

use crate::protocol::{encoder::var_int_size, DecodeError, Decoder, Encoder, BUFFER_LIMIT};
use aes::{cipher::generic_array::GenericArray, Aes128};
use anyhow::bail;
use cfb8::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::Compression;
use std::{
    borrow::Cow,
    io::{Read, Write},
    slice,
};

/// Shared secret used for stream encryption, negotiated during login.
#[derive(Copy, Clone)]
pub struct EncryptionKey([u8; 16]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_secret(secret: &[u8]) -> anyhow::Result<Self> {
        let bytes: [u8; 16] = secret
            .try_into()
            .map_err(|_| anyhow::anyhow!("shared secret must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Decodes frames from an incoming byte stream.
pub struct FrameDecoder {
    /// Buffered incoming bytes, already decrypted.
    read_buffer: Vec<u8>,
    decryptor: Option<cfb8::Decryptor<Aes128>>,
    compression_threshold: Option<i32>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::new(),
            decryptor: None,
            compression_threshold: None,
        }
    }

    pub fn set_compression_threshold(&mut self, threshold: i32) {
        self.compression_threshold = (threshold >= 0).then_some(threshold);
    }

    pub fn enable_encryption(&mut self, key: EncryptionKey) {
        self.decryptor = Some(cfb8::Decryptor::new(&key.0.into(), &key.0.into()));
    }

    /// Gives data to the internal read buffer, decrypting it in place first.
    ///
    /// Call `next_frame` in a loop afterwards until it returns `None`.
    pub fn give_data(&mut self, data: &mut [u8]) {
        if let Some(decryptor) = &mut self.decryptor {
            for byte in data.iter_mut() {
                decryptor.decrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
            }
        }
        self.read_buffer.extend_from_slice(data);
    }

    /// Attempts to decode one frame, returning the decompressed payload
    /// (packet id varint + body).
    ///
    /// * `Ok(None)` if not enough data is buffered yet.
    /// * `Ok(Some(payload))` if a frame was read; more may be available.
    /// * `Err(e)` on a malformed stream, invalidating the connection.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut decoder = Decoder::new(&self.read_buffer);
        let length = match decoder.read_var_int() {
            Ok(x) => x,
            Err(DecodeError::EndOfStream(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let length = usize::try_from(length)?;
        if length > BUFFER_LIMIT {
            bail!("frame length of {length} exceeds maximum allowed");
        }
        let total_bytes = length + var_int_size(length as i32);

        let contents = match decoder.consume_slice(length) {
            Ok(x) => x,
            Err(DecodeError::EndOfStream(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let payload = match self.compression_threshold {
            Some(_) => {
                let mut inner = Decoder::new(contents);
                let data_length = usize::try_from(inner.read_var_int()?)?;
                if data_length == 0 {
                    Cow::Borrowed(inner.buffer())
                } else {
                    if data_length > BUFFER_LIMIT {
                        bail!("decompressed length of {data_length} exceeds maximum allowed");
                    }
                    let mut buf = Vec::with_capacity(data_length);
                    flate2::read::ZlibDecoder::new(inner.buffer())
                        .take(BUFFER_LIMIT as u64)
                        .read_to_end(&mut buf)?;
                    Cow::Owned(buf)
                }
            }
            None => Cow::Borrowed(contents),
        };

        let payload = payload.into_owned();
        self.read_buffer.drain(..total_bytes);
        Ok(Some(payload))
    }
}

/// Encodes payloads (packet id varint + body) into wire frames.
pub struct FrameEncoder {
    encryptor: Option<cfb8::Encryptor<Aes128>>,
    compression_threshold: Option<i32>,
    compression_level: Compression,
}

impl FrameEncoder {
    pub fn new(compression_level: u32) -> Self {
        Self {
            encryptor: None,
            compression_threshold: None,
            compression_level: Compression::new(compression_level),
        }
    }

    pub fn set_compression_threshold(&mut self, threshold: i32) {
        self.compression_threshold = (threshold >= 0).then_some(threshold);
    }

    pub fn enable_encryption(&mut self, key: EncryptionKey) {
        self.encryptor = Some(cfb8::Encryptor::new(&key.0.into(), &key.0.into()));
    }

    /// Frames `payload` and appends the wire bytes to `out`, encrypting them
    /// when encryption is enabled.
    pub fn encode_frame(&mut self, payload: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
        let start = out.len();
        let uncompressed_length = i32::try_from(payload.len())?;

        match self.compression_threshold {
            Some(threshold) => {
                let (data_length, data) = if uncompressed_length >= threshold {
                    let mut encoder =
                        flate2::write::ZlibEncoder::new(Vec::new(), self.compression_level);
                    encoder.write_all(payload)?;
                    (uncompressed_length, Cow::Owned(encoder.finish()?))
                } else {
                    (0, Cow::Borrowed(payload))
                };
                let mut encoder = Encoder::new(out);
                encoder
                    .write_var_int(var_int_size(data_length) as i32 + i32::try_from(data.len())?);
                encoder.write_var_int(data_length);
                encoder.write_slice(&data);
            }
            None => {
                let mut encoder = Encoder::new(out);
                encoder.write_var_int(uncompressed_length);
                encoder.write_slice(payload);
            }
        }

        if let Some(encryptor) = &mut self.encryptor {
            for byte in &mut out[start..] {
                encryptor.encrypt_block_mut(GenericArray::from_mut_slice(slice::from_mut(byte)));
            }
        }
        Ok(())
    }
}
