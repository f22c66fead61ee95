//! Binary field encoding for SOE packets.
//!
//! Every packet starts with a big-endian opcode. Fixed-layout bodies are
//! serde structs encoded by bincode configured for big-endian, fixed-width
//! integers, so a `u16` is always two bytes and a `bool` is one.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::packet::{OpCode, Packet};

/// Size of the opcode that prefixes every packet.
pub const OPCODE_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("malformed packet body: {0}")]
    Body(#[from] bincode::Error),
    #[error("message of {0} bytes does not fit a u32 length field")]
    MessageTooLarge(usize),
    #[error("string field is not null-terminated")]
    UnterminatedString,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Builds a packet field by field.
#[derive(Debug)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new(opcode: OpCode) -> Self {
        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(&u16::from(opcode).to_be_bytes());
        Self { buffer }
    }

    /// Appends a fixed-layout body.
    pub fn write<T: Serialize>(&mut self, body: &T) -> Result<&mut Self, CodecError> {
        wire_options().serialize_into(&mut self.buffer, body)?;
        Ok(self)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn write_cstring(&mut self, value: &str) -> &mut Self {
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(0);
        self
    }

    pub fn finish(self) -> Packet {
        Packet::from_raw_unchecked(self.buffer)
    }
}

/// Reads fields from a packet, starting right after the opcode.
#[derive(Debug)]
pub struct PacketReader<'a> {
    rest: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(packet: &'a Packet) -> Self {
        Self {
            rest: packet.payload(),
        }
    }

    /// Decodes a fixed-layout body and advances past it.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T, CodecError> {
        Ok(wire_options().deserialize_from(&mut self.rest)?)
    }

    pub fn read_cstring(&mut self) -> Result<String, CodecError> {
        let end = self
            .rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(CodecError::UnterminatedString)?;
        let value = String::from_utf8_lossy(&self.rest[..end]).into_owned();
        self.rest = &self.rest[end + 1..];
        Ok(value)
    }

    /// Everything not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }
}
