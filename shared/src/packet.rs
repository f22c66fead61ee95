use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, PacketReader, PacketWriter, OPCODE_LEN};
use crate::disconnect::DisconnectReason;

/// Transport-level opcodes understood by the server core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    SessionRequest,
    SessionResponse,
    MultiPacket,
    Disconnect,
    Ping,
    NetStatusRequest,
    NetStatusResponse,
    ReliableData,
    FragmentedReliableData,
    OutOfOrderReliableData,
    AckReliableData,
    Unknown(u16),
}

impl From<u16> for OpCode {
    fn from(value: u16) -> Self {
        match value {
            0x01 => OpCode::SessionRequest,
            0x02 => OpCode::SessionResponse,
            0x03 => OpCode::MultiPacket,
            0x05 => OpCode::Disconnect,
            0x06 => OpCode::Ping,
            0x07 => OpCode::NetStatusRequest,
            0x08 => OpCode::NetStatusResponse,
            0x09 => OpCode::ReliableData,
            0x0D => OpCode::FragmentedReliableData,
            0x11 => OpCode::OutOfOrderReliableData,
            0x15 => OpCode::AckReliableData,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for u16 {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::SessionRequest => 0x01,
            OpCode::SessionResponse => 0x02,
            OpCode::MultiPacket => 0x03,
            OpCode::Disconnect => 0x05,
            OpCode::Ping => 0x06,
            OpCode::NetStatusRequest => 0x07,
            OpCode::NetStatusResponse => 0x08,
            OpCode::ReliableData => 0x09,
            OpCode::FragmentedReliableData => 0x0D,
            OpCode::OutOfOrderReliableData => 0x11,
            OpCode::AckReliableData => 0x15,
            OpCode::Unknown(other) => other,
        }
    }
}

/// Body of `ACK_RELIABLE_DATA` and `OUT_OF_ORDER_RELIABLE_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub compressed: bool,
    pub sequence: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectBody {
    pub session_id: u32,
    pub reason: u16,
}

/// Leading field of `RELIABLE_DATA` and of every fragment after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceHeader {
    pub sequence: u16,
}

/// Leading fields of the first fragment of a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub sequence: u16,
    pub total_size: u32,
}

/// Fixed part of `SESSION_REQUEST`; the protocol name follows as a C string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequestBody {
    pub crc_length: u32,
    pub session_id: u32,
    pub udp_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponseBody {
    pub session_id: u32,
    pub crc_seed: u32,
    pub crc_length: u8,
    pub compressed: bool,
    pub encrypted: bool,
    pub udp_length: u32,
}

/// A single datagram: big-endian opcode followed by its payload.
///
/// `raw` always holds the full datagram including the opcode, so header
/// offsets (4 for reliable data, 8 for a first fragment) count from the
/// start of the wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    raw: Vec<u8>,
}

impl Packet {
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, CodecError> {
        if raw.len() < OPCODE_LEN {
            return Err(CodecError::TooShort(raw.len()));
        }
        Ok(Self { raw })
    }

    pub(crate) fn from_raw_unchecked(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::from(u16::from_be_bytes([self.raw[0], self.raw[1]]))
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Bytes after the opcode.
    pub fn payload(&self) -> &[u8] {
        &self.raw[OPCODE_LEN..]
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == OPCODE_LEN
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self)
    }

    pub fn reliable_data(sequence: u16, data: &[u8]) -> Result<Self, CodecError> {
        let mut writer = PacketWriter::new(OpCode::ReliableData);
        writer.write(&SequenceHeader { sequence })?.write_bytes(data);
        Ok(writer.finish())
    }

    /// A fragment of a larger message. Only the first fragment carries the
    /// total message length.
    pub fn fragment(
        sequence: u16,
        total_size: Option<u32>,
        data: &[u8],
    ) -> Result<Self, CodecError> {
        let mut writer = PacketWriter::new(OpCode::FragmentedReliableData);
        match total_size {
            Some(total_size) => writer.write(&FragmentHeader {
                sequence,
                total_size,
            })?,
            None => writer.write(&SequenceHeader { sequence })?,
        };
        writer.write_bytes(data);
        Ok(writer.finish())
    }

    pub fn ack(sequence: u16) -> Result<Self, CodecError> {
        Self::ack_shaped(OpCode::AckReliableData, sequence)
    }

    pub fn out_of_order(sequence: u16) -> Result<Self, CodecError> {
        Self::ack_shaped(OpCode::OutOfOrderReliableData, sequence)
    }

    fn ack_shaped(opcode: OpCode, sequence: u16) -> Result<Self, CodecError> {
        let mut writer = PacketWriter::new(opcode);
        writer.write(&AckBody {
            compressed: false,
            sequence,
        })?;
        Ok(writer.finish())
    }

    pub fn disconnect(session_id: u32, reason: DisconnectReason) -> Result<Self, CodecError> {
        let mut writer = PacketWriter::new(OpCode::Disconnect);
        writer.write(&DisconnectBody {
            session_id,
            reason: reason.into(),
        })?;
        Ok(writer.finish())
    }

    pub fn ping() -> Self {
        PacketWriter::new(OpCode::Ping).finish()
    }

    pub fn session_request(
        body: SessionRequestBody,
        protocol_name: &str,
    ) -> Result<Self, CodecError> {
        let mut writer = PacketWriter::new(OpCode::SessionRequest);
        writer.write(&body)?.write_cstring(protocol_name);
        Ok(writer.finish())
    }

    pub fn session_response(body: SessionResponseBody) -> Result<Self, CodecError> {
        let mut writer = PacketWriter::new(OpCode::SessionResponse);
        writer.write(&body)?;
        Ok(writer.finish())
    }
}
