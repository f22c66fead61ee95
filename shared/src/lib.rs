pub mod codec;
pub mod disconnect;
pub mod message;
pub mod packet;

pub use codec::{CodecError, PacketReader, PacketWriter, OPCODE_LEN};
pub use disconnect::DisconnectReason;
pub use message::Message;
pub use packet::{
    AckBody, DisconnectBody, FragmentHeader, OpCode, Packet, SequenceHeader, SessionRequestBody,
    SessionResponseBody,
};

pub const DEFAULT_PORT: u16 = 20260;
pub const DEFAULT_UDP_LENGTH: u32 = 512;
pub const DEFAULT_PROTOCOL_NAME: &str = "CGAPI_257";

/// Opcode plus sequence number.
pub const RELIABLE_HEADER_LEN: usize = 4;
/// Opcode, sequence number and total message length.
pub const FRAGMENT_HEADER_LEN: usize = 8;
