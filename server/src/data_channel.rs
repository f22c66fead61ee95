//! Reliable, ordered delivery for a single connection
//!
//! The channel owns two independent halves:
//! - Inbound: sequence validation, acknowledgments, out-of-order notices and
//!   reassembly of fragmented messages
//! - Outbound: sequence numbering and a single-flight guard that keeps the
//!   fragments of one message contiguous on the wire
//!
//! Each half sits behind its own lock so an application thread sending to a
//! client never waits on a worker that is reassembling that client's input.
//!
//! Outbound data is sent exactly once. Acknowledgments are observed and
//! logged but nothing is retransmitted when one goes missing.

use log::{debug, warn};
use soe_shared::{
    AckBody, CodecError, FragmentHeader, Message, OpCode, Packet, SequenceHeader,
    FRAGMENT_HEADER_LEN, RELIABLE_HEADER_LEN,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::network::PacketSink;
use crate::utils::lock;

/// Fragments accepted after the first one before a partial ack is due
pub const INITIAL_FRAGMENTS_UNTIL_ACK: u8 = 4;
/// Fragments between subsequent partial acks
pub const FRAGMENTS_PER_ACK: u8 = 5;

/// Acceptance test shared by every reliable receive path.
///
/// Sequence 0 is always accepted, which lets a peer restart its stream at
/// any time. Peers rely on this for wire compatibility.
fn in_sequence(last: u16, sequence: u16) -> bool {
    sequence == last.wrapping_add(1) || sequence == 0
}

#[derive(Debug)]
struct Reassembly {
    fragment_seq: u16,
    total_size: usize,
    buffer: Vec<u8>,
    fragments_until_ack: u8,
}

impl Reassembly {
    /// Copies as much of `data` as still fits the announced size.
    fn append(&mut self, data: &[u8]) -> usize {
        let room = self.total_size - self.buffer.len();
        let taken = data.len().min(room);
        self.buffer.extend_from_slice(&data[..taken]);
        data.len() - taken
    }

    fn is_complete(&self) -> bool {
        self.buffer.len() >= self.total_size
    }
}

/// Remainder of a fragmented message that was refused at its first fragment.
/// Its continuation fragments are swallowed so none of them can be read as
/// the start of a new message.
#[derive(Debug)]
struct Discard {
    fragment_seq: u16,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Inbound {
    last_received_seq: u16,
    reassembly: Option<Reassembly>,
    discard: Option<Discard>,
}

#[derive(Debug, Default)]
struct Outbound {
    next_seq: u16,
    busy: bool,
    pending: VecDeque<Message>,
}

impl Outbound {
    fn next_sequence(&mut self) -> u16 {
        let sequence = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        sequence
    }
}

#[derive(Debug)]
pub struct DataChannel {
    endpoint: SocketAddr,
    max_message_size: usize,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
}

impl DataChannel {
    pub fn new(endpoint: SocketAddr, max_message_size: usize) -> Self {
        Self {
            endpoint,
            max_message_size,
            inbound: Mutex::new(Inbound::default()),
            outbound: Mutex::new(Outbound::default()),
        }
    }

    pub fn last_received_sequence(&self) -> u16 {
        lock(&self.inbound).last_received_seq
    }

    pub fn is_reassembling(&self) -> bool {
        lock(&self.inbound).reassembly.is_some()
    }

    /// Number of fragmented messages waiting behind the one in flight
    pub fn pending_sends(&self) -> usize {
        lock(&self.outbound).pending.len()
    }

    /// Hands out the next outbound sequence number, wrapping 0xFFFF to 0
    pub fn next_sequence_number(&self) -> u16 {
        lock(&self.outbound).next_sequence()
    }

    /// Processes one inbound packet addressed to this channel
    ///
    /// Returns the application messages completed by this packet, in order.
    /// Acknowledgments and out-of-order notices are written to `sink` as a
    /// side effect. Protocol violations are answered or dropped here and are
    /// not errors; an `Err` means the packet body could not be decoded.
    pub fn receive(
        &self,
        packet: &Packet,
        sink: &dyn PacketSink,
    ) -> Result<Vec<Vec<u8>>, CodecError> {
        let mut inbound = lock(&self.inbound);
        let mut delivered = Vec::new();

        match packet.opcode() {
            OpCode::ReliableData => {
                let header: SequenceHeader = packet.reader().read()?;
                if !in_sequence(inbound.last_received_seq, header.sequence) {
                    self.out_of_order(header.sequence, sink)?;
                    return Ok(delivered);
                }
                let data = packet.raw()[RELIABLE_HEADER_LEN..].to_vec();
                self.accept(&mut inbound, header.sequence, data, sink, &mut delivered)?;
            }
            OpCode::FragmentedReliableData => {
                if let Some((sequence, data)) = self.receive_fragment(&mut inbound, packet, sink)? {
                    self.accept(&mut inbound, sequence, data, sink, &mut delivered)?;
                }
            }
            OpCode::AckReliableData => {
                let body: AckBody = packet.reader().read()?;
                debug!("{} acknowledged sequence {}", self.endpoint, body.sequence);
            }
            OpCode::OutOfOrderReliableData => {
                let body: AckBody = packet.reader().read()?;
                debug!(
                    "{} reported sequence {} out of order",
                    self.endpoint, body.sequence
                );
            }
            other => {
                debug!(
                    "Discarding {:?} from {}: not a data packet",
                    other, self.endpoint
                );
            }
        }

        Ok(delivered)
    }

    /// The single exit for data that passed sequencing: acknowledge it,
    /// advance the stream and hand it to the caller.
    fn accept(
        &self,
        inbound: &mut Inbound,
        sequence: u16,
        data: Vec<u8>,
        sink: &dyn PacketSink,
        delivered: &mut Vec<Vec<u8>>,
    ) -> Result<(), CodecError> {
        self.acknowledge(sequence, sink)?;
        inbound.last_received_seq = sequence;
        delivered.push(data);
        Ok(())
    }

    /// Feeds one fragment into the reassembly state. Returns the finished
    /// message and the sequence of its last fragment once complete.
    fn receive_fragment(
        &self,
        inbound: &mut Inbound,
        packet: &Packet,
        sink: &dyn PacketSink,
    ) -> Result<Option<(u16, Vec<u8>)>, CodecError> {
        if let Some(mut discard) = inbound.discard.take() {
            let header: SequenceHeader = packet.reader().read()?;
            if header.sequence == discard.fragment_seq.wrapping_add(1) {
                let payload = packet.raw().len() - RELIABLE_HEADER_LEN;
                discard.fragment_seq = header.sequence;
                discard.remaining = discard.remaining.saturating_sub(payload);
                debug!(
                    "Dropping fragment {} from {}, {} bytes of a refused message left",
                    header.sequence, self.endpoint, discard.remaining
                );
                if discard.remaining > 0 {
                    inbound.discard = Some(discard);
                }
                return Ok(None);
            }
            // Anything else ends the refused message and is handled normally.
        }

        let mut reader = packet.reader();

        let mut reassembly = match inbound.reassembly.take() {
            None => {
                let header: FragmentHeader = reader.read()?;
                if !in_sequence(inbound.last_received_seq, header.sequence) {
                    self.out_of_order(header.sequence, sink)?;
                    return Ok(None);
                }

                let total_size = header.total_size as usize;
                if total_size == 0 || total_size > self.max_message_size {
                    warn!(
                        "Discarding fragmented message of {} bytes from {} (limit {})",
                        total_size, self.endpoint, self.max_message_size
                    );
                    self.out_of_order(header.sequence, sink)?;
                    let payload = packet.raw().len() - FRAGMENT_HEADER_LEN;
                    let remaining = total_size.saturating_sub(payload);
                    if remaining > 0 {
                        inbound.discard = Some(Discard {
                            fragment_seq: header.sequence,
                            remaining,
                        });
                    }
                    return Ok(None);
                }

                let mut reassembly = Reassembly {
                    fragment_seq: header.sequence,
                    total_size,
                    buffer: Vec::with_capacity(total_size),
                    fragments_until_ack: INITIAL_FRAGMENTS_UNTIL_ACK,
                };
                let overflow = reassembly.append(&packet.raw()[FRAGMENT_HEADER_LEN..]);
                self.report_overflow(overflow);
                reassembly
            }
            Some(mut reassembly) => {
                reassembly.fragments_until_ack = reassembly.fragments_until_ack.saturating_sub(1);

                let header: SequenceHeader = match reader.read() {
                    Ok(header) => header,
                    Err(e) => {
                        inbound.reassembly = Some(reassembly);
                        return Err(e);
                    }
                };

                if header.sequence != reassembly.fragment_seq.wrapping_add(1) {
                    // The partial message is abandoned so the peer can resend
                    // it from the first fragment.
                    warn!(
                        "Fragment {} from {} expected {}, abandoning {} of {} bytes",
                        header.sequence,
                        self.endpoint,
                        reassembly.fragment_seq.wrapping_add(1),
                        reassembly.buffer.len(),
                        reassembly.total_size
                    );
                    self.out_of_order(header.sequence, sink)?;
                    return Ok(None);
                }

                reassembly.fragment_seq = header.sequence;
                let overflow = reassembly.append(&packet.raw()[RELIABLE_HEADER_LEN..]);
                self.report_overflow(overflow);
                reassembly
            }
        };

        if reassembly.is_complete() {
            reassembly.fragments_until_ack = 0;
            return Ok(Some((reassembly.fragment_seq, reassembly.buffer)));
        }

        if reassembly.fragments_until_ack == 0 {
            self.acknowledge(reassembly.fragment_seq, sink)?;
            reassembly.fragments_until_ack = FRAGMENTS_PER_ACK;
        }

        inbound.reassembly = Some(reassembly);
        Ok(None)
    }

    fn report_overflow(&self, overflow: usize) {
        if overflow > 0 {
            warn!(
                "Dropped {} bytes from {} past the announced message size",
                overflow, self.endpoint
            );
        }
    }

    fn acknowledge(&self, sequence: u16, sink: &dyn PacketSink) -> Result<(), CodecError> {
        sink.send_packet(self.endpoint, Packet::ack(sequence)?);
        Ok(())
    }

    fn out_of_order(&self, sequence: u16, sink: &dyn PacketSink) -> Result<(), CodecError> {
        debug!("Sequence {} from {} out of order", sequence, self.endpoint);
        sink.send_packet(self.endpoint, Packet::out_of_order(sequence)?);
        Ok(())
    }

    /// Sends a message to the peer
    ///
    /// Plain messages go out immediately as one `RELIABLE_DATA` packet.
    /// Fragmented messages are single-flight per channel: if another caller
    /// is already transmitting one, this message is queued and the call
    /// returns at once; the active caller drains the queue in FIFO order.
    pub fn send(&self, message: Message, sink: &dyn PacketSink) -> Result<(), CodecError> {
        if !message.is_fragmented() {
            let mut outbound = lock(&self.outbound);
            let sequence = outbound.next_sequence();
            sink.send_packet(self.endpoint, Packet::reliable_data(sequence, message.raw())?);
            return Ok(());
        }

        if u32::try_from(message.len()).is_err() {
            return Err(CodecError::MessageTooLarge(message.len()));
        }

        {
            let mut outbound = lock(&self.outbound);
            if outbound.busy {
                debug!(
                    "Queueing fragmented message of {} bytes for {}",
                    message.len(),
                    self.endpoint
                );
                outbound.pending.push_back(message);
                return Ok(());
            }
            outbound.busy = true;
        }

        let mut next = Some(message);
        while let Some(message) = next {
            if let Err(e) = self.send_fragments(&message, sink) {
                warn!(
                    "Failed to send fragmented message to {}: {}",
                    self.endpoint, e
                );
            }

            let mut outbound = lock(&self.outbound);
            next = outbound.pending.pop_front();
            if next.is_none() {
                outbound.busy = false;
            }
        }

        Ok(())
    }

    /// Emits every fragment of one message under the outbound lock, so their
    /// sequence numbers are consecutive and nothing is interleaved.
    fn send_fragments(&self, message: &Message, sink: &dyn PacketSink) -> Result<(), CodecError> {
        let total_size =
            u32::try_from(message.len()).map_err(|_| CodecError::MessageTooLarge(message.len()))?;

        let mut outbound = lock(&self.outbound);
        for (index, fragment) in message.fragments().iter().enumerate() {
            let sequence = outbound.next_sequence();
            let total = if index == 0 { Some(total_size) } else { None };
            sink.send_packet(self.endpoint, Packet::fragment(sequence, total, fragment)?);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::RecordingSink;
    use std::sync::Arc;
    use std::thread;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn channel() -> DataChannel {
        DataChannel::new(test_addr(), 1 << 20)
    }

    fn ack_sequence(packet: &Packet) -> u16 {
        packet.reader().read::<AckBody>().unwrap().sequence
    }

    /// Sends `message` on a fresh channel and returns the packets it produced
    fn fragment_packets(message: Message, first_sequence: u16) -> Vec<Packet> {
        let sender = channel();
        for _ in 0..first_sequence {
            sender.next_sequence_number();
        }
        let sink = RecordingSink::default();
        sender.send(message, &sink).unwrap();
        sink.packets()
    }

    #[test]
    fn test_sequence_numbers_wrap() {
        let channel = channel();

        for expected in 0..=0xFFFFu32 {
            assert_eq!(channel.next_sequence_number() as u32, expected);
        }
        assert_eq!(channel.next_sequence_number(), 0);
        assert_eq!(channel.next_sequence_number(), 1);
    }

    #[test]
    fn test_reliable_data_in_order_is_acked_and_delivered() {
        let channel = channel();
        let sink = RecordingSink::default();

        let delivered = channel
            .receive(&Packet::reliable_data(0, b"hello").unwrap(), &sink)
            .unwrap();
        assert_eq!(delivered, vec![b"hello".to_vec()]);

        let delivered = channel
            .receive(&Packet::reliable_data(1, b"world").unwrap(), &sink)
            .unwrap();
        assert_eq!(delivered, vec![b"world".to_vec()]);

        let sent = sink.packets();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|p| p.opcode() == OpCode::AckReliableData));
        assert_eq!(ack_sequence(&sent[0]), 0);
        assert_eq!(ack_sequence(&sent[1]), 1);
        assert_eq!(channel.last_received_sequence(), 1);
    }

    #[test]
    fn test_reliable_data_out_of_order_is_dropped() {
        let channel = channel();
        let sink = RecordingSink::default();

        let delivered = channel
            .receive(&Packet::reliable_data(5, b"late").unwrap(), &sink)
            .unwrap();

        assert!(delivered.is_empty());
        let sent = sink.packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), OpCode::OutOfOrderReliableData);
        assert_eq!(ack_sequence(&sent[0]), 5);
        assert_eq!(channel.last_received_sequence(), 0);
    }

    #[test]
    fn test_sequence_zero_is_always_accepted() {
        let channel = channel();
        let sink = RecordingSink::default();

        for sequence in 0..4 {
            channel
                .receive(&Packet::reliable_data(sequence, b"x").unwrap(), &sink)
                .unwrap();
        }
        assert_eq!(channel.last_received_sequence(), 3);

        let delivered = channel
            .receive(&Packet::reliable_data(0, b"again").unwrap(), &sink)
            .unwrap();
        assert_eq!(delivered, vec![b"again".to_vec()]);
        assert_eq!(channel.last_received_sequence(), 0);
    }

    #[test]
    fn test_sequence_acceptance_wraps() {
        assert!(in_sequence(0xFFFF, 0));
        assert!(in_sequence(0xFFFE, 0xFFFF));
        assert!(in_sequence(41, 42));
        assert!(!in_sequence(41, 43));
        assert!(!in_sequence(41, 41));
    }

    #[test]
    fn test_truncated_reliable_data_is_an_error() {
        let channel = channel();
        let sink = RecordingSink::default();
        let packet = Packet::from_bytes(vec![0x00, 0x09, 0x01]).unwrap();

        assert!(channel.receive(&packet, &sink).is_err());
        assert!(sink.packets().is_empty());
    }

    #[test]
    fn test_reassembly_round_trip() {
        let fragment_size = 16;
        let sizes = [1, 15, 16, 17, 32, 48, 50, 100];

        for size in sizes {
            let original: Vec<u8> = (0..size).map(|i| (i * 7 % 251) as u8).collect();
            let packets = fragment_packets(
                Message::fragmented(original.clone(), fragment_size),
                0,
            );

            let receiver = channel();
            let sink = RecordingSink::default();
            let mut delivered = Vec::new();
            for packet in &packets {
                delivered.extend(receiver.receive(packet, &sink).unwrap());
            }

            assert_eq!(delivered, vec![original], "size {}", size);
            assert!(!receiver.is_reassembling());
            assert_eq!(
                receiver.last_received_sequence(),
                (packets.len() - 1) as u16,
                "size {}",
                size
            );
        }
    }

    #[test]
    fn test_reassembly_after_plain_data() {
        let receiver = channel();
        let sink = RecordingSink::default();
        receiver
            .receive(&Packet::reliable_data(0, b"first").unwrap(), &sink)
            .unwrap();

        let original = vec![3u8; 40];
        let packets = fragment_packets(Message::fragmented(original.clone(), 16), 1);

        let mut delivered = Vec::new();
        for packet in &packets {
            delivered.extend(receiver.receive(packet, &sink).unwrap());
        }
        assert_eq!(delivered, vec![original]);
        assert_eq!(receiver.last_received_sequence(), 3);
    }

    #[test]
    fn test_out_of_order_fragment() {
        let receiver = channel();
        let sink = RecordingSink::default();
        let packets = fragment_packets(Message::fragmented(vec![1u8; 64], 16), 0);

        // Fragment 0 accepted, fragment 2 arrives while 1 is expected.
        assert!(receiver.receive(&packets[0], &sink).unwrap().is_empty());
        assert!(receiver.receive(&packets[2], &sink).unwrap().is_empty());

        let sent = sink.packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), OpCode::OutOfOrderReliableData);
        assert_eq!(ack_sequence(&sent[0]), 2);
        assert_eq!(receiver.last_received_sequence(), 0);
        assert!(!receiver.is_reassembling());
    }

    #[test]
    fn test_resend_after_abandoned_reassembly() {
        let receiver = channel();
        let sink = RecordingSink::default();
        let original = vec![5u8; 64];
        let packets = fragment_packets(Message::fragmented(original.clone(), 16), 0);

        receiver.receive(&packets[0], &sink).unwrap();
        receiver.receive(&packets[2], &sink).unwrap();

        let mut delivered = Vec::new();
        for packet in &packets {
            delivered.extend(receiver.receive(packet, &sink).unwrap());
        }
        assert_eq!(delivered, vec![original]);
    }

    #[test]
    fn test_first_fragment_out_of_order() {
        let receiver = channel();
        let sink = RecordingSink::default();
        let packets = fragment_packets(Message::fragmented(vec![1u8; 32], 16), 7);

        assert!(receiver.receive(&packets[0], &sink).unwrap().is_empty());
        assert!(!receiver.is_reassembling());
        assert_eq!(sink.packets()[0].opcode(), OpCode::OutOfOrderReliableData);
        assert_eq!(ack_sequence(&sink.packets()[0]), 7);
    }

    #[test]
    fn test_partial_acks_during_long_reassembly() {
        let receiver = channel();
        let sink = RecordingSink::default();
        // 12 fragments: partial acks after fragments 4 and 9, final ack at 11.
        let packets = fragment_packets(Message::fragmented(vec![0u8; 12 * 8], 8), 0);
        assert_eq!(packets.len(), 12);

        for packet in &packets {
            receiver.receive(packet, &sink).unwrap();
        }

        let acked: Vec<u16> = sink.packets().iter().map(ack_sequence).collect();
        assert_eq!(acked, vec![4, 9, 11]);
    }

    #[test]
    fn test_oversized_fragmented_message_is_discarded() {
        let receiver = DataChannel::new(test_addr(), 32);
        let sink = RecordingSink::default();
        let packets = fragment_packets(Message::fragmented(vec![0u8; 64], 16), 0);

        for packet in &packets {
            assert!(receiver.receive(packet, &sink).unwrap().is_empty());
        }
        assert!(!receiver.is_reassembling());
        assert!(lock(&receiver.inbound).discard.is_none());

        let sent = sink.packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), OpCode::OutOfOrderReliableData);
        assert_eq!(ack_sequence(&sent[0]), 0);
        assert_eq!(receiver.last_received_sequence(), 0);
    }

    #[test]
    fn test_fragment_after_refused_message_is_not_a_new_message() {
        let receiver = DataChannel::new(test_addr(), 16);
        let sink = RecordingSink::default();

        let first = Packet::fragment(0, Some(64), &[0u8; 8]).unwrap();
        // Its payload would parse as a first fragment announcing 4 bytes.
        let crafted = Packet::fragment(1, None, &[0, 0, 0, 4, 1, 2, 3, 4]).unwrap();

        assert!(receiver.receive(&first, &sink).unwrap().is_empty());
        assert!(receiver.receive(&crafted, &sink).unwrap().is_empty());

        let sent = sink.packets();
        assert!(sent.iter().all(|p| p.opcode() != OpCode::AckReliableData));
        assert_eq!(sent.len(), 1);
        assert_eq!(ack_sequence(&sent[0]), 0);
        assert!(!receiver.is_reassembling());
        assert_eq!(receiver.last_received_sequence(), 0);
    }

    #[test]
    fn test_valid_message_after_refused_message() {
        let receiver = DataChannel::new(test_addr(), 16);
        let sink = RecordingSink::default();

        receiver
            .receive(&Packet::fragment(0, Some(64), &[0u8; 8]).unwrap(), &sink)
            .unwrap();
        receiver
            .receive(&Packet::fragment(1, None, &[0u8; 8]).unwrap(), &sink)
            .unwrap();

        // A restart at sequence 0 ends the refused message.
        let original = vec![9u8; 12];
        let packets = fragment_packets(Message::fragmented(original.clone(), 8), 0);
        let mut delivered = Vec::new();
        for packet in &packets {
            delivered.extend(receiver.receive(packet, &sink).unwrap());
        }

        assert_eq!(delivered, vec![original]);
        assert!(lock(&receiver.inbound).discard.is_none());
        assert_eq!(receiver.last_received_sequence(), 1);
    }

    #[test]
    fn test_zero_size_fragmented_message_is_discarded() {
        let receiver = channel();
        let sink = RecordingSink::default();

        let first = Packet::fragment(0, Some(0), b"junk").unwrap();
        assert!(receiver.receive(&first, &sink).unwrap().is_empty());

        let sent = sink.packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode(), OpCode::OutOfOrderReliableData);
        assert!(!receiver.is_reassembling());
        assert!(lock(&receiver.inbound).discard.is_none());
    }

    #[test]
    fn test_reassembly_across_sequence_wrap() {
        let receiver = channel();
        let sink = RecordingSink::default();
        lock(&receiver.inbound).last_received_seq = 0xFFFC;

        let original: Vec<u8> = (0..12 * 8).map(|i| (i * 3 % 251) as u8).collect();
        let packets = fragment_packets(Message::fragmented(original.clone(), 8), 0xFFFD);
        assert_eq!(packets.len(), 12);

        let mut delivered = Vec::new();
        for packet in &packets {
            delivered.extend(receiver.receive(packet, &sink).unwrap());
        }

        // Partial acks after fragments 4 and 9, final ack at 11, all past the wrap.
        let acked: Vec<u16> = sink.packets().iter().map(ack_sequence).collect();
        assert_eq!(acked, vec![0x0001, 0x0006, 0x0008]);
        assert!(sink
            .packets()
            .iter()
            .all(|p| p.opcode() == OpCode::AckReliableData));
        assert_eq!(delivered, vec![original]);
        assert_eq!(receiver.last_received_sequence(), 0x0008);
        assert!(!receiver.is_reassembling());
    }

    #[test]
    fn test_fragment_payload_never_exceeds_announced_size() {
        let receiver = channel();
        let sink = RecordingSink::default();
        let first = Packet::fragment(0, Some(4), b"abcdefgh").unwrap();

        let delivered = receiver.receive(&first, &sink).unwrap();
        assert_eq!(delivered, vec![b"abcd".to_vec()]);
    }

    #[test]
    fn test_acks_from_peer_do_not_change_state() {
        let channel = channel();
        let sink = RecordingSink::default();

        assert!(channel
            .receive(&Packet::ack(3).unwrap(), &sink)
            .unwrap()
            .is_empty());
        assert!(channel
            .receive(&Packet::out_of_order(3).unwrap(), &sink)
            .unwrap()
            .is_empty());
        assert!(channel.receive(&Packet::ping(), &sink).unwrap().is_empty());

        assert!(sink.packets().is_empty());
        assert_eq!(channel.last_received_sequence(), 0);
    }

    #[test]
    fn test_plain_send_uses_next_sequence() {
        let channel = channel();
        let sink = RecordingSink::default();

        channel.send(Message::new(b"one".to_vec()), &sink).unwrap();
        channel.send(Message::new(b"two".to_vec()), &sink).unwrap();

        let sent = sink.packets();
        assert_eq!(sent[0].raw(), Packet::reliable_data(0, b"one").unwrap().raw());
        assert_eq!(sent[1].raw(), Packet::reliable_data(1, b"two").unwrap().raw());
    }

    #[test]
    fn test_fragmented_send_layout() {
        let channel = channel();
        let sink = RecordingSink::default();

        channel
            .send(Message::fragmented(b"abcdefghij".to_vec(), 4), &sink)
            .unwrap();

        let sent = sink.packets();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].raw(), Packet::fragment(0, Some(10), b"abcd").unwrap().raw());
        assert_eq!(sent[1].raw(), Packet::fragment(1, None, b"efgh").unwrap().raw());
        assert_eq!(sent[2].raw(), Packet::fragment(2, None, b"ij").unwrap().raw());
    }

    #[test]
    fn test_fragmented_send_queues_while_busy() {
        let channel = channel();
        let sink = RecordingSink::default();

        lock(&channel.outbound).busy = true;
        channel
            .send(Message::fragmented(vec![1u8; 8], 4), &sink)
            .unwrap();
        assert!(sink.packets().is_empty());
        assert_eq!(channel.pending_sends(), 1);

        // The next sender finds the flight slot free and drains the queue.
        lock(&channel.outbound).busy = false;
        channel
            .send(Message::fragmented(vec![2u8; 8], 4), &sink)
            .unwrap();

        let sent = sink.packets();
        assert_eq!(sent.len(), 4);
        assert_eq!(&sent[0].raw()[FRAGMENT_HEADER_LEN..], &[2u8; 4]);
        assert_eq!(&sent[2].raw()[FRAGMENT_HEADER_LEN..], &[1u8; 4]);
        assert_eq!(channel.pending_sends(), 0);
        assert!(!lock(&channel.outbound).busy);
    }

    #[test]
    fn test_concurrent_fragmented_sends_do_not_interleave() {
        let channel = Arc::new(channel());
        let sink = Arc::new(RecordingSink::default());

        let handles: Vec<_> = [0xAAu8, 0xBBu8]
            .into_iter()
            .map(|fill| {
                let channel = Arc::clone(&channel);
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    channel
                        .send(Message::fragmented(vec![fill; 64], 8), sink.as_ref())
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sent = sink.packets();
        assert_eq!(sent.len(), 16);

        let fill_of = |packet: &Packet| *packet.raw().last().unwrap();
        let first_fill = fill_of(&sent[0]);
        assert!(sent[..8].iter().all(|p| fill_of(p) == first_fill));
        assert!(sent[8..].iter().all(|p| fill_of(p) != first_fill));

        // Each message starts with a header carrying its total size.
        assert_eq!(
            sent[0].reader().read::<FragmentHeader>().unwrap().total_size,
            64
        );
        assert_eq!(
            sent[8].reader().read::<FragmentHeader>().unwrap().total_size,
            64
        );
    }
}
