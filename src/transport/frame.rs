//! Datagram encoding and decoding for the EMI transport.
//!
//! A datagram is a packet header followed by zero or more messages:
//!
//! ```text
//! Packet header (9 bytes):
//! +--------+-------------------+-------------------+
//! | Flags  | Timestamp         | Timestamp echo    |
//! | 1 byte | 4 bytes (LE32)    | 4 bytes (LE32)    |
//! +--------+-------------------+-------------------+
//!
//! Message (4-8 byte header + payload):
//! +--------+---------+----------+---------+---------+-----------+
//! | Flags  | Channel | Length   | [Seq]   | [Ack]   | Payload   |
//! | 1 byte | 1 byte  | LE16     | LE16    | LE16    | Length B  |
//! +--------+---------+----------+---------+---------+-----------+
//! ```
//!
//! `Seq` is present iff `Length > 0` or SYN or RST is set. `Ack` is present iff
//! ACK is set and the message is not SYN|RST. A datagram whose first byte has
//! the rendezvous bit set is a mediator message instead and is parsed by
//! [`crate::p2p`].

use thiserror::Error;

use crate::core::{
    MESSAGE_FLAG_ACK, MESSAGE_FLAG_PRX, MESSAGE_FLAG_RST, MESSAGE_FLAG_SACK, MESSAGE_FLAG_SYN,
    PACKET_FLAG_HEARTBEAT, PACKET_FLAG_RENDEZVOUS, qualifier,
};

/// Size constants of the wire format.
pub mod sizes {
    /// Packet header size (flags + timestamp + echo).
    pub const PACKET_HEADER_SIZE: usize = 1 + 4 + 4;
    /// Fixed part of a message header (flags + channel + length).
    pub const MESSAGE_HEADER_SIZE: usize = 1 + 1 + 2;
    /// Sequence number field size.
    pub const SEQ_SIZE: usize = 2;
    /// Acknowledgement field size.
    pub const ACK_SIZE: usize = 2;
    /// Largest message header.
    pub const MAX_MESSAGE_HEADER_SIZE: usize = MESSAGE_HEADER_SIZE + SEQ_SIZE + ACK_SIZE;
    /// Handshake tag carried by authenticated (PRX) handshakes.
    pub const HANDSHAKE_TAG_SIZE: usize = 32;
}

/// Frame parsing errors. All of them result in the datagram being dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes.
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum size required.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Packet flags carry unknown bits.
    #[error("invalid packet flags: {0:#04x}")]
    InvalidPacketFlags(u8),

    /// Message flags carry an unsupported combination.
    #[error("invalid message flags: {0:#04x}")]
    InvalidMessageFlags(u8),

    /// Data message on a qualifier with the reserved bit set.
    #[error("invalid channel qualifier: {0:#04x}")]
    InvalidChannel(u8),

    /// Message payload does not match its kind.
    #[error("unexpected payload length {0}")]
    UnexpectedPayload(usize),

    /// Unknown rendezvous message type.
    #[error("invalid rendezvous message type: {0:#04x}")]
    InvalidRendezvousType(u8),

    /// Unknown address family in a rendezvous message.
    #[error("invalid address family: {0}")]
    InvalidAddressFamily(u8),
}

impl FrameError {
    /// Malformed datagrams are never answered.
    pub fn is_silent_drop(&self) -> bool {
        true
    }
}

/// Whether a datagram is addressed to the rendezvous layer.
pub fn is_rendezvous(datagram: &[u8]) -> bool {
    datagram
        .first()
        .is_some_and(|b| b & PACKET_FLAG_RENDEZVOUS != 0)
}

/// Packet-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Liveness-only packet.
    pub const HEARTBEAT: Self = Self(PACKET_FLAG_HEARTBEAT);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Whether the heartbeat bit is set.
    pub fn is_heartbeat(self) -> bool {
        self.0 & PACKET_FLAG_HEARTBEAT != 0
    }

    /// Only the heartbeat bit may be set on a transport packet.
    pub fn is_valid(self) -> bool {
        self.0 & !PACKET_FLAG_HEARTBEAT == 0
    }
}

/// Message-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Connection request.
    pub const SYN: Self = Self(MESSAGE_FLAG_SYN);
    /// Connection accepted.
    pub const SYN_RST: Self = Self(MESSAGE_FLAG_SYN | MESSAGE_FLAG_RST);
    /// Close request.
    pub const RST: Self = Self(MESSAGE_FLAG_RST);
    /// Close acknowledged.
    pub const CLOSE_ACK: Self = Self(MESSAGE_FLAG_SYN | MESSAGE_FLAG_RST | MESSAGE_FLAG_ACK);
    /// Acknowledgement.
    pub const ACK: Self = Self(MESSAGE_FLAG_ACK);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// SYN bit.
    pub fn is_syn(self) -> bool {
        self.0 & MESSAGE_FLAG_SYN != 0
    }

    /// RST bit.
    pub fn is_rst(self) -> bool {
        self.0 & MESSAGE_FLAG_RST != 0
    }

    /// ACK bit.
    pub fn is_ack(self) -> bool {
        self.0 & MESSAGE_FLAG_ACK != 0
    }

    /// PRX bit (authenticated handshake).
    pub fn is_prx(self) -> bool {
        self.0 & MESSAGE_FLAG_PRX != 0
    }

    /// Set the PRX bit.
    pub fn with_prx(self) -> Self {
        Self(self.0 | MESSAGE_FLAG_PRX)
    }

    /// Reject reserved bits, SACK and meaningless combinations.
    pub fn is_valid(self) -> bool {
        let known = MESSAGE_FLAG_PRX | MESSAGE_FLAG_RST | MESSAGE_FLAG_SYN | MESSAGE_FLAG_ACK;
        if self.0 & !known != 0 || self.0 & MESSAGE_FLAG_SACK != 0 {
            return false;
        }
        let (syn, rst, ack) = (self.is_syn(), self.is_rst(), self.is_ack());
        if self.is_prx() && (!syn || ack) {
            return false;
        }
        // ACK alongside exactly one of SYN/RST has no meaning.
        !(ack && syn != rst)
    }

    fn has_seq(self) -> bool {
        self.is_syn() || self.is_rst()
    }

    fn has_ack(self) -> bool {
        self.is_ack() && !(self.is_syn() && self.is_rst())
    }
}

/// What a message means, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Connection request carrying the initiator's initial sequence number.
    Syn,
    /// Connection accepted, carrying the acceptor's initial sequence number.
    SynRst,
    /// Close request.
    Rst,
    /// Close acknowledgement.
    CloseAck,
    /// Channel data and/or acknowledgement.
    Data,
}

/// One message inside a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message flags.
    pub flags: MessageFlags,
    /// Channel qualifier byte (zero for control messages).
    pub channel: u8,
    /// Sequence number.
    pub seq: Option<u16>,
    /// Cumulative acknowledgement.
    pub ack: Option<u16>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Data message.
    pub fn data(channel: u8, seq: u16, payload: Vec<u8>) -> Self {
        Self {
            flags: MessageFlags::NONE,
            channel,
            seq: Some(seq),
            ack: None,
            payload,
        }
    }

    /// Ack-only message for a channel.
    pub fn ack(channel: u8, ack: u16) -> Self {
        Self {
            flags: MessageFlags::ACK,
            channel,
            seq: None,
            ack: Some(ack),
            payload: Vec::new(),
        }
    }

    /// Unauthenticated control message (SYN, SYN-RST, RST, close-ack).
    pub fn control(flags: MessageFlags, seq: u16) -> Self {
        Self {
            flags,
            channel: 0,
            seq: Some(seq),
            ack: None,
            payload: Vec::new(),
        }
    }

    /// Authenticated handshake message carrying a tag.
    pub fn handshake(flags: MessageFlags, seq: u16, tag: [u8; sizes::HANDSHAKE_TAG_SIZE]) -> Self {
        Self {
            flags: flags.with_prx(),
            channel: 0,
            seq: Some(seq),
            ack: None,
            payload: tag.to_vec(),
        }
    }

    /// Classify the message.
    pub fn kind(&self) -> MessageKind {
        match (self.flags.is_syn(), self.flags.is_rst(), self.flags.is_ack()) {
            (true, true, true) => MessageKind::CloseAck,
            (true, true, false) => MessageKind::SynRst,
            (true, false, _) => MessageKind::Syn,
            (false, true, _) => MessageKind::Rst,
            (false, false, _) => MessageKind::Data,
        }
    }

    /// Encoded size of this message.
    pub fn encoded_len(&self) -> usize {
        sizes::MESSAGE_HEADER_SIZE
            + self.seq.map_or(0, |_| sizes::SEQ_SIZE)
            + self.ack.map_or(0, |_| sizes::ACK_SIZE)
            + self.payload.len()
    }

    /// Append the encoded message to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.flags.as_byte());
        buf.push(self.channel);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        if let Some(seq) = self.seq {
            buf.extend_from_slice(&seq.to_le_bytes());
        }
        if let Some(ack) = self.ack {
            buf.extend_from_slice(&ack.to_le_bytes());
        }
        buf.extend_from_slice(&self.payload);
    }

    /// Parse one message from the front of `bytes`, returning it and its size.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), FrameError> {
        if bytes.len() < sizes::MESSAGE_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: sizes::MESSAGE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let flags = MessageFlags::from_byte(bytes[0]);
        if !flags.is_valid() {
            return Err(FrameError::InvalidMessageFlags(bytes[0]));
        }
        let channel = bytes[1];
        let length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;

        let has_seq = length > 0 || flags.has_seq();
        let has_ack = flags.has_ack();
        let header = sizes::MESSAGE_HEADER_SIZE
            + if has_seq { sizes::SEQ_SIZE } else { 0 }
            + if has_ack { sizes::ACK_SIZE } else { 0 };
        let total = header + length;
        if bytes.len() < total {
            return Err(FrameError::TooShort {
                expected: total,
                actual: bytes.len(),
            });
        }

        let mut pos = sizes::MESSAGE_HEADER_SIZE;
        let seq = has_seq.then(|| {
            let v = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            pos += sizes::SEQ_SIZE;
            v
        });
        let ack = has_ack.then(|| {
            let v = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            pos += sizes::ACK_SIZE;
            v
        });

        let message = Self {
            flags,
            channel,
            seq,
            ack,
            payload: bytes[pos..total].to_vec(),
        };
        message.validate()?;
        Ok((message, total))
    }

    fn validate(&self) -> Result<(), FrameError> {
        let len = self.payload.len();
        match self.kind() {
            MessageKind::Data => {
                if !qualifier::is_valid(self.channel) {
                    return Err(FrameError::InvalidChannel(self.channel));
                }
                // Empty data is only meaningful as an ack.
                if len == 0 && !self.flags.is_ack() {
                    return Err(FrameError::UnexpectedPayload(len));
                }
            }
            _ if self.flags.is_prx() => {
                if len != sizes::HANDSHAKE_TAG_SIZE {
                    return Err(FrameError::UnexpectedPayload(len));
                }
            }
            _ => {
                if len != 0 {
                    return Err(FrameError::UnexpectedPayload(len));
                }
            }
        }
        Ok(())
    }
}

/// Packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet flags.
    pub flags: PacketFlags,
    /// Sender's timestamp (ms since its connection started).
    pub timestamp: u32,
    /// Most recent timestamp the sender received from us.
    pub timestamp_echo: u32,
}

impl PacketHeader {
    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; sizes::PACKET_HEADER_SIZE] {
        let mut buf = [0u8; sizes::PACKET_HEADER_SIZE];
        buf[0] = self.flags.as_byte();
        buf[1..5].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[5..9].copy_from_slice(&self.timestamp_echo.to_le_bytes());
        buf
    }

    /// Parse header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < sizes::PACKET_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: sizes::PACKET_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let flags = PacketFlags::from_byte(bytes[0]);
        if !flags.is_valid() {
            return Err(FrameError::InvalidPacketFlags(bytes[0]));
        }
        Ok(Self {
            flags,
            timestamp: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            timestamp_echo: u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
        })
    }
}

/// A decoded transport datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header.
    pub header: PacketHeader,
    /// Messages in wire order.
    pub messages: Vec<Message>,
}

impl Packet {
    /// Packet with a zeroed header, used for replies to unknown peers.
    pub fn stray(message: Message) -> Self {
        Self {
            header: PacketHeader {
                flags: PacketFlags::NONE,
                timestamp: 0,
                timestamp_echo: 0,
            },
            messages: vec![message],
        }
    }

    /// Encoded size.
    pub fn encoded_len(&self) -> usize {
        sizes::PACKET_HEADER_SIZE
            + self
                .messages
                .iter()
                .map(Message::encoded_len)
                .sum::<usize>()
    }

    /// Encode the packet into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.header.to_bytes());
        for message in &self.messages {
            message.encode_into(&mut buf);
        }
        buf
    }

    /// Parse a datagram. Any malformed message rejects the whole datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = PacketHeader::from_bytes(bytes)?;
        let mut messages = Vec::new();
        let mut rest = &bytes[sizes::PACKET_HEADER_SIZE..];
        while !rest.is_empty() {
            let (message, used) = Message::decode(rest)?;
            messages.push(message);
            rest = &rest[used..];
        }
        Ok(Self { header, messages })
    }

    /// First message of the given kind, if any.
    pub fn find(&self, kind: MessageKind) -> Option<&Message> {
        self.messages.iter().find(|m| m.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> PacketHeader {
        PacketHeader {
            flags: PacketFlags::NONE,
            timestamp: 0x0102_0304,
            timestamp_echo: 7,
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = header().to_bytes();
        assert_eq!(hex::encode(bytes), "000403020107000000");
        assert_eq!(PacketHeader::from_bytes(&bytes).unwrap(), header());
    }

    #[test]
    fn test_header_rejects_unknown_flags() {
        let mut bytes = header().to_bytes();
        bytes[0] = 0x02;
        assert_eq!(
            PacketHeader::from_bytes(&bytes),
            Err(FrameError::InvalidPacketFlags(0x02))
        );
    }

    #[test]
    fn test_data_message_layout() {
        let mut buf = Vec::new();
        Message::data(0xC0, 0x1234, b"hi".to_vec()).encode_into(&mut buf);
        assert_eq!(hex::encode(&buf), "00c0020034126869");
    }

    #[test]
    fn test_ack_only_layout() {
        let mut buf = Vec::new();
        let ack = Message::ack(0xC1, 9);
        ack.encode_into(&mut buf);
        assert_eq!(hex::encode(&buf), "02c100000900");
        let (decoded, used) = Message::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, ack);
        assert_eq!(decoded.kind(), MessageKind::Data);
    }

    #[test]
    fn test_control_kinds() {
        let cases = [
            (MessageFlags::SYN, MessageKind::Syn),
            (MessageFlags::SYN_RST, MessageKind::SynRst),
            (MessageFlags::RST, MessageKind::Rst),
            (MessageFlags::CLOSE_ACK, MessageKind::CloseAck),
        ];
        for (flags, kind) in cases {
            let msg = Message::control(flags, 42);
            let mut buf = Vec::new();
            msg.encode_into(&mut buf);
            // Close-ack carries no ack field despite the ACK bit.
            assert_eq!(buf.len(), 6);
            let (decoded, _) = Message::decode(&buf).unwrap();
            assert_eq!(decoded.kind(), kind);
            assert_eq!(decoded.seq, Some(42));
        }
    }

    #[test]
    fn test_packet_with_several_messages() {
        let packet = Packet {
            header: header(),
            messages: vec![
                Message::ack(0xC0, 1),
                Message::data(0x00, 5, vec![1, 2, 3]),
                Message::data(0xC0, 6, vec![4]),
            ],
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_rejects_sack() {
        let bytes = [0x01, 0xC0, 0x00, 0x00];
        assert_eq!(
            Message::decode(&bytes),
            Err(FrameError::InvalidMessageFlags(0x01))
        );
    }

    #[test]
    fn test_rejects_reserved_channel_bit() {
        let mut buf = Vec::new();
        Message::data(0x20, 1, vec![0]).encode_into(&mut buf);
        assert_eq!(
            Message::decode(&buf),
            Err(FrameError::InvalidChannel(0x20))
        );
    }

    #[test]
    fn test_rejects_empty_data_without_ack() {
        let bytes = [0x00, 0xC0, 0x00, 0x00];
        assert_eq!(
            Message::decode(&bytes),
            Err(FrameError::UnexpectedPayload(0))
        );
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let mut buf = Vec::new();
        Message::data(0xC0, 1, vec![0; 10]).encode_into(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            Message::decode(&buf),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_plain_syn_with_payload_rejected() {
        let mut msg = Message::control(MessageFlags::SYN, 1);
        msg.payload = vec![0; 4];
        let mut buf = Vec::new();
        msg.encode_into(&mut buf);
        assert_eq!(
            Message::decode(&buf),
            Err(FrameError::UnexpectedPayload(4))
        );
    }

    #[test]
    fn test_handshake_carries_tag() {
        let msg = Message::handshake(MessageFlags::SYN, 77, [0xAA; 32]);
        assert!(msg.flags.is_prx());
        let mut buf = Vec::new();
        msg.encode_into(&mut buf);
        let (decoded, _) = Message::decode(&buf).unwrap();
        assert_eq!(decoded.kind(), MessageKind::Syn);
        assert_eq!(decoded.payload, vec![0xAA; 32]);
    }

    #[test]
    fn test_invalid_flag_combinations() {
        // PRX without SYN
        assert!(!MessageFlags::from_byte(0x10).is_valid());
        // SYN|ACK and RST|ACK
        assert!(!MessageFlags::from_byte(0x06).is_valid());
        assert!(!MessageFlags::from_byte(0x0A).is_valid());
        // Unknown high bits
        assert!(!MessageFlags::from_byte(0x40).is_valid());
        assert!(MessageFlags::CLOSE_ACK.is_valid());
    }

    #[test]
    fn test_is_rendezvous() {
        assert!(is_rendezvous(&[0x80, 1]));
        assert!(!is_rendezvous(&[0x01]));
        assert!(!is_rendezvous(&[]));
    }

    #[test]
    fn test_heartbeat_packet() {
        let packet = Packet {
            header: PacketHeader {
                flags: PacketFlags::HEARTBEAT,
                ..header()
            },
            messages: Vec::new(),
        };
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert!(decoded.header.flags.is_heartbeat());
        assert!(decoded.messages.is_empty());
    }
}
