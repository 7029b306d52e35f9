//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Maximum negotiable TDS packet size.
pub const MAX_PACKET_SIZE: usize = 32_767;

/// Minimum negotiable TDS packet size.
pub const MIN_PACKET_SIZE: usize = 512;

/// Default TDS packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    TabularResult = 0x04,
    /// Attention signal (out-of-band cancel request).
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Tds7Login),
            0x12 => Ok(Self::PreLogin),
            _ => Err(WireError::UnknownPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketStatus: u8 {
        /// End of message (last packet of the logical message).
        const END_OF_MESSAGE = 0x01;
        /// Message was cancelled; receiver must discard it.
        const IGNORE = 0x02;
        /// Reset connection state before executing this request.
        const RESET_CONNECTION = 0x04;
        /// More packets of this message follow.
        const BATCH = 0x08;
    }
}

/// TDS packet header.
///
/// Every TDS packet begins with an 8-byte header describing the packet
/// type, status, and total length. Length and channel are big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including the header.
    pub length: u16,
    /// Channel (SPID echoed by the server, session id on MARS requests).
    pub channel: u16,
    /// Packet sequence number, 1-based per message, wraps 255 to 1.
    pub packet_number: u8,
    /// Window (unused, must be 0).
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            channel: 0,
            packet_number: 1,
            window: 0,
        }
    }

    /// Parse a packet header from bytes.
    pub fn decode(src: &mut impl Buf) -> Result<Self, WireError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(WireError::Incomplete {
                expected: PACKET_HEADER_SIZE,
                actual: src.remaining(),
            });
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status_byte = src.get_u8();
        let status = PacketStatus::from_bits(status_byte)
            .ok_or(WireError::InvalidPacketStatus(status_byte))?;
        let length = src.get_u16();
        let channel = src.get_u16();
        let packet_number = src.get_u8();
        let window = src.get_u8();

        if (length as usize) < PACKET_HEADER_SIZE {
            return Err(WireError::CorruptedStream("packet length below header size"));
        }

        Ok(Self {
            packet_type,
            status,
            length,
            channel,
            packet_number,
            window,
        })
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.channel);
        dst.put_u8(self.packet_number);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(PACKET_HEADER_SIZE)
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Check if the receiver must discard this message.
    #[must_use]
    pub const fn is_ignored(&self) -> bool {
        self.status.contains(PacketStatus::IGNORE)
    }

    /// Set the packet sequence number.
    #[must_use]
    pub const fn with_packet_number(mut self, number: u8) -> Self {
        self.packet_number = number;
        self
    }

    /// Set the channel.
    #[must_use]
    pub const fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }
}

/// Build the fixed 8-byte attention frame.
///
/// An attention packet is header-only: message type 0x06, status EOM,
/// total length equal to the header size.
#[must_use]
pub fn attention_frame(channel: u16) -> [u8; PACKET_HEADER_SIZE] {
    let mut frame = [0u8; PACKET_HEADER_SIZE];
    frame[0] = PacketType::Attention as u8;
    frame[1] = PacketStatus::END_OF_MESSAGE.bits();
    frame[2..4].copy_from_slice(&(PACKET_HEADER_SIZE as u16).to_be_bytes());
    frame[4..6].copy_from_slice(&channel.to_be_bytes());
    frame[6] = 1;
    frame
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::SqlBatch,
            status: PacketStatus::END_OF_MESSAGE,
            length: 100,
            channel: 54,
            packet_number: 1,
            window: 0,
        };

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);

        let mut cursor = bytes.as_ref();
        let decoded = PacketHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_length_is_big_endian() {
        let header = PacketHeader::new(
            PacketType::TabularResult,
            PacketStatus::END_OF_MESSAGE,
            0x1234,
        );
        let bytes = header.encode_to_bytes();
        assert_eq!(bytes[2], 0x12);
        assert_eq!(bytes[3], 0x34);
    }

    #[test]
    fn test_short_length_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u8(PacketType::SqlBatch as u8);
        raw.put_u8(PacketStatus::END_OF_MESSAGE.bits());
        raw.put_u16(4); // below header size
        raw.put_u16(0);
        raw.put_u8(1);
        raw.put_u8(0);

        let mut cursor = raw.as_ref();
        assert!(matches!(
            PacketHeader::decode(&mut cursor),
            Err(WireError::CorruptedStream(_))
        ));
    }

    #[test]
    fn test_payload_length() {
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0x01).unwrap(), PacketType::SqlBatch);
        assert_eq!(PacketType::from_u8(0x0E).unwrap(), PacketType::TransactionManager);
        assert!(PacketType::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_attention_frame_layout() {
        let frame = attention_frame(7);
        assert_eq!(frame[0], 0x06);
        assert_eq!(frame[1], PacketStatus::END_OF_MESSAGE.bits());
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 8);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 7);
    }
}
