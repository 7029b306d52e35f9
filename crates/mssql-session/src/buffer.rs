//! Paired input/output packet buffers.
//!
//! The input buffer accumulates the payload bytes of received packets and
//! tracks the parser's position in them. The output buffer accumulates an
//! outbound packet with the 8-byte header prefix reserved up front, so the
//! header is stamped in place at flush time. Both buffers share one
//! configured size; resizing is only legal when both are empty.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use tds_wire::{PacketHeader, PacketStatus, PacketType, PACKET_HEADER_SIZE};

/// Buffer holding received payload bytes and the parser's position.
///
/// Invariants: `bytes_used <= bytes_read` and `bytes_in_packet >= 0` at
/// every observable point.
#[derive(Debug)]
pub struct InputBuffer {
    data: BytesMut,
    /// Unconsumed payload length of each buffered packet, front first.
    packet_bounds: VecDeque<usize>,
    bytes_used: usize,
    bytes_read: usize,
    message_status: PacketStatus,
    last_packet_eom: bool,
    capacity: usize,
}

impl InputBuffer {
    /// Create an empty input buffer for the given packet size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            packet_bounds: VecDeque::new(),
            bytes_used: 0,
            bytes_read: 0,
            message_status: PacketStatus::empty(),
            last_packet_eom: false,
            capacity,
        }
    }

    /// Append a received packet's payload.
    pub fn append(&mut self, header: &PacketHeader, payload: &[u8]) {
        if self.data.is_empty() {
            // Fresh window: drop drained bounds and reset the position counters.
            self.packet_bounds.clear();
            self.bytes_used = 0;
            self.bytes_read = 0;
        }
        self.packet_bounds.push_back(payload.len());
        self.data.extend_from_slice(payload);
        self.bytes_read += payload.len();
        self.message_status = header.status;
        self.last_packet_eom = header.is_end_of_message();
        debug_assert!(self.bytes_used <= self.bytes_read);
    }

    /// Bytes available to the parser.
    #[must_use]
    pub fn available(&self) -> usize {
        self.data.len()
    }

    /// Unconsumed payload bytes of the packet currently being parsed.
    #[must_use]
    pub fn bytes_in_packet(&self) -> usize {
        self.packet_bounds.front().copied().unwrap_or(0)
    }

    /// Consumed offset within the current buffer window.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Valid bytes received into the current buffer window.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Status byte of the most recently received packet.
    #[must_use]
    pub fn message_status(&self) -> PacketStatus {
        self.message_status
    }

    /// Whether the final packet of the current message has been received.
    #[must_use]
    pub fn end_of_message_received(&self) -> bool {
        self.last_packet_eom
    }

    /// View the unconsumed bytes.
    #[must_use]
    pub fn peek(&self) -> &[u8] {
        &self.data
    }

    /// Consume `n` bytes.
    ///
    /// Panics in debug builds if `n` exceeds the available bytes; the read
    /// pipeline checks availability before consuming.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        let mut remaining = n;
        while remaining > 0 {
            let Some(front) = self.packet_bounds.front_mut() else {
                break;
            };
            let step = remaining.min(*front);
            *front -= step;
            remaining -= step;
            if *front == 0 && self.packet_bounds.len() > 1 {
                self.packet_bounds.pop_front();
            } else if step == 0 {
                // Zero-length bound with nothing left to account against.
                self.packet_bounds.pop_front();
            }
        }
        self.data.advance(n);
        self.bytes_used += n;
        if self.bytes_used == self.bytes_read {
            self.bytes_used = 0;
            self.bytes_read = 0;
        }
        debug_assert!(self.bytes_used <= self.bytes_read);
    }

    /// Drop all buffered data and position state.
    pub fn reset(&mut self) {
        self.data.clear();
        self.packet_bounds.clear();
        self.bytes_used = 0;
        self.bytes_read = 0;
        self.message_status = PacketStatus::empty();
        self.last_packet_eom = false;
    }

    /// Configured buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if the buffer holds no data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(self.is_empty());
        self.capacity = capacity;
    }

    pub(crate) fn save(&self) -> InputSave {
        InputSave {
            data: Bytes::copy_from_slice(&self.data),
            packet_bounds: self.packet_bounds.clone(),
            bytes_used: self.bytes_used,
            bytes_read: self.bytes_read,
            message_status: self.message_status,
            last_packet_eom: self.last_packet_eom,
        }
    }

    pub(crate) fn restore(&mut self, save: &InputSave) {
        self.data.clear();
        self.data.extend_from_slice(&save.data);
        self.packet_bounds = save.packet_bounds.clone();
        self.bytes_used = save.bytes_used;
        self.bytes_read = save.bytes_read;
        self.message_status = save.message_status;
        self.last_packet_eom = save.last_packet_eom;
    }
}

/// Saved input buffer state for snapshot restore.
#[derive(Debug, Clone)]
pub(crate) struct InputSave {
    data: Bytes,
    packet_bounds: VecDeque<usize>,
    bytes_used: usize,
    bytes_read: usize,
    message_status: PacketStatus,
    last_packet_eom: bool,
}

/// Outbound packet buffer with the header prefix reserved in place.
#[derive(Debug)]
pub struct OutputBuffer {
    buf: BytesMut,
    capacity: usize,
    packet_number: u8,
}

impl OutputBuffer {
    /// Create an output buffer for the given packet size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity);
        buf.extend_from_slice(&[0u8; PACKET_HEADER_SIZE]);
        Self {
            buf,
            capacity,
            packet_number: 1,
        }
    }

    /// Payload bytes accumulated so far.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.buf.len() - PACKET_HEADER_SIZE
    }

    /// Payload bytes that still fit in this packet.
    #[must_use]
    pub fn room(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Check if no payload has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.len() == PACKET_HEADER_SIZE
    }

    /// Current packet sequence number.
    #[must_use]
    pub fn packet_number(&self) -> u8 {
        self.packet_number
    }

    /// Configured buffer size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append as much of `src` as fits; returns the number written.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.room());
        self.buf.extend_from_slice(&src[..n]);
        n
    }

    /// Overwrite payload bytes at `offset` (used to materialise secrets).
    ///
    /// Returns false when the range is out of bounds.
    pub fn overwrite_payload(&mut self, offset: usize, src: &[u8]) -> bool {
        let start = PACKET_HEADER_SIZE + offset;
        let end = start + src.len();
        if end > self.buf.len() {
            return false;
        }
        self.buf[start..end].copy_from_slice(src);
        true
    }

    /// Stamp the header in place and take the finished frame.
    ///
    /// Soft flushes bump the packet number; hard flushes (EOM or IGNORE)
    /// reset it to 1 for the next message.
    pub fn stamp_and_take(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
        channel: u16,
    ) -> BytesMut {
        let total = self.buf.len() as u16;
        self.buf[0] = packet_type as u8;
        self.buf[1] = status.bits();
        self.buf[2..4].copy_from_slice(&total.to_be_bytes());
        self.buf[4..6].copy_from_slice(&channel.to_be_bytes());
        self.buf[6] = self.packet_number;
        self.buf[7] = 0;

        let terminal = status.contains(PacketStatus::END_OF_MESSAGE)
            || status.contains(PacketStatus::IGNORE);
        self.packet_number = if terminal {
            1
        } else if self.packet_number == 255 {
            1
        } else {
            self.packet_number + 1
        };

        let frame = self.buf.split();
        self.buf.extend_from_slice(&[0u8; PACKET_HEADER_SIZE]);
        frame
    }

    /// Discard accumulated payload and reset packet numbering.
    pub fn discard(&mut self) {
        self.buf.clear();
        self.buf.extend_from_slice(&[0u8; PACKET_HEADER_SIZE]);
        self.packet_number = 1;
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(self.is_empty());
        self.capacity = capacity;
    }
}
