//! Read snapshot and replay.
//!
//! A retryable read takes a snapshot before it begins. Every packet
//! received while the snapshot is active is recorded; rolling back
//! restores the parser position captured at snapshot time and re-delivers
//! the recorded packets in order before the session touches the transport
//! again. Committing the snapshot discards the recording.

use bytes::Bytes;
use tds_wire::PacketHeader;

use crate::reader::{ParserPosition, ReadPipeline};

/// A packet recorded for replay.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotPacket {
    pub(crate) header: PacketHeader,
    pub(crate) payload: Bytes,
}

/// Recording of packets and parser position for a retryable read.
#[derive(Debug)]
pub struct ReadSnapshot {
    position: ParserPosition,
    packets: Vec<SnapshotPacket>,
    replay_cursor: usize,
}

impl ReadSnapshot {
    /// Capture the pipeline's current position and start recording.
    #[must_use]
    pub fn capture(pipeline: &ReadPipeline) -> Self {
        Self {
            position: pipeline.capture_position(),
            packets: Vec::new(),
            replay_cursor: 0,
        }
    }

    /// Record a packet received while the snapshot is active.
    ///
    /// Packets delivered from the replay queue itself are not re-recorded;
    /// the caller distinguishes by checking [`Self::is_replaying`] first.
    pub fn record(&mut self, header: PacketHeader, payload: &[u8]) {
        self.packets.push(SnapshotPacket {
            header,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Whether buffered packets remain to be replayed.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replay_cursor < self.packets.len()
    }

    /// Take the next packet to replay, if any.
    pub(crate) fn next_replay(&mut self) -> Option<(PacketHeader, Bytes)> {
        let packet = self.packets.get(self.replay_cursor)?;
        self.replay_cursor += 1;
        Some((packet.header, packet.payload.clone()))
    }

    /// Restore the pipeline to the snapshot point and rewind the replay
    /// queue, so the next fill delivers recorded packets before any live
    /// read.
    pub fn rollback(&mut self, pipeline: &mut ReadPipeline) {
        pipeline.restore_position(&self.position);
        self.replay_cursor = 0;
    }

    /// Number of packets recorded since the snapshot point.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reader::ReadOutcome;
    use tds_wire::{PacketStatus, PacketType, DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE};

    fn header(payload_len: usize, eom: bool) -> PacketHeader {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::BATCH
        };
        PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + payload_len) as u16,
        )
    }

    /// Feed a packet the way the session does: record into the snapshot
    /// (when active and not replaying), then append to the input buffer.
    fn deliver(
        pipeline: &mut ReadPipeline,
        snapshot: &mut ReadSnapshot,
        payload: &[u8],
        eom: bool,
    ) {
        let h = header(payload.len(), eom);
        snapshot.record(h, payload);
        pipeline.input_mut().append(&h, payload);
    }

    fn replay_into(pipeline: &mut ReadPipeline, snapshot: &mut ReadSnapshot) -> bool {
        match snapshot.next_replay() {
            Some((h, payload)) => {
                pipeline.input_mut().append(&h, &payload);
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_replay_is_bit_identical() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        let mut snapshot = ReadSnapshot::capture(&pipeline);

        deliver(&mut pipeline, &mut snapshot, &[1, 2, 3, 4], false);
        deliver(&mut pipeline, &mut snapshot, &[5, 0, 0, 0], true);

        let first = pipeline.try_read_u32().unwrap();
        let second = pipeline.try_read_u32().unwrap();

        snapshot.rollback(&mut pipeline);
        // Pipeline is back at the snapshot point: no buffered data.
        assert_eq!(pipeline.try_read_u32().unwrap(), ReadOutcome::NeedsData);

        while replay_into(&mut pipeline, &mut snapshot) {}
        assert_eq!(pipeline.try_read_u32().unwrap(), first);
        assert_eq!(pipeline.try_read_u32().unwrap(), second);
    }

    #[test]
    fn test_replay_restores_mid_value_position() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);

        // Consume half of a u32 before the snapshot: the staged scratch
        // bytes must be part of the captured position.
        pipeline
            .input_mut()
            .append(&header(2, false), &[0xEF, 0xBE]);
        assert_eq!(pipeline.try_read_u32().unwrap(), ReadOutcome::NeedsData);

        let mut snapshot = ReadSnapshot::capture(&pipeline);
        deliver(&mut pipeline, &mut snapshot, &[0xAD, 0xDE], true);
        assert_eq!(
            pipeline.try_read_u32().unwrap(),
            ReadOutcome::Ready(0xDEAD_BEEF)
        );

        snapshot.rollback(&mut pipeline);
        while replay_into(&mut pipeline, &mut snapshot) {}
        assert_eq!(
            pipeline.try_read_u32().unwrap(),
            ReadOutcome::Ready(0xDEAD_BEEF)
        );
    }

    #[test]
    fn test_empty_snapshot_rollback_is_noop() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        let mut snapshot = ReadSnapshot::capture(&pipeline);

        snapshot.rollback(&mut pipeline);
        assert_eq!(snapshot.packet_count(), 0);
        assert!(!snapshot.is_replaying());
        assert_eq!(pipeline.input().available(), 0);
        assert_eq!(pipeline.try_read_u8().unwrap(), ReadOutcome::NeedsData);
    }

    #[test]
    fn test_null_bitmap_shared_until_mutation() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        pipeline.null_bitmap_mut().reset(8, vec![0b0000_0010]);

        let snapshot = ReadSnapshot::capture(&pipeline);
        // Captured cache shares storage until the live pipeline mutates it.
        assert!(pipeline
            .null_bitmap()
            .shares_storage_with(snapshot.position.null_bitmap_for_test()));

        pipeline.null_bitmap_mut().set_null(0);
        assert!(!pipeline
            .null_bitmap()
            .shares_storage_with(snapshot.position.null_bitmap_for_test()));
        assert!(!snapshot.position.null_bitmap_for_test().is_null(0));
    }
}
