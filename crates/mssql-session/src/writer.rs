//! Write pipeline.
//!
//! Outbound bytes accumulate in the output buffer and are emitted as
//! packets: soft flushes carry the BATCH status and bump the packet
//! number, the hard flush carries EOM and resets numbering for the next
//! message. Cancellation is honoured mid-request: before the first packet
//! of a message goes out the buffer is simply discarded; afterwards the
//! message must be terminated on the wire with an EOM|IGNORE packet
//! followed by an attention request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tds_wire::{PacketStatus, PacketType};
use tokio::sync::Notify;

use crate::buffer::OutputBuffer;
use crate::error::{Result, SessionError};
use crate::session::SessionShared;

/// Flush mode for the current packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// More packets of this message follow (status BATCH).
    Soft,
    /// Final packet of the message (status EOM).
    Hard,
}

/// Maximum number of write secrets that may be in flight at once
/// (login password plus change-password).
pub const MAX_SECRETS_IN_FLIGHT: usize = 2;

/// Opaque secret payload for the write pipeline.
///
/// The plaintext is materialised into the outbound packet buffer
/// immediately before the frame is handed to the transport, and wiped
/// from both the handle and the frame afterwards.
pub struct WriteSecret {
    bytes: Vec<u8>,
}

impl WriteSecret {
    /// Wrap secret bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Length of the secret in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the secret is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for WriteSecret {
    fn drop(&mut self) {
        for b in &mut self.bytes {
            *b = 0;
        }
    }
}

impl std::fmt::Debug for WriteSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSecret")
            .field("len", &self.bytes.len())
            .finish()
    }
}

struct PlacedSecret {
    secret: WriteSecret,
    /// Offset within the current packet's payload.
    offset: usize,
}

/// Accounting for writes handed to the transport.
///
/// A completion that records an error before any waiter is registered is
/// stashed and surfaced to the first subsequent waiter.
#[derive(Debug, Default)]
pub struct PendingWrites {
    outstanding: AtomicUsize,
    notify: Notify,
    stashed_error: Mutex<Option<SessionError>>,
}

impl PendingWrites {
    /// Number of writes currently outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete(&self, result: &Result<()>) {
        if let Err(e) = result {
            let mut stash = self.stashed_error.lock();
            if stash.is_none() {
                *stash = Some(e.clone());
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Wait until all accumulated writes have completed.
    ///
    /// Surfaces a stashed completion error to the first waiter.
    pub async fn wait_for_accumulated_writes(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        match self.stashed_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub(crate) fn take_stashed_error(&self) -> Option<SessionError> {
        self.stashed_error.lock().take()
    }
}

/// Accumulates a request message and emits its packets.
#[derive(Debug)]
pub(crate) struct WritePipeline {
    out: OutputBuffer,
    message_type: Option<PacketType>,
    packets_sent: u32,
    reset_connection: bool,
    secrets: Vec<PlacedSecret>,
    pending: Arc<PendingWrites>,
}

impl std::fmt::Debug for PlacedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlacedSecret")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl WritePipeline {
    pub(crate) fn new(packet_size: usize) -> Self {
        Self {
            out: OutputBuffer::new(packet_size),
            message_type: None,
            packets_sent: 0,
            reset_connection: false,
            secrets: Vec::new(),
            pending: Arc::new(PendingWrites::default()),
        }
    }

    pub(crate) fn output(&self) -> &OutputBuffer {
        &self.out
    }

    pub(crate) fn pending(&self) -> &Arc<PendingWrites> {
        &self.pending
    }

    /// Request the RESET_CONNECTION flag on the first packet of the next
    /// message (session redeployed from a pool).
    pub(crate) fn set_reset_connection(&mut self, reset: bool) {
        self.reset_connection = reset;
    }

    pub(crate) fn begin_message(&mut self, packet_type: PacketType) -> Result<()> {
        if self.message_type.is_some() {
            return Err(SessionError::InvalidState("message already in progress"));
        }
        if let Some(e) = self.pending.take_stashed_error() {
            return Err(e);
        }
        self.message_type = Some(packet_type);
        self.packets_sent = 0;
        Ok(())
    }

    pub(crate) async fn write_bytes(
        &mut self,
        shared: &SessionShared,
        mut src: &[u8],
    ) -> Result<()> {
        if self.message_type.is_none() {
            return Err(SessionError::InvalidState("no message in progress"));
        }
        loop {
            let written = self.out.write(src);
            src = &src[written..];
            if src.is_empty() {
                return Ok(());
            }
            // Buffer full with bytes remaining: suspension point.
            self.flush(shared, FlushMode::Soft).await?;
        }
    }

    pub(crate) async fn write_u8(&mut self, shared: &SessionShared, value: u8) -> Result<()> {
        self.write_bytes(shared, &[value]).await
    }

    /// Register a secret to be materialised at `offset` within the
    /// current packet's payload. The bytes at that offset must already be
    /// reserved (written as placeholders).
    pub(crate) fn place_secret(&mut self, secret: WriteSecret, offset: usize) -> Result<()> {
        if self.secrets.len() >= MAX_SECRETS_IN_FLIGHT {
            return Err(SessionError::TooManySecrets);
        }
        if offset + secret.len() > self.out.payload_len() {
            return Err(SessionError::InvalidState(
                "secret placement outside written payload",
            ));
        }
        self.secrets.push(PlacedSecret { secret, offset });
        Ok(())
    }

    /// Emit the buffered payload as one packet.
    pub(crate) async fn flush(&mut self, shared: &SessionShared, mode: FlushMode) -> Result<()> {
        let Some(packet_type) = self.message_type else {
            return Err(SessionError::InvalidState("no message in progress"));
        };

        if shared.is_cancelled() {
            return self.flush_cancelled(shared, packet_type).await;
        }

        // A soft flush with nothing buffered is a no-op; a hard flush may
        // legitimately emit a header-only EOM packet.
        if self.out.is_empty() && mode == FlushMode::Soft {
            return Ok(());
        }

        let mut status = match mode {
            FlushMode::Soft => PacketStatus::BATCH,
            FlushMode::Hard => PacketStatus::END_OF_MESSAGE,
        };
        if self.packets_sent == 0 && self.reset_connection {
            status |= PacketStatus::RESET_CONNECTION;
        }

        self.send_current(shared, packet_type, status).await?;

        if mode == FlushMode::Hard {
            self.message_type = None;
            self.packets_sent = 0;
            self.reset_connection = false;
        }
        Ok(())
    }

    /// Drop the buffered message without emitting anything.
    pub(crate) fn discard(&mut self) {
        self.out.discard();
        self.secrets.clear();
        self.message_type = None;
        self.packets_sent = 0;
    }

    async fn flush_cancelled(
        &mut self,
        shared: &SessionShared,
        packet_type: PacketType,
    ) -> Result<()> {
        if self.packets_sent == 0 {
            // Nothing on the wire yet: the message simply never happened.
            tracing::debug!("request cancelled before first packet, discarding buffer");
            self.discard();
            return Err(SessionError::OperationCancelled);
        }

        // The server has seen part of this message: terminate it on the
        // wire, then ask for an attention acknowledgment. The ack itself
        // is consumed by the read side.
        tracing::debug!(
            packets_sent = self.packets_sent,
            "request cancelled mid-message, terminating with EOM|IGNORE"
        );
        let status = PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE;
        self.send_current(shared, packet_type, status).await?;
        self.message_type = None;
        self.packets_sent = 0;

        shared.send_attention().await?;
        Err(SessionError::OperationCancelled)
    }

    async fn send_current(
        &mut self,
        shared: &SessionShared,
        packet_type: PacketType,
        status: PacketStatus,
    ) -> Result<()> {
        // Materialise secrets into the pinned output buffer only now,
        // right before the frame is handed to the transport.
        for placed in self.secrets.drain(..) {
            if !self.out.overwrite_payload(placed.offset, &placed.secret.bytes) {
                return Err(SessionError::InvalidState(
                    "secret placement outside written payload",
                ));
            }
        }

        let mut frame = self.out.stamp_and_take(packet_type, status, shared.channel());

        self.pending.begin();
        let result = {
            let mut writer = shared.writer().lock().await;
            writer.send_frame(&frame).await
        };
        self.pending.complete(&result);

        // Wipe the frame; it may have carried secret plaintext.
        for b in frame.iter_mut() {
            *b = 0;
        }

        if result.is_ok() {
            self.packets_sent += 1;
        }
        result
    }

    pub(crate) fn set_packet_size(&mut self, size: usize) {
        self.out.set_capacity(size);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::session::Session;
    use tds_wire::{PacketType, PACKET_HEADER_SIZE};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_write_secret_length() {
        let secret = WriteSecret::new(b"hunter2".to_vec());
        assert_eq!(secret.len(), 7);
        assert!(!secret.is_empty());
    }

    #[tokio::test]
    async fn test_secret_materialised_at_flush() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(Box::new(client));

        session.begin_request(PacketType::Tds7Login, 1).unwrap();
        // Reserve placeholder bytes, then point the secret at them.
        session.write_request_bytes(&[0u8; 16]).await.unwrap();
        session
            .place_secret(WriteSecret::new(b"s3cret".to_vec()), 4)
            .unwrap();
        session.flush_request(FlushMode::Hard).await.unwrap();

        let mut frame = vec![0u8; PACKET_HEADER_SIZE + 16];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[PACKET_HEADER_SIZE + 4..PACKET_HEADER_SIZE + 10], b"s3cret");
    }

    #[tokio::test]
    async fn test_at_most_two_secrets_in_flight() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(Box::new(client));

        session.begin_request(PacketType::Tds7Login, 1).unwrap();
        session.write_request_bytes(&[0u8; 32]).await.unwrap();

        session
            .place_secret(WriteSecret::new(vec![1; 4]), 0)
            .unwrap();
        session
            .place_secret(WriteSecret::new(vec![2; 4]), 8)
            .unwrap();
        assert!(matches!(
            session.place_secret(WriteSecret::new(vec![3; 4]), 16),
            Err(SessionError::TooManySecrets)
        ));
    }

    #[tokio::test]
    async fn test_secret_outside_payload_rejected() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(Box::new(client));

        session.begin_request(PacketType::Tds7Login, 1).unwrap();
        session.write_request_bytes(&[0u8; 4]).await.unwrap();
        assert!(matches!(
            session.place_secret(WriteSecret::new(vec![1; 8]), 0),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_writes_settle_after_flush() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(Box::new(client));
        let pending = session.pending_writes();

        session.begin_request(PacketType::SqlBatch, 1).unwrap();
        session.write_request_bytes(b"\x01").await.unwrap();
        session.flush_request(FlushMode::Hard).await.unwrap();

        assert_eq!(pending.outstanding(), 0);
        pending.wait_for_accumulated_writes().await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_while_in_message_is_rejected() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let mut session = Session::new(Box::new(client));

        session.begin_request(PacketType::SqlBatch, 1).unwrap();
        assert!(matches!(
            session.begin_request(PacketType::SqlBatch, 2),
            Err(SessionError::InvalidState(_))
        ));
    }
}
