//! The per-session protocol state object.
//!
//! A [`Session`] owns the framed byte stream to one server and aggregates
//! the read pipeline, write pipeline, snapshot machinery, timeout
//! supervisor, diagnostics collections, and transaction registry. The
//! read side is single-consumer by `&mut` construction; the write half
//! and all cross-task state live in [`SessionShared`] behind the writer
//! lock, so an attention packet can be sent from a cancel handle or the
//! timeout path while a read is in flight.

use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tds_wire::{
    Done, EnvChange, EnvChangeKind, LoginAck, PacketType, ServerError, ServerInfo, TokenType,
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE,
};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Notify;

use crate::error::{Result, SessionError, UNASSOCIATED_OPERATION};
use crate::events;
use crate::reader::{ReadOutcome, ReadPipeline};
use crate::snapshot::ReadSnapshot;
use crate::timeout::TimeoutSupervisor;
use crate::transaction::{TransactionEvent, TransactionRegistry};
use crate::transport::{BoxedTransport, Packet, PacketDecoder, PacketReader, PacketWriter};
use crate::writer::{FlushMode, PendingWrites, WritePipeline, WriteSecret};

/// Bounded poll interval used when a cancel path competes for a lock with
/// a concurrent close.
const CANCEL_LOCK_POLL: Duration = Duration::from_millis(100);

type SharedWriter = PacketWriter<WriteHalf<BoxedTransport>>;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// Usable.
    Healthy = 0,
    /// A fatal error occurred; the session must not be reused.
    Broken = 1,
    /// Closed by the owner.
    Closed = 2,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Broken,
            2 => Self::Closed,
            _ => Self::Healthy,
        }
    }
}

/// Opaque tag held by the command that currently owns a session.
///
/// Orphan detection compares the session's activation count against the
/// liveness of the weak reference to this tag.
#[derive(Debug, Default)]
pub struct SessionOwner;

/// Error and warning collections, guarded by a single lock.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<SessionError>,
    warnings: Vec<SessionError>,
    attention_errors: Vec<SessionError>,
    attention_warnings: Vec<SessionError>,
    stored_for_attention: bool,
}

impl Diagnostics {
    fn add_error(&mut self, error: SessionError) {
        self.errors.push(error);
    }

    fn add_warning(&mut self, warning: SessionError) {
        self.warnings.push(warning);
    }

    /// Move the current collections aside while attention is outstanding,
    /// so errors caused by the attention itself don't mask the original
    /// failure.
    fn store_for_attention(&mut self) {
        self.attention_errors = std::mem::take(&mut self.errors);
        self.attention_warnings = std::mem::take(&mut self.warnings);
        self.stored_for_attention = true;
    }

    /// Restore the pre-attention collections, ahead of anything recorded
    /// while the attention was outstanding.
    fn restore_after_attention(&mut self) {
        if !self.stored_for_attention {
            return;
        }
        let mut errors = std::mem::take(&mut self.attention_errors);
        errors.append(&mut self.errors);
        self.errors = errors;

        let mut warnings = std::mem::take(&mut self.attention_warnings);
        warnings.append(&mut self.warnings);
        self.warnings = warnings;

        self.stored_for_attention = false;
    }

    fn take_all(&mut self) -> (Vec<SessionError>, Vec<SessionError>) {
        (
            std::mem::take(&mut self.errors),
            std::mem::take(&mut self.warnings),
        )
    }

    fn error_count(&self) -> usize {
        self.errors.len()
    }
}

/// State shared between the session, cancel handles, and the timeout path.
pub struct SessionShared {
    writer: tokio::sync::Mutex<SharedWriter>,
    status: AtomicU8,
    cancelled: AtomicBool,
    attention_sent: AtomicBool,
    attention_sending: AtomicBool,
    pending_data: AtomicBool,
    in_pool: AtomicBool,
    logged_in: AtomicBool,
    sync_mode_requested: AtomicBool,
    current_operation: AtomicI64,
    activation_count: AtomicU32,
    channel: AtomicU16,
    owner: Mutex<Weak<SessionOwner>>,
    diagnostics: Mutex<Diagnostics>,
    /// Serialises the cancel/close interlock.
    cancel_gate: Mutex<()>,
    supervisor: TimeoutSupervisor,
    ack_notify: Notify,
    registry: Mutex<TransactionRegistry>,
    session_id: u64,
}

impl SessionShared {
    fn new(writer: SharedWriter, session_id: u64) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            status: AtomicU8::new(SessionStatus::Healthy as u8),
            cancelled: AtomicBool::new(false),
            attention_sent: AtomicBool::new(false),
            attention_sending: AtomicBool::new(false),
            pending_data: AtomicBool::new(false),
            in_pool: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            sync_mode_requested: AtomicBool::new(false),
            current_operation: AtomicI64::new(UNASSOCIATED_OPERATION),
            activation_count: AtomicU32::new(0),
            channel: AtomicU16::new(0),
            owner: Mutex::new(Weak::new()),
            diagnostics: Mutex::new(Diagnostics::default()),
            cancel_gate: Mutex::new(()),
            supervisor: TimeoutSupervisor::new(),
            ack_notify: Notify::new(),
            registry: Mutex::new(TransactionRegistry::new(session_id)),
            session_id,
        }
    }

    /// Numeric object id for diagnostics.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Check that the session is neither broken nor closed.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status() == SessionStatus::Healthy
    }

    /// Mark the session broken.
    ///
    /// The store is published before any waiter inspects a pending
    /// completion source, hence the full fence.
    pub fn mark_broken(&self) {
        let prev = self
            .status
            .swap(SessionStatus::Broken as u8, Ordering::AcqRel);
        fence(Ordering::SeqCst);
        self.ack_notify.notify_waiters();
        if prev != SessionStatus::Broken as u8 {
            tracing::warn!(session_id = self.session_id, "session marked broken");
            events::with_sink(|s| s.session_broken(self.session_id));
        }
    }

    fn mark_closed(&self) {
        self.status
            .store(SessionStatus::Closed as u8, Ordering::Release);
        fence(Ordering::SeqCst);
        self.ack_notify.notify_waiters();
    }

    /// Whether the session currently sits in a pool.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.in_pool.load(Ordering::Acquire)
    }

    /// Record pool membership.
    pub fn set_pooled(&self, pooled: bool) {
        self.in_pool.store(pooled, Ordering::Release);
    }

    /// Whether login has completed on this session.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Record login completion (driven by the authentication collaborator
    /// or by a LOGINACK token).
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
    }

    /// Timeout supervisor for this session.
    #[must_use]
    pub fn supervisor(&self) -> &TimeoutSupervisor {
        &self.supervisor
    }

    /// Transaction registry for this session.
    #[must_use]
    pub fn registry(&self) -> &Mutex<TransactionRegistry> {
        &self.registry
    }

    /// Whether a cancel has been requested for the current operation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether an attention packet has been sent and not yet acknowledged.
    #[must_use]
    pub fn attention_sent(&self) -> bool {
        self.attention_sent.load(Ordering::Acquire)
    }

    pub(crate) fn channel(&self) -> u16 {
        self.channel.load(Ordering::Acquire)
    }

    pub(crate) fn set_channel(&self, channel: u16) {
        self.channel.store(channel, Ordering::Release);
    }

    pub(crate) fn writer(&self) -> &tokio::sync::Mutex<SharedWriter> {
        &self.writer
    }

    /// Record an error; class >= 20 breaks the session, and subsequent
    /// reads are forced synchronous.
    pub fn add_error_record(&self, error: SessionError) {
        let fatal = error.is_fatal();
        tracing::debug!(session_id = self.session_id, %error, "recording session error");
        self.diagnostics.lock().add_error(error);
        self.sync_mode_requested.store(true, Ordering::Release);
        if fatal {
            self.mark_broken();
        }
    }

    /// Record a warning.
    pub fn add_warning_record(&self, warning: SessionError) {
        self.diagnostics.lock().add_warning(warning);
        self.sync_mode_requested.store(true, Ordering::Release);
    }

    /// Take all accumulated errors and warnings, plus the broken bit.
    pub fn take_full_and_clear(&self) -> (Vec<SessionError>, Vec<SessionError>, bool) {
        let (errors, warnings) = self.diagnostics.lock().take_all();
        (errors, warnings, self.status() == SessionStatus::Broken)
    }

    /// Number of errors currently recorded.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.diagnostics.lock().error_count()
    }

    fn take_sync_mode_request(&self) -> bool {
        self.sync_mode_requested.swap(false, Ordering::AcqRel)
    }

    /// Send the attention packet once, moving the diagnostics aside first.
    ///
    /// Idempotent: a second call while an attention is outstanding is a
    /// no-op.
    pub(crate) async fn send_attention(&self) -> Result<()> {
        if self.attention_sent.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.attention_sending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.diagnostics.lock().store_for_attention();

        let result = {
            let mut writer = match self.acquire_writer_bounded().await {
                Ok(writer) => writer,
                Err(e) => {
                    self.attention_sending.store(false, Ordering::Release);
                    return Err(e);
                }
            };
            writer.send_attention(self.channel()).await
        };

        match &result {
            Ok(()) => {
                self.attention_sent.store(true, Ordering::Release);
                events::with_sink(|s| s.attention_sent(self.session_id));
            }
            Err(_) => self.mark_broken(),
        }
        self.attention_sending.store(false, Ordering::Release);
        result
    }

    /// Acquire the writer lock with a bounded wait, giving up if the
    /// session dies while polling (avoids deadlock with a concurrent
    /// close).
    async fn acquire_writer_bounded(
        &self,
    ) -> Result<tokio::sync::MutexGuard<'_, SharedWriter>> {
        loop {
            match tokio::time::timeout(CANCEL_LOCK_POLL, self.writer.lock()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => {
                    if !self.is_alive() {
                        return Err(SessionError::SessionBroken);
                    }
                }
            }
        }
    }

    /// Cancel the operation identified by `operation_id`.
    ///
    /// Returns true when the cancel was accepted (it targeted the current
    /// operation). The reserved sentinel `-1` never matches. Idempotent;
    /// a no-op once the session is broken or closed.
    pub async fn cancel(&self, operation_id: i64) -> Result<bool> {
        if !self.is_alive() {
            return Ok(false);
        }

        let needs_attention = {
            let _gate = loop {
                if let Some(guard) = self.cancel_gate.try_lock_for(CANCEL_LOCK_POLL) {
                    break guard;
                }
                if !self.is_alive() {
                    return Ok(false);
                }
            };

            let current = self.current_operation.load(Ordering::Acquire);
            if current == UNASSOCIATED_OPERATION || current != operation_id {
                return Ok(false);
            }
            if self.cancelled.swap(true, Ordering::AcqRel) {
                return Ok(true);
            }
            self.pending_data.load(Ordering::Acquire) && !self.attention_sent()
        };

        if needs_attention {
            self.send_attention().await?;
        }
        Ok(true)
    }

    /// Wait until an outstanding attention is acknowledged, or the
    /// session dies.
    pub async fn wait_attention_acknowledged(&self) {
        while self.attention_sent() && self.is_alive() {
            self.ack_notify.notified().await;
        }
    }

    fn begin_operation(&self, operation_id: i64) -> u64 {
        self.current_operation
            .store(operation_id, Ordering::Release);
        self.cancelled.store(false, Ordering::Release);
        self.supervisor.begin_operation()
    }

    fn finish_operation(&self) {
        self.supervisor.finish_operation();
        self.current_operation
            .store(UNASSOCIATED_OPERATION, Ordering::Release);
        self.pending_data.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionShared")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .field("attention_sent", &self.attention_sent())
            .finish_non_exhaustive()
    }
}

/// Handle for cancelling the current operation on a session.
///
/// Cloneable and sendable to other tasks; cancellation works while the
/// session's owner is blocked reading results.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<SessionShared>,
}

impl CancelHandle {
    /// Cancel the operation identified by `operation_id`.
    pub async fn cancel(&self, operation_id: i64) -> Result<bool> {
        self.shared.cancel(operation_id).await
    }

    /// Whether a cancel is in progress (attention outstanding).
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.shared.is_cancelled() && self.shared.attention_sent()
    }

    /// Wait for the server to acknowledge the cancellation.
    pub async fn wait_cancelled(&self) {
        self.shared.wait_attention_acknowledged().await;
    }
}

/// Summary of a fully consumed control response.
#[derive(Debug)]
pub struct ResponseSummary {
    /// The final DONE token.
    pub done: Done,
    /// Transaction state changes observed in the response.
    pub transaction_events: Vec<TransactionEvent>,
    /// Whether any error token was observed.
    pub had_error: bool,
}

/// The per-session protocol state object.
pub struct Session {
    reader: PacketReader<ReadHalf<BoxedTransport>>,
    shared: Arc<SessionShared>,
    pipeline: ReadPipeline,
    write: WritePipeline,
    snapshot: Option<ReadSnapshot>,
    packet_size: usize,
    pending_packet_size: Option<usize>,
    timer_identity: u64,
    spid: u16,
}

impl Session {
    /// Create a session over the given transport with the default packet
    /// size.
    #[must_use]
    pub fn new(transport: BoxedTransport) -> Self {
        Self::build(transport, DEFAULT_PACKET_SIZE)
    }

    /// Create a session with a specific negotiated packet size.
    pub fn with_packet_size(transport: BoxedTransport, packet_size: usize) -> Result<Self> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&packet_size) {
            return Err(SessionError::InvalidPacketSize(packet_size));
        }
        Ok(Self::build(transport, packet_size))
    }

    fn build(transport: BoxedTransport, packet_size: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let session_id = events::next_session_id();
        tracing::debug!(session_id, packet_size, "session created");
        Self {
            reader: PacketReader::new(read_half, PacketDecoder::new(packet_size)),
            shared: Arc::new(SessionShared::new(PacketWriter::new(write_half), session_id)),
            pipeline: ReadPipeline::new(packet_size),
            write: WritePipeline::new(packet_size),
            snapshot: None,
            packet_size,
            pending_packet_size: None,
            timer_identity: 0,
            spid: 0,
        }
    }

    /// Shared half of the session.
    #[must_use]
    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Handle for cancelling operations from other tasks.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// The read pipeline, for the response parser that sits above the
    /// session.
    #[must_use]
    pub fn pipeline(&self) -> &ReadPipeline {
        &self.pipeline
    }

    /// Mutable access to the read pipeline.
    pub fn pipeline_mut(&mut self) -> &mut ReadPipeline {
        &mut self.pipeline
    }

    /// Server-assigned session id echoed in packet headers.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Whether the session is usable for another request.
    #[must_use]
    pub fn check_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Resize both packet buffers. Only legal while both are empty.
    pub fn set_packet_size(&mut self, size: usize) -> Result<()> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
            return Err(SessionError::InvalidPacketSize(size));
        }
        if !self.pipeline.input().is_empty() || !self.write.output().is_empty() {
            return Err(SessionError::InvalidState(
                "packet buffers must be empty to resize",
            ));
        }
        self.packet_size = size;
        self.pipeline.input_mut().set_capacity(size);
        self.write.set_packet_size(size);
        self.reader.decoder_mut().set_max_packet_size(size);
        tracing::debug!(session_id = self.shared.session_id, size, "packet size changed");
        Ok(())
    }

    /// Accounting for writes handed to the transport.
    #[must_use]
    pub fn pending_writes(&self) -> Arc<PendingWrites> {
        Arc::clone(self.write.pending())
    }

    // ---- ownership / orphan detection -----------------------------------

    /// Activate the session for an owner (MARS usage counting).
    pub fn activate(&self, owner: &Arc<SessionOwner>) {
        self.shared
            .activation_count
            .fetch_add(1, Ordering::AcqRel);
        *self.shared.owner.lock() = Arc::downgrade(owner);
    }

    /// Deactivate the session, releasing the owner slot.
    pub fn deactivate(&self) {
        let count = &self.shared.activation_count;
        let mut current = count.load(Ordering::Acquire);
        while current > 0 {
            match count.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        *self.shared.owner.lock() = Weak::new();
    }

    /// Whether the session was abandoned by its owner without being
    /// closed.
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.shared.activation_count.load(Ordering::Acquire) > 0
            && self.shared.owner.lock().strong_count() == 0
    }

    /// Reclaim an orphaned session: drain any pending response and reset
    /// it for pool reuse. Returns true if reclamation happened.
    pub async fn reclaim_orphan(&mut self) -> Result<bool> {
        if !self.is_orphaned() {
            return Ok(false);
        }
        tracing::debug!(session_id = self.shared.session_id, "reclaiming orphaned session");
        if self.pipeline.pending_data() && !self.pipeline.input().end_of_message_received() {
            loop {
                let packet = self.read_live_packet().await?;
                if packet.header.is_end_of_message() {
                    break;
                }
            }
        }
        self.pipeline.reset_message();
        self.snapshot = None;
        self.shared.finish_operation();
        self.shared.activation_count.store(0, Ordering::Release);
        *self.shared.owner.lock() = Weak::new();
        Ok(true)
    }

    // ---- write side ------------------------------------------------------

    /// Begin a request message of the given packet type.
    pub fn begin_request(&mut self, packet_type: PacketType, operation_id: i64) -> Result<()> {
        self.ensure_usable()?;
        if self.pipeline.pending_data() {
            return Err(SessionError::InvalidState(
                "a response is still pending on this session",
            ));
        }
        self.write.begin_message(packet_type)?;
        self.timer_identity = self.shared.begin_operation(operation_id);
        Ok(())
    }

    /// Append request bytes, soft-flushing full packets.
    pub async fn write_request_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.write.write_bytes(&self.shared, src).await
    }

    /// Append one request byte.
    pub async fn write_request_u8(&mut self, value: u8) -> Result<()> {
        self.write.write_u8(&self.shared, value).await
    }

    /// Register a secret to be materialised into the current packet at
    /// `offset` just before it is handed to the transport.
    pub fn place_secret(&mut self, secret: WriteSecret, offset: usize) -> Result<()> {
        self.write.place_secret(secret, offset)
    }

    /// Flush the current packet.
    pub async fn flush_request(&mut self, mode: FlushMode) -> Result<()> {
        self.write.flush(&self.shared, mode).await?;
        if mode == FlushMode::Hard {
            self.pipeline.set_pending_data(true);
            self.shared.pending_data.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Request the RESET_CONNECTION flag on the next message.
    pub fn set_reset_connection(&mut self, reset: bool) {
        self.write.set_reset_connection(reset);
    }

    /// Send a complete single-payload request.
    pub async fn send_request(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        operation_id: i64,
    ) -> Result<()> {
        self.begin_request(packet_type, operation_id)?;
        self.write_request_bytes(payload).await?;
        self.flush_request(FlushMode::Hard).await
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.shared.status() {
            SessionStatus::Healthy => {}
            SessionStatus::Broken => return Err(SessionError::SessionBroken),
            SessionStatus::Closed => return Err(SessionError::ConnectionClosed),
        }
        if self.shared.attention_sent() {
            return Err(SessionError::InvalidState(
                "attention acknowledgment outstanding",
            ));
        }
        Ok(())
    }

    // ---- read side -------------------------------------------------------

    /// Drive a pipeline read to completion, filling packets on suspension.
    async fn resume<T>(
        &mut self,
        mut op: impl FnMut(&mut ReadPipeline) -> Result<ReadOutcome<T>>,
    ) -> Result<T> {
        loop {
            self.check_interrupts().await?;
            match op(&mut self.pipeline)? {
                ReadOutcome::Ready(value) => return Ok(value),
                ReadOutcome::NeedsData => self.fill_one_packet().await?,
            }
        }
    }

    /// Read one byte.
    pub async fn read_u8(&mut self) -> Result<u8> {
        self.resume(|p| p.try_read_u8()).await
    }

    /// Read a little-endian u16.
    pub async fn read_u16(&mut self) -> Result<u16> {
        self.resume(|p| p.try_read_u16()).await
    }

    /// Read a little-endian i32.
    pub async fn read_i32(&mut self) -> Result<i32> {
        self.resume(|p| p.try_read_i32()).await
    }

    /// Read a little-endian u64.
    pub async fn read_u64(&mut self) -> Result<u64> {
        self.resume(|p| p.try_read_u64()).await
    }

    /// Read exactly `len` bytes.
    pub async fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.resume(|p| p.try_read_bytes(Some(&mut buf[..]), len))
            .await?;
        Ok(buf)
    }

    /// Skip exactly `len` bytes.
    pub async fn skip_bytes(&mut self, len: usize) -> Result<()> {
        self.resume(|p| p.try_read_bytes(None, len)).await
    }

    /// Read `char_count` UTF-16LE code units.
    pub async fn read_string_utf16(&mut self, char_count: usize) -> Result<String> {
        self.resume(|p| p.try_read_string_utf16(char_count)).await
    }

    /// Read the 8-byte PLP total length.
    pub async fn read_plp_length(&mut self) -> Result<tds_wire::PlpLength> {
        self.resume(|p| p.try_read_plp_length()).await
    }

    /// Read a whole PLP stream into `dest`; returns its total length.
    pub async fn read_plp_bytes(&mut self, dest: &mut Vec<u8>) -> Result<u64> {
        let mut staged = std::mem::take(dest);
        let result = self
            .resume(|p| p.try_read_plp_bytes(&mut staged))
            .await;
        *dest = staged;
        result
    }

    async fn check_interrupts(&mut self) -> Result<()> {
        match self.shared.status() {
            SessionStatus::Healthy => {}
            SessionStatus::Broken => return Err(SessionError::SessionBroken),
            SessionStatus::Closed => return Err(SessionError::ConnectionClosed),
        }
        if self.shared.take_sync_mode_request() {
            self.pipeline.set_sync_over_async(true);
        }
        if self.shared.is_cancelled() {
            if self.shared.attention_sent() {
                self.drain_to_attention_ack().await?;
            } else {
                self.shared.cancelled.store(false, Ordering::Release);
                self.shared.finish_operation();
                self.pipeline.reset_message();
            }
            return Err(SessionError::OperationCancelled);
        }
        Ok(())
    }

    async fn fill_one_packet(&mut self) -> Result<()> {
        // Buffered replay first: a replayed packet is never re-requested
        // from the transport.
        if let Some(snap) = self.snapshot.as_mut() {
            if let Some((header, payload)) = snap.next_replay() {
                self.pipeline.input_mut().append(&header, &payload);
                return Ok(());
            }
        }

        if self.pipeline.input().end_of_message_received()
            && self.pipeline.input().available() == 0
        {
            return Err(SessionError::CorruptedStream(
                "attempt to read past end of message",
            ));
        }

        let packet = self.read_live_packet().await?;
        if let Some(snap) = self.snapshot.as_mut() {
            snap.record(packet.header, &packet.payload);
        }
        self.spid = packet.header.channel;
        self.shared.set_channel(packet.header.channel);
        self.pipeline
            .input_mut()
            .append(&packet.header, &packet.payload);
        Ok(())
    }

    async fn read_live_packet(&mut self) -> Result<Packet> {
        let deadline = self.shared.supervisor.timeout();
        match deadline {
            Some(limit) => match tokio::time::timeout(limit, self.read_live_packet_raw()).await {
                Ok(inner) => inner,
                Err(_) => Err(self.handle_sync_timeout().await),
            },
            None => self.read_live_packet_raw().await,
        }
    }

    /// Read one packet with no operation deadline applied. Used by the
    /// attention drain, which is bounded by the grace period instead.
    async fn read_live_packet_raw(&mut self) -> Result<Packet> {
        match self.reader.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => {
                self.shared.mark_broken();
                Err(e)
            }
            None => {
                self.shared.mark_broken();
                Err(SessionError::ConnectionClosed)
            }
        }
    }

    /// Handle expiration observed on the synchronous wait path.
    async fn handle_sync_timeout(&mut self) -> SessionError {
        if !self.shared.supervisor.expire(self.timer_identity, true) {
            return SessionError::Timeout;
        }
        tracing::debug!(session_id = self.shared.session_id, "operation timed out");
        events::with_sink(|s| s.timeout_expired(self.shared.session_id));

        // A pooled (or not yet logged-in) session must not start the
        // attention dance; it is broken outright.
        if self.shared.is_pooled() || !self.shared.is_logged_in() {
            self.shared
                .add_error_record(SessionError::timeout_expired());
            self.shared.mark_broken();
            return SessionError::Timeout;
        }

        self.shared
            .add_error_record(SessionError::timeout_expired());
        self.pipeline.set_sync_over_async(true);
        if let Err(e) = self.shared.send_attention().await {
            return e;
        }

        match self.drain_to_attention_ack().await {
            Ok(()) => SessionError::Timeout,
            Err(SessionError::Timeout) => SessionError::Timeout,
            Err(e) => e,
        }
    }

    /// Drain the response stream until the server's attention
    /// acknowledgment (a DONE token with the attention bit, closing an
    /// EOM packet), then restore the session to a clean state.
    ///
    /// The drain is bounded by the supervisor's attention grace period;
    /// if no acknowledgment arrives within it the session is broken.
    pub async fn drain_to_attention_ack(&mut self) -> Result<()> {
        self.snapshot = None;

        // The acknowledgment may already sit in the input buffer.
        if self.buffered_attention_ack() {
            self.finish_attention();
            return Ok(());
        }
        self.pipeline.input_mut().reset();

        let grace = self.shared.supervisor.attention_grace();
        match tokio::time::timeout(grace, self.drain_loop()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    session_id = self.shared.session_id,
                    "no attention acknowledgment within grace period"
                );
                self.shared.mark_broken();
                Err(SessionError::Timeout)
            }
        }
    }

    async fn drain_loop(&mut self) -> Result<()> {
        loop {
            let packet = self.read_live_packet_raw().await?;
            if packet.header.is_end_of_message()
                && payload_ends_with_attention_ack(&packet.payload)
            {
                self.finish_attention();
                return Ok(());
            }
            // Anything else is abandoned output from before the attention.
        }
    }

    fn buffered_attention_ack(&self) -> bool {
        let input = self.pipeline.input();
        input.end_of_message_received() && payload_ends_with_attention_ack(input.peek())
    }

    fn finish_attention(&mut self) {
        tracing::debug!(
            session_id = self.shared.session_id,
            "attention acknowledged, session clean"
        );
        self.pipeline.reset_message();
        self.pipeline.set_attention_received(true);
        self.shared.cancelled.store(false, Ordering::Release);
        self.shared.attention_sent.store(false, Ordering::Release);
        self.shared.finish_operation();
        self.shared.diagnostics.lock().restore_after_attention();
        self.shared.ack_notify.notify_waiters();
        events::with_sink(|s| s.attention_acknowledged(self.shared.session_id));
    }

    // ---- snapshots -------------------------------------------------------

    /// Start recording packets for a retryable read.
    pub fn begin_snapshot(&mut self) {
        self.snapshot = Some(ReadSnapshot::capture(&self.pipeline));
    }

    /// Commit the snapshot: the operation's progress is final.
    pub fn commit_snapshot(&mut self) {
        self.snapshot = None;
    }

    /// Roll back to the snapshot point; buffered packets will replay
    /// before any live read.
    pub fn rollback_snapshot(&mut self) -> bool {
        match self.snapshot.as_mut() {
            Some(snap) => {
                snap.rollback(&mut self.pipeline);
                true
            }
            None => false,
        }
    }

    /// The active snapshot, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<&ReadSnapshot> {
        self.snapshot.as_ref()
    }

    // ---- response processing --------------------------------------------

    /// Consume a control response (login, transaction manager) to its
    /// final DONE token, dispatching environment changes and diagnostics.
    pub async fn process_until_done(&mut self) -> Result<ResponseSummary> {
        let mut transaction_events = Vec::new();
        let mut had_error = false;

        loop {
            let token_byte = self.read_u8().await?;
            match TokenType::from_u8(token_byte) {
                Some(TokenType::EnvChange) => {
                    let len = self.read_u16().await? as usize;
                    let body = self.read_bytes(len).await?;
                    let env = EnvChange::decode_body(&mut &body[..])?;
                    if let Some(event) = self.handle_env_change(&env) {
                        transaction_events.push(event);
                    }
                }
                Some(TokenType::Error) => {
                    let len = self.read_u16().await? as usize;
                    let body = self.read_bytes(len).await?;
                    let err = ServerError::decode_body(&mut &body[..])?;
                    had_error = true;
                    self.pipeline.mark_error_token();
                    self.shared.add_error_record(SessionError::Server {
                        number: err.number,
                        class: err.class,
                        state: err.state,
                        message: err.message,
                        server: err.server,
                        procedure: err.procedure,
                        line: err.line,
                    });
                }
                Some(TokenType::Info) => {
                    let len = self.read_u16().await? as usize;
                    let body = self.read_bytes(len).await?;
                    let info = ServerInfo::decode_body(&mut &body[..])?;
                    tracing::debug!(number = info.number, message = %info.message, "server info");
                    self.shared.add_warning_record(SessionError::Server {
                        number: info.number,
                        class: info.class,
                        state: info.state,
                        message: info.message,
                        server: info.server,
                        procedure: info.procedure,
                        line: info.line,
                    });
                }
                Some(TokenType::LoginAck) => {
                    let len = self.read_u16().await? as usize;
                    let body = self.read_bytes(len).await?;
                    let ack = LoginAck::decode_body(&mut &body[..])?;
                    tracing::info!(
                        prog_name = %ack.prog_name,
                        tds_version = format_args!("0x{:08X}", ack.tds_version),
                        "login acknowledged"
                    );
                    self.shared.set_logged_in(true);
                }
                Some(TokenType::Order) => {
                    let len = self.read_u16().await? as usize;
                    self.skip_bytes(len).await?;
                }
                Some(TokenType::Done | TokenType::DoneProc | TokenType::DoneInProc) => {
                    let body = self.read_bytes(Done::SIZE).await?;
                    let done = Done::decode(&mut &body[..])?;
                    if done.is_attention_ack() {
                        self.finish_attention();
                        return Err(SessionError::OperationCancelled);
                    }
                    if !done.has_more() {
                        self.finish_message();
                        return Ok(ResponseSummary {
                            done,
                            transaction_events,
                            had_error,
                        });
                    }
                }
                Some(TokenType::ColMetaData | TokenType::Row | TokenType::NbcRow) => {
                    return Err(SessionError::CorruptedStream(
                        "data token in a control response",
                    ));
                }
                None => {
                    return Err(SessionError::Protocol(
                        tds_wire::WireError::UnknownTokenType(token_byte),
                    ));
                }
            }
        }
    }

    fn handle_env_change(&mut self, env: &EnvChange) -> Option<TransactionEvent> {
        match env.kind {
            EnvChangeKind::PacketSize => {
                if let Some(size) = env.packet_size() {
                    tracing::debug!(size, "server changed packet size");
                    self.pending_packet_size = Some(size);
                }
                None
            }
            EnvChangeKind::Database | EnvChangeKind::Language => {
                if let tds_wire::EnvValue::String(value) = &env.new_value {
                    tracing::debug!(kind = ?env.kind, value = %value, "environment changed");
                }
                None
            }
            _ => self.shared.registry.lock().apply_env_change(env),
        }
    }

    /// Mark the current response fully consumed and apply any deferred
    /// packet-size change.
    pub fn finish_message(&mut self) {
        self.pipeline.reset_message();
        self.shared.finish_operation();
        if let Some(size) = self.pending_packet_size.take() {
            if self.set_packet_size(size).is_err() {
                tracing::warn!(size, "deferred packet size change rejected");
            }
        }
    }

    /// Take all accumulated errors and warnings, plus the broken bit.
    pub fn take_errors(&self) -> (Vec<SessionError>, Vec<SessionError>, bool) {
        self.shared.take_full_and_clear()
    }

    /// Close the session, shutting down the transport write side.
    pub async fn close(&mut self) {
        self.shared.mark_closed();
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(%e, "transport shutdown failed during close");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.shared.session_id)
            .field("spid", &self.spid)
            .field("packet_size", &self.packet_size)
            .field("status", &self.shared.status())
            .finish_non_exhaustive()
    }
}

/// Check whether a packet payload ends with a DONE token carrying the
/// attention bit.
fn payload_ends_with_attention_ack(payload: &[u8]) -> bool {
    if payload.len() < 1 + Done::SIZE {
        return false;
    }
    let tail = &payload[payload.len() - 1 - Done::SIZE..];
    if tail[0] != TokenType::Done as u8 {
        return false;
    }
    match Done::decode(&mut &tail[1..]) {
        Ok(done) => done.is_attention_ack(),
        Err(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use tds_wire::{DoneStatus, PacketStatus, PACKET_HEADER_SIZE};
    use tokio::io::AsyncWriteExt;

    fn frame(packet_type: PacketType, status: PacketStatus, payload: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        raw.push(packet_type as u8);
        raw.push(status.bits());
        raw.put_u16((PACKET_HEADER_SIZE + payload.len()) as u16);
        raw.put_u16(37); // spid
        raw.push(1);
        raw.push(0);
        raw.extend_from_slice(payload);
        raw
    }

    fn done_token(status: DoneStatus, row_count: u64) -> Vec<u8> {
        let mut buf = bytes::BytesMut::new();
        Done {
            status,
            cur_cmd: 0,
            row_count,
        }
        .encode(&mut buf);
        buf.to_vec()
    }

    fn attention_ack_payload() -> Vec<u8> {
        done_token(
            DoneStatus {
                attn: true,
                ..DoneStatus::default()
            },
            0,
        )
    }

    fn new_pair() -> (Session, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(256 * 1024);
        (Session::new(Box::new(client)), server)
    }

    #[tokio::test]
    async fn test_read_across_packets_updates_spid() {
        let (mut session, mut server) = new_pair();

        server
            .write_all(&frame(
                PacketType::TabularResult,
                PacketStatus::END_OF_MESSAGE,
                &[7, 0, 0, 0],
            ))
            .await
            .unwrap();

        assert_eq!(session.read_i32().await.unwrap(), 7);
        assert_eq!(session.spid(), 37);
    }

    #[tokio::test]
    async fn test_read_past_end_of_message_is_corrupt() {
        let (mut session, mut server) = new_pair();
        server
            .write_all(&frame(
                PacketType::TabularResult,
                PacketStatus::END_OF_MESSAGE,
                &[1],
            ))
            .await
            .unwrap();

        assert_eq!(session.read_u8().await.unwrap(), 1);
        assert!(matches!(
            session.read_u8().await,
            Err(SessionError::CorruptedStream(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_sends_attention_and_drain_restores_clean_state() {
        let (mut session, mut server) = new_pair();
        session.shared().set_logged_in(true);

        // Put a request on the wire so there is an operation to cancel.
        session
            .send_request(PacketType::SqlBatch, b"\x00", 42)
            .await
            .unwrap();

        // First response packet arrives.
        server
            .write_all(&frame(PacketType::TabularResult, PacketStatus::BATCH, &[9]))
            .await
            .unwrap();
        assert_eq!(session.read_u8().await.unwrap(), 9);

        // Cancel from a handle; attention goes out on the write half.
        let handle = session.cancel_handle();
        assert!(handle.cancel(42).await.unwrap());
        assert!(session.shared().attention_sent());

        // Cancel with the wrong operation id would have been refused.
        assert!(!handle.cancel(99).await.unwrap());

        // Server abandons output and acknowledges the attention.
        server
            .write_all(&frame(
                PacketType::TabularResult,
                PacketStatus::END_OF_MESSAGE,
                &attention_ack_payload(),
            ))
            .await
            .unwrap();

        let err = session.read_u8().await.unwrap_err();
        assert!(matches!(err, SessionError::OperationCancelled));
        assert!(!session.shared().attention_sent());
        assert!(!session.shared().is_cancelled());
        assert!(session.check_alive());

        // The attention frame reached the server.
        use tokio::io::AsyncReadExt;
        let mut sniff = vec![0u8; 4096];
        let n = server.read(&mut sniff).await.unwrap();
        assert!(sniff[..n].contains(&(PacketType::Attention as u8)));
    }

    #[tokio::test]
    async fn test_cancel_unassociated_operation_never_matches() {
        let (session, _server) = new_pair();
        let handle = session.cancel_handle();
        // No operation in flight: current is the -1 sentinel.
        assert!(!handle.cancel(UNASSOCIATED_OPERATION).await.unwrap());
        assert!(!handle.cancel(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_pooled_session_timeout_breaks_without_attention() {
        let (mut session, mut server) = new_pair();
        session.shared().set_logged_in(true);
        session.shared().set_pooled(true);
        session.shared().supervisor().set_timeout_ms(50);

        session
            .send_request(PacketType::SqlBatch, b"\x00", 1)
            .await
            .unwrap();

        // Server stalls: no response at all.
        let err = session.read_u8().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(session.shared().status(), SessionStatus::Broken);
        assert!(!session.shared().attention_sent());

        let (errors, _, broken) = session.take_errors();
        assert!(broken);
        assert!(errors
            .iter()
            .any(|e| e.is_server_error(crate::error::TIMEOUT_EXPIRED_NUMBER)));

        // Only the request frame must have been written, never attention.
        use tokio::io::AsyncReadExt;
        let mut sniff = vec![0u8; 4096];
        let n = server.read(&mut sniff).await.unwrap();
        assert_eq!(sniff[0], PacketType::SqlBatch as u8);
        assert!(!sniff[..n].contains(&(PacketType::Attention as u8)));
    }

    #[tokio::test]
    async fn test_timeout_with_ack_keeps_session_usable() {
        let (mut session, mut server) = new_pair();
        session.shared().set_logged_in(true);
        session.shared().supervisor().set_timeout_ms(50);

        session
            .send_request(PacketType::SqlBatch, b"\x00", 1)
            .await
            .unwrap();

        // Server only answers with the attention ack, after the timeout.
        let responder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            server
                .write_all(&frame(
                    PacketType::TabularResult,
                    PacketStatus::END_OF_MESSAGE,
                    &attention_ack_payload(),
                ))
                .await
                .unwrap();
            server
        });

        let err = session.read_u8().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert!(session.check_alive());
        assert!(!session.shared().attention_sent());

        let (errors, _, broken) = session.take_errors();
        assert!(!broken);
        assert!(errors
            .iter()
            .any(|e| e.is_server_error(crate::error::TIMEOUT_EXPIRED_NUMBER)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_without_ack_breaks_after_grace() {
        let (mut session, _server) = new_pair();
        session.shared().set_logged_in(true);
        session.shared().supervisor().set_timeout_ms(50);
        session
            .shared()
            .supervisor()
            .set_attention_grace(Duration::from_millis(100));

        session
            .send_request(PacketType::SqlBatch, b"\x00", 1)
            .await
            .unwrap();

        let err = session.read_u8().await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout));
        assert_eq!(session.shared().status(), SessionStatus::Broken);
    }

    #[tokio::test]
    async fn test_diagnostics_store_and_restore_around_attention() {
        let mut diag = Diagnostics::default();

        diag.add_error(SessionError::timeout_expired());
        diag.store_for_attention();
        assert_eq!(diag.error_count(), 0);

        diag.add_error(SessionError::ConnectionClosed);
        diag.restore_after_attention();

        let (errors, _) = diag.take_all();
        assert_eq!(errors.len(), 2);
        // The original failure comes first.
        assert!(errors[0].is_server_error(crate::error::TIMEOUT_EXPIRED_NUMBER));
    }

    #[tokio::test]
    async fn test_orphan_detection() {
        let (session, _server) = new_pair();
        assert!(!session.is_orphaned());

        let owner = Arc::new(SessionOwner);
        session.activate(&owner);
        assert!(!session.is_orphaned());

        drop(owner);
        assert!(session.is_orphaned());

        session.deactivate();
        assert!(!session.is_orphaned());
    }

    #[tokio::test]
    async fn test_packet_size_resize_requires_empty_buffers() {
        let (mut session, mut server) = new_pair();

        assert!(session.set_packet_size(8192).is_ok());
        assert!(matches!(
            session.set_packet_size(100),
            Err(SessionError::InvalidPacketSize(100))
        ));
        assert!(matches!(
            session.set_packet_size(40_000),
            Err(SessionError::InvalidPacketSize(_))
        ));

        // Buffer some unconsumed data: resize now refused.
        server
            .write_all(&frame(
                PacketType::TabularResult,
                PacketStatus::END_OF_MESSAGE,
                &[1, 2],
            ))
            .await
            .unwrap();
        session.read_u8().await.unwrap();
        assert!(matches!(
            session.set_packet_size(4096),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_fatal_server_error_breaks_session() {
        let (session, _server) = new_pair();
        session.shared().add_error_record(SessionError::Server {
            number: 5,
            class: 20,
            state: 1,
            message: "fatal".into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        });
        assert_eq!(session.shared().status(), SessionStatus::Broken);
    }

    #[test]
    fn test_attention_ack_tail_detection() {
        let ack = attention_ack_payload();
        assert!(payload_ends_with_attention_ack(&ack));

        let plain = done_token(DoneStatus::default(), 3);
        assert!(!payload_ends_with_attention_ack(&plain));

        // Ack preceded by abandoned row bytes still detected.
        let mut with_prefix = vec![0xD1, 0x01, 0x02];
        with_prefix.extend_from_slice(&ack);
        assert!(payload_ends_with_attention_ack(&with_prefix));
    }
}
