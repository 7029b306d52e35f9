//! Replayable read pipeline.
//!
//! The pipeline turns the framed byte stream into primitive values. Every
//! `try_read_*` operation returns a tristate: a completed value, a
//! suspension (`NeedsData`, more network data required), or an error.
//! Suspension leaves the parser position intact; the caller resumes by
//! delivering another packet to the input buffer and calling the same
//! operation again. Values that straddle the buffered data are staged in a
//! scratch buffer so no partial progress is lost across suspensions.
//!
//! The same incomplete-input discipline the packet decoder applies at the
//! frame level (`decode -> Ok(None)`) is applied here to typed reads.

use std::sync::Arc;

use encoding_rs::Encoding;
use tds_wire::{PacketStatus, PlpLength, PLP_TERMINATOR};

use crate::buffer::{InputBuffer, InputSave};
use crate::error::{Result, SessionError};

/// Outcome of a pipeline read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// The value is complete.
    Ready(T),
    /// More network data is required; parser position is preserved.
    NeedsData,
}

impl<T> ReadOutcome<T> {
    /// Map the contained value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadOutcome<U> {
        match self {
            Self::Ready(v) => ReadOutcome::Ready(f(v)),
            Self::NeedsData => ReadOutcome::NeedsData,
        }
    }

    /// Check if the value is complete.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Convert to an `Option`, discarding the suspension.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Ready(v) => Some(v),
            Self::NeedsData => None,
        }
    }
}

/// Shared null-bitmap cache for compressed row decoding.
///
/// The snapshot machinery shares this by reference and clones it on first
/// mutation, so a replay observes the bitmap as it was at snapshot time.
#[derive(Debug, Clone, Default)]
pub struct NullBitmapCache {
    bits: Arc<Vec<u8>>,
    column_count: usize,
}

impl NullBitmapCache {
    /// Replace the bitmap for a new row.
    pub fn reset(&mut self, column_count: usize, bits: Vec<u8>) {
        self.bits = Arc::new(bits);
        self.column_count = column_count;
    }

    /// Number of columns covered.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Check if the given column is null.
    #[must_use]
    pub fn is_null(&self, column: usize) -> bool {
        self.bits
            .get(column / 8)
            .is_some_and(|byte| byte & (1 << (column % 8)) != 0)
    }

    /// Mark a column null, copying the shared bitmap on first write.
    pub fn set_null(&mut self, column: usize) {
        let bits = Arc::make_mut(&mut self.bits);
        if let Some(byte) = bits.get_mut(column / 8) {
            *byte |= 1 << (column % 8);
        }
    }

    /// Check whether two caches share the same underlying allocation.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bits, &other.bits)
    }
}

/// Parser position captured by a read snapshot.
#[derive(Debug, Clone)]
pub(crate) struct ParserPosition {
    pub(crate) input: InputSave,
    scratch: [u8; 8],
    scratch_len: usize,
    bytes_progress: usize,
    str_scratch: Vec<u8>,
    plp_declared: Option<PlpLength>,
    plp_chunk_left: u64,
    plp_total_read: u64,
    pending_data: bool,
    error_token_received: bool,
    open_result: bool,
    column_metadata_received: bool,
    attention_received: bool,
    null_bitmap: NullBitmapCache,
}

#[cfg(test)]
impl ParserPosition {
    pub(crate) fn null_bitmap_for_test(&self) -> &NullBitmapCache {
        &self.null_bitmap
    }
}

/// Lazy stream of primitive values over the framed byte stream.
#[derive(Debug)]
pub struct ReadPipeline {
    input: InputBuffer,
    scratch: [u8; 8],
    scratch_len: usize,
    bytes_progress: usize,
    str_scratch: Vec<u8>,
    plp_declared: Option<PlpLength>,
    plp_chunk_left: u64,
    plp_total_read: u64,
    pending_data: bool,
    error_token_received: bool,
    sync_over_async: bool,
    open_result: bool,
    column_metadata_received: bool,
    attention_received: bool,
    null_bitmap: NullBitmapCache,
}

impl ReadPipeline {
    /// Create a pipeline over an empty input buffer of the given size.
    #[must_use]
    pub fn new(packet_size: usize) -> Self {
        Self {
            input: InputBuffer::new(packet_size),
            scratch: [0; 8],
            scratch_len: 0,
            bytes_progress: 0,
            str_scratch: Vec::new(),
            plp_declared: None,
            plp_chunk_left: 0,
            plp_total_read: 0,
            pending_data: false,
            error_token_received: false,
            sync_over_async: false,
            open_result: false,
            column_metadata_received: false,
            attention_received: false,
            null_bitmap: NullBitmapCache::default(),
        }
    }

    /// Access the input buffer.
    #[must_use]
    pub fn input(&self) -> &InputBuffer {
        &self.input
    }

    /// Mutable access to the input buffer.
    pub fn input_mut(&mut self) -> &mut InputBuffer {
        &mut self.input
    }

    /// Whether a response is outstanding on the wire.
    #[must_use]
    pub fn pending_data(&self) -> bool {
        self.pending_data
    }

    /// Mark a response outstanding (request sent) or fully consumed.
    pub fn set_pending_data(&mut self, pending: bool) {
        self.pending_data = pending;
    }

    /// Whether an error token has been observed in the current response.
    #[must_use]
    pub fn error_token_received(&self) -> bool {
        self.error_token_received
    }

    /// Record observation of an error token. Forces synchronous reads for
    /// the remainder of the operation.
    pub fn mark_error_token(&mut self) {
        self.error_token_received = true;
        self.sync_over_async = true;
    }

    /// Whether reads must complete synchronously.
    #[must_use]
    pub fn sync_over_async(&self) -> bool {
        self.sync_over_async
    }

    /// Toggle sync-over-async mode.
    pub fn set_sync_over_async(&mut self, on: bool) {
        self.sync_over_async = on;
    }

    /// Whether a result set is open in the current response.
    #[must_use]
    pub fn open_result(&self) -> bool {
        self.open_result
    }

    /// Set the open-result flag.
    pub fn set_open_result(&mut self, open: bool) {
        self.open_result = open;
    }

    /// Whether column metadata has been received in the current response.
    #[must_use]
    pub fn column_metadata_received(&self) -> bool {
        self.column_metadata_received
    }

    /// Set the column-metadata-received flag.
    pub fn set_column_metadata_received(&mut self, received: bool) {
        self.column_metadata_received = received;
    }

    /// Whether the attention acknowledgment has been consumed.
    #[must_use]
    pub fn attention_received(&self) -> bool {
        self.attention_received
    }

    /// Set the attention-received flag.
    pub fn set_attention_received(&mut self, received: bool) {
        self.attention_received = received;
    }

    /// Access the shared null-bitmap cache.
    #[must_use]
    pub fn null_bitmap(&self) -> &NullBitmapCache {
        &self.null_bitmap
    }

    /// Mutable access to the shared null-bitmap cache.
    pub fn null_bitmap_mut(&mut self) -> &mut NullBitmapCache {
        &mut self.null_bitmap
    }

    /// Declared PLP total for the value currently being read.
    #[must_use]
    pub fn plp_declared(&self) -> Option<PlpLength> {
        self.plp_declared
    }

    /// Remaining bytes of the current PLP chunk.
    #[must_use]
    pub fn plp_chunk_left(&self) -> u64 {
        self.plp_chunk_left
    }

    /// Status of the most recently received packet.
    #[must_use]
    pub fn message_status(&self) -> PacketStatus {
        self.input.message_status()
    }

    /// Clear all per-message state, keeping the configured buffer size.
    pub fn reset_message(&mut self) {
        self.input.reset();
        self.scratch_len = 0;
        self.bytes_progress = 0;
        self.str_scratch.clear();
        self.plp_declared = None;
        self.plp_chunk_left = 0;
        self.plp_total_read = 0;
        self.pending_data = false;
        self.error_token_received = false;
        self.sync_over_async = false;
        self.open_result = false;
        self.column_metadata_received = false;
        self.attention_received = false;
    }

    // ---- primitive reads ------------------------------------------------

    /// Take exactly `width` bytes (width <= 8), staging across suspensions.
    fn try_take(&mut self, width: usize) -> Result<ReadOutcome<[u8; 8]>> {
        debug_assert!(width <= 8);
        if self.scratch_len == 0 && self.input.available() >= width {
            let mut out = [0u8; 8];
            out[..width].copy_from_slice(&self.input.peek()[..width]);
            self.input.consume(width);
            return Ok(ReadOutcome::Ready(out));
        }

        let take = (width - self.scratch_len).min(self.input.available());
        self.scratch[self.scratch_len..self.scratch_len + take]
            .copy_from_slice(&self.input.peek()[..take]);
        self.input.consume(take);
        self.scratch_len += take;

        if self.scratch_len == width {
            self.scratch_len = 0;
            Ok(ReadOutcome::Ready(self.scratch))
        } else {
            Ok(ReadOutcome::NeedsData)
        }
    }

    /// Read a single byte.
    pub fn try_read_u8(&mut self) -> Result<ReadOutcome<u8>> {
        Ok(self.try_take(1)?.map(|b| b[0]))
    }

    /// Read a little-endian u16.
    pub fn try_read_u16(&mut self) -> Result<ReadOutcome<u16>> {
        Ok(self
            .try_take(2)?
            .map(|b| u16::from_le_bytes([b[0], b[1]])))
    }

    /// Read a little-endian i16.
    pub fn try_read_i16(&mut self) -> Result<ReadOutcome<i16>> {
        Ok(self.try_read_u16()?.map(|v| v as i16))
    }

    /// Read a little-endian u32.
    pub fn try_read_u32(&mut self) -> Result<ReadOutcome<u32>> {
        Ok(self
            .try_take(4)?
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Read a little-endian i32.
    pub fn try_read_i32(&mut self) -> Result<ReadOutcome<i32>> {
        Ok(self.try_read_u32()?.map(|v| v as i32))
    }

    /// Read a little-endian u64.
    pub fn try_read_u64(&mut self) -> Result<ReadOutcome<u64>> {
        Ok(self.try_take(8)?.map(|b| u64::from_le_bytes(b)))
    }

    /// Read a little-endian i64.
    pub fn try_read_i64(&mut self) -> Result<ReadOutcome<i64>> {
        Ok(self.try_read_u64()?.map(|v| v as i64))
    }

    /// Read a little-endian f32.
    pub fn try_read_f32(&mut self) -> Result<ReadOutcome<f32>> {
        Ok(self.try_read_u32()?.map(f32::from_bits))
    }

    /// Read a little-endian f64.
    pub fn try_read_f64(&mut self) -> Result<ReadOutcome<f64>> {
        Ok(self.try_read_u64()?.map(f64::from_bits))
    }

    /// Read `len` bytes into `dest`, or skip them when `dest` is `None`.
    ///
    /// Partial progress is tracked internally; on resume the remaining
    /// bytes continue from where the suspension left off.
    pub fn try_read_bytes(
        &mut self,
        mut dest: Option<&mut [u8]>,
        len: usize,
    ) -> Result<ReadOutcome<()>> {
        if let Some(d) = dest.as_deref() {
            debug_assert!(d.len() >= len);
        }
        loop {
            if self.bytes_progress == len {
                self.bytes_progress = 0;
                return Ok(ReadOutcome::Ready(()));
            }
            let avail = self.input.available();
            if avail == 0 {
                return Ok(ReadOutcome::NeedsData);
            }
            let step = avail.min(len - self.bytes_progress);
            if let Some(d) = dest.as_deref_mut() {
                d[self.bytes_progress..self.bytes_progress + step]
                    .copy_from_slice(&self.input.peek()[..step]);
            }
            self.input.consume(step);
            self.bytes_progress += step;
        }
    }

    /// Read `char_count` UTF-16LE code units as a `String`.
    pub fn try_read_string_utf16(&mut self, char_count: usize) -> Result<ReadOutcome<String>> {
        let goal = char_count * 2;
        if let ReadOutcome::NeedsData = self.fill_str_scratch(goal)? {
            return Ok(ReadOutcome::NeedsData);
        }
        let units: Vec<u16> = self
            .str_scratch
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.str_scratch.clear();
        let text = String::from_utf16(&units)
            .map_err(|_| SessionError::Protocol(tds_wire::WireError::InvalidUtf16))?;
        Ok(ReadOutcome::Ready(text))
    }

    /// Read a string of `len` bytes in the given encoding.
    ///
    /// With `is_plp`, `len` is ignored and the value is consumed as a PLP
    /// stream (the 8-byte length must already have been read via
    /// [`Self::try_read_plp_length`]).
    pub fn try_read_string(
        &mut self,
        encoding: &'static Encoding,
        len: usize,
        is_plp: bool,
    ) -> Result<ReadOutcome<String>> {
        if is_plp {
            let mut buf = std::mem::take(&mut self.str_scratch);
            let outcome = self.try_read_plp_bytes(&mut buf)?;
            match outcome {
                ReadOutcome::Ready(_) => {
                    let (text, _, _) = encoding.decode(&buf);
                    let text = text.into_owned();
                    buf.clear();
                    self.str_scratch = buf;
                    Ok(ReadOutcome::Ready(text))
                }
                ReadOutcome::NeedsData => {
                    self.str_scratch = buf;
                    Ok(ReadOutcome::NeedsData)
                }
            }
        } else {
            if let ReadOutcome::NeedsData = self.fill_str_scratch(len)? {
                return Ok(ReadOutcome::NeedsData);
            }
            let (text, _, _) = encoding.decode(&self.str_scratch);
            let text = text.into_owned();
            self.str_scratch.clear();
            Ok(ReadOutcome::Ready(text))
        }
    }

    fn fill_str_scratch(&mut self, goal: usize) -> Result<ReadOutcome<()>> {
        while self.str_scratch.len() < goal {
            let avail = self.input.available();
            if avail == 0 {
                return Ok(ReadOutcome::NeedsData);
            }
            let step = avail.min(goal - self.str_scratch.len());
            self.str_scratch
                .extend_from_slice(&self.input.peek()[..step]);
            self.input.consume(step);
        }
        Ok(ReadOutcome::Ready(()))
    }

    // ---- PLP streams ----------------------------------------------------

    /// Read the 8-byte PLP total length and arm the chunk reader.
    pub fn try_read_plp_length(&mut self) -> Result<ReadOutcome<PlpLength>> {
        match self.try_read_u64()? {
            ReadOutcome::NeedsData => Ok(ReadOutcome::NeedsData),
            ReadOutcome::Ready(raw) => {
                let declared = PlpLength::from_raw(raw);
                self.plp_total_read = 0;
                self.plp_chunk_left = 0;
                self.plp_declared = if declared.is_null() {
                    None
                } else {
                    Some(declared)
                };
                Ok(ReadOutcome::Ready(declared))
            }
        }
    }

    /// Consume PLP chunks into `dest` until the terminator.
    ///
    /// Returns the total number of bytes in the value. `long_len` (the
    /// declared total) and `long_len_left` (remaining in the current
    /// chunk) stay consistent across suspensions.
    pub fn try_read_plp_bytes(&mut self, dest: &mut Vec<u8>) -> Result<ReadOutcome<u64>> {
        let Some(declared) = self.plp_declared else {
            return Err(SessionError::CorruptedStream(
                "PLP bytes requested without a PLP length",
            ));
        };

        loop {
            if self.plp_chunk_left == 0 {
                let chunk = match self.try_take(4)? {
                    ReadOutcome::NeedsData => return Ok(ReadOutcome::NeedsData),
                    ReadOutcome::Ready(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                };
                if chunk == PLP_TERMINATOR {
                    if let PlpLength::Known(total) = declared {
                        if total != self.plp_total_read {
                            return Err(SessionError::CorruptedStream(
                                "PLP stream length does not match declared total",
                            ));
                        }
                    }
                    let total = self.plp_total_read;
                    self.plp_declared = None;
                    self.plp_total_read = 0;
                    return Ok(ReadOutcome::Ready(total));
                }
                if let PlpLength::Known(total) = declared {
                    if self.plp_total_read + u64::from(chunk) > total {
                        return Err(SessionError::CorruptedStream(
                            "PLP chunk extends past declared total",
                        ));
                    }
                }
                self.plp_chunk_left = u64::from(chunk);
            }

            let avail = self.input.available();
            if avail == 0 {
                return Ok(ReadOutcome::NeedsData);
            }
            let step = (avail as u64).min(self.plp_chunk_left) as usize;
            dest.extend_from_slice(&self.input.peek()[..step]);
            self.input.consume(step);
            self.plp_chunk_left -= step as u64;
            self.plp_total_read += step as u64;
        }
    }

    // ---- snapshot support -----------------------------------------------

    pub(crate) fn capture_position(&self) -> ParserPosition {
        ParserPosition {
            input: self.input.save(),
            scratch: self.scratch,
            scratch_len: self.scratch_len,
            bytes_progress: self.bytes_progress,
            str_scratch: self.str_scratch.clone(),
            plp_declared: self.plp_declared,
            plp_chunk_left: self.plp_chunk_left,
            plp_total_read: self.plp_total_read,
            pending_data: self.pending_data,
            error_token_received: self.error_token_received,
            open_result: self.open_result,
            column_metadata_received: self.column_metadata_received,
            attention_received: self.attention_received,
            null_bitmap: self.null_bitmap.clone(),
        }
    }

    pub(crate) fn restore_position(&mut self, position: &ParserPosition) {
        self.input.restore(&position.input);
        self.scratch = position.scratch;
        self.scratch_len = position.scratch_len;
        self.bytes_progress = position.bytes_progress;
        self.str_scratch = position.str_scratch.clone();
        self.plp_declared = position.plp_declared;
        self.plp_chunk_left = position.plp_chunk_left;
        self.plp_total_read = position.plp_total_read;
        self.pending_data = position.pending_data;
        self.error_token_received = position.error_token_received;
        self.open_result = position.open_result;
        self.column_metadata_received = position.column_metadata_received;
        self.attention_received = position.attention_received;
        self.null_bitmap = position.null_bitmap.clone();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_wire::{
        PacketHeader, PacketType, DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PLP_UNKNOWN_LEN,
    };

    fn feed(pipeline: &mut ReadPipeline, payload: &[u8], eom: bool) {
        let status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::BATCH
        };
        let header = PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + payload.len()) as u16,
        );
        pipeline.input_mut().append(&header, payload);
    }

    #[test]
    fn test_read_primitives() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        feed(&mut pipeline, &[0x2A, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF], true);

        assert_eq!(pipeline.try_read_u8().unwrap(), ReadOutcome::Ready(0x2A));
        assert_eq!(pipeline.try_read_u16().unwrap(), ReadOutcome::Ready(1));
        assert_eq!(pipeline.try_read_i32().unwrap(), ReadOutcome::Ready(-1));
        assert_eq!(pipeline.try_read_u8().unwrap(), ReadOutcome::NeedsData);
    }

    #[test]
    fn test_value_straddles_packets() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        feed(&mut pipeline, &[0x01, 0x00], false);

        // Only 2 of 4 bytes available: suspension with position preserved.
        assert_eq!(pipeline.try_read_u32().unwrap(), ReadOutcome::NeedsData);
        assert_eq!(pipeline.input().available(), 0);

        feed(&mut pipeline, &[0x00, 0x00], true);
        assert_eq!(pipeline.try_read_u32().unwrap(), ReadOutcome::Ready(1));
    }

    #[test]
    fn test_read_bytes_with_skip() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        feed(&mut pipeline, &[1, 2, 3, 4, 5], true);

        assert!(pipeline.try_read_bytes(None, 3).unwrap().is_ready());

        let mut dest = [0u8; 2];
        assert!(pipeline
            .try_read_bytes(Some(&mut dest), 2)
            .unwrap()
            .is_ready());
        assert_eq!(dest, [4, 5]);
    }

    #[test]
    fn test_read_bytes_resumes_after_suspension() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        feed(&mut pipeline, &[1, 2], false);

        let mut dest = [0u8; 5];
        assert_eq!(
            pipeline.try_read_bytes(Some(&mut dest), 5).unwrap(),
            ReadOutcome::NeedsData
        );
        feed(&mut pipeline, &[3, 4, 5], true);
        assert!(pipeline
            .try_read_bytes(Some(&mut dest), 5)
            .unwrap()
            .is_ready());
        assert_eq!(dest, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_read_string_utf16() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        let text: Vec<u8> = "SELECT"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        feed(&mut pipeline, &text[..5], false);

        assert_eq!(
            pipeline.try_read_string_utf16(6).unwrap(),
            ReadOutcome::NeedsData
        );
        feed(&mut pipeline, &text[5..], true);
        assert_eq!(
            pipeline.try_read_string_utf16(6).unwrap(),
            ReadOutcome::Ready("SELECT".to_string())
        );
    }

    #[test]
    fn test_read_string_encoded() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        feed(&mut pipeline, b"us_english", true);

        let outcome = pipeline
            .try_read_string(encoding_rs::WINDOWS_1252, 10, false)
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Ready("us_english".to_string()));
    }

    #[test]
    fn test_plp_known_length() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);

        let mut stream = Vec::new();
        stream.extend_from_slice(&5u64.to_le_bytes());
        stream.extend_from_slice(&3u32.to_le_bytes());
        stream.extend_from_slice(b"abc");
        stream.extend_from_slice(&2u32.to_le_bytes());
        stream.extend_from_slice(b"de");
        stream.extend_from_slice(&0u32.to_le_bytes());
        feed(&mut pipeline, &stream, true);

        assert_eq!(
            pipeline.try_read_plp_length().unwrap(),
            ReadOutcome::Ready(PlpLength::Known(5))
        );
        let mut value = Vec::new();
        assert_eq!(
            pipeline.try_read_plp_bytes(&mut value).unwrap(),
            ReadOutcome::Ready(5)
        );
        assert_eq!(value, b"abcde");
    }

    #[test]
    fn test_plp_unknown_length_across_suspensions() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);

        let mut first = Vec::new();
        first.extend_from_slice(&PLP_UNKNOWN_LEN.to_le_bytes());
        first.extend_from_slice(&4u32.to_le_bytes());
        first.extend_from_slice(b"ab"); // chunk split across packets
        feed(&mut pipeline, &first, false);

        assert!(pipeline.try_read_plp_length().unwrap().is_ready());
        let mut value = Vec::new();
        assert_eq!(
            pipeline.try_read_plp_bytes(&mut value).unwrap(),
            ReadOutcome::NeedsData
        );
        assert_eq!(pipeline.plp_chunk_left(), 2);

        let mut second = Vec::new();
        second.extend_from_slice(b"cd");
        second.extend_from_slice(&0u32.to_le_bytes());
        feed(&mut pipeline, &second, true);

        assert_eq!(
            pipeline.try_read_plp_bytes(&mut value).unwrap(),
            ReadOutcome::Ready(4)
        );
        assert_eq!(value, b"abcd");
    }

    #[test]
    fn test_plp_null() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        feed(&mut pipeline, &tds_wire::PLP_NULL.to_le_bytes(), true);

        assert_eq!(
            pipeline.try_read_plp_length().unwrap(),
            ReadOutcome::Ready(PlpLength::Null)
        );
        assert!(pipeline.plp_declared().is_none());
    }

    #[test]
    fn test_plp_chunk_past_declared_total() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);

        let mut stream = Vec::new();
        stream.extend_from_slice(&2u64.to_le_bytes());
        stream.extend_from_slice(&10u32.to_le_bytes()); // chunk larger than total
        feed(&mut pipeline, &stream, true);

        assert!(pipeline.try_read_plp_length().unwrap().is_ready());
        let mut value = Vec::new();
        assert!(matches!(
            pipeline.try_read_plp_bytes(&mut value),
            Err(SessionError::CorruptedStream(_))
        ));
    }

    #[test]
    fn test_plp_bytes_without_length_is_misuse() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        let mut value = Vec::new();
        assert!(pipeline.try_read_plp_bytes(&mut value).is_err());
    }

    #[test]
    fn test_error_token_forces_sync() {
        let mut pipeline = ReadPipeline::new(DEFAULT_PACKET_SIZE);
        assert!(!pipeline.sync_over_async());
        pipeline.mark_error_token();
        assert!(pipeline.sync_over_async());
        assert!(pipeline.error_token_received());
    }

    #[test]
    fn test_null_bitmap_copy_on_write() {
        let mut original = NullBitmapCache::default();
        original.reset(8, vec![0b0000_0001]);

        let shared = original.clone();
        assert!(shared.shares_storage_with(&original));
        assert!(shared.is_null(0));

        original.set_null(3);
        assert!(!shared.shares_storage_with(&original));
        assert!(original.is_null(3));
        assert!(!shared.is_null(3));
    }
}
