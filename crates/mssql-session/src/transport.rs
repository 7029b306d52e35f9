//! Framed transport adapter.
//!
//! The adapter is the only component that touches the byte transport.
//! Inbound, a tokio-util [`Decoder`] reassembles TDS packets across
//! arbitrary TCP fragmentation (a header split over two transport reads is
//! buffered and decoding resumes without replay). Outbound, the
//! [`PacketWriter`] sends pre-stamped frames produced by the write
//! pipeline, so the header bytes the session stamped in place are exactly
//! the bytes on the wire.
//!
//! The transport is split into read and write halves so an Attention
//! packet can be sent while a read of a large result set is in flight.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_core::Stream;
use pin_project_lite::pin_project;
use tds_wire::{attention_frame, PacketHeader, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead};

use crate::error::{Result, SessionError};

/// Byte transport the session can drive.
///
/// Opening a transport (name resolution, SPN, ip preference, TLS) is the
/// connector's business; the session takes the handle as built.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Boxed transport handle owned by a session.
pub type BoxedTransport = Box<dyn Transport>;

/// A TDS packet with header and payload.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload (excluding header).
    pub payload: BytesMut,
}

impl Packet {
    /// Create a new packet with the given header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    /// Get the total packet size including header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// Inbound TDS packet decoder for tokio-util framing.
pub struct PacketDecoder {
    /// Maximum packet size to accept.
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a decoder accepting packets up to `max_packet_size` bytes.
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_PACKET_SIZE),
        }
    }

    /// Change the accepted maximum packet size.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(MAX_PACKET_SIZE);
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketDecoder {
    type Item = Packet;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // A partial header stays buffered until all 8 bytes arrive.
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[2], src[3]]) as usize;

        if length < PACKET_HEADER_SIZE {
            return Err(SessionError::CorruptedStream(
                "packet length below header size",
            ));
        }
        if length > self.max_packet_size {
            return Err(SessionError::Protocol(tds_wire::WireError::PacketTooLarge {
                size: length,
                max: self.max_packet_size,
            }));
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let packet_bytes = src.split_to(length);
        let mut cursor = packet_bytes.as_ref();
        let header = PacketHeader::decode(&mut cursor)?;
        let payload = BytesMut::from(&packet_bytes[PACKET_HEADER_SIZE..]);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = length,
            is_eom = header.is_end_of_message(),
            "decoded TDS packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }
}

pin_project! {
    /// A read-only packet stream over the read half of a transport.
    pub struct PacketReader<T> {
        #[pin]
        inner: FramedRead<T, PacketDecoder>,
    }
}

impl<T> PacketReader<T>
where
    T: AsyncRead,
{
    /// Create a new packet reader over the given transport half.
    pub fn new(transport: T, decoder: PacketDecoder) -> Self {
        Self {
            inner: FramedRead::new(transport, decoder),
        }
    }

    /// Get a mutable reference to the decoder.
    pub fn decoder_mut(&mut self) -> &mut PacketDecoder {
        self.inner.decoder_mut()
    }

    /// Get a reference to the read buffer.
    pub fn read_buffer(&self) -> &BytesMut {
        self.inner.read_buffer()
    }
}

impl<T> Stream for PacketReader<T>
where
    T: AsyncRead + Unpin,
{
    type Item = Result<Packet>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T> std::fmt::Debug for PacketReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketReader").finish_non_exhaustive()
    }
}

/// A write-only packet sink over the write half of a transport.
///
/// Frames arrive pre-stamped from the write pipeline; the writer's job is
/// delivery and teardown only.
pub struct PacketWriter<T> {
    io: T,
}

impl<T> PacketWriter<T>
where
    T: AsyncWrite + Unpin,
{
    /// Create a new packet writer over the given transport half.
    pub fn new(io: T) -> Self {
        Self { io }
    }

    /// Send one pre-stamped frame and flush it to the transport.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.io.write_all(frame).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Send the out-of-band attention frame for the given channel.
    pub async fn send_attention(&mut self, channel: u16) -> Result<()> {
        tracing::debug!(channel, "sending attention packet");
        self.send_frame(&attention_frame(channel)).await
    }

    /// Shut down the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for PacketWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter").finish_non_exhaustive()
    }
}
