//! Scripted mock TDS server.
//!
//! The server accepts a single connection and plays a deterministic
//! script: expect a request message, send a response, stall, stream rows
//! until an attention arrives. Scenario tests need ordered, stateful
//! exchanges, so the script is a sequence rather than a request/response
//! map.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tds_wire::{
    peek_request_kind, PacketStatus, PacketType, TmRequestKind, DEFAULT_PACKET_SIZE,
    PACKET_HEADER_SIZE,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client violated the script.
    #[error("script violation: {0}")]
    Script(String),

    /// The server task panicked or was aborted.
    #[error("server task failed")]
    Join,
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// One step of the server script.
#[derive(Debug)]
pub enum ScriptStep {
    /// Read one full request message and assert its packet type.
    ExpectMessage(PacketType),
    /// Read one transaction-manager request and assert its kind.
    ExpectTmRequest(TmRequestKind),
    /// Send a token stream, fragmented into EOM-terminated packets.
    SendTokens(Bytes),
    /// Send raw packets with explicit statuses.
    SendPackets(Vec<(PacketStatus, Bytes)>),
    /// Do nothing for a while before the next step.
    Pause(Duration),
    /// Stream `row` tokens in BATCH packets until an attention packet
    /// arrives, then acknowledge it with `ack` in a final EOM packet.
    SendRowsUntilAttention {
        /// Prefix sent once before the rows (column metadata).
        prelude: Bytes,
        /// One encoded row token, repeated.
        row: Bytes,
        /// Rows per packet.
        rows_per_packet: usize,
        /// Attention acknowledgment token stream.
        ack: Bytes,
    },
    /// Assert that the client sends nothing for the given window.
    ExpectSilence(Duration),
    /// Read until the client disconnects.
    WaitDisconnect,
}

/// A scripted mock TDS server bound to a local port.
#[derive(Debug)]
pub struct MockTdsServer {
    addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl MockTdsServer {
    /// Bind a listener and start playing `script` against the first
    /// connection.
    pub async fn start(script: Vec<ScriptStep>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "mock server accepted connection");
            run_script(stream, script).await
        });

        Ok(Self { addr, handle })
    }

    /// Address to connect the session to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the script to finish and surface any violation.
    pub async fn finished(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(MockServerError::Join),
        }
    }
}

async fn run_script(mut stream: TcpStream, script: Vec<ScriptStep>) -> Result<()> {
    let spid = 54u16;
    for step in script {
        tracing::trace!(?step, "mock server step");
        match step {
            ScriptStep::ExpectMessage(expected) => {
                let (packet_type, _payload) = read_message(&mut stream).await?;
                if packet_type != expected as u8 {
                    return Err(MockServerError::Script(format!(
                        "expected message type {expected:?}, got 0x{packet_type:02X}"
                    )));
                }
            }
            ScriptStep::ExpectTmRequest(expected) => {
                let (packet_type, payload) = read_message(&mut stream).await?;
                if packet_type != PacketType::TransactionManager as u8 {
                    return Err(MockServerError::Script(format!(
                        "expected a transaction manager request, got 0x{packet_type:02X}"
                    )));
                }
                match peek_request_kind(&payload) {
                    Some(kind) if kind == expected => {}
                    other => {
                        return Err(MockServerError::Script(format!(
                            "expected TM request {expected:?}, got {other:?}"
                        )));
                    }
                }
            }
            ScriptStep::SendTokens(tokens) => {
                send_message(&mut stream, spid, &tokens).await?;
            }
            ScriptStep::SendPackets(packets) => {
                for (status, payload) in packets {
                    let frame = build_frame(spid, status, &payload);
                    stream.write_all(&frame).await?;
                }
                stream.flush().await?;
            }
            ScriptStep::Pause(duration) => {
                tokio::time::sleep(duration).await;
            }
            ScriptStep::SendRowsUntilAttention {
                prelude,
                row,
                rows_per_packet,
                ack,
            } => {
                stream_rows_until_attention(&mut stream, spid, &prelude, &row, rows_per_packet)
                    .await?;
                let frame = build_frame(spid, PacketStatus::END_OF_MESSAGE, &ack);
                stream.write_all(&frame).await?;
                stream.flush().await?;
            }
            ScriptStep::ExpectSilence(window) => {
                let mut probe = [0u8; 1];
                match tokio::time::timeout(window, stream.peek(&mut probe)).await {
                    Err(_) => {} // silence, as scripted
                    Ok(Ok(0)) => {} // disconnect also counts as silence
                    Ok(Ok(_)) => {
                        return Err(MockServerError::Script(
                            "unexpected client traffic during silence window".to_string(),
                        ));
                    }
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
            ScriptStep::WaitDisconnect => {
                let mut sink = [0u8; 1024];
                loop {
                    match stream.read(&mut sink).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
        }
    }
    Ok(())
}

/// Read one full message (all packets to EOM); returns type and payload.
async fn read_message(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut payload = Vec::new();
    let mut message_type = None;
    loop {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        stream.read_exact(&mut header).await?;
        let packet_type = header[0];
        let status = header[1];
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        if length < PACKET_HEADER_SIZE {
            return Err(MockServerError::Script(format!(
                "client sent packet with length {length}"
            )));
        }

        let mut body = vec![0u8; length - PACKET_HEADER_SIZE];
        stream.read_exact(&mut body).await?;

        // An attention overtaking the message is surfaced as its own
        // "message" so scripts can react to it.
        if packet_type == PacketType::Attention as u8 && message_type.is_none() {
            return Ok((packet_type, body));
        }

        message_type.get_or_insert(packet_type);
        payload.extend_from_slice(&body);

        if status & PacketStatus::END_OF_MESSAGE.bits() != 0 {
            let packet_type = message_type.unwrap_or(packet_type);
            return Ok((packet_type, payload));
        }
    }
}

fn build_frame(spid: u16, status: PacketStatus, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
    frame.push(PacketType::TabularResult as u8);
    frame.push(status.bits());
    frame.put_u16((PACKET_HEADER_SIZE + payload.len()) as u16);
    frame.put_u16(spid);
    frame.push(1);
    frame.push(0);
    frame.extend_from_slice(payload);
    frame
}

/// Send a token stream fragmented into negotiated-size packets.
async fn send_message(stream: &mut TcpStream, spid: u16, tokens: &[u8]) -> Result<()> {
    let max_payload = DEFAULT_PACKET_SIZE - PACKET_HEADER_SIZE;
    let chunks: Vec<&[u8]> = if tokens.is_empty() {
        vec![&[][..]]
    } else {
        tokens.chunks(max_payload).collect()
    };
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let status = if i == last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::BATCH
        };
        let frame = build_frame(spid, status, chunk);
        stream.write_all(&frame).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Stream row packets until the client's attention packet arrives.
async fn stream_rows_until_attention(
    stream: &mut TcpStream,
    spid: u16,
    prelude: &[u8],
    row: &[u8],
    rows_per_packet: usize,
) -> Result<()> {
    if !prelude.is_empty() {
        let frame = build_frame(spid, PacketStatus::BATCH, prelude);
        stream.write_all(&frame).await?;
        stream.flush().await?;
    }

    let mut packet_payload = BytesMut::with_capacity(row.len() * rows_per_packet);
    for _ in 0..rows_per_packet {
        packet_payload.put_slice(row);
    }

    let mut inbound = Vec::new();
    let mut probe = [0u8; 64];
    loop {
        match stream.try_read(&mut probe) {
            Ok(0) => {
                return Err(MockServerError::Script(
                    "client disconnected while streaming rows".to_string(),
                ));
            }
            Ok(n) => {
                inbound.extend_from_slice(&probe[..n]);
                if inbound.first() == Some(&(PacketType::Attention as u8))
                    && inbound.len() >= PACKET_HEADER_SIZE
                {
                    tracing::debug!("mock server observed attention, stopping row stream");
                    return Ok(());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        let frame = build_frame(spid, PacketStatus::BATCH, &packet_payload);
        stream.write_all(&frame).await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tokens::TokenStreamBuilder;

    #[tokio::test]
    async fn test_expect_and_respond() {
        let tokens = TokenStreamBuilder::new().done(0).build();
        let server = MockTdsServer::start(vec![
            ScriptStep::ExpectMessage(PacketType::SqlBatch),
            ScriptStep::SendTokens(tokens),
            ScriptStep::WaitDisconnect,
        ])
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.addr()).await.unwrap();

        // A minimal single-packet SQL batch request.
        let frame = {
            let mut f = Vec::new();
            f.push(PacketType::SqlBatch as u8);
            f.push(PacketStatus::END_OF_MESSAGE.bits());
            f.put_u16((PACKET_HEADER_SIZE + 2) as u16);
            f.put_u16(0);
            f.push(1);
            f.push(0);
            f.extend_from_slice(&[0xAB, 0xCD]);
            f
        };
        client.write_all(&frame).await.unwrap();

        let mut header = [0u8; PACKET_HEADER_SIZE];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], PacketType::TabularResult as u8);
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; length - PACKET_HEADER_SIZE];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(body[0], 0xFD); // DONE

        drop(client);
        server.finished().await.unwrap();
    }

    #[tokio::test]
    async fn test_script_violation_reported() {
        let server = MockTdsServer::start(vec![ScriptStep::ExpectMessage(
            PacketType::TransactionManager,
        )])
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.addr()).await.unwrap();
        let mut frame = Vec::new();
        frame.push(PacketType::SqlBatch as u8);
        frame.push(PacketStatus::END_OF_MESSAGE.bits());
        frame.put_u16(PACKET_HEADER_SIZE as u16);
        frame.put_u16(0);
        frame.push(1);
        frame.push(0);
        client.write_all(&frame).await.unwrap();

        assert!(matches!(
            server.finished().await,
            Err(MockServerError::Script(_))
        ));
    }
}
