//! The WebSocket framer.
//!
//! # Design Decisions
//! - One wire frame per [`WebSocket::receive`] call; reassembling fragments
//!   is the caller's job (`Message::is_last_segment`)
//! - Control frames never surface: pings are answered inline, pongs are
//!   dropped, a close is echoed and ends the session
//! - Reads and writes sit behind separate async locks, so one task can
//!   block in `receive` while others send
//! - Dropping an open socket sends a best-effort `1001` close from a
//!   background task

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use super::frame::{self, apply_mask, FrameHeader, Opcode};
use super::{close_code, WsError};
use crate::body::READ_CHUNK;
use crate::net::{BoxedIo, Rewind};
use crate::observability::metrics;

type Stream = Rewind<BoxedIo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// The payload of one data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Bytes,
    /// FIN bit: false while more fragments of the same message follow.
    pub is_last_segment: bool,
}

impl Message {
    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

struct ReadState {
    io: ReadHalf<Stream>,
    /// Kind of the fragmented message in progress, if any.
    fragment: Option<MessageKind>,
}

struct WriteState {
    io: WriteHalf<Stream>,
    close_sent: bool,
}

/// A WebSocket session over a handed-off connection.
pub struct WebSocket {
    reader: Mutex<ReadState>,
    writer: Arc<Mutex<WriteState>>,
    /// Mask outgoing frames (client role).
    mask: bool,
    max_frame: u64,
    closed: AtomicBool,
}

impl WebSocket {
    /// Wrap a connection whose handshake has completed.
    ///
    /// Servers pass `mask = false`; `max_frame` bounds incoming payloads.
    pub fn new(io: Stream, mask: bool, max_frame: u64) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: Mutex::new(ReadState {
                io: read_half,
                fragment: None,
            }),
            writer: Arc::new(Mutex::new(WriteState {
                io: write_half,
                close_sent: false,
            })),
            mask,
            max_frame,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the next data frame.
    ///
    /// Returns [`WsError::Closed`] once the session is over, whether the
    /// peer sent a close frame or simply went away.
    pub async fn receive(&self) -> Result<Message, WsError> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        let mut state = self.reader.lock().await;
        loop {
            let (header, payload) = match self.read_frame(&mut state.io).await {
                Ok(frame) => frame,
                Err(err) => return Err(self.fail(err).await),
            };
            metrics::websocket_frame("in");

            match header.opcode {
                Opcode::Ping => {
                    tracing::trace!(len = payload.len(), "Answering ping");
                    self.send_frame(Opcode::Pong, &payload, true).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = if payload.len() >= 2 {
                        u16::from_be_bytes([payload[0], payload[1]])
                    } else {
                        close_code::NO_STATUS
                    };
                    tracing::debug!(code, "Peer closed WebSocket");
                    // Echo the peer's code; 1005 must never go on the wire.
                    let echo = if code == close_code::NO_STATUS {
                        Vec::new()
                    } else {
                        code.to_be_bytes().to_vec()
                    };
                    let _ = self.send_close_frame(&echo).await;
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(WsError::Closed);
                }
                Opcode::Text | Opcode::Binary => {
                    if state.fragment.is_some() {
                        let err = WsError::Protocol("new message inside a fragmented one".into());
                        return Err(self.fail(err).await);
                    }
                    let kind = if header.opcode == Opcode::Text {
                        MessageKind::Text
                    } else {
                        MessageKind::Binary
                    };
                    if !header.fin {
                        state.fragment = Some(kind);
                    }
                    return Ok(Message {
                        kind,
                        data: Bytes::from(payload),
                        is_last_segment: header.fin,
                    });
                }
                Opcode::Continuation => {
                    let Some(kind) = state.fragment else {
                        let err = WsError::Protocol("continuation without a message".into());
                        return Err(self.fail(err).await);
                    };
                    if header.fin {
                        state.fragment = None;
                    }
                    return Ok(Message {
                        kind,
                        data: Bytes::from(payload),
                        is_last_segment: header.fin,
                    });
                }
            }
        }
    }

    async fn read_frame(&self, io: &mut ReadHalf<Stream>) -> Result<(FrameHeader, Vec<u8>), WsError> {
        let header = frame::read_header(io, self.max_frame).await?;
        let len = header.payload_len as usize;
        let mut payload = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let end = (filled + READ_CHUNK).min(len);
            io.read_exact(&mut payload[filled..end]).await?;
            if let Some(key) = header.mask {
                apply_mask(&mut payload[filled..end], key, filled);
            }
            filled = end;
        }
        Ok((header, payload))
    }

    /// Close the session after a receive failure, mapping short reads to
    /// [`WsError::Closed`].
    async fn fail(&self, err: WsError) -> WsError {
        let code = match &err {
            WsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.closed.store(true, Ordering::SeqCst);
                return WsError::Closed;
            }
            WsError::Protocol(reason) => {
                tracing::debug!(reason = %reason, "WebSocket protocol violation");
                Some(close_code::PROTOCOL_ERROR)
            }
            WsError::FrameTooLarge { .. } => Some(close_code::TOO_BIG),
            _ => None,
        };
        if let Some(code) = code {
            let _ = self.send_close_frame(&code.to_be_bytes()).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        err
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send_frame(Opcode::Text, text.as_bytes(), true).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.send_frame(Opcode::Binary, data, true).await
    }

    /// Send one fragment of a message. The first fragment carries `kind`;
    /// the caller marks the final one with `is_last`.
    pub async fn send_fragment(
        &self,
        kind: MessageKind,
        data: &[u8],
        is_first: bool,
        is_last: bool,
    ) -> Result<(), WsError> {
        let opcode = match (is_first, kind) {
            (false, _) => Opcode::Continuation,
            (true, MessageKind::Text) => Opcode::Text,
            (true, MessageKind::Binary) => Opcode::Binary,
        };
        self.send_frame(opcode, data, is_last).await
    }

    /// Send a close frame with `code` and a UTF-8 `reason` (truncated to fit
    /// a control frame) and end the session.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), WsError> {
        let mut payload = code.to_be_bytes().to_vec();
        let mut cut = reason.len().min(frame::MAX_CONTROL_PAYLOAD as usize - 2);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..cut]);
        let result = self.send_close_frame(&payload).await;
        self.closed.store(true, Ordering::SeqCst);
        result
    }

    async fn send_close_frame(&self, payload: &[u8]) -> Result<(), WsError> {
        let mut writer = self.writer.lock().await;
        if writer.close_sent {
            return Ok(());
        }
        writer.close_sent = true;
        let bytes = encode_frame(Opcode::Close, payload, true, self.mask);
        writer.io.write_all(&bytes).await?;
        writer.io.flush().await?;
        writer.io.shutdown().await?;
        metrics::websocket_frame("out");
        Ok(())
    }

    async fn send_frame(&self, opcode: Opcode, payload: &[u8], fin: bool) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        let bytes = encode_frame(opcode, payload, fin, self.mask);
        let mut writer = self.writer.lock().await;
        if writer.close_sent {
            return Err(WsError::Closed);
        }
        let written = async {
            writer.io.write_all(&bytes).await?;
            writer.io.flush().await
        }
        .await;
        if let Err(err) = written {
            self.closed.store(true, Ordering::SeqCst);
            return Err(err.into());
        }
        metrics::websocket_frame("out");
        Ok(())
    }
}

/// Header plus payload, masked with a fresh key when `mask` is set.
fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool, mask: bool) -> Vec<u8> {
    let key = mask.then(rand::random::<[u8; 4]>);
    let header = FrameHeader {
        fin,
        opcode,
        mask: key,
        payload_len: payload.len() as u64,
    };
    let mut bytes = header.encode();
    let start = bytes.len();
    bytes.extend_from_slice(payload);
    if let Some(key) = key {
        apply_mask(&mut bytes[start..], key, 0);
    }
    bytes
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let writer = Arc::clone(&self.writer);
        let mask = self.mask;
        handle.spawn(async move {
            let mut writer = writer.lock().await;
            if writer.close_sent {
                return;
            }
            writer.close_sent = true;
            let bytes = encode_frame(Opcode::Close, &close_code::GOING_AWAY.to_be_bytes(), true, mask);
            let _ = writer.io.write_all(&bytes).await;
            let _ = writer.io.shutdown().await;
        });
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("mask", &self.mask)
            .field("max_frame", &self.max_frame)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const LIMIT: u64 = 1024 * 1024;

    fn pair() -> (WebSocket, DuplexStream) {
        let (server, client) = tokio::io::duplex(256 * 1024);
        let io: BoxedIo = Box::new(server);
        (WebSocket::new(Rewind::new(io), false, LIMIT), client)
    }

    async fn client_frame(peer: &mut DuplexStream, opcode: Opcode, payload: &[u8], fin: bool) {
        peer.write_all(&encode_frame(opcode, payload, fin, true)).await.unwrap();
    }

    async fn server_frame(peer: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
        let header = frame::read_header(peer, LIMIT).await.unwrap();
        assert!(header.mask.is_none(), "server frames are never masked");
        let mut payload = vec![0u8; header.payload_len as usize];
        peer.read_exact(&mut payload).await.unwrap();
        (header, payload)
    }

    #[tokio::test]
    async fn ping_is_answered_and_never_returned() {
        let (ws, mut peer) = pair();
        client_frame(&mut peer, Opcode::Ping, b"are you there", true).await;
        client_frame(&mut peer, Opcode::Text, b"hello", true).await;

        let msg = ws.receive().await.unwrap();
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.as_text(), Some("hello"));

        let (header, payload) = server_frame(&mut peer).await;
        assert_eq!(header.opcode, Opcode::Pong);
        assert_eq!(payload, b"are you there");
    }

    #[tokio::test]
    async fn fragments_are_returned_one_frame_at_a_time() {
        let (ws, mut peer) = pair();
        client_frame(&mut peer, Opcode::Binary, &[1, 2], false).await;
        client_frame(&mut peer, Opcode::Pong, b"", true).await;
        client_frame(&mut peer, Opcode::Continuation, &[3], true).await;

        let first = ws.receive().await.unwrap();
        assert_eq!((first.kind, first.is_last_segment), (MessageKind::Binary, false));
        let second = ws.receive().await.unwrap();
        assert_eq!(second.kind, MessageKind::Binary);
        assert!(second.is_last_segment);
        assert_eq!(&second.data[..], &[3]);
    }

    #[tokio::test]
    async fn large_payload_is_unmasked_across_chunks() {
        let (ws, mut peer) = pair();
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 253) as u8).collect();
        let writer = tokio::spawn(async move {
            client_frame(&mut peer, Opcode::Binary, &payload, true).await;
            (peer, payload)
        });
        let msg = ws.receive().await.unwrap();
        let (_peer, payload) = writer.await.unwrap();
        assert_eq!(&msg.data[..], &payload[..]);
    }

    #[tokio::test]
    async fn close_is_echoed_and_sticky() {
        let (ws, mut peer) = pair();
        let mut close = 1000u16.to_be_bytes().to_vec();
        close.extend_from_slice(b"bye");
        client_frame(&mut peer, Opcode::Close, &close, true).await;

        assert!(matches!(ws.receive().await, Err(WsError::Closed)));
        assert!(matches!(ws.receive().await, Err(WsError::Closed)));
        assert!(matches!(ws.send_text("late").await, Err(WsError::Closed)));

        let (header, payload) = server_frame(&mut peer).await;
        assert_eq!(header.opcode, Opcode::Close);
        assert_eq!(payload, 1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn reserved_opcode_closes_with_protocol_error() {
        let (ws, mut peer) = pair();
        peer.write_all(&[0x83, 0x80, 0, 0, 0, 0]).await.unwrap();

        assert!(matches!(ws.receive().await, Err(WsError::Protocol(_))));
        assert!(ws.is_closed());
        let (header, payload) = server_frame(&mut peer).await;
        assert_eq!(header.opcode, Opcode::Close);
        assert_eq!(payload, close_code::PROTOCOL_ERROR.to_be_bytes());
    }

    #[tokio::test]
    async fn short_read_is_closed() {
        let (ws, mut peer) = pair();
        peer.write_all(&[0x81, 0x85, 1, 2]).await.unwrap();
        drop(peer);
        assert!(matches!(ws.receive().await, Err(WsError::Closed)));
    }

    #[tokio::test]
    async fn close_sends_code_and_reason() {
        let (ws, mut peer) = pair();
        ws.send_fragment(MessageKind::Text, b"par", true, false).await.unwrap();
        ws.send_fragment(MessageKind::Text, b"tial", false, true).await.unwrap();
        ws.close(close_code::GOING_AWAY, "restarting").await.unwrap();

        let (first, _) = server_frame(&mut peer).await;
        assert_eq!((first.opcode, first.fin), (Opcode::Text, false));
        let (second, _) = server_frame(&mut peer).await;
        assert_eq!((second.opcode, second.fin), (Opcode::Continuation, true));
        let (close, payload) = server_frame(&mut peer).await;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(&payload[..2], &1001u16.to_be_bytes());
        assert_eq!(&payload[2..], b"restarting");
    }

    #[tokio::test]
    async fn masked_sender_masks_every_frame() {
        let (server, mut peer) = tokio::io::duplex(1024);
        let io: BoxedIo = Box::new(server);
        let ws = WebSocket::new(Rewind::new(io), true, LIMIT);
        ws.send_binary(b"secret").await.unwrap();

        let header = frame::read_header(&mut peer, LIMIT).await.unwrap();
        let key = header.mask.expect("client frames are masked");
        let mut payload = vec![0u8; 6];
        peer.read_exact(&mut payload).await.unwrap();
        apply_mask(&mut payload, key, 0);
        assert_eq!(payload, b"secret");
    }
}
