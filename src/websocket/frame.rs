//! Frame header codec (RFC 6455 §5.2) and payload masking (§5.3).

use tokio::io::{AsyncRead, AsyncReadExt};

use super::WsError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// `None` for the reserved opcodes 0x3-0x7 and 0xB-0xF.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// A decoded frame header; the payload follows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Serialize using the shortest of the 7-bit, 16-bit and 64-bit length forms.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.push(if self.fin { 0x80 } else { 0x00 } | self.opcode.as_u8());
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        match self.payload_len {
            len @ 0..=125 => out.push(mask_bit | len as u8),
            len @ 126..=0xffff => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&len.to_be_bytes());
            }
        }
        if let Some(key) = self.mask {
            out.extend_from_slice(&key);
        }
        out
    }
}

/// XOR `payload` with `key`, where `payload` starts `offset` bytes into the
/// frame's payload. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[(offset + i) % 4];
    }
}

/// Read and validate one frame header.
///
/// Reserved bits, reserved opcodes, fragmented or oversized control frames
/// are protocol errors; payloads above `max_payload` are rejected before
/// anything is allocated.
pub async fn read_header<R>(reader: &mut R, max_payload: u64) -> Result<FrameHeader, WsError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let fin = head[0] & 0x80 != 0;
    if head[0] & 0x70 != 0 {
        return Err(WsError::Protocol("reserved bits set".into()));
    }
    let opcode = Opcode::from_u8(head[0] & 0x0f)
        .ok_or_else(|| WsError::Protocol(format!("reserved opcode 0x{:x}", head[0] & 0x0f)))?;

    let masked = head[1] & 0x80 != 0;
    let payload_len = match head[1] & 0x7f {
        126 => u64::from(reader.read_u16().await?),
        127 => {
            let len = reader.read_u64().await?;
            if len >> 63 != 0 {
                return Err(WsError::Protocol("64-bit length with the high bit set".into()));
            }
            len
        }
        len => u64::from(len),
    };

    if opcode.is_control() {
        if payload_len > MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol(format!(
                "control frame with {payload_len} byte payload"
            )));
        }
        if !fin {
            return Err(WsError::Protocol("fragmented control frame".into()));
        }
    }
    if payload_len > max_payload {
        return Err(WsError::FrameTooLarge {
            size: payload_len,
            limit: max_payload,
        });
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
    })
}
