//! WebSocket frame decoding and encoding
//!
//! The engine only speaks single-frame text messages with 7-bit or 16-bit
//! payload lengths, plus ping and close control frames. Everything else is
//! reported as a [`FrameError`] so the caller can log it and skip the frame.

use crate::{
    error::FrameError,
    protocol::{constants::MAX_PAYLOAD_LEN, frame::*, Opcode},
};
use bytes::{BufMut, Bytes, BytesMut};

/// Outcome of decoding the front of a byte buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Final text frame with its unmasked payload
    Text {
        /// Unmasked payload bytes
        payload: Bytes,
        /// Bytes of the input the frame occupied
        consumed: usize,
    },
    /// Ping frame, kept verbatim so it can be echoed as a pong
    Ping {
        /// The raw frame, header included
        frame: Bytes,
    },
    /// Close frame with its unmasked payload (status code and reason)
    Close {
        /// Unmasked payload bytes
        payload: Bytes,
        /// Bytes of the input the frame occupied
        consumed: usize,
    },
    /// The buffer does not yet hold a whole frame
    Incomplete {
        /// Total bytes required before decoding can make progress
        needed: usize,
    },
}

impl Decoded {
    /// Number of input bytes consumed by this frame (zero when incomplete)
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::Text { consumed, .. } | Decoded::Close { consumed, .. } => *consumed,
            Decoded::Ping { frame } => frame.len(),
            Decoded::Incomplete { .. } => 0,
        }
    }
}

/// Decode the first frame in `buf`.
///
/// Returns [`Decoded::Incomplete`] when more bytes are required. Protocol
/// errors carry the frame length when it is known; see
/// [`FrameError::skip_len`].
pub fn decode(buf: &[u8]) -> Result<Decoded, FrameError> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete { needed: 2 });
    }

    let header = buf[0];
    let masked = (buf[1] & MASK_BIT) != 0;
    let inline_len = buf[1] & PAYLOAD_LEN_MASK;

    let mut offset = 2;
    let payload_len = match inline_len {
        PAYLOAD_LEN_64 => {
            // unsupported, but the length is still read so the caller can
            // skip the whole frame
            if buf.len() < 10 {
                return Ok(Decoded::Incomplete { needed: 10 });
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            let header_len = if masked { 10 + MASKING_KEY_LEN } else { 10 };
            let frame_len = usize::try_from(u64::from_be_bytes(len))
                .unwrap_or(usize::MAX)
                .saturating_add(header_len);
            return Err(FrameError::ExtendedLength64 { frame_len });
        }
        PAYLOAD_LEN_16 => {
            if buf.len() < 4 {
                return Ok(Decoded::Incomplete { needed: 4 });
            }
            offset += 2;
            u16::from_be_bytes([buf[2], buf[3]]) as usize
        }
        len => len as usize,
    };

    let mask = if masked {
        offset += MASKING_KEY_LEN;
        if buf.len() < offset {
            return Ok(Decoded::Incomplete { needed: offset });
        }
        let mut key = [0u8; MASKING_KEY_LEN];
        key.copy_from_slice(&buf[offset - MASKING_KEY_LEN..offset]);
        Some(key)
    } else {
        None
    };

    let frame_len = offset + payload_len;
    if buf.len() < frame_len {
        return Ok(Decoded::Incomplete { needed: frame_len });
    }

    if header & RSV_BITS != 0 {
        return Err(FrameError::ReservedBitsSet { frame_len });
    }

    let fin = header & FIN_BIT != 0;
    let unmask = || {
        let mut payload = BytesMut::from(&buf[offset..frame_len]);
        if let Some(key) = mask {
            mask_in_place(&mut payload, key);
        }
        payload.freeze()
    };

    match Opcode::from(header) {
        Some(Opcode::Ping) => Ok(Decoded::Ping {
            frame: Bytes::copy_from_slice(&buf[..frame_len]),
        }),
        Some(Opcode::Close) => Ok(Decoded::Close {
            payload: unmask(),
            consumed: frame_len,
        }),
        Some(Opcode::Text) if fin => Ok(Decoded::Text {
            payload: unmask(),
            consumed: frame_len,
        }),
        Some(Opcode::Text) | Some(Opcode::Continuation) => {
            Err(FrameError::Fragmented { frame_len })
        }
        _ => Err(FrameError::UnsupportedOpcode { header, frame_len }),
    }
}

/// Encode `payload` as a single final text frame.
///
/// Payloads below 126 bytes use the inline length; larger ones use the
/// 16-bit extended form. Payloads that would need the 64-bit form are
/// rejected. When `masked` is set a fresh random key is drawn for the
/// frame.
pub fn encode(payload: &[u8], masked: bool) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u8(TEXT_FRAME);

    let mask_bit = if masked { MASK_BIT } else { 0 };
    if payload.len() < PAYLOAD_LEN_16 as usize {
        buf.put_u8(mask_bit | payload.len() as u8);
    } else {
        buf.put_u8(mask_bit | PAYLOAD_LEN_16);
        buf.put_u16(payload.len() as u16);
    }

    if masked {
        let key = rand::random::<[u8; MASKING_KEY_LEN]>();
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        mask_in_place(&mut buf[start..], key);
    } else {
        buf.put_slice(payload);
    }

    Ok(buf.freeze())
}

/// Turn a raw ping frame into the matching pong.
///
/// Only the opcode nibble changes; FIN, length, mask and payload are kept
/// byte for byte.
pub fn encode_pong(ping: &[u8]) -> Result<Bytes, FrameError> {
    let Some(&header) = ping.first() else {
        return Err(FrameError::InsufficientData { needed: 1, have: 0 });
    };
    if Opcode::from(header) != Some(Opcode::Ping) {
        return Err(FrameError::UnsupportedOpcode {
            header,
            frame_len: ping.len(),
        });
    }

    let mut pong = BytesMut::from(ping);
    pong[0] = (header & !OPCODE_MASK) | Opcode::Pong.value();
    Ok(pong.freeze())
}

/// XOR `data` with `key`, cycling the key by index mod 4.
///
/// Applying the same key twice restores the original bytes.
pub fn mask_in_place(data: &mut [u8], key: [u8; MASKING_KEY_LEN]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % MASKING_KEY_LEN];
    }
}
