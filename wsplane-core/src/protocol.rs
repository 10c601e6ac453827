//! WebSocket protocol constants and utilities
//!
//! Opcodes and header bit layout from RFC 6455, restricted to the subset
//! the engine speaks: single-frame text messages, ping, pong and close.

/// WebSocket opcodes as defined in RFC 6455 Section 5.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Close frame
    Close = 0x8,
    /// Ping frame
    Ping = 0x9,
    /// Pong frame
    Pong = 0xA,
}

impl Opcode {
    /// Create an Opcode from the low nibble of a header byte
    pub fn from(value: u8) -> Option<Self> {
        match value & frame::OPCODE_MASK {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Get the numeric value of the opcode
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Protocol limits
pub mod constants {
    /// Largest payload representable with the 16-bit extended length
    pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

    /// Largest header the codec emits or accepts: 2 + 2 (length) + 4 (mask)
    pub const MAX_HEADER_LEN: usize = 8;

    /// Largest single frame on the wire
    pub const MAX_FRAME_LEN: usize = MAX_HEADER_LEN + MAX_PAYLOAD_LEN;
}

/// Frame header bit positions and masks
pub mod frame {
    /// FIN bit position
    pub const FIN_BIT: u8 = 0x80;

    /// RSV1..RSV3 bits
    pub const RSV_BITS: u8 = 0x70;

    /// Opcode mask
    pub const OPCODE_MASK: u8 = 0x0F;

    /// MASK bit position
    pub const MASK_BIT: u8 = 0x80;

    /// Payload length mask for 7-bit length
    pub const PAYLOAD_LEN_MASK: u8 = 0x7F;

    /// Extended payload length (16-bit) marker
    pub const PAYLOAD_LEN_16: u8 = 126;

    /// Extended payload length (64-bit) marker
    pub const PAYLOAD_LEN_64: u8 = 127;

    /// Masking key length
    pub const MASKING_KEY_LEN: usize = 4;

    /// Final text frame header byte
    pub const TEXT_FRAME: u8 = FIN_BIT | 0x1;
}
