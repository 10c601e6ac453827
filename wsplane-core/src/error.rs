//! Error types for wsplane
//!
//! This module defines the codec and configuration errors shared with the
//! engine.

use thiserror::Error;

/// Frame parsing and encoding errors
///
/// Every variant describes a protocol error: the frame is dropped and the
/// connection is left alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Insufficient data to parse a frame
    #[error("Insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Bytes required to make progress
        needed: usize,
        /// Bytes available
        have: usize,
    },

    /// First byte is not a final text, ping or close frame
    #[error("Unsupported frame header 0x{header:02x}")]
    UnsupportedOpcode {
        /// The raw FIN+opcode byte
        header: u8,
        /// Total length of the offending frame
        frame_len: usize,
    },

    /// Non-final (fragmented) text frame
    #[error("Fragmented frames are not supported")]
    Fragmented {
        /// Total length of the offending frame
        frame_len: usize,
    },

    /// 64-bit extended payload length
    #[error("64-bit extended payload length is not supported")]
    ExtendedLength64 {
        /// Total length of the offending frame, saturated to `usize::MAX`
        frame_len: usize,
    },

    /// Payload cannot be represented with a 16-bit length
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge {
        /// Payload size
        size: usize,
        /// Largest supported payload size
        max: usize,
    },

    /// Reserved bits set in the header
    #[error("Reserved bits set in frame header")]
    ReservedBitsSet {
        /// Total length of the offending frame
        frame_len: usize,
    },
}

impl FrameError {
    /// Number of bytes a caller can discard to skip past the bad frame.
    ///
    /// The count may exceed what is buffered; the remainder is still on
    /// the wire. `None` means the frame boundary is unknown and the whole
    /// buffer must be dropped.
    pub fn skip_len(&self) -> Option<usize> {
        match self {
            FrameError::UnsupportedOpcode { frame_len, .. }
            | FrameError::Fragmented { frame_len }
            | FrameError::ReservedBitsSet { frame_len }
            | FrameError::ExtendedLength64 { frame_len } => Some(*frame_len),
            FrameError::InsufficientData { .. } | FrameError::TooLarge { .. } => None,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue {
        /// Key that failed to parse
        field: String,
        /// Offending raw value
        value: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}
