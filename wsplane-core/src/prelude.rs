//! Prelude module for wsplane Core
//!
//! This module re-exports commonly used types so that users of the
//! library can pull them in with a single import.

pub use crate::error::{ConfigError, FrameError};
pub use crate::frame::{decode, encode, encode_pong, Decoded};
pub use crate::protocol::Opcode;

// Re-export commonly used external dependencies
pub use bytes::{Bytes, BytesMut};
