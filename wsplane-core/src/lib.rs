//! # wsplane Core
//!
//! Wire-level building blocks for the wsplane WebSocket engine.
//!
//! This crate is pure: it performs no I/O and spawns no threads. It includes:
//!
//! - Error handling and types
//! - Frame decoding and encoding for single-frame text messages
//! - Ping to pong conversion
//! - Protocol constants and opcodes

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

// Core modules
pub mod error;
pub mod frame;
pub mod protocol;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use error::{ConfigError, FrameError};
pub use frame::{decode, encode, encode_pong, mask_in_place, Decoded};
pub use protocol::Opcode;
