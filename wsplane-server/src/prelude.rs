//! Prelude module with common imports
//!
//! This module re-exports the most commonly used types and traits
//! from the wsplane-server crate for ergonomic imports.

// Engine types
pub use crate::config::{EngineConfig, KeyValueStore};
pub use crate::connection::{ConnectionId, ConnectionInfo, UpgradeContext};
pub use crate::engine::{Engine, EngineHandle};
pub use crate::error::{EngineError, HandlerError};
pub use crate::event_loop::LoopState;
pub use crate::handler::{
    from_fn, ChannelHandler, Context, DispatchEvent, EchoHandler, FnHandler, Handler,
    HandlerResult,
};
pub use crate::stats::EngineStats;

// Re-export core types
pub use wsplane_core::prelude::*;
