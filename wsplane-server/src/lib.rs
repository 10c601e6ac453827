//! wsplane server
//!
//! Readiness-driven WebSocket data plane. An external HTTP layer performs
//! the upgrade handshake and hands the engine the raw socket; the engine
//! multiplexes every upgraded socket on one poller thread, decodes frames
//! and dispatches text payloads to a [`Handler`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsplane_server::prelude::*;
//!
//! fn main() -> wsplane_server::Result<()> {
//!     let handler = FnHandler::new()
//!         .with_connect(|ctx| {
//!             ctx.reply("welcome")?;
//!             Ok(())
//!         })
//!         .with_data(|ctx, text| {
//!             ctx.broadcast(text)?;
//!             Ok(())
//!         });
//!
//!     let engine = Engine::new(EngineConfig::default(), handler)?;
//!     engine.start()?;
//!     // engine.upgrade(stream, None, leftover)? for every upgraded socket
//!     engine.wait_for()
//! }
//! ```
//!
//! Only Unix platforms are supported: sockets are registered with the
//! multiplexer by raw descriptor.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(unix))]
compile_error!("wsplane-server requires a Unix platform");

// Public modules
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod logging;
pub mod multiplexer;
pub mod registry;
pub mod stats;

mod reader;
mod writer;

// Prelude module with common imports
pub mod prelude;

// Re-export key types for convenience
pub use config::{EngineConfig, KeyValueStore, CONFIG_SECTION};
pub use connection::{ConnectionId, ConnectionInfo, UpgradeContext};
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, HandlerError, Result};
pub use event_loop::LoopState;
pub use handler::{
    from_fn, ChannelHandler, Context, DispatchEvent, EchoHandler, FnHandler, Handler,
    HandlerResult,
};
pub use logging::init_logging;
pub use stats::EngineStats;
