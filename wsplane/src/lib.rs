//! # wsplane
//!
//! Readiness-driven WebSocket data plane for sockets whose HTTP upgrade
//! was performed elsewhere.
//!
//! [`core`](wsplane_core) holds the frame codec; [`server`] holds the
//! engine: connection registry, event loop, reader, writer and the
//! dispatch interface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsplane::prelude::*;
//!
//! fn main() -> wsplane::server::Result<()> {
//!     let engine = Engine::new(EngineConfig::default(), EchoHandler::new())?;
//!     engine.start()?;
//!
//!     // for every socket the HTTP layer upgrades:
//!     // engine.upgrade(stream, None, leftover_bytes)?;
//!
//!     engine.wait_for()
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

// Re-export core components
pub use wsplane_core::*;

#[cfg(feature = "server")]
pub use wsplane_server as server;

/// Prelude module with common imports
pub mod prelude {
    pub use wsplane_core::prelude::*;

    #[cfg(feature = "server")]
    pub use wsplane_server::prelude::*;
}
