//! Dispatch interface
//!
//! Application code receives decoded payloads through the [`Handler`]
//! trait. Every callback runs on the poller thread; errors and panics are
//! caught at the boundary, logged and discarded.

use crate::connection::ConnectionId;
use crate::engine::EngineHandle;
use crate::error::{HandlerError, Result};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::error;

/// Value returned by handler callbacks
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Connection a callback was invoked for, and access to the engine.
pub struct Context<'a> {
    id: ConnectionId,
    handle: &'a EngineHandle,
}

impl<'a> Context<'a> {
    pub(crate) fn new(id: ConnectionId, handle: &'a EngineHandle) -> Self {
        Self { id, handle }
    }

    /// Connection the event belongs to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Send a text frame back to this connection
    pub fn reply(&self, text: &str) -> Result<()> {
        self.handle.write(self.id, text)
    }

    /// Send a text frame to every valid connection
    pub fn broadcast(&self, text: &str) -> Result<usize> {
        self.handle.broadcast(text)
    }

    /// Invalidate this connection; it is removed on the next sweep
    pub fn close(&self) -> bool {
        self.handle.invalidate(self.id)
    }

    /// Engine handle, for use outside the callback
    pub fn handle(&self) -> &EngineHandle {
        self.handle
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("id", &self.id).finish()
    }
}

/// Application callbacks
pub trait Handler: Send + Sync + 'static {
    /// A connection was upgraded
    fn on_connect(&self, _ctx: &Context<'_>) -> HandlerResult {
        Ok(())
    }

    /// A text frame arrived
    fn on_data(&self, _ctx: &Context<'_>, _text: &str) -> HandlerResult {
        Ok(())
    }

    /// A text frame parsed as JSON; fires after `on_data` for the same frame
    fn on_structured(&self, _ctx: &Context<'_>, _value: &Value) -> HandlerResult {
        Ok(())
    }

    /// The connection was removed; writes to it fail from here on
    fn on_disconnect(&self, _ctx: &Context<'_>) -> HandlerResult {
        Ok(())
    }
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn on_connect(&self, ctx: &Context<'_>) -> HandlerResult {
        (**self).on_connect(ctx)
    }

    fn on_data(&self, ctx: &Context<'_>, text: &str) -> HandlerResult {
        (**self).on_data(ctx, text)
    }

    fn on_structured(&self, ctx: &Context<'_>, value: &Value) -> HandlerResult {
        (**self).on_structured(ctx, value)
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> HandlerResult {
        (**self).on_disconnect(ctx)
    }
}

/// Run one callback, converting errors and panics into a logged
/// [`HandlerError`].
pub(crate) fn dispatch<F>(
    operation: &'static str,
    id: ConnectionId,
    f: F,
) -> std::result::Result<(), HandlerError>
where
    F: FnOnce() -> HandlerResult,
{
    let err = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(err)) => HandlerError::Returned {
            operation,
            message: err.to_string(),
        },
        Err(payload) => HandlerError::Panicked {
            operation,
            message: panic_message(payload.as_ref()),
        },
    };

    error!(connection_id = %id, operation, error = %err, "Handler failed");
    Err(err)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handler that sends every text frame back to its sender
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

impl EchoHandler {
    /// Create a new echo handler
    pub fn new() -> Self {
        Self
    }
}

impl Handler for EchoHandler {
    fn on_data(&self, ctx: &Context<'_>, text: &str) -> HandlerResult {
        ctx.reply(text)?;
        Ok(())
    }
}

type ContextFn = Box<dyn Fn(&Context<'_>) -> HandlerResult + Send + Sync>;
type DataFn = Box<dyn Fn(&Context<'_>, &str) -> HandlerResult + Send + Sync>;
type StructuredFn = Box<dyn Fn(&Context<'_>, &Value) -> HandlerResult + Send + Sync>;

/// Handler assembled from closures; unset callbacks do nothing
#[derive(Default)]
pub struct FnHandler {
    connect: Option<ContextFn>,
    data: Option<DataFn>,
    structured: Option<StructuredFn>,
    disconnect: Option<ContextFn>,
}

impl FnHandler {
    /// Create a handler with no callbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connect callback
    pub fn with_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.connect = Some(Box::new(f));
        self
    }

    /// Set the data callback
    pub fn with_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_>, &str) -> HandlerResult + Send + Sync + 'static,
    {
        self.data = Some(Box::new(f));
        self
    }

    /// Set the structured payload callback
    pub fn with_structured<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_>, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.structured = Some(Box::new(f));
        self
    }

    /// Set the disconnect callback
    pub fn with_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.disconnect = Some(Box::new(f));
        self
    }
}

impl Handler for FnHandler {
    fn on_connect(&self, ctx: &Context<'_>) -> HandlerResult {
        self.connect.as_ref().map_or(Ok(()), |f| f(ctx))
    }

    fn on_data(&self, ctx: &Context<'_>, text: &str) -> HandlerResult {
        self.data.as_ref().map_or(Ok(()), |f| f(ctx, text))
    }

    fn on_structured(&self, ctx: &Context<'_>, value: &Value) -> HandlerResult {
        self.structured.as_ref().map_or(Ok(()), |f| f(ctx, value))
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> HandlerResult {
        self.disconnect.as_ref().map_or(Ok(()), |f| f(ctx))
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("connect", &self.connect.is_some())
            .field("data", &self.data.is_some())
            .field("structured", &self.structured.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .finish()
    }
}

/// Create a handler from a data callback
pub fn from_fn<F>(f: F) -> FnHandler
where
    F: Fn(&Context<'_>, &str) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler::new().with_data(f)
}

/// Event forwarded by [`ChannelHandler`]
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// `on_connect`
    Connected(ConnectionId),
    /// `on_data`
    Data {
        /// Sender
        id: ConnectionId,
        /// Decoded text
        text: String,
    },
    /// `on_structured`
    Structured {
        /// Sender
        id: ConnectionId,
        /// Parsed payload
        value: Value,
    },
    /// `on_disconnect`
    Disconnected(ConnectionId),
}

impl DispatchEvent {
    /// Connection the event belongs to
    pub fn id(&self) -> ConnectionId {
        match self {
            DispatchEvent::Connected(id) | DispatchEvent::Disconnected(id) => *id,
            DispatchEvent::Data { id, .. } | DispatchEvent::Structured { id, .. } => *id,
        }
    }
}

/// Handler forwarding every callback over an mpsc channel, for consumers
/// on another thread
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<DispatchEvent>,
}

impl ChannelHandler {
    /// Create the handler and the receiving end of its channel
    pub fn new() -> (Self, mpsc::Receiver<DispatchEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: DispatchEvent) -> HandlerResult {
        self.tx
            .send(event)
            .map_err(|_| "dispatch receiver dropped".into())
    }
}

impl Handler for ChannelHandler {
    fn on_connect(&self, ctx: &Context<'_>) -> HandlerResult {
        self.send(DispatchEvent::Connected(ctx.id()))
    }

    fn on_data(&self, ctx: &Context<'_>, text: &str) -> HandlerResult {
        self.send(DispatchEvent::Data {
            id: ctx.id(),
            text: text.to_string(),
        })
    }

    fn on_structured(&self, ctx: &Context<'_>, value: &Value) -> HandlerResult {
        self.send(DispatchEvent::Structured {
            id: ctx.id(),
            value: value.clone(),
        })
    }

    fn on_disconnect(&self, ctx: &Context<'_>) -> HandlerResult {
        self.send(DispatchEvent::Disconnected(ctx.id()))
    }
}
