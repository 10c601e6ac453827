//! Simple chat relay example
//!
//! A bare `TcpListener` stands in for the HTTP layer: every accepted socket
//! is treated as already upgraded. Text frames are broadcast to every
//! connection; JSON frames with a `"nick"` field rename the sender.
//!
//! Run with `RUST_LOG=debug cargo run --example server_example --features logging`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use wsplane_server::prelude::*;

fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    wsplane_server::init_logging()?;

    let nicks: Arc<Mutex<HashMap<ConnectionId, String>>> = Arc::default();
    let on_nick = nicks.clone();
    let on_data = nicks.clone();
    let on_leave = nicks;

    let handler = FnHandler::new()
        .with_connect(|ctx| {
            ctx.reply("welcome; send {\"nick\": \"name\"} to pick a name")?;
            Ok(())
        })
        .with_structured(move |ctx, value| {
            if let Some(nick) = value.get("nick").and_then(|v| v.as_str()) {
                on_nick.lock().insert(ctx.id(), nick.to_string());
                ctx.reply(&format!("you are now {}", nick))?;
            }
            Ok(())
        })
        .with_data(move |ctx, text| {
            let name = on_data
                .lock()
                .get(&ctx.id())
                .cloned()
                .unwrap_or_else(|| ctx.id().to_string());
            ctx.broadcast(&format!("{}: {}", name, text))?;
            Ok(())
        })
        .with_disconnect(move |ctx| {
            if let Some(name) = on_leave.lock().remove(&ctx.id()) {
                ctx.broadcast(&format!("{} left", name))?;
            }
            Ok(())
        });

    let engine = Engine::new(EngineConfig::default(), handler)?;
    engine.start()?;

    let listener = TcpListener::bind("127.0.0.1:8080")?;
    println!("Relay listening on 127.0.0.1:8080 (raw frames, no handshake)");

    for stream in listener.incoming() {
        let stream = stream?;
        let id = engine.upgrade(stream, None, Bytes::new())?;
        println!("connection {} joined", id);
    }

    engine.terminate();
    engine.wait_for()?;
    Ok(())
}
