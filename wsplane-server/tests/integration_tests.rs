//! Integration tests for the wsplane engine
//!
//! A plain `TcpListener` stands in for the HTTP layer: accepted sockets
//! are handed to the engine as if the upgrade handshake had completed.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use wsplane_server::prelude::*;

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config() -> EngineConfig {
    EngineConfig::default().with_timeout(Duration::from_millis(20))
}

struct Harness {
    engine: Engine,
    events: Receiver<DispatchEvent>,
    listener: TcpListener,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let (handler, events) = ChannelHandler::new();
        Self::with_handler(config, handler, events)
    }

    fn with_handler<H: Handler>(
        config: EngineConfig,
        handler: H,
        events: Receiver<DispatchEvent>,
    ) -> Self {
        let engine = Engine::new(config, handler).unwrap();
        engine.start().unwrap();
        Self {
            engine,
            events,
            listener: TcpListener::bind("127.0.0.1:0").unwrap(),
        }
    }

    fn connect(&self) -> (ConnectionId, TcpStream) {
        self.connect_with(&[], None)
    }

    fn connect_with(
        &self,
        leftover: &[u8],
        context: Option<Arc<dyn UpgradeContext>>,
    ) -> (ConnectionId, TcpStream) {
        let client = TcpStream::connect(self.listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
        let (server, _) = self.listener.accept().unwrap();
        let id = self
            .engine
            .upgrade(server, context, Bytes::copy_from_slice(leftover))
            .unwrap();
        (id, client)
    }

    /// Connect and wait until `on_connect` has fired
    fn connected(&self) -> (ConnectionId, TcpStream) {
        let (id, client) = self.connect();
        assert_eq!(self.next_event(), DispatchEvent::Connected(id));
        (id, client)
    }

    fn next_event(&self) -> DispatchEvent {
        self.events
            .recv_timeout(EVENT_TIMEOUT)
            .expect("no dispatch event")
    }

    fn assert_quiet(&self) {
        let event = self.events.recv_timeout(Duration::from_millis(150));
        assert!(event.is_err(), "unexpected event {:?}", event);
    }
}

fn masked(text: &str) -> Bytes {
    wsplane_core::encode(text.as_bytes(), true).unwrap()
}

fn read_frame(client: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).unwrap();
    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            client.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };
    let mut payload = vec![0u8; len];
    client.read_exact(&mut payload).unwrap();
    (header[0], payload)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Default)]
struct CountingContext(AtomicUsize);

impl UpgradeContext for CountingContext {
    fn downgrade(&self, _id: ConnectionId) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_masked_text_frame_dispatched() {
    let harness = Harness::new(test_config());
    let (id, mut client) = harness.connected();

    let key = [0x37, 0xfa, 0x21, 0x3d];
    let mut payload = *b"hello";
    wsplane_core::mask_in_place(&mut payload, key);
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&key);
    frame.extend_from_slice(&payload);
    client.write_all(&frame).unwrap();

    assert_eq!(
        harness.next_event(),
        DispatchEvent::Data {
            id,
            text: "hello".to_string()
        }
    );
    harness.assert_quiet();
}

#[test]
fn test_ping_answered_without_dispatch() {
    let harness = Harness::new(test_config());
    let (_id, mut client) = harness.connected();

    client.write_all(&[0x89, 0x00]).unwrap();
    let mut pong = [0u8; 2];
    client.read_exact(&mut pong).unwrap();
    assert_eq!(pong, [0x8A, 0x00]);
    harness.assert_quiet();
}

#[test]
fn test_close_frame_removes_connection() {
    let harness = Harness::new(test_config());
    let context = Arc::new(CountingContext::default());
    let (id, mut client) = harness.connect_with(&[], Some(context.clone()));
    assert_eq!(harness.next_event(), DispatchEvent::Connected(id));

    // data behind the close frame must not be dispatched
    let mut bytes = vec![0x88, 0x00];
    bytes.extend_from_slice(&masked("too late"));
    client.write_all(&bytes).unwrap();

    assert_eq!(harness.next_event(), DispatchEvent::Disconnected(id));
    harness.assert_quiet();
    assert_eq!(context.0.load(Ordering::SeqCst), 1);
    assert_eq!(harness.engine.connection_count(), 0);
    assert!(harness.engine.connection_info(id).is_none());

    let err = harness.engine.write(id, "anyone there?").unwrap_err();
    assert!(matches!(err, EngineError::FatalWrite { .. }));

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_write_above_mtu_is_fatal() {
    let harness = Harness::new(test_config().with_mtu(16));
    let (id, mut client) = harness.connected();

    let err = harness.engine.write(id, &"x".repeat(17)).unwrap_err();
    assert!(matches!(err, EngineError::FatalWrite { .. }));
    assert!(harness.engine.handle().is_valid(id));

    // the connection still works and nothing was sent before this frame
    harness.engine.write(id, &"y".repeat(16)).unwrap();
    let (header, payload) = read_frame(&mut client);
    assert_eq!(header, 0x81);
    assert_eq!(payload, b"yyyyyyyyyyyyyyyy");
}

#[test]
fn test_broadcast_skips_invalid_connection() {
    let harness = Harness::new(test_config());
    let mut live: Vec<_> = (0..3).map(|_| harness.connected()).collect();
    let (dead, _dead_client) = harness.connected();
    harness.engine.invalidate(dead);

    assert_eq!(harness.engine.broadcast("news").unwrap(), 3);
    for (_, client) in live.iter_mut() {
        assert_eq!(read_frame(client), (0x81, b"news".to_vec()));
    }
}

#[test]
fn test_leftover_bytes_dispatched_after_connect() {
    let harness = Harness::new(test_config());
    let mut leftover = masked("early").to_vec();
    leftover.extend_from_slice(&masked("bird"));
    let (id, _client) = harness.connect_with(&leftover, None);

    assert_eq!(harness.next_event(), DispatchEvent::Connected(id));
    assert_eq!(
        harness.next_event(),
        DispatchEvent::Data {
            id,
            text: "early".to_string()
        }
    );
    assert_eq!(
        harness.next_event(),
        DispatchEvent::Data {
            id,
            text: "bird".to_string()
        }
    );
}

#[test]
fn test_structured_payload() {
    let harness = Harness::new(test_config());
    let (id, mut client) = harness.connected();

    client.write_all(&masked(r#"{"type":"ping","seq":3}"#)).unwrap();
    assert!(matches!(harness.next_event(), DispatchEvent::Data { .. }));
    match harness.next_event() {
        DispatchEvent::Structured { id: from, value } => {
            assert_eq!(from, id);
            assert_eq!(value["seq"], 3);
        }
        other => panic!("unexpected {:?}", other),
    }

    // plain text has no structured counterpart
    client.write_all(&masked("not json")).unwrap();
    assert!(matches!(harness.next_event(), DispatchEvent::Data { .. }));
    harness.assert_quiet();
}

#[test]
fn test_echo_handler_round_trip() {
    let (_unused, events) = mpsc::channel();
    let harness = Harness::with_handler(test_config(), EchoHandler::new(), events);
    let (_id, mut client) = harness.connect();

    client.write_all(&masked("echo me")).unwrap();
    assert_eq!(read_frame(&mut client), (0x81, b"echo me".to_vec()));
}

#[test]
fn test_failing_handler_does_not_stop_loop() {
    let (tx, events) = mpsc::channel();
    let handler = FnHandler::new().with_data(move |ctx, text| {
        match text {
            "panic" => panic!("handler blew up"),
            "error" => return Err("handler refused".into()),
            _ => {}
        }
        tx.send(DispatchEvent::Data {
            id: ctx.id(),
            text: text.to_string(),
        })?;
        Ok(())
    });
    let harness = Harness::with_handler(test_config(), handler, events);
    let (id, mut client) = harness.connect();

    for text in ["panic", "error", "survived"] {
        client.write_all(&masked(text)).unwrap();
    }
    assert_eq!(
        harness.next_event(),
        DispatchEvent::Data {
            id,
            text: "survived".to_string()
        }
    );
    assert!(harness.engine.handle().is_valid(id));
    assert_ne!(harness.engine.state(), LoopState::Stopped);
}

#[test]
fn test_peer_disconnect_sweeps_connection() {
    let harness = Harness::new(test_config());
    let context = Arc::new(CountingContext::default());
    let (id, client) = harness.connect_with(&[], Some(context.clone()));
    assert_eq!(harness.next_event(), DispatchEvent::Connected(id));

    drop(client);
    assert_eq!(harness.next_event(), DispatchEvent::Disconnected(id));
    assert_eq!(context.0.load(Ordering::SeqCst), 1);

    let stats = harness.engine.stats();
    assert_eq!(stats.active_connections, 0);
    assert_eq!(stats.swept_connections, 1);
}

#[test]
fn test_message_larger_than_read_buffer() {
    let harness = Harness::new(test_config().with_read_buffer_size(512));
    let (id, mut client) = harness.connected();

    let text: String = (0..10_000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    client.write_all(&masked(&text)).unwrap();
    assert_eq!(harness.next_event(), DispatchEvent::Data { id, text });
}

#[test]
fn test_frame_split_across_writes() {
    let harness = Harness::new(test_config());
    let (id, mut client) = harness.connected();

    let frame = masked("slow peer");
    client.write_all(&frame[..3]).unwrap();
    thread::sleep(Duration::from_millis(60));
    client.write_all(&frame[3..]).unwrap();

    assert_eq!(
        harness.next_event(),
        DispatchEvent::Data {
            id,
            text: "slow peer".to_string()
        }
    );
}

#[test]
fn test_idle_connection_invalidated() {
    let config = test_config().with_idle_timeout(Some(Duration::from_millis(100)));
    let harness = Harness::new(config);
    let (id, _client) = harness.connected();

    assert_eq!(harness.next_event(), DispatchEvent::Disconnected(id));
}

#[test]
fn test_idle_engine_reacts_to_upgrade_and_terminate() {
    let harness = Harness::new(EngineConfig::default().with_timeout(Duration::from_secs(10)));
    // let the poller settle into a wait with nothing registered
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let (id, _client) = harness.connected();
    assert!(started.elapsed() < Duration::from_secs(2));

    thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    harness.engine.terminate();
    harness.engine.wait_for().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(harness.next_event(), DispatchEvent::Disconnected(id));
}

#[test]
fn test_idle_engine_terminates_promptly() {
    let harness = Harness::new(EngineConfig::default().with_timeout(Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    harness.engine.terminate();
    harness.engine.wait_for().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(harness.engine.state(), LoopState::Stopped);
}

#[test]
fn test_terminate_and_wait_for() {
    let harness = Harness::new(test_config());
    let (a, mut client) = harness.connected();
    let (b, _other) = harness.connected();

    harness.engine.terminate();
    harness.engine.wait_for().unwrap();
    assert_eq!(harness.engine.state(), LoopState::Stopped);

    let mut disconnected = vec![harness.next_event(), harness.next_event()];
    disconnected.sort_by_key(|event| event.id());
    assert_eq!(
        disconnected,
        vec![DispatchEvent::Disconnected(a), DispatchEvent::Disconnected(b)]
    );

    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert!(matches!(
        harness.engine.handle().upgrade(
            TcpStream::connect(harness.listener.local_addr().unwrap()).unwrap(),
            None,
            Bytes::new()
        ),
        Err(EngineError::ShuttingDown)
    ));
}

#[test]
fn test_no_bytes_reach_socket_after_invalidate() {
    let harness = Harness::new(test_config());
    let (id, mut client) = harness.connected();

    // keep the client's receive buffer empty and count what arrives
    let received = Arc::new(AtomicUsize::new(0));
    let reader = {
        let received = received.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while let Ok(n) = client.read(&mut buf) {
                if n == 0 {
                    break;
                }
                received.fetch_add(n, Ordering::SeqCst);
            }
        })
    };

    let invalidated = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));
    let late_writes = Arc::new(AtomicUsize::new(0));
    let handle = harness.engine.handle();
    let writers: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            let invalidated = invalidated.clone();
            let stop = stop.clone();
            let late_writes = late_writes.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let after = invalidated.load(Ordering::SeqCst);
                    match handle.write(id, "concurrent") {
                        Ok(()) if after => {
                            late_writes.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(()) => {}
                        Err(EngineError::FatalWrite { .. })
                        | Err(EngineError::WriteFailed { .. }) => {}
                        Err(other) => panic!("unexpected error {:?}", other),
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    assert!(handle.invalidate(id));
    invalidated.store(true, Ordering::SeqCst);

    // bytes written before invalidate returned finish arriving
    thread::sleep(Duration::from_millis(100));
    let settled = received.load(Ordering::SeqCst);
    assert!(settled > 0);

    // writers keep hammering the dead connection
    thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::SeqCst);
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(received.load(Ordering::SeqCst), settled);
    assert_eq!(late_writes.load(Ordering::SeqCst), 0);
    assert!(matches!(
        handle.write(id, "after"),
        Err(EngineError::FatalWrite { .. })
    ));
    assert_eq!(harness.next_event(), DispatchEvent::Disconnected(id));
    reader.join().unwrap();
    assert_eq!(received.load(Ordering::SeqCst), settled);
}

#[test]
fn test_engine_stats() {
    let harness = Harness::new(test_config());
    let (id, mut client) = harness.connected();

    client.write_all(&masked("one")).unwrap();
    client.write_all(&[0x89, 0x00]).unwrap();
    assert!(matches!(harness.next_event(), DispatchEvent::Data { .. }));
    let mut pong = [0u8; 2];
    client.read_exact(&mut pong).unwrap();

    harness.engine.write(id, "two").unwrap();
    assert!(wait_until(|| harness.engine.stats().frames_sent == 2));

    let stats = harness.engine.stats();
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.protocol_errors, 0);
}

#[test]
fn test_engine_from_config_store() {
    let mut store = std::collections::HashMap::new();
    store.insert("WebSocket.Timeout".to_string(), "15".to_string());
    store.insert("WebSocket.MTU".to_string(), "128".to_string());

    let engine = Engine::from_store(&store, EchoHandler::new()).unwrap();
    assert_eq!(engine.handle().config().mtu, 128);
    assert_eq!(engine.handle().config().timeout, Duration::from_millis(15));
}
