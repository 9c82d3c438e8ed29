//! End-to-end session scenarios over an in-memory duplex transport.
//!
//! The peer side is driven by hand: raw handshake bytes plus a
//! client-role frame codec, so the tests control exactly what arrives on
//! the wire. Tests run under paused virtual time, which lets the 5 s
//! handshake deadline and the 1 s close-ack deadline fire without real
//! waiting.

use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::{Decoder, Encoder};
use websock::close::CloseRecord;
use websock::endpoint::{Handler, Rejection, SessionConfig};
use websock::frame::{Frame, FrameCodec, Opcode};
use websock::handshake::{ClientHandshake, HandshakeRecord, HttpResponse, ResponseOptions};
use websock::message::Message;
use websock::session::{Session, SessionLink, SessionState};

const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
    Host: server.example.com\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Origin: http://example.com\r\n\
    Sec-WebSocket-Protocol: chat, superchat\r\n\
    Sec-WebSocket-Extensions: permessage-deflate\r\n\
    \r\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Open {
        subprotocol: Option<String>,
        version: Option<u16>,
        origin: Option<String>,
        resource: Option<String>,
        extensions: Vec<String>,
    },
    Message(Message),
    Closed {
        was_clean: bool,
        local_code: Option<u16>,
        remote_code: Option<u16>,
    },
}

type Events = Arc<Mutex<Vec<Event>>>;

/// Scriptable handler recording every callback.
#[derive(Default)]
struct TestHandler {
    events: Events,
    echo: bool,
    reject: Option<(u16, String)>,
    select_subprotocol: Option<String>,
    select_extension: Option<String>,
    close_on_open: Option<(u16, String)>,
}

impl TestHandler {
    fn recording(events: &Events) -> Self {
        Self {
            events: Arc::clone(events),
            ..Self::default()
        }
    }

    fn echoing(events: &Events) -> Self {
        Self {
            echo: true,
            ..Self::recording(events)
        }
    }
}

impl Handler for TestHandler {
    fn validate(
        &mut self,
        _record: &HandshakeRecord,
        response: &mut ResponseOptions,
    ) -> Result<(), Rejection> {
        if let Some((status, reason)) = &self.reject {
            return Err(Rejection::new(*status, reason.clone()));
        }
        if let Some(proto) = &self.select_subprotocol {
            response.select_subprotocol(proto.clone());
        }
        if let Some(ext) = &self.select_extension {
            response.select_extension(ext.clone());
        }
        Ok(())
    }

    fn on_open(&mut self, link: &mut SessionLink<'_>) {
        assert_eq!(link.state(), SessionState::Open);
        assert_eq!(link.client_header("host"), Some("server.example.com"));
        self.events.lock().unwrap().push(Event::Open {
            subprotocol: link
                .subprotocol()
                .expect("handshake is complete in on_open")
                .map(String::from),
            version: link.version(),
            origin: link.origin().map(String::from),
            resource: link.resource().map(String::from),
            extensions: link.offered_extensions().to_vec(),
        });
        if let Some((code, reason)) = self.close_on_open.take() {
            link.close(code, &reason);
        }
    }

    fn on_message(&mut self, link: &mut SessionLink<'_>, message: Message) {
        self.events.lock().unwrap().push(Event::Message(message.clone()));
        if self.echo {
            match message {
                Message::Text(text) => link.send_text(text),
                Message::Binary(data) => link.send_binary(data),
            }
        }
    }

    fn on_close(&mut self, record: &CloseRecord) {
        self.events.lock().unwrap().push(Event::Closed {
            was_clean: record.was_clean,
            local_code: record.local_code,
            remote_code: record.remote_code,
        });
    }
}

/// Hand-driven peer: raw bytes for the handshake, a client-role codec for
/// frames.
struct TestClient {
    io: DuplexStream,
    encoder: FrameCodec,
    decoder: FrameCodec,
    buf: BytesMut,
}

impl TestClient {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            encoder: FrameCodec::client(),
            decoder: FrameCodec::client(),
            buf: BytesMut::new(),
        }
    }

    /// Writes a handshake request and reads the response head.
    async fn handshake(&mut self, request: &str) -> String {
        self.io.write_all(request.as_bytes()).await.unwrap();
        loop {
            if let Some(end) = self
                .buf
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|i| i + 4)
            {
                let head = self.buf.split_to(end);
                return String::from_utf8(head.to_vec()).unwrap();
            }
            let mut chunk = [0u8; 1024];
            let n = self.io.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "EOF before handshake response completed");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        let mut wire = BytesMut::new();
        self.encoder.encode(frame, &mut wire).unwrap();
        self.io.write_all(&wire).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Reads the next frame; `None` at EOF.
    async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(frame);
            }
            let mut chunk = [0u8; 1024];
            let n = self.io.read(&mut chunk).await.unwrap();
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads a frame and asserts it is a CLOSE, returning code and reason.
    async fn recv_close(&mut self) -> (Option<u16>, Option<String>) {
        let frame = self.recv_frame().await.expect("expected a close frame");
        assert_eq!(frame.opcode, Opcode::Close);
        match frame.payload.len() {
            0 => (None, None),
            _ => {
                let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                let reason = if frame.payload.len() > 2 {
                    Some(String::from_utf8(frame.payload[2..].to_vec()).unwrap())
                } else {
                    None
                };
                (Some(code), reason)
            }
        }
    }

    /// Acknowledges a close with the given code.
    async fn send_close_ack(&mut self, code: u16) {
        let payload = Bytes::copy_from_slice(&code.to_be_bytes());
        self.send_frame(Frame::close(payload)).await;
    }

    async fn expect_eof(&mut self) {
        assert!(self.recv_frame().await.is_none(), "expected EOF");
    }
}

fn spawn_server(
    handler: TestHandler,
    config: SessionConfig,
) -> (TestClient, tokio::task::JoinHandle<CloseRecord>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let session = Session::server(server_io, handler, config);
    let server = tokio::spawn(session.run());
    (TestClient::new(client_io), server)
}

fn events_of(events: &Events) -> Vec<Event> {
    events.lock().unwrap().clone()
}

fn text_frame(fin: bool, payload: &[u8]) -> Frame {
    let mut frame = Frame::text(Bytes::copy_from_slice(payload));
    frame.fin = fin;
    frame
}

fn continuation_frame(fin: bool, payload: &[u8]) -> Frame {
    Frame {
        fin,
        rsv: 0,
        opcode: Opcode::Continuation,
        mask_key: None,
        payload: Bytes::copy_from_slice(payload),
    }
}

// Scenario: canonical version-13 handshake from the RFC.
#[tokio::test(start_paused = true)]
async fn canonical_v13_handshake() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::recording(&events), SessionConfig::default());

    let response = client.handshake(SAMPLE_REQUEST).await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response.contains("Upgrade: websocket\r\n"));
    assert!(response.contains("Connection: Upgrade\r\n"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(response.contains("Server: websock/"));
}

// Scenario: echo round-trip of a masked single-frame text message.
#[tokio::test(start_paused = true)]
async fn echo_round_trip() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    client.send_frame(Frame::text("Hello")).await;

    let frame = client.recv_frame().await.unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert!(!frame.is_masked(), "server frames must be unmasked");
    assert_eq!(frame.payload.as_ref(), b"Hello");

    let events = events_of(&events);
    assert!(matches!(&events[0], Event::Open { .. }));
    assert_eq!(events[1], Event::Message(Message::text("Hello")));
}

// Scenario: three-fragment text message delivers exactly once.
#[tokio::test(start_paused = true)]
async fn fragmented_text_delivers_once() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    client.send_frame(text_frame(false, b"Hel")).await;
    client.send_frame(continuation_frame(false, b"lo, ")).await;
    client.send_frame(continuation_frame(true, b"World")).await;

    // The echo proves exactly one delivery.
    let frame = client.recv_frame().await.unwrap();
    assert_eq!(frame.payload.as_ref(), b"Hello, World");

    let messages: Vec<_> = events_of(&events)
        .into_iter()
        .filter(|e| matches!(e, Event::Message(_)))
        .collect();
    assert_eq!(messages, vec![Event::Message(Message::text("Hello, World"))]);
}

// Scenario: a ping interleaved in a fragmented message is answered with a
// pong and does not disturb assembly.
#[tokio::test(start_paused = true)]
async fn interleaved_ping_answered_mid_message() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    client.send_frame(text_frame(false, b"Hel")).await;
    client.send_frame(Frame::ping("x")).await;
    client.send_frame(continuation_frame(true, b"lo")).await;

    let pong = client.recv_frame().await.unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload.as_ref(), b"x");

    let echo = client.recv_frame().await.unwrap();
    assert_eq!(echo.opcode, Opcode::Text);
    assert_eq!(echo.payload.as_ref(), b"Hello");
}

// Scenario: invalid UTF-8 in a text frame closes with 1007; the close is
// clean because the peer acknowledges within the deadline.
#[tokio::test(start_paused = true)]
async fn invalid_utf8_closes_with_1007() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    client
        .send_frame(Frame::text(Bytes::from_static(&[0xC0, 0xAF])))
        .await;

    let (code, _reason) = client.recv_close().await;
    assert_eq!(code, Some(1007));
    client.send_close_ack(1007).await;

    let record = server.await.unwrap();
    assert!(record.was_clean);
    assert!(record.closed_by_me);
    assert_eq!(record.local_code, Some(1007));
    assert!(!events_of(&events)
        .iter()
        .any(|e| matches!(e, Event::Message(_))));
}

// Same payload violation, but the peer never acknowledges: the close-ack
// deadline expires and the close is unclean.
#[tokio::test(start_paused = true)]
async fn missing_close_ack_is_unclean() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    client
        .send_frame(Frame::text(Bytes::from_static(&[0xC0, 0xAF])))
        .await;

    let (code, _) = client.recv_close().await;
    assert_eq!(code, Some(1007));
    // No acknowledgement; the 1 s deadline expires under virtual time.
    let record = server.await.unwrap();
    assert!(!record.was_clean);
    assert_eq!(record.local_code, Some(1007));
}

// Scenario: an unmasked client frame is a protocol violation answered
// with close 1002.
#[tokio::test(start_paused = true)]
async fn unmasked_client_frame_closes_with_1002() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    // TEXT "Hello" with MASK = 0, hand-assembled.
    client.send_raw(&[0x81, 0x05]).await;
    client.send_raw(b"Hello").await;

    let (code, _) = client.recv_close().await;
    assert_eq!(code, Some(1002));
    client.send_close_ack(1002).await;

    let record = server.await.unwrap();
    assert!(record.was_clean);
    assert_eq!(record.local_code, Some(1002));
}

// Scenario: no bytes within the handshake deadline drops the connection
// without any callback.
#[tokio::test(start_paused = true)]
async fn handshake_timeout_drops_tcp() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::recording(&events), SessionConfig::default());

    // Send nothing. Virtual time advances past the 5 s deadline.
    let record = server.await.unwrap();
    assert!(record.dropped_by_me);
    assert!(!record.was_clean);
    assert!(events_of(&events).is_empty(), "no on_open, no on_close");
    client.expect_eof().await;
}

// The application validate hook can reject with a specific HTTP status.
#[tokio::test(start_paused = true)]
async fn validate_rejection_answers_http_error() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        reject: Some((403, "token expired".to_string())),
        ..TestHandler::recording(&events)
    };
    let (mut client, server) = spawn_server(handler, SessionConfig::default());

    let response = client.handshake(SAMPLE_REQUEST).await;
    assert!(response.starts_with("HTTP/1.1 403 token expired\r\n"));
    let record = server.await.unwrap();
    assert!(record.dropped_by_me);
    assert!(events_of(&events).is_empty());
}

// Subprotocol selection is echoed in the response and visible through the
// link.
#[tokio::test(start_paused = true)]
async fn subprotocol_negotiation() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        select_subprotocol: Some("chat".to_string()),
        ..TestHandler::recording(&events)
    };
    let (mut client, _server) = spawn_server(handler, SessionConfig::default());

    let response = client.handshake(SAMPLE_REQUEST).await;
    assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"));

    // Drive one frame through so on_open has certainly run.
    client.send_frame(Frame::ping("sync")).await;
    client.recv_frame().await.unwrap();

    let events = events_of(&events);
    assert_eq!(
        events[0],
        Event::Open {
            subprotocol: Some("chat".to_string()),
            version: Some(13),
            origin: Some("http://example.com".to_string()),
            resource: Some("/chat".to_string()),
            extensions: vec!["permessage-deflate".to_string()],
        }
    );
}

// Extension selection is echoed in the response and recorded on the
// offered list.
#[tokio::test(start_paused = true)]
async fn extension_selection_echoed() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        select_extension: Some("permessage-deflate".to_string()),
        ..TestHandler::recording(&events)
    };
    let (mut client, _server) = spawn_server(handler, SessionConfig::default());

    let response = client.handshake(SAMPLE_REQUEST).await;
    assert!(response.contains("Sec-WebSocket-Extensions: permessage-deflate\r\n"));
}

// The endpoint registry vets the Host header before anything else runs.
#[tokio::test(start_paused = true)]
async fn host_rejected_by_endpoint_registry() {
    init_tracing();

    struct OneHost;
    impl websock::endpoint::Endpoint for OneHost {
        fn validate_host(&self, host: &str) -> bool {
            host == "allowed.example"
        }
    }

    let events = Events::default();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let session = Session::server_with_endpoint(
        server_io,
        TestHandler::recording(&events),
        OneHost,
        SessionConfig::default(),
    );
    let server = tokio::spawn(session.run());
    let mut client = TestClient::new(client_io);

    let response = client.handshake(SAMPLE_REQUEST).await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    let record = server.await.unwrap();
    assert!(record.dropped_by_me);
    assert!(events_of(&events).is_empty());
}

// Selecting a subprotocol the client did not offer is an internal error.
#[tokio::test(start_paused = true)]
async fn unoffered_subprotocol_yields_500() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        select_subprotocol: Some("graphql-ws".to_string()),
        ..TestHandler::recording(&events)
    };
    let (mut client, server) = spawn_server(handler, SessionConfig::default());

    let response = client.handshake(SAMPLE_REQUEST).await;
    assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    server.await.unwrap();
    assert!(events_of(&events).is_empty());
}

// Versions below 13 carry the origin in Sec-WebSocket-Origin.
#[tokio::test(start_paused = true)]
async fn version_8_uses_legacy_origin_header() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::recording(&events), SessionConfig::default());

    let request = "GET /legacy HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 8\r\n\
        Sec-WebSocket-Origin: http://legacy.example\r\n\
        \r\n";
    let response = client.handshake(request).await;
    assert!(response.starts_with("HTTP/1.1 101"));

    client.send_frame(Frame::ping("sync")).await;
    client.recv_frame().await.unwrap();

    assert_eq!(
        events_of(&events)[0],
        Event::Open {
            subprotocol: None,
            version: Some(8),
            origin: Some("http://legacy.example".to_string()),
            resource: Some("/legacy".to_string()),
            extensions: vec![],
        }
    );
}

// Remote-initiated close: the server acknowledges by echoing the code and
// records the peer as the closer.
#[tokio::test(start_paused = true)]
async fn remote_close_is_acknowledged() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    let mut payload = 1000u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"done");
    client.send_frame(Frame::close(Bytes::from(payload))).await;

    let (code, reason) = client.recv_close().await;
    assert_eq!(code, Some(1000));
    assert_eq!(reason.as_deref(), Some("done"));

    let record = server.await.unwrap();
    assert!(record.was_clean);
    assert!(!record.closed_by_me);
    assert_eq!(record.remote_code, Some(1000));
    assert_eq!(record.remote_reason.as_deref(), Some("done"));

    let events = events_of(&events);
    assert_eq!(
        events.last().unwrap(),
        &Event::Closed {
            was_clean: true,
            local_code: Some(1000),
            remote_code: Some(1000),
        }
    );
}

// Locally initiated close from a callback, acknowledged by the peer.
#[tokio::test(start_paused = true)]
async fn local_close_with_application_code() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        close_on_open: Some((4001, "done here".to_string())),
        ..TestHandler::recording(&events)
    };
    let (mut client, server) = spawn_server(handler, SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    let (code, reason) = client.recv_close().await;
    assert_eq!(code, Some(4001));
    assert_eq!(reason.as_deref(), Some("done here"));
    client.send_close_ack(4001).await;

    let record = server.await.unwrap();
    assert!(record.was_clean);
    assert!(record.closed_by_me);
    assert_eq!(record.local_code, Some(4001));
    assert_eq!(record.remote_code, Some(4001));
}

// The no-status sentinel is rewritten to a normal closure on the wire.
#[tokio::test(start_paused = true)]
async fn close_code_sanitation_on_the_wire() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        close_on_open: Some((1005, "ignored".to_string())),
        ..TestHandler::recording(&events)
    };
    let (mut client, server) = spawn_server(handler, SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    let (code, reason) = client.recv_close().await;
    assert_eq!(code, Some(1000));
    assert_eq!(reason, None);
    client.send_close_ack(1000).await;
    assert!(server.await.unwrap().was_clean);
}

// Data frames arriving while CLOSING are discarded.
#[tokio::test(start_paused = true)]
async fn data_ignored_while_closing() {
    init_tracing();
    let events = Events::default();
    let handler = TestHandler {
        close_on_open: Some((1000, String::new())),
        ..TestHandler::recording(&events)
    };
    let (mut client, server) = spawn_server(handler, SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    let (code, _) = client.recv_close().await;
    assert_eq!(code, Some(1000));

    client.send_frame(Frame::text("too late")).await;
    client.send_close_ack(1000).await;

    let record = server.await.unwrap();
    assert!(record.was_clean);
    assert!(!events_of(&events)
        .iter()
        .any(|e| matches!(e, Event::Message(_))));
}

// Frame bytes arriving in the same segment as the handshake are not lost.
#[tokio::test(start_paused = true)]
async fn frame_bytes_behind_handshake_are_processed() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    let mut wire = BytesMut::new();
    wire.extend_from_slice(SAMPLE_REQUEST.as_bytes());
    let mut encoder = FrameCodec::client();
    encoder.encode(Frame::text("early"), &mut wire).unwrap();
    client.send_raw(&wire).await;

    // Response head first, then the echo of the piggybacked frame.
    let response = client.handshake("").await;
    assert!(response.starts_with("HTTP/1.1 101"));
    let echo = client.recv_frame().await.unwrap();
    assert_eq!(echo.payload.as_ref(), b"early");
}

// A frame split into single bytes on the wire still decodes.
#[tokio::test(start_paused = true)]
async fn frames_split_at_every_byte_still_decode() {
    init_tracing();
    let events = Events::default();
    let (mut client, _server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;

    let mut wire = BytesMut::new();
    let mut encoder = FrameCodec::client();
    encoder.encode(Frame::text("piecewise"), &mut wire).unwrap();
    for byte in wire {
        client.send_raw(&[byte]).await;
    }

    let echo = client.recv_frame().await.unwrap();
    assert_eq!(echo.payload.as_ref(), b"piecewise");
}

// A frame over the configured cap closes with 1009 before the payload is
// transferred.
#[tokio::test(start_paused = true)]
async fn oversized_frame_closes_with_1009() {
    init_tracing();
    let events = Events::default();
    let config = SessionConfig::default().with_max_frame_len(1024);
    let (mut client, server) = spawn_server(TestHandler::echoing(&events), config);

    client.handshake(SAMPLE_REQUEST).await;
    // Header announcing 16 KB; no payload follows.
    client.send_raw(&[0x82, 0x80 | 126, 0x40, 0x00]).await;
    client.send_raw(&[0, 0, 0, 0]).await;

    let (code, _) = client.recv_close().await;
    assert_eq!(code, Some(1009));
    client.send_close_ack(1009).await;
    let record = server.await.unwrap();
    assert_eq!(record.local_code, Some(1009));
}

// Continuation without an open message is a protocol violation.
#[tokio::test(start_paused = true)]
async fn stray_continuation_closes_with_1002() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::echoing(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    client.send_frame(continuation_frame(true, b"stray")).await;

    let (code, _) = client.recv_close().await;
    assert_eq!(code, Some(1002));
    client.send_close_ack(1002).await;
    server.await.unwrap();
}

// Full client-role session against a server-role session, both driven by
// this crate: handshake, one echo round trip, clean close initiated by
// the client.
#[tokio::test(start_paused = true)]
async fn client_session_against_server_session() {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server_events = Events::default();
    let server_handler = TestHandler {
        select_subprotocol: Some("chat".to_string()),
        ..TestHandler::echoing(&server_events)
    };
    let server = tokio::spawn(
        Session::server(server_io, server_handler, SessionConfig::default()).run(),
    );

    // Perform the client handshake by hand over the raw stream.
    let mut client_io = client_io;
    let handshake = ClientHandshake::new("ws://server.example.com/chat")
        .unwrap()
        .protocol("chat");
    client_io.write_all(&handshake.request_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client_io.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let response = HttpResponse::parse(&head).unwrap();
    let negotiated = handshake.validate_response(&response).unwrap();

    // A client handler that sends one message and closes after the echo.
    #[derive(Default)]
    struct OneShot {
        events: Events,
    }
    impl Handler for OneShot {
        fn on_open(&mut self, link: &mut SessionLink<'_>) {
            self.events.lock().unwrap().push(Event::Open {
                subprotocol: link.subprotocol().unwrap().map(String::from),
                version: link.version(),
                origin: None,
                resource: None,
                extensions: vec![],
            });
            // Exercise both control sends; the server answers the ping and
            // ignores the unsolicited pong.
            link.ping("probe");
            link.pong("unsolicited");
            link.send_text("Hello");
        }
        fn on_message(&mut self, link: &mut SessionLink<'_>, message: Message) {
            self.events.lock().unwrap().push(Event::Message(message));
            link.close(1000, "done");
        }
        fn on_close(&mut self, record: &CloseRecord) {
            self.events.lock().unwrap().push(Event::Closed {
                was_clean: record.was_clean,
                local_code: record.local_code,
                remote_code: record.remote_code,
            });
        }
    }

    let client_events = Events::default();
    let client_handler = OneShot {
        events: Arc::clone(&client_events),
    };
    let client_session = Session::client_upgraded(
        client_io,
        client_handler,
        negotiated,
        SessionConfig::default(),
    );
    assert_eq!(client_session.state(), SessionState::Open);
    let client_record = client_session.run().await;

    let server_record = server.await.unwrap();

    assert!(client_record.was_clean);
    assert!(client_record.closed_by_me);
    assert!(server_record.was_clean);
    assert!(!server_record.closed_by_me);

    let client_events = events_of(&client_events);
    assert_eq!(client_events.len(), 3);
    assert!(matches!(
        &client_events[0],
        Event::Open { subprotocol, .. } if subprotocol.as_deref() == Some("chat")
    ));
    assert_eq!(client_events[1], Event::Message(Message::text("Hello")));
    assert!(matches!(
        &client_events[2],
        Event::Closed { was_clean: true, .. }
    ));

    // The server saw exactly one message and one close notification.
    let server_events = events_of(&server_events);
    assert_eq!(
        server_events
            .iter()
            .filter(|e| matches!(e, Event::Message(_)))
            .count(),
        1
    );
    assert_eq!(
        server_events
            .iter()
            .filter(|e| matches!(e, Event::Closed { .. }))
            .count(),
        1
    );
}

// on_close fires exactly once, and only when on_open fired.
#[tokio::test(start_paused = true)]
async fn close_notification_pairs_with_open() {
    init_tracing();
    let events = Events::default();
    let (mut client, server) =
        spawn_server(TestHandler::recording(&events), SessionConfig::default());

    client.handshake(SAMPLE_REQUEST).await;
    // Peer drops TCP without a close frame.
    drop(client);

    let record = server.await.unwrap();
    assert!(!record.was_clean);

    let events = events_of(&events);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], Event::Open { .. }));
    assert!(matches!(
        events[1],
        Event::Closed {
            was_clean: false,
            ..
        }
    ));
}
