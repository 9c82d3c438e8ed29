//! Per-connection session engine.
//!
//! A [`Session`] owns one transport stream and drives it from the opening
//! handshake to TCP teardown: CONNECTING → OPEN → CLOSING → CLOSED. The
//! session is single-task cooperative: exactly one read is in flight at a
//! time, writes are serialized through an outbound queue, and application
//! callbacks run between suspension points, so no locking is needed.
//!
//! Two deadlines guard the lifecycle, at most one armed at a time: the
//! handshake must complete within `handshake_timeout` (expiry drops TCP),
//! and once a close frame has been sent the peer's acknowledgement must
//! arrive within `close_ack_timeout` (expiry drops TCP with
//! `was_clean = false`). A deadline is cancelled by the guarded read
//! completing; expiry surfaces as an `Elapsed` value, so the two outcomes
//! cannot be confused.
//!
//! Errors never reach the application as return values. They are
//! translated at the top of the frame loop into close frames or TCP drops
//! and recorded on the terminal [`CloseRecord`], which `run` returns and
//! `on_close` observes.

use crate::close::{sanitize_close, CloseCode, ClosePayloadError, CloseReason, CloseRecord};
use crate::endpoint::{DefaultEndpoint, Endpoint, Handler, SessionConfig};
use crate::frame::{Frame, FrameCodec, FrameError, Opcode, Role};
use crate::handshake::{
    build_accept_response, build_error_response, validate_request, HandshakeError,
    HandshakeRecord, HttpRequest, Negotiated, ResponseOptions,
};
use crate::message::{AssemblyError, MessageAssembler};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, trace, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening handshake in progress.
    Connecting,
    /// Handshake complete, data flowing.
    Open,
    /// A close frame has been sent or received; waiting for the exchange
    /// to finish.
    Closing,
    /// Terminal. No frames are emitted past this point.
    Closed,
}

/// Session-level error taxonomy.
///
/// Every variant maps to exactly one recovery: a close frame with a
/// specific status, a logged no-op, or an immediate TCP drop.
#[derive(Debug)]
pub enum SessionError {
    /// Opening handshake failed; answered with an HTTP error page.
    Handshake(HandshakeError),
    /// Peer violated framing rules; close with 1002.
    Protocol(String),
    /// Peer sent a malformed payload (bad UTF-8); close with 1007.
    Payload(String),
    /// Frame or message over the configured limit; close with 1009.
    TooBig {
        /// Observed size.
        size: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Internal endpoint failure; close with 1008 on the wire.
    Internal(String),
    /// Non-fatal; logged, processing continues.
    Soft(String),
    /// Unrecoverable; TCP dropped without a close frame.
    Fatal(&'static str),
    /// Transport error; TCP dropped, `was_clean = false`.
    Io(io::Error),
    /// Peer dropped TCP.
    Eof,
    /// An accessor needing the handshake was called while CONNECTING.
    NotOpen,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake(e) => write!(f, "handshake failed: {e}"),
            Self::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            Self::Payload(msg) => write!(f, "payload violation: {msg}"),
            Self::TooBig { size, max } => {
                write!(f, "message of {size} bytes exceeds limit of {max}")
            }
            Self::Internal(msg) => write!(f, "internal endpoint error: {msg}"),
            Self::Soft(msg) => write!(f, "soft session error: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal session error: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Eof => write!(f, "peer closed the connection"),
            Self::NotOpen => write!(f, "not available before the handshake has completed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handshake(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<HandshakeError> for SessionError {
    fn from(err: HandshakeError) -> Self {
        Self::Handshake(err)
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => Self::Io(e),
            FrameError::PayloadTooLarge { size, max } => Self::TooBig { size, max },
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<AssemblyError> for SessionError {
    fn from(err: AssemblyError) -> Self {
        match err {
            AssemblyError::Interleaving(msg) => Self::Protocol(msg.to_string()),
            AssemblyError::InvalidUtf8 => Self::Payload(err.to_string()),
            AssemblyError::MessageTooBig { size, max } => Self::TooBig {
                size: size as u64,
                max,
            },
        }
    }
}

impl From<ClosePayloadError> for SessionError {
    fn from(err: ClosePayloadError) -> Self {
        match err {
            ClosePayloadError::InvalidReasonUtf8 => Self::Payload(err.to_string()),
            ClosePayloadError::TruncatedCode | ClosePayloadError::DisallowedCode(_) => {
                Self::Protocol(err.to_string())
            }
        }
    }
}

/// The one deadline a session may have armed.
#[derive(Debug, Clone, Copy)]
enum ArmedTimer {
    /// Handshake must finish by this instant.
    Handshake(Instant),
    /// Close acknowledgement must arrive by this instant.
    CloseAck(Instant),
}

/// Protocol state shared between the session loop and the callback-facing
/// [`SessionLink`].
#[derive(Debug)]
struct Conn {
    state: SessionState,
    role: Role,
    config: SessionConfig,
    codec: FrameCodec,
    assembler: MessageAssembler,
    handshake: Option<HandshakeRecord>,
    negotiated: Option<Negotiated>,
    close_record: CloseRecord,
    outbound: VecDeque<Frame>,
    timer: Option<ArmedTimer>,
    /// `on_open` was delivered; gates `on_close`.
    opened: bool,
}

impl Conn {
    fn new(role: Role, config: SessionConfig) -> Self {
        let codec = FrameCodec::new(role).max_payload_len(config.max_frame_len);
        let assembler = MessageAssembler::new(config.max_message_len);
        Self {
            state: SessionState::Connecting,
            role,
            config,
            codec,
            assembler,
            handshake: None,
            negotiated: None,
            close_record: CloseRecord::default(),
            outbound: VecDeque::new(),
            timer: None,
            opened: false,
        }
    }

    /// Fills in the masking key on client-role frames.
    fn prepare_mask(&self, frame: &mut Frame, endpoint: &dyn Endpoint) {
        if self.role == Role::Client && frame.mask_key.is_none() {
            frame.mask_key = Some(endpoint.mask_key());
        }
    }

    fn enqueue(&mut self, mut frame: Frame, endpoint: &dyn Endpoint) {
        self.prepare_mask(&mut frame, endpoint);
        self.outbound.push_back(frame);
    }

    /// Initiates the close handshake from this side. Only meaningful in
    /// OPEN; elsewhere the request is dropped with a warning, like any
    /// other send.
    fn send_close(&mut self, code: u16, reason: &str, endpoint: &dyn Endpoint) {
        if self.state != SessionState::Open {
            warn!("dropping close request: session is not open");
            return;
        }
        let (code, reason) = sanitize_close(code, reason);
        self.close_record.closed_by_me = true;
        self.close_record.local_code = Some(code);
        self.close_record.local_reason = if reason.is_empty() {
            None
        } else {
            Some(reason)
        };
        self.state = SessionState::Closing;
        self.arm_close_timer();
        let close = CloseReason::new(code, self.close_record.local_reason.as_deref());
        self.enqueue(close.to_frame(), endpoint);
    }

    /// Arms the close-ack deadline; replaces whatever was armed before.
    fn arm_close_timer(&mut self) {
        self.timer = Some(ArmedTimer::CloseAck(
            Instant::now() + self.config.close_ack_timeout,
        ));
    }
}

/// Handle passed to application callbacks for sending and for reading
/// negotiated connection facts.
///
/// Sends are queued and written by the session loop after the callback
/// returns; a send attempted while the session is not OPEN is dropped
/// with a warning rather than failing the session.
pub struct SessionLink<'a> {
    conn: &'a mut Conn,
    endpoint: &'a dyn Endpoint,
}

impl SessionLink<'_> {
    fn send_data(&mut self, frame: Frame, kind: &'static str) {
        if self.conn.state != SessionState::Open {
            warn!("dropping {kind}: session is not open");
            return;
        }
        self.conn.enqueue(frame, self.endpoint);
    }

    /// Queues a single-frame TEXT message. UTF-8 validity is guaranteed by
    /// the argument type; nothing further is validated on send.
    pub fn send_text(&mut self, text: impl Into<String>) {
        self.send_data(Frame::text(Bytes::from(text.into())), "text message");
    }

    /// Queues a single-frame BINARY message.
    pub fn send_binary(&mut self, data: impl Into<Bytes>) {
        self.send_data(Frame::binary(data.into()), "binary message");
    }

    /// Queues a PING. Payloads over 125 bytes are dropped with a warning.
    pub fn ping(&mut self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        if payload.len() > 125 {
            warn!(
                len = payload.len(),
                "dropping ping: control payload over 125 bytes"
            );
            return;
        }
        self.send_data(Frame::ping(payload), "ping");
    }

    /// Queues a PONG. Payloads over 125 bytes are dropped with a warning.
    pub fn pong(&mut self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        if payload.len() > 125 {
            warn!(
                len = payload.len(),
                "dropping pong: control payload over 125 bytes"
            );
            return;
        }
        self.send_data(Frame::pong(payload), "pong");
    }

    /// Initiates the close handshake. The code is sanitized per the
    /// protocol rules (sentinel, invalid and reserved codes are rewritten)
    /// and the close-ack deadline is armed.
    pub fn close(&mut self, code: u16, reason: &str) {
        self.conn.send_close(code, reason, self.endpoint);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.conn.state
    }

    /// The negotiated subprotocol.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotOpen`] before the handshake has completed.
    pub fn subprotocol(&self) -> Result<Option<&str>, SessionError> {
        match &self.conn.negotiated {
            Some(negotiated) => Ok(negotiated.subprotocol.as_deref()),
            None => Err(SessionError::NotOpen),
        }
    }

    /// Requested resource path (server role).
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.conn.handshake.as_ref().map(|h| h.resource.as_str())
    }

    /// Client origin, when one was sent.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.conn.handshake.as_ref().and_then(|h| h.origin.as_deref())
    }

    /// Negotiated protocol version.
    #[must_use]
    pub fn version(&self) -> Option<u16> {
        self.conn.handshake.as_ref().map(|h| h.version)
    }

    /// A client request header, case-insensitive.
    #[must_use]
    pub fn client_header(&self, name: &str) -> Option<&str> {
        self.conn.handshake.as_ref().and_then(|h| h.headers.get(name))
    }

    /// Extensions the client offered.
    #[must_use]
    pub fn offered_extensions(&self) -> &[String] {
        self.conn
            .handshake
            .as_ref()
            .map_or(&[], |h| h.extensions.as_slice())
    }
}

/// One WebSocket connection over a generic transport.
///
/// Constructed on accept (server role) or after a client handshake, then
/// consumed by [`run`](Self::run), which drives the connection to
/// completion and returns the terminal [`CloseRecord`].
pub struct Session<IO, H, E = DefaultEndpoint> {
    io: IO,
    handler: H,
    endpoint: E,
    conn: Conn,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_chunk: Vec<u8>,
    /// Write latch: a second write may not start before the first
    /// completes.
    writing: bool,
    /// The transport has been shut down.
    tcp_dropped: bool,
    /// The peer reached EOF first.
    peer_eof: bool,
}

impl<IO, H> Session<IO, H> {
    /// Server-role session for a freshly accepted connection. The opening
    /// handshake has not been read yet; [`run`](Self::run) performs it.
    pub fn server(io: IO, handler: H, config: SessionConfig) -> Self {
        Self::server_with_endpoint(io, handler, DefaultEndpoint, config)
    }

    /// Client-role session over a transport whose Upgrade exchange was
    /// already completed with
    /// [`ClientHandshake`](crate::handshake::ClientHandshake).
    pub fn client_upgraded(
        io: IO,
        handler: H,
        negotiated: Negotiated,
        config: SessionConfig,
    ) -> Self {
        let mut session = Self::with_endpoint(io, handler, DefaultEndpoint, Role::Client, config);
        session.conn.state = SessionState::Open;
        session.conn.negotiated = Some(negotiated);
        session
    }
}

impl<IO, H, E> Session<IO, H, E> {
    /// Server-role session with an explicit endpoint registry.
    pub fn server_with_endpoint(io: IO, handler: H, endpoint: E, config: SessionConfig) -> Self {
        Self::with_endpoint(io, handler, endpoint, Role::Server, config)
    }

    fn with_endpoint(io: IO, handler: H, endpoint: E, role: Role, config: SessionConfig) -> Self {
        let read_chunk = vec![0u8; config.read_buffer_capacity.max(1)];
        let capacity = config.read_buffer_capacity;
        Self {
            io,
            handler,
            endpoint,
            conn: Conn::new(role, config),
            read_buf: BytesMut::with_capacity(capacity),
            write_buf: BytesMut::with_capacity(capacity),
            read_chunk,
            writing: false,
            tcp_dropped: false,
            peer_eof: false,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.conn.state
    }
}

impl<IO, H, E> Session<IO, H, E>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
    E: Endpoint,
{
    /// Drives the connection to completion: handshake, frame loop, close
    /// exchange, TCP teardown. Returns the terminal close record; errors
    /// are folded into it rather than surfaced.
    pub async fn run(mut self) -> CloseRecord {
        if self.conn.state == SessionState::Connecting {
            self.do_handshake().await;
        }

        if self.conn.state == SessionState::Open && !self.conn.opened {
            self.conn.opened = true;
            let mut link = SessionLink {
                conn: &mut self.conn,
                endpoint: &self.endpoint,
            };
            self.handler.on_open(&mut link);
        }

        while matches!(self.conn.state, SessionState::Open | SessionState::Closing) {
            self.turn().await;
        }

        self.finish().await
    }

    /// Reads the Upgrade request, validates it and answers, honoring the
    /// handshake deadline. Leaves the session OPEN on success, CLOSED
    /// otherwise. Bytes past the blank line stay buffered for the frame
    /// loop.
    async fn do_handshake(&mut self) {
        self.conn.timer = Some(ArmedTimer::Handshake(
            Instant::now() + self.conn.config.handshake_timeout,
        ));
        let Some(ArmedTimer::Handshake(deadline)) = self.conn.timer else {
            unreachable!("handshake deadline armed above");
        };

        let head_end = loop {
            if let Some(end) = find_head_end(&self.read_buf) {
                break end;
            }
            if self.read_buf.len() > self.conn.config.max_handshake_len {
                self.conn.timer = None;
                self.fail_handshake(HandshakeError::InvalidRequest(
                    "handshake exceeds size limit".into(),
                ))
                .await;
                return;
            }
            match timeout_at(deadline, read_some_io(&mut self.io, &mut self.read_chunk)).await {
                Err(_elapsed) => {
                    debug!("handshake timed out");
                    self.conn.timer = None;
                    self.drop_tcp(true).await;
                    return;
                }
                Ok(Ok(0)) => {
                    debug!("EOF during handshake");
                    self.conn.timer = None;
                    self.peer_eof = true;
                    self.conn.state = SessionState::Closed;
                    return;
                }
                Ok(Ok(n)) => self.read_buf.extend_from_slice(&self.read_chunk[..n]),
                Ok(Err(e)) => {
                    error!(error = %e, "error reading handshake");
                    self.conn.timer = None;
                    self.conn.state = SessionState::Closed;
                    return;
                }
            }
        };
        // The guarded read completed; the deadline is cancelled.
        self.conn.timer = None;

        let head = self.read_buf.split_to(head_end);
        trace!(
            target: "websock::access",
            category = "handshake",
            len = head.len(),
            "handshake request read"
        );

        let validated = HttpRequest::parse(&head)
            .and_then(|request| validate_request(&request, |host| self.endpoint.validate_host(host)));
        let record = match validated {
            Ok(record) => record,
            Err(e) => {
                self.fail_handshake(e).await;
                return;
            }
        };

        let mut options = ResponseOptions::default();
        let accepted = self
            .handler
            .validate(&record, &mut options)
            .map_err(|rejection| HandshakeError::Rejected {
                status: rejection.status,
                reason: rejection.reason,
            })
            .and_then(|()| options.check_against(&record));
        if let Err(e) = accepted {
            self.fail_handshake(e).await;
            return;
        }

        let response = build_accept_response(&record, &options, &self.conn.config.server_ident);
        self.conn.negotiated = Some(Negotiated {
            subprotocol: options.subprotocol().map(String::from),
            extensions: options.extensions().to_vec(),
            http_status: 101,
        });
        info!(
            target: "websock::access",
            category = "handshake",
            version = record.version,
            resource = %record.resource,
            status = 101_u16,
            "connection opened"
        );
        self.conn.handshake = Some(record);

        match write_all_io(&mut self.io, &response).await {
            Ok(()) => self.conn.state = SessionState::Open,
            Err(e) => {
                error!(error = %e, "error writing handshake response");
                self.drop_tcp(true).await;
            }
        }
    }

    /// Answers a failed handshake with an HTTP error page, then drops TCP.
    async fn fail_handshake(&mut self, err: HandshakeError) {
        let status = err.http_status();
        let reason = match &err {
            HandshakeError::Rejected { reason, .. } => reason.clone(),
            _ => String::new(),
        };
        error!(error = %err, "handshake failed");
        info!(
            target: "websock::access",
            category = "handshake",
            status,
            "handshake rejected"
        );
        let response = build_error_response(status, &reason, &self.conn.config.server_ident);
        if let Err(e) = write_all_io(&mut self.io, &response).await {
            debug!(error = %e, "error writing handshake error response");
        }
        self.drop_tcp(true).await;
    }

    /// One iteration of the frame loop: flush queued writes, then decode
    /// a frame or read more bytes (bounded by the close-ack deadline when
    /// one is armed).
    async fn turn(&mut self) {
        if let Err(e) = self.flush_outbound().await {
            self.handle_error(e).await;
            return;
        }

        match self.conn.codec.decode(&mut self.read_buf) {
            Ok(Some(frame)) => {
                if let Err(e) = self.process_frame(frame).await {
                    self.handle_error(e).await;
                }
            }
            Ok(None) => {
                trace!(needed = self.conn.codec.bytes_needed(), "awaiting more data");
                let result = match self.conn.timer {
                    Some(ArmedTimer::CloseAck(deadline)) => {
                        let read = read_some_io(&mut self.io, &mut self.read_chunk);
                        match timeout_at(deadline, read).await {
                            Err(_elapsed) => {
                                debug!("close handshake timed out");
                                self.conn.timer = None;
                                // No acknowledgement: unclean close.
                                self.drop_tcp(false).await;
                                return;
                            }
                            Ok(result) => result,
                        }
                    }
                    _ => read_some_io(&mut self.io, &mut self.read_chunk).await,
                };
                match result {
                    Ok(0) => self.handle_error(SessionError::Eof).await,
                    Ok(n) => self.read_buf.extend_from_slice(&self.read_chunk[..n]),
                    Err(e) => self.handle_error(SessionError::Io(e)).await,
                }
            }
            Err(e) => self.handle_error(e.into()).await,
        }
    }

    /// Routes one decoded frame. Control frames are handled inline and
    /// never disturb the assembler.
    async fn process_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        match self.conn.state {
            SessionState::Open => match frame.opcode {
                Opcode::Ping => {
                    debug!(
                        target: "websock::access",
                        category = "control",
                        len = frame.payload.len(),
                        "ping"
                    );
                    self.conn.enqueue(Frame::pong(frame.payload), &self.endpoint);
                    Ok(())
                }
                Opcode::Pong => {
                    debug!(
                        target: "websock::access",
                        category = "control",
                        len = frame.payload.len(),
                        "pong"
                    );
                    Ok(())
                }
                Opcode::Close => self.process_close(frame).await,
                Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                    if let Some(message) = self.conn.assembler.push_frame(frame)? {
                        let mut link = SessionLink {
                            conn: &mut self.conn,
                            endpoint: &self.endpoint,
                        };
                        self.handler.on_message(&mut link, message);
                    }
                    Ok(())
                }
            },
            SessionState::Closing => {
                if frame.opcode == Opcode::Close {
                    self.process_close(frame).await
                } else {
                    debug!(opcode = ?frame.opcode, "ignoring frame while closing");
                    Ok(())
                }
            }
            _ => Err(SessionError::Fatal("frame processed in invalid state")),
        }
    }

    /// Handles a received CLOSE frame: either the peer is initiating (we
    /// acknowledge by echoing their status) or this is the acknowledgement
    /// of our own close.
    async fn process_close(&mut self, frame: Frame) -> Result<(), SessionError> {
        let reason = CloseReason::parse(&frame.payload)?;
        self.conn.close_record.remote_code = reason.code;
        self.conn.close_record.remote_reason = reason.reason.clone();

        match self.conn.state {
            SessionState::Open => {
                debug!("close received, acknowledging");
                self.conn.close_record.closed_by_me = false;
                self.conn.state = SessionState::Closing;

                // Echo the peer's code; it already passed wire validation.
                let code = reason.code.unwrap_or(CloseCode::Normal as u16);
                let ack = CloseReason::new(code, reason.reason.as_deref());
                self.conn.close_record.local_code = ack.code;
                self.conn.close_record.local_reason = ack.reason.clone();

                let mut ack_frame = ack.to_frame();
                self.conn.prepare_mask(&mut ack_frame, &self.endpoint);
                self.write_frame(ack_frame).await?;

                self.conn.close_record.was_clean = true;
                self.conn.timer = None;
                self.conn.state = SessionState::Closed;
                Ok(())
            }
            SessionState::Closing => {
                debug!("close acknowledgement received");
                self.conn.close_record.was_clean = true;
                self.conn.timer = None;
                self.conn.state = SessionState::Closed;
                Ok(())
            }
            _ => Err(SessionError::Fatal("close processed in invalid state")),
        }
    }

    /// The single place the error taxonomy is turned into protocol
    /// actions.
    async fn handle_error(&mut self, err: SessionError) {
        match err {
            SessionError::Protocol(msg) => {
                error!(error = %msg, "protocol violation");
                self.conn
                    .send_close(CloseCode::ProtocolError as u16, &msg, &self.endpoint);
            }
            SessionError::Payload(msg) => {
                error!(error = %msg, "payload violation");
                self.conn
                    .send_close(CloseCode::InvalidPayload as u16, &msg, &self.endpoint);
            }
            SessionError::TooBig { size, max } => {
                error!(size, max, "message too big");
                let msg = format!("message of {size} bytes exceeds limit of {max}");
                self.conn
                    .send_close(CloseCode::MessageTooBig as u16, &msg, &self.endpoint);
            }
            SessionError::Internal(msg) => {
                error!(error = %msg, "internal endpoint error");
                // The abnormal-close sentinel is rewritten to 1008 on the
                // wire by close sanitation.
                self.conn
                    .send_close(CloseCode::AbnormalClose as u16, &msg, &self.endpoint);
            }
            SessionError::Soft(msg) => {
                warn!(error = %msg, "soft session error, continuing");
            }
            SessionError::Fatal(msg) => {
                error!(error = %msg, "fatal session error, dropping TCP");
                self.drop_tcp(true).await;
            }
            SessionError::Io(e) => {
                error!(error = %e, "transport error");
                self.conn.timer = None;
                self.conn.state = SessionState::Closed;
            }
            SessionError::Eof => {
                debug!("EOF from peer");
                self.peer_eof = true;
                self.conn.timer = None;
                self.conn.state = SessionState::Closed;
            }
            SessionError::Handshake(_) | SessionError::NotOpen => {
                error!(error = %err, "unexpected error in frame loop");
                self.drop_tcp(true).await;
            }
        }
    }

    /// Writes every queued frame, one at a time.
    async fn flush_outbound(&mut self) -> Result<(), SessionError> {
        while let Some(frame) = self.conn.outbound.pop_front() {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    /// Serialized frame write; the latch guards against overlapping
    /// writes.
    async fn write_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        debug_assert!(!self.writing, "write issued while a write is in flight");
        self.writing = true;
        self.write_buf.clear();
        let encoded = self.conn.codec.encode(frame, &mut self.write_buf);
        let result = match encoded {
            Ok(()) => write_all_io(&mut self.io, &self.write_buf)
                .await
                .map_err(SessionError::Io),
            Err(e) => Err(e.into()),
        };
        self.writing = false;
        if result.is_ok() {
            trace!(
                target: "websock::access",
                category = "frame",
                len = self.write_buf.len(),
                "frame write complete"
            );
        }
        result
    }

    /// Immediate TCP teardown (no close frame). Cancels the armed
    /// deadline.
    async fn drop_tcp(&mut self, by_me: bool) {
        self.conn.timer = None;
        if !self.tcp_dropped {
            let _ = shutdown_io(&mut self.io).await;
            self.tcp_dropped = true;
            self.conn.close_record.dropped_by_me = by_me;
        }
        self.conn.state = SessionState::Closed;
    }

    /// Terminal bookkeeping on reaching CLOSED: tear down the transport
    /// (a client that initiated the close and got its acknowledgement
    /// waits, bounded, for the server's EOF), log the outcome, and notify
    /// the application exactly once.
    async fn finish(mut self) -> CloseRecord {
        self.conn.timer = None;

        if !self.tcp_dropped {
            if self.peer_eof {
                self.conn.close_record.dropped_by_me = false;
            } else if self.conn.role == Role::Client
                && self.conn.close_record.was_clean
                && self.conn.close_record.closed_by_me
            {
                // The server drops TCP first after acknowledging; give it
                // a bounded window before dropping ourselves.
                let wait = self.conn.config.close_ack_timeout;
                let got_eof = timeout(wait, read_to_eof(&mut self.io, &mut self.read_chunk))
                    .await
                    .is_ok();
                self.conn.close_record.dropped_by_me = !got_eof;
            } else {
                self.conn.close_record.dropped_by_me = true;
            }
            let _ = shutdown_io(&mut self.io).await;
            self.tcp_dropped = true;
        }

        info!(
            target: "websock::access",
            category = "disconnect",
            clean = self.conn.close_record.was_clean,
            local_code = ?self.conn.close_record.local_code,
            local_reason = ?self.conn.close_record.local_reason,
            remote_code = ?self.conn.close_record.remote_code,
            remote_reason = ?self.conn.close_record.remote_reason,
            "connection closed"
        );

        if self.conn.opened {
            self.handler.on_close(&self.conn.close_record);
        }

        self.conn.close_record
    }
}

/// Index just past the `\r\n\r\n` terminating the request head, if
/// present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Reads once into `buf`, returning the byte count (0 at EOF).
async fn read_some_io<IO: AsyncRead + Unpin>(io: &mut IO, buf: &mut [u8]) -> io::Result<usize> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match Pin::new(&mut *io).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

/// Writes the whole buffer, failing on a zero-length write.
async fn write_all_io<IO: AsyncWrite + Unpin>(io: &mut IO, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = poll_fn(|cx| Pin::new(&mut *io).poll_write(cx, &buf[written..])).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        written += n;
    }
    Ok(())
}

/// Discards input until EOF.
async fn read_to_eof<IO: AsyncRead + Unpin>(io: &mut IO, buf: &mut [u8]) -> io::Result<()> {
    loop {
        if read_some_io(io, buf).await? == 0 {
            return Ok(());
        }
    }
}

/// Shuts the write half down, ignoring "not connected".
async fn shutdown_io<IO: AsyncWrite + Unpin>(io: &mut IO) -> io::Result<()> {
    match poll_fn(|cx| Pin::new(&mut *io).poll_shutdown(cx)).await {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}
