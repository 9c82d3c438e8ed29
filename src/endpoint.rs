//! Session-external context: the endpoint registry, the application
//! callback object, and per-connection configuration.
//!
//! The original design kept host validation, the RNG and log sinks as
//! endpoint-wide singletons; here they arrive as an explicit [`Endpoint`]
//! value passed at session construction, and logging goes through
//! `tracing` directly.

use crate::close::CloseRecord;
use crate::frame::generate_mask_key;
use crate::handshake::{HandshakeRecord, ResponseOptions};
use crate::message::Message;
use crate::session::SessionLink;
use std::time::Duration;

/// Endpoint-wide registry shared by all sessions of one listener.
///
/// Stateless or internally synchronized; a `&` reference is handed to each
/// session.
pub trait Endpoint {
    /// Accepts or rejects the Host header of an incoming handshake.
    /// Rejection answers with a 400.
    fn validate_host(&self, _host: &str) -> bool {
        true
    }

    /// Produces a masking key for one client-role frame. The default
    /// draws from OS entropy; tests may inject a fixed source.
    fn mask_key(&self) -> [u8; 4] {
        generate_mask_key()
    }
}

/// Registry that accepts every host and masks from OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEndpoint;

impl Endpoint for DefaultEndpoint {}

/// Application rejection of a handshake, surfaced as an HTTP error page.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// HTTP status to answer with.
    pub status: u16,
    /// Reason phrase (empty uses the standard phrase for the status).
    pub reason: String,
}

impl Rejection {
    /// Rejection with a status and reason phrase.
    #[must_use]
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// The application side of a session.
///
/// All callbacks run on the session's task, between its suspension
/// points; sends issued through the [`SessionLink`] are queued and written
/// after the callback returns. `on_close` fires exactly once, and only if
/// `on_open` fired.
pub trait Handler {
    /// Runs at the end of handshake validation. May add response headers,
    /// select a subprotocol or extension, or reject the connection.
    ///
    /// # Errors
    ///
    /// Returning a [`Rejection`] turns the handshake into an HTTP error
    /// page with the given status.
    fn validate(
        &mut self,
        _record: &HandshakeRecord,
        _response: &mut ResponseOptions,
    ) -> Result<(), Rejection> {
        Ok(())
    }

    /// The connection reached OPEN.
    fn on_open(&mut self, _link: &mut SessionLink<'_>) {}

    /// A complete message arrived.
    fn on_message(&mut self, _link: &mut SessionLink<'_>, _message: Message) {}

    /// The connection reached CLOSED. `record` carries codes, reasons and
    /// the clean/unclean outcome.
    fn on_close(&mut self, _record: &CloseRecord) {}
}

/// Per-session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Chunk size for socket reads and initial buffer capacity.
    pub read_buffer_capacity: usize,
    /// Upper bound on the handshake head (request line + headers).
    pub max_handshake_len: usize,
    /// Per-frame payload cap (decoder fails with 1009 beyond it).
    pub max_frame_len: usize,
    /// Whole-message cap across continuations.
    pub max_message_len: usize,
    /// Deadline for the opening handshake to complete.
    pub handshake_timeout: Duration,
    /// Deadline for the peer's close acknowledgement.
    pub close_ack_timeout: Duration,
    /// Value of the `Server:` response header.
    pub server_ident: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_capacity: 8 * 1024,
            max_handshake_len: 16 * 1024,
            max_frame_len: 16 * 1024 * 1024,
            max_message_len: 64 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
            close_ack_timeout: Duration::from_secs(1),
            server_ident: concat!("websock/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl SessionConfig {
    /// Configuration with production defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-frame payload cap.
    #[must_use]
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Sets the whole-message cap.
    #[must_use]
    pub fn with_max_message_len(mut self, max: usize) -> Self {
        self.max_message_len = max;
        self
    }

    /// Sets the handshake deadline.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the close-acknowledgement deadline.
    #[must_use]
    pub fn with_close_ack_timeout(mut self, timeout: Duration) -> Self {
        self.close_ack_timeout = timeout;
        self
    }

    /// Sets the `Server:` header value.
    #[must_use]
    pub fn with_server_ident(mut self, ident: impl Into<String>) -> Self {
        self.server_ident = ident.into();
        self
    }

    /// Sets the read chunk size.
    #[must_use]
    pub fn with_read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.read_buffer_capacity = capacity;
        self
    }
}
