//! Websock: a per-connection WebSocket protocol engine (RFC 6455).
//!
//! # Overview
//!
//! This crate implements the server side of RFC 6455 (protocol versions
//! 7, 8 and 13) with hooks for the symmetric client role: the HTTP
//! Upgrade handshake, the frame codec, message assembly with streaming
//! UTF-8 validation, and the close handshake with its deadlines. It owns
//! no sockets and no event loop; a [`session::Session`] drives any
//! transport implementing the async I/O traits, and everything
//! endpoint-wide (host validation, masking entropy) arrives through an
//! explicit [`endpoint::Endpoint`] value.
//!
//! # Module Structure
//!
//! - [`frame`]: wire codec — resumable decoder state machine, encoder,
//!   masking
//! - [`handshake`]: Upgrade request validation and response building,
//!   accept-key computation, client-side handshake
//! - [`utf8`]: incremental UTF-8 validation across frame boundaries
//! - [`message`]: fragmentation and message assembly rules
//! - [`close`]: status-code catalog, close payload handling, sanitation
//! - [`session`]: the connection state machine and public facade
//! - [`endpoint`]: registry trait, application callbacks, configuration
//!
//! # Example
//!
//! ```no_run
//! use websock::endpoint::{Handler, SessionConfig};
//! use websock::message::Message;
//! use websock::session::{Session, SessionLink};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, link: &mut SessionLink<'_>, message: Message) {
//!         match message {
//!             Message::Text(text) => link.send_text(text),
//!             Message::Binary(data) => link.send_binary(data),
//!         }
//!     }
//! }
//!
//! # async fn serve(stream: tokio::io::DuplexStream) {
//! let session = Session::server(stream, Echo, SessionConfig::default());
//! let record = session.run().await;
//! println!("clean close: {}", record.was_clean);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod close;
pub mod endpoint;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod session;
pub mod utf8;

pub use close::{CloseCode, CloseReason, CloseRecord};
pub use endpoint::{DefaultEndpoint, Endpoint, Handler, Rejection, SessionConfig};
pub use frame::{Frame, FrameCodec, FrameError, Opcode, Role};
pub use handshake::{compute_accept_key, ClientHandshake, HandshakeError, HandshakeRecord};
pub use message::Message;
pub use session::{Session, SessionError, SessionLink, SessionState};
pub use utf8::Utf8Validator;
