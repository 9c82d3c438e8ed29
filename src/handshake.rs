//! Opening handshake (RFC 6455 Section 4): HTTP Upgrade parsing and
//! validation on the server side, request building and response checking
//! on the client side.
//!
//! Server request:
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! Success response:
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Validation runs in a fixed order and the first failure picks the HTTP
//! status of the error page. Supported protocol versions are 7, 8 and 13;
//! versions below 13 carry the origin in `Sec-WebSocket-Origin` instead of
//! `Origin`.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol versions this endpoint speaks.
pub const SUPPORTED_VERSIONS: [u16; 3] = [7, 8, 13];

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA-1(key || GUID))`, hash bytes in network order.
///
/// # Example
///
/// ```
/// use websock::handshake::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Reason phrase for the statuses this library answers with.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Handshake failures, server and client side.
#[derive(Debug)]
pub enum HandshakeError {
    /// Request or response bytes could not be parsed at all.
    InvalidRequest(String),
    /// Request line was not `GET <resource> HTTP/1.1`.
    BadRequestLine(String),
    /// A required header is absent.
    MissingHeader(&'static str),
    /// Host header rejected by the endpoint registry.
    HostNotAllowed(String),
    /// Upgrade header present but not `websocket`.
    WrongUpgrade(String),
    /// Connection header present but missing the `upgrade` token.
    WrongConnection(String),
    /// `Sec-WebSocket-Version` outside {7, 8, 13}.
    UnsupportedVersion(String),
    /// Application selected a subprotocol the client did not offer.
    SubprotocolNotOffered(String),
    /// Application selected an extension the client did not offer.
    ExtensionNotOffered(String),
    /// Application callback rejected the connection.
    Rejected {
        /// HTTP status to answer with.
        status: u16,
        /// Reason phrase (may be empty; the table phrase is used then).
        reason: String,
    },
    /// Client side: the URL could not be parsed.
    InvalidUrl(String),
    /// Client side: response status was not 101.
    NotSwitchingProtocols(u16),
    /// Client side: `Sec-WebSocket-Accept` did not match the key.
    InvalidAccept {
        /// Accept value derived from our key.
        expected: String,
        /// Accept value the server sent.
        actual: String,
    },
}

impl HandshakeError {
    /// HTTP status code of the error page answering this failure.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::SubprotocolNotOffered(_) | Self::ExtensionNotOffered(_) => 500,
            Self::Rejected { status, .. } => *status,
            _ => 400,
        }
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid HTTP request: {msg}"),
            Self::BadRequestLine(line) => write!(f, "invalid request line: {line:?}"),
            Self::MissingHeader(name) => write!(f, "required {name} header is missing"),
            Self::HostNotAllowed(host) => {
                write!(f, "host {host:?} is not one of this server's names")
            }
            Self::WrongUpgrade(value) => {
                write!(f, "Upgrade header was {value:?} instead of \"websocket\"")
            }
            Self::WrongConnection(value) => {
                write!(f, "Connection header {value:?} lacks the \"upgrade\" token")
            }
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported WebSocket protocol version {v}")
            }
            Self::SubprotocolNotOffered(p) => {
                write!(f, "selected subprotocol {p:?} was not offered by the client")
            }
            Self::ExtensionNotOffered(e) => {
                write!(f, "selected extension {e:?} was not offered by the client")
            }
            Self::Rejected { status, reason } => {
                write!(f, "application rejected the handshake: {status} {reason}")
            }
            Self::InvalidUrl(msg) => write!(f, "invalid URL: {msg}"),
            Self::NotSwitchingProtocols(status) => {
                write!(f, "expected 101 Switching Protocols, got {status}")
            }
            Self::InvalidAccept { expected, actual } => {
                write!(
                    f,
                    "invalid Sec-WebSocket-Accept: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Case-insensitive header map. Repeated headers are joined with `", "`
/// at parse time, matching how they would read as a single field line.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    map: HashMap<String, String>,
}

impl Headers {
    fn insert(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.map.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.map.insert(key, value.to_string());
            }
        }
    }

    /// Looks a header up by name, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no headers were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn parse_header_block<'a>(lines: impl Iterator<Item = &'a str>, headers: &mut Headers) {
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim(), value.trim());
        }
    }
}

/// A parsed HTTP Upgrade request (request line + headers, no body).
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The raw request line.
    pub request_line: String,
    /// Header fields.
    pub headers: Headers,
}

impl HttpRequest {
    /// Parses the request bytes up to and including the blank line.
    ///
    /// # Errors
    ///
    /// Fails with [`HandshakeError::InvalidRequest`] on non-UTF-8 input or
    /// an empty request.
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| HandshakeError::InvalidRequest("not valid UTF-8".into()))?;

        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::InvalidRequest("empty request".into()))?
            .to_string();

        let mut headers = Headers::default();
        parse_header_block(lines, &mut headers);

        Ok(Self {
            request_line,
            headers,
        })
    }
}

/// Immutable record of the client's opening handshake, produced by
/// [`validate_request`]. Everything the application may later ask about
/// the connection comes from here.
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    /// Requested resource path.
    pub resource: String,
    /// Negotiated protocol version (7, 8 or 13).
    pub version: u16,
    /// Client origin, when sent (`Sec-WebSocket-Origin` below version 13).
    pub origin: Option<String>,
    /// Subprotocols the client offered, in request order.
    pub subprotocols: Vec<String>,
    /// Extensions the client offered, in request order.
    pub extensions: Vec<String>,
    /// The client key, used verbatim for the accept computation.
    pub key: String,
    /// All client headers.
    pub headers: Headers,
}

/// Splits a comma-separated offer list, trimming and dropping empties.
fn parse_offer_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Validates an Upgrade request in the order the protocol prescribes.
///
/// The checks run in sequence: request line, Host (against
/// `validate_host`), Upgrade, Connection, `Sec-WebSocket-Key` (presence
/// only; the value is used verbatim), `Sec-WebSocket-Version`, then the
/// optional origin and offer lists are recorded. The first failure decides
/// the HTTP error status via [`HandshakeError::http_status`].
///
/// # Errors
///
/// Any of the request-shaped [`HandshakeError`] variants; all map to 400.
pub fn validate_request(
    request: &HttpRequest,
    validate_host: impl FnOnce(&str) -> bool,
) -> Result<HandshakeRecord, HandshakeError> {
    let line = &request.request_line;
    let resource = line
        .strip_prefix("GET ")
        .and_then(|rest| rest.strip_suffix(" HTTP/1.1"))
        .filter(|r| !r.is_empty())
        .ok_or_else(|| HandshakeError::BadRequestLine(line.clone()))?
        .to_string();

    let host = request
        .headers
        .get("host")
        .ok_or(HandshakeError::MissingHeader("Host"))?;
    if !validate_host(host) {
        return Err(HandshakeError::HostNotAllowed(host.to_string()));
    }

    let upgrade = request
        .headers
        .get("upgrade")
        .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::WrongUpgrade(upgrade.to_string()));
    }

    let connection = request
        .headers
        .get("connection")
        .ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeError::WrongConnection(connection.to_string()));
    }

    let key = request
        .headers
        .get("sec-websocket-key")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?
        .to_string();

    let version_raw = request
        .headers
        .get("sec-websocket-version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    let version: u16 = version_raw
        .trim()
        .parse()
        .map_err(|_| HandshakeError::UnsupportedVersion(version_raw.to_string()))?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(HandshakeError::UnsupportedVersion(version_raw.to_string()));
    }

    let origin_header = if version < 13 {
        "sec-websocket-origin"
    } else {
        "origin"
    };
    let origin = request.headers.get(origin_header).map(String::from);

    let subprotocols = parse_offer_list(request.headers.get("sec-websocket-protocol"));
    let extensions = parse_offer_list(request.headers.get("sec-websocket-extensions"));

    Ok(HandshakeRecord {
        resource,
        version,
        origin,
        subprotocols,
        extensions,
        key,
        headers: request.headers.clone(),
    })
}

/// Mutable response side of the handshake, handed to the application's
/// `validate` callback: extra headers plus subprotocol and extension
/// selections.
#[derive(Debug, Clone, Default)]
pub struct ResponseOptions {
    headers: Vec<(String, String)>,
    subprotocol: Option<String>,
    extensions: Vec<String>,
}

impl ResponseOptions {
    /// Adds a header to the 101 response.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Selects the subprotocol to answer with. Must be one the client
    /// offered; checked when the response is built.
    pub fn select_subprotocol(&mut self, protocol: impl Into<String>) {
        self.subprotocol = Some(protocol.into());
    }

    /// Selects an extension to answer with. Must be one the client
    /// offered; checked when the response is built.
    pub fn select_extension(&mut self, extension: impl Into<String>) {
        self.extensions.push(extension.into());
    }

    /// The selected subprotocol, if any.
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The selected extensions.
    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Checks every selection against what the client offered.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::SubprotocolNotOffered`] or
    /// [`HandshakeError::ExtensionNotOffered`]; both answer with a 500.
    pub fn check_against(&self, record: &HandshakeRecord) -> Result<(), HandshakeError> {
        if let Some(proto) = &self.subprotocol {
            if !proto.is_empty() && !record.subprotocols.iter().any(|p| p == proto) {
                return Err(HandshakeError::SubprotocolNotOffered(proto.clone()));
            }
        }
        for ext in &self.extensions {
            if !record.extensions.iter().any(|e| e == ext) {
                return Err(HandshakeError::ExtensionNotOffered(ext.clone()));
            }
        }
        Ok(())
    }
}

/// Final negotiated state, immutable once the session is open.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    /// Selected subprotocol (empty selection = none).
    pub subprotocol: Option<String>,
    /// Selected extensions.
    pub extensions: Vec<String>,
    /// HTTP status of the handshake response.
    pub http_status: u16,
}

/// Builds the `101 Switching Protocols` response.
#[must_use]
pub fn build_accept_response(
    record: &HandshakeRecord,
    options: &ResponseOptions,
    server_ident: &str,
) -> Vec<u8> {
    let accept = compute_accept_key(&record.key);

    let mut response = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(&accept);
    response.push_str("\r\n");

    if let Some(proto) = options.subprotocol().filter(|p| !p.is_empty()) {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(proto);
        response.push_str("\r\n");
    }
    if !options.extensions().is_empty() {
        response.push_str("Sec-WebSocket-Extensions: ");
        response.push_str(&options.extensions().join(", "));
        response.push_str("\r\n");
    }
    for (name, value) in &options.headers {
        response.push_str(name);
        response.push_str(": ");
        response.push_str(value);
        response.push_str("\r\n");
    }

    response.push_str("Server: ");
    response.push_str(server_ident);
    response.push_str("\r\n\r\n");
    response.into_bytes()
}

/// Builds an HTTP error page for a failed handshake. An empty `reason`
/// falls back to the phrase table.
#[must_use]
pub fn build_error_response(status: u16, reason: &str, server_ident: &str) -> Vec<u8> {
    let phrase = if reason.is_empty() {
        reason_phrase(status)
    } else {
        reason
    };
    format!(
        "HTTP/1.1 {status} {phrase}\r\n\
         Server: {server_ident}\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Parsed WebSocket URL (client side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host name or address.
    pub host: String,
    /// Port (defaults: 80 for `ws`, 443 for `wss`).
    pub port: u16,
    /// Request path, `/` when absent.
    pub path: String,
    /// True for `wss://`.
    pub tls: bool,
}

impl WsUrl {
    /// Parses a `ws://` or `wss://` URL.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::InvalidUrl`] when the scheme, host or port is
    /// malformed.
    pub fn parse(url: &str) -> Result<Self, HandshakeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| HandshakeError::InvalidUrl("missing scheme".into()))?;
        let tls = match scheme {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(HandshakeError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        let default_port = if tls { 443 } else { 80 };

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = if let Some(bracket_end) = host_port.find(']') {
            // Bracketed IPv6 literal.
            let host = &host_port[1..bracket_end];
            let port = match host_port.get(bracket_end + 1..) {
                Some(p) if !p.is_empty() => p
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| HandshakeError::InvalidUrl("invalid port".into()))?,
                _ => default_port,
            };
            (host.to_string(), port)
        } else if let Some((host, port)) = host_port.rsplit_once(':') {
            let port = port
                .parse()
                .map_err(|_| HandshakeError::InvalidUrl("invalid port".into()))?;
            (host.to_string(), port)
        } else {
            (host_port.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(HandshakeError::InvalidUrl("empty host".into()));
        }

        Ok(Self {
            host,
            port,
            path: path.to_string(),
            tls,
        })
    }

    /// Host header value; omits default ports.
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Client-side handshake: builds the Upgrade request and checks the
/// server's response against the generated nonce.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    url: WsUrl,
    key: String,
    protocols: Vec<String>,
    headers: Vec<(String, String)>,
}

impl ClientHandshake {
    /// Creates a handshake for the given URL with a fresh random key.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::InvalidUrl`] when the URL does not parse.
    pub fn new(url: &str) -> Result<Self, HandshakeError> {
        Ok(Self {
            url: WsUrl::parse(url)?,
            key: generate_client_key(),
            protocols: Vec::new(),
            headers: Vec::new(),
        })
    }

    /// Adds a subprotocol offer.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Adds a custom request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The target URL.
    #[must_use]
    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    /// The nonce sent as `Sec-WebSocket-Key`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serializes the Upgrade request.
    #[must_use]
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            self.url.path,
            self.url.host_header(),
            self.key
        );
        if !self.protocols.is_empty() {
            request.push_str("Sec-WebSocket-Protocol: ");
            request.push_str(&self.protocols.join(", "));
            request.push_str("\r\n");
        }
        for (name, value) in &self.headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request.into_bytes()
    }

    /// Validates the server's 101 response: status, Upgrade and Connection
    /// headers, and the accept key derived from our nonce.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::NotSwitchingProtocols`], a header failure, or
    /// [`HandshakeError::InvalidAccept`].
    pub fn validate_response(&self, response: &HttpResponse) -> Result<Negotiated, HandshakeError> {
        if response.status != 101 {
            return Err(HandshakeError::NotSwitchingProtocols(response.status));
        }

        let upgrade = response
            .headers
            .get("upgrade")
            .ok_or(HandshakeError::MissingHeader("Upgrade"))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::WrongUpgrade(upgrade.to_string()));
        }

        let connection = response
            .headers
            .get("connection")
            .ok_or(HandshakeError::MissingHeader("Connection"))?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(HandshakeError::WrongConnection(connection.to_string()));
        }

        let actual = response
            .headers
            .get("sec-websocket-accept")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        let expected = compute_accept_key(&self.key);
        if actual != expected {
            return Err(HandshakeError::InvalidAccept {
                expected,
                actual: actual.to_string(),
            });
        }

        Ok(Negotiated {
            subprotocol: response.headers.get("sec-websocket-protocol").map(String::from),
            extensions: parse_offer_list(response.headers.get("sec-websocket-extensions")),
            http_status: response.status,
        })
    }
}

/// Generates the random 16-byte nonce for the client handshake.
fn generate_client_key() -> String {
    let mut key = [0u8; 16];
    getrandom::fill(&mut key).expect("OS RNG unavailable");
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// A parsed HTTP response (client side of the handshake).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Header fields.
    pub headers: Headers,
}

impl HttpResponse {
    /// Parses the response head up to the blank line.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::InvalidRequest`] on malformed input.
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| HandshakeError::InvalidRequest("not valid UTF-8".into()))?;

        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::InvalidRequest("empty response".into()))?;

        let mut parts = status_line.splitn(3, ' ');
        let _version = parts
            .next()
            .ok_or_else(|| HandshakeError::InvalidRequest("missing HTTP version".into()))?;
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HandshakeError::InvalidRequest("invalid status code".into()))?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = Headers::default();
        parse_header_block(lines, &mut headers);

        Ok(Self {
            status,
            reason,
            headers,
        })
    }
}
