// Text wire protocol for Tern: control-line grammar and encoding.
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

mod parser;

pub use parser::{FrameSink, MsgArgs, ParseError, Parser};

/// Client protocol level advertised in CONNECT. Level 1 means the client
/// accepts asynchronous INFO updates after the initial handshake.
pub const PROTOCOL: i32 = 1;

pub const PING_LINE: &[u8] = b"PING\r\n";
pub const PONG_LINE: &[u8] = b"PONG\r\n";

const CRLF: &[u8] = b"\r\n";

pub type Result<T> = std::result::Result<T, ParseError>;

/// Capabilities block the server sends first on every connection and
/// asynchronously afterwards.
///
/// ```
/// use tern_wire::ServerInfo;
///
/// let info = ServerInfo::parse(br#"{"server_id":"a1","max_payload":1048576}"#).expect("info");
/// assert_eq!(info.server_id, "a1");
/// assert_eq!(info.max_payload, 1_048_576);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub max_payload: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connect_urls: Vec<String>,
}

impl ServerInfo {
    pub fn parse(json: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }
}

/// Handshake block the client sends in response to INFO.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(rename = "auth_token", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub tls_required: bool,
    pub name: String,
    pub lang: String,
    pub version: String,
    pub protocol: i32,
}

/// Append a `CONNECT <json>` control line.
pub fn write_connect(
    buf: &mut BytesMut,
    info: &ConnectInfo,
) -> std::result::Result<(), serde_json::Error> {
    let body = serde_json::to_vec(info)?;
    buf.extend_from_slice(b"CONNECT ");
    buf.extend_from_slice(&body);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Append a `PUB <subject> [reply] <#bytes>\r\n<payload>\r\n` frame.
///
/// The header is assembled directly into `buf`; the payload bytes are
/// copied verbatim and may contain embedded CR/LF.
pub fn write_pub(buf: &mut BytesMut, subject: &str, reply: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(reply) = reply {
        buf.extend_from_slice(reply.as_bytes());
        buf.extend_from_slice(b" ");
    }
    push_decimal(buf, payload.len() as u64);
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// Append a `SUB <subject> [queue] <sid>` control line.
pub fn write_sub(buf: &mut BytesMut, subject: &str, queue: Option<&str>, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(queue) = queue {
        buf.extend_from_slice(queue.as_bytes());
        buf.extend_from_slice(b" ");
    }
    push_decimal(buf, sid);
    buf.extend_from_slice(CRLF);
}

/// Append an `UNSUB <sid> [max]` control line.
pub fn write_unsub(buf: &mut BytesMut, sid: u64, max: Option<u64>) {
    buf.extend_from_slice(b"UNSUB ");
    push_decimal(buf, sid);
    if let Some(max) = max {
        buf.extend_from_slice(b" ");
        push_decimal(buf, max);
    }
    buf.extend_from_slice(CRLF);
}

// Hand-rolled decimal formatting keeps the publish fast path free of
// intermediate String allocations.
fn push_decimal(buf: &mut BytesMut, mut n: u64) {
    let mut digits = [0u8; 20];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    buf.extend_from_slice(&digits[i..]);
}

/// Normalize a server `-ERR` line: strip the verb, trim whitespace and
/// the surrounding single quotes, and fold to lower case.
///
/// ```
/// use tern_wire::normalize_err;
///
/// assert_eq!(normalize_err("-ERR 'Stale Connection'"), "stale connection");
/// ```
pub fn normalize_err(line: &str) -> String {
    let s = line.trim().strip_prefix("-ERR").unwrap_or(line).trim();
    s.trim_start_matches('\'')
        .trim_end_matches('\'')
        .to_lowercase()
}
