// Client error taxonomy.
//
// Validation errors are returned inline and never touch connection state;
// I/O and protocol errors feed the reconnect/close machinery. The enum is
// Clone so the most recent terminal error can be handed out from
// `Client::last_error` and from inside the closed callback; the io/json
// sources are wrapped in Arc for that reason.
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("secure connection required by server")]
    SecureConnRequired,
    #[error("secure connection not available from server")]
    SecureConnWanted,
    #[error("invalid subscription")]
    BadSubscription,
    #[error("operation not supported by this subscription type")]
    TypeSubscription,
    #[error("illegal call on an async subscription")]
    SyncRequired,
    #[error("invalid subject")]
    BadSubject,
    #[error("slow consumer, messages dropped")]
    SlowConsumer,
    #[error("timeout")]
    Timeout,
    #[error("timeout invalid")]
    BadTimeout,
    #[error("authorization violation")]
    Authorization,
    #[error("no servers available for connection")]
    NoServers,
    #[error("protocol exception, INFO not received")]
    NoInfoReceived,
    #[error("maximum payload exceeded")]
    MaxPayload,
    #[error("maximum messages delivered")]
    MaxMessages,
    #[error("outbound buffer limit exceeded")]
    ReconnectBufExceeded,
    #[error("stale connection")]
    StaleConnection,
    #[error("invalid connection")]
    InvalidConnection,
    #[error("invalid message")]
    InvalidMsg,
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("invalid argument")]
    InvalidArg,
    #[error("permissions violation: {0}")]
    Permissions(String),
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Parse(#[from] tern_wire::ParseError),
    #[error("i/o error: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("json error: {0}")]
    Json(#[source] Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}
