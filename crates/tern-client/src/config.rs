// Client-side defaults and connection options.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::rustls;

use crate::client::connection::Client;
use crate::client::subscription::Subscription;
use crate::errors::{Error, Result};

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_URL: &str = "nats://localhost:4222";
pub const DEFAULT_MAX_RECONNECT: i32 = 60;
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_PINGS_OUT: u32 = 2;
pub const DEFAULT_SUB_CHAN_LEN: usize = 8192;
pub const DEFAULT_RECONNECT_BUF_SIZE: usize = 8 * 1024 * 1024;

/// Default per-subscription pending limits; exceeding either marks the
/// subscription a slow consumer.
pub const DEFAULT_PENDING_MSGS_LIMIT: i64 = 65536;
pub const DEFAULT_PENDING_BYTES_LIMIT: i64 = 65536 * 1024;

// The size of socket reads and of the writer coalescing buffer.
pub(crate) const READ_BUF_SIZE: usize = 32768;
// Channel depth for the inbox subscription backing request().
pub(crate) const REQUEST_CHAN_LEN: usize = 8;

pub type ConnCallback = Arc<dyn Fn(&Client) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Client, Option<&Subscription>, &Error) + Send + Sync>;

/// Pluggable socket dialer. The default dials plain TCP; tests and
/// embedders can substitute their own.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<TcpStream>;
}

pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}

/// Connection options. Plain struct with public fields; start from
/// `ClientOptions::default()` and override what you need.
#[derive(Clone)]
pub struct ClientOptions {
    /// Primary server URL, tried first when set.
    pub url: String,
    /// Additional candidate servers for the pool.
    pub servers: Vec<String>,
    /// Keep the pool in configuration order instead of shuffling.
    pub no_randomize: bool,
    /// Client name reported in the CONNECT handshake.
    pub name: String,
    /// Ask the server to acknowledge every protocol line with +OK.
    pub verbose: bool,
    pub pedantic: bool,
    /// Require a TLS-wrapped connection. Implied by a `tls://` pool URL.
    pub secure: bool,
    /// TLS configuration pass-through; certificate policy is entirely the
    /// caller's. Required in practice when `secure` engages.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub allow_reconnect: bool,
    /// Per-server reconnect attempt budget; negative means unlimited.
    pub max_reconnect: i32,
    pub reconnect_wait: Duration,
    /// Dial (and handshake) timeout.
    pub timeout: Duration,
    /// Heartbeat interval; zero disables the ping timer.
    pub ping_interval: Duration,
    /// Outstanding unanswered pings tolerated before the connection is
    /// declared stale.
    pub max_pings_out: u32,
    /// Byte cap on the staging buffer that absorbs writes while
    /// reconnecting.
    pub reconnect_buf_size: usize,
    /// Channel depth for sync subscriptions.
    pub sub_chan_len: usize,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub disconnected_cb: Option<ConnCallback>,
    pub reconnected_cb: Option<ConnCallback>,
    pub closed_cb: Option<ConnCallback>,
    pub async_error_cb: Option<ErrorCallback>,
    pub dialer: Arc<dyn Dialer>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            servers: Vec::new(),
            no_randomize: false,
            name: String::new(),
            verbose: false,
            pedantic: false,
            secure: false,
            tls_config: None,
            allow_reconnect: true,
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            timeout: DEFAULT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            reconnect_buf_size: DEFAULT_RECONNECT_BUF_SIZE,
            sub_chan_len: DEFAULT_SUB_CHAN_LEN,
            user: None,
            password: None,
            token: None,
            disconnected_cb: None,
            reconnected_cb: None,
            closed_cb: None,
            async_error_cb: None,
            dialer: Arc::new(TcpDialer),
        }
    }
}

impl ClientOptions {
    /// Options seeded from a URL string; comma-separated lists are split
    /// into the server pool.
    pub fn from_url(url: &str) -> Self {
        Self {
            servers: url.split(',').map(|s| s.trim().to_string()).collect(),
            ..Self::default()
        }
    }

    /// Establish a connection with these options.
    pub async fn connect(self) -> Result<Client> {
        Client::connect_with_options(self).await
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sub_chan_len == 0 || self.reconnect_buf_size == 0 {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_constants() {
        let opts = ClientOptions::default();
        assert!(opts.allow_reconnect);
        assert_eq!(opts.max_reconnect, 60);
        assert_eq!(opts.reconnect_wait, Duration::from_secs(2));
        assert_eq!(opts.ping_interval, Duration::from_secs(120));
        assert_eq!(opts.max_pings_out, 2);
        assert_eq!(opts.sub_chan_len, 8192);
        assert_eq!(opts.reconnect_buf_size, 8 * 1024 * 1024);
    }

    #[test]
    fn from_url_splits_comma_separated_servers() {
        let opts = ClientOptions::from_url("nats://a:4222, nats://b:4223");
        assert_eq!(opts.servers, vec!["nats://a:4222", "nats://b:4223"]);
    }
}
