// Connection lifecycle: dial + handshake, steady-state reader/flusher/ping
// tasks, reconnection across the server pool, and teardown.
//
// Concurrency model: one coarse mutex guards all mutable connection state
// (status, outbound buffer, subscription registry, pong waiters, pool).
// Long-lived tasks never hold it across an await. Each installed socket
// gets an epoch number; bumping the epoch retires the tasks of the
// previous socket, which prevents a stale reader or flusher from feeding
// errors into a connection that has already moved on.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tracing::debug;

use tern_wire::{
    ConnectInfo, FrameSink, MsgArgs, PING_LINE, PONG_LINE, PROTOCOL, Parser, ServerInfo,
    normalize_err, write_connect, write_pub, write_sub, write_unsub,
};

use crate::client::lock;
use crate::client::server_pool::{ServerPool, ServerUrl};
use crate::client::subscription::{
    Message, MsgCallback, SubShared, SubState, Subscription, SubscriptionKind,
    spawn_delivery_task,
};
use crate::config::{ClientOptions, READ_BUF_SIZE, REQUEST_CHAN_LEN};
use crate::errors::{Error, Result};

/// Connection lifecycle states. `Closed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Message and byte counters for the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

type AsyncCb = Box<dyn FnOnce() + Send>;

struct ConnState {
    status: Status,
    epoch: u64,
    pool: ServerPool,
    info: ServerInfo,
    // Outbound coalescing buffer; doubles as the bounded staging buffer
    // while reconnecting.
    outbuf: BytesMut,
    // Flush waiters, one per outstanding PING, answered in FIFO order.
    pongs: VecDeque<oneshot::Sender<()>>,
    subs: HashMap<u64, Arc<SubShared>>,
    // Outstanding pings without a PONG reply.
    pout: u32,
    last_error: Option<Error>,
    stats: Statistics,
    cb_tx: Option<mpsc::UnboundedSender<AsyncCb>>,
}

pub(crate) struct Inner {
    opts: ClientOptions,
    state: Mutex<ConnState>,
    flush_kick: Notify,
    epoch_tx: watch::Sender<u64>,
    next_sid: AtomicU64,
}

struct HandshakeOutcome {
    stream: BoxedStream,
    leftover: BytesMut,
    info: ServerInfo,
}

enum AttemptError {
    // Socket never came up; not worth surfacing over a handshake error.
    Dial(Error),
    Handshake(Error),
}

/// Handle to one connection. Clones share the connection; the last
/// explicit `close` tears it down.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Connect using default options. Comma-separated URLs seed the pool.
    pub async fn connect(url: &str) -> Result<Client> {
        ClientOptions::from_url(url).connect().await
    }

    pub async fn connect_with_options(mut opts: ClientOptions) -> Result<Client> {
        opts.validate()?;
        let (pool, secure_hint) = ServerPool::setup(&opts)?;
        if secure_hint {
            opts.secure = true;
        }
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel::<AsyncCb>();
        // All user callbacks funnel through one task so they never run
        // concurrently and never block the read loop.
        tokio::spawn(async move {
            while let Some(f) = cb_rx.recv().await {
                f();
            }
        });
        let inner = Arc::new(Inner {
            opts,
            state: Mutex::new(ConnState {
                status: Status::Disconnected,
                epoch: 0,
                pool,
                info: ServerInfo::default(),
                outbuf: BytesMut::with_capacity(READ_BUF_SIZE),
                pongs: VecDeque::new(),
                subs: HashMap::new(),
                pout: 0,
                last_error: None,
                stats: Statistics::default(),
                cb_tx: Some(cb_tx),
            }),
            flush_kick: Notify::new(),
            epoch_tx: watch::Sender::new(0),
            next_sid: AtomicU64::new(0),
        });
        let client = Client { inner };
        client.connect_initial().await?;
        Ok(client)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Client {
        Client { inner }
    }

    // ---------------------------------------------------------------
    // Initial connect
    // ---------------------------------------------------------------

    async fn connect_initial(&self) -> Result<()> {
        let mut handshake_err: Option<Error> = None;
        let mut i = 0;
        loop {
            let url = {
                let mut st = lock(&self.inner.state);
                let Some(server) = st.pool.get_mut(i) else {
                    break;
                };
                server.last_attempt = Some(Instant::now());
                let url = server.url.clone();
                st.status = Status::Connecting;
                st.pool.set_current(i);
                url
            };
            match self.connect_attempt(&url).await {
                Ok(outcome) => {
                    let mut st = lock(&self.inner.state);
                    if let Some(server) = st.pool.get_mut(i) {
                        server.did_connect = true;
                        server.reconnects = 0;
                    }
                    self.install_connection(&mut st, outcome);
                    debug!(server = %url.display(), "connection established");
                    return Ok(());
                }
                Err(AttemptError::Dial(_)) => {}
                Err(AttemptError::Handshake(err)) => handshake_err = Some(err),
            }
            i += 1;
        }
        {
            let mut st = lock(&self.inner.state);
            st.status = Status::Disconnected;
        }
        Err(handshake_err.unwrap_or(Error::NoServers))
    }

    async fn connect_attempt(
        &self,
        url: &ServerUrl,
    ) -> std::result::Result<HandshakeOutcome, AttemptError> {
        let opts = &self.inner.opts;
        let dialed = tokio::time::timeout(opts.timeout, opts.dialer.dial(&url.host, url.port))
            .await
            .map_err(|_| AttemptError::Dial(Error::Timeout))?
            .map_err(|err| AttemptError::Dial(err.into()))?;
        let stream: BoxedStream = Box::new(dialed);
        match tokio::time::timeout(opts.timeout, self.handshake(url, stream)).await {
            Err(_) => Err(AttemptError::Handshake(Error::Timeout)),
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(AttemptError::Handshake(err)),
        }
    }

    /// INFO, TLS decision, CONNECT+PING, PONG. Runs before the steady-state
    /// tasks exist, so it reads the socket directly.
    async fn handshake(&self, url: &ServerUrl, stream: BoxedStream) -> Result<HandshakeOutcome> {
        let opts = &self.inner.opts;
        let mut reader = LineReader::new(stream);
        let line = reader.read_line().await?;
        let (op, args) = split_control(&line);
        if !op.eq_ignore_ascii_case("INFO") {
            return Err(Error::NoInfoReceived);
        }
        let info = ServerInfo::parse(args.as_bytes())?;
        {
            let mut st = lock(&self.inner.state);
            st.info = info.clone();
            if st.pool.merge_discovered(&info.connect_urls) && !opts.no_randomize {
                st.pool.shuffle();
            }
        }

        // Secure is a two-way negotiation: a one-sided requirement is a
        // hard mismatch, otherwise either side wanting TLS upgrades.
        if opts.secure && !info.tls_required {
            return Err(Error::SecureConnWanted);
        }
        if info.tls_required && !opts.secure {
            return Err(Error::SecureConnRequired);
        }

        let (mut stream, mut leftover) = reader.into_parts();
        if opts.secure {
            if !leftover.is_empty() {
                return Err(Error::InvalidConnection);
            }
            let config = opts.tls_config.clone().unwrap_or_else(default_tls_config);
            let server_name = rustls::pki_types::ServerName::try_from(url.host.clone())
                .map_err(|_| Error::InvalidArg)?;
            let tls = TlsConnector::from(config)
                .connect(server_name, stream)
                .await?;
            stream = Box::new(tls);
            leftover = BytesMut::new();
        }

        let connect = self.connect_info(url);
        let mut out = BytesMut::with_capacity(256);
        write_connect(&mut out, &connect)?;
        out.extend_from_slice(PING_LINE);
        stream.write_all(&out).await?;
        stream.flush().await?;

        let mut reader = LineReader::with_leftover(stream, leftover);
        let mut line = reader.read_line().await?;
        if opts.verbose && line.eq_ignore_ascii_case("+OK") {
            line = reader.read_line().await?;
        }
        if !line.eq_ignore_ascii_case("PONG") {
            if line.len() >= 4 && line.as_bytes()[..4].eq_ignore_ascii_case(b"-ERR") {
                let normalized = normalize_err(&line);
                if normalized.starts_with("authorization") {
                    return Err(Error::Authorization);
                }
                return Err(Error::Server(normalized));
            }
            return Err(Error::Server(format!("expected PONG, got {line:?}")));
        }
        let (stream, leftover) = reader.into_parts();
        Ok(HandshakeOutcome {
            stream,
            leftover,
            info,
        })
    }

    /// Credentials embedded in the URL win over configured ones; a URL
    /// username without a password is treated as a bearer token.
    fn connect_info(&self, url: &ServerUrl) -> ConnectInfo {
        let opts = &self.inner.opts;
        let (user, pass, token) = match (&url.username, &url.password) {
            (Some(user), Some(pass)) => (Some(user.clone()), Some(pass.clone()), None),
            (Some(token), None) => (None, None, Some(token.clone())),
            (None, _) => (opts.user.clone(), opts.password.clone(), opts.token.clone()),
        };
        ConnectInfo {
            verbose: opts.verbose,
            pedantic: opts.pedantic,
            user,
            pass,
            auth_token: token,
            tls_required: opts.secure,
            name: opts.name.clone(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL,
        }
    }

    /// Flip to CONNECTED and start the per-socket tasks. Holds the state
    /// lock; spawning is non-blocking.
    fn install_connection(&self, st: &mut ConnState, outcome: HandshakeOutcome) {
        st.info = outcome.info;
        st.status = Status::Connected;
        st.pout = 0;
        st.epoch += 1;
        let epoch = st.epoch;
        self.inner.epoch_tx.send_replace(epoch);
        let (reader, writer) = tokio::io::split(outcome.stream);
        tokio::spawn(read_loop(self.clone(), reader, outcome.leftover, epoch));
        tokio::spawn(flusher(self.clone(), writer, epoch));
        if self.inner.opts.ping_interval > Duration::ZERO {
            tokio::spawn(ping_timer(self.clone(), epoch));
        }
    }

    // ---------------------------------------------------------------
    // Publish / subscribe
    // ---------------------------------------------------------------

    /// Publish `payload` to `subject`. The write lands in the coalescing
    /// buffer and is pushed out by the flusher task.
    pub fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_reply(subject, None, payload)
    }

    /// Publish with a reply-to subject for request/reply flows.
    pub fn publish_request(&self, subject: &str, reply: &str, payload: &[u8]) -> Result<()> {
        self.publish_with_reply(subject, Some(reply), payload)
    }

    pub fn publish_msg(&self, msg: &Message) -> Result<()> {
        self.publish_with_reply(&msg.subject, msg.reply.as_deref(), &msg.payload)
    }

    fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        if subject.is_empty() {
            return Err(Error::BadSubject);
        }
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        // Reject payloads the server told us it will not accept.
        if st.info.max_payload > 0 && payload.len() as i64 > st.info.max_payload {
            return Err(Error::MaxPayload);
        }
        if st.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        // While reconnecting the outbound buffer is the staging buffer and
        // must stay bounded.
        if st.status == Status::Reconnecting && st.outbuf.len() >= inner.opts.reconnect_buf_size {
            return Err(Error::ReconnectBufExceeded);
        }
        write_pub(&mut st.outbuf, subject, reply, payload);
        st.stats.out_msgs += 1;
        st.stats.out_bytes += payload.len() as u64;
        drop(st);
        inner.flush_kick.notify_one();
        Ok(())
    }

    /// Subscribe with a callback. Delivery happens on a dedicated task,
    /// one message at a time per subscription.
    pub fn subscribe<F>(&self, subject: &str, cb: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_inner(
            subject,
            None,
            Some(Arc::new(cb) as MsgCallback),
            SubscriptionKind::Async,
            None,
            None,
        )
    }

    /// Callback subscription in a queue group; the server delivers each
    /// message to one member of the group.
    pub fn queue_subscribe<F>(&self, subject: &str, queue: &str, cb: F) -> Result<Subscription>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_inner(
            subject,
            Some(queue),
            Some(Arc::new(cb) as MsgCallback),
            SubscriptionKind::Async,
            None,
            None,
        )
    }

    /// Subscription polled via `next_msg`.
    pub fn subscribe_sync(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_sync_with_cap(subject, None, self.inner.opts.sub_chan_len)
    }

    pub fn queue_subscribe_sync(&self, subject: &str, queue: &str) -> Result<Subscription> {
        self.subscribe_sync_with_cap(subject, Some(queue), self.inner.opts.sub_chan_len)
    }

    fn subscribe_sync_with_cap(
        &self,
        subject: &str,
        queue: Option<&str>,
        cap: usize,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(cap.max(1));
        self.subscribe_inner(
            subject,
            queue,
            None,
            SubscriptionKind::Sync,
            Some(tx),
            Some(rx),
        )
    }

    /// Deliver matching messages into a caller-supplied channel. The
    /// sender is dropped on unsubscribe or close, which ends the
    /// receiver's stream.
    pub fn chan_subscribe(
        &self,
        subject: &str,
        tx: mpsc::Sender<Message>,
    ) -> Result<Subscription> {
        self.subscribe_inner(subject, None, None, SubscriptionKind::Channel, Some(tx), None)
    }

    pub fn chan_queue_subscribe(
        &self,
        subject: &str,
        queue: &str,
        tx: mpsc::Sender<Message>,
    ) -> Result<Subscription> {
        self.subscribe_inner(
            subject,
            Some(queue),
            None,
            SubscriptionKind::Channel,
            Some(tx),
            None,
        )
    }

    fn subscribe_inner(
        &self,
        subject: &str,
        queue: Option<&str>,
        cb: Option<MsgCallback>,
        kind: SubscriptionKind,
        tx: Option<mpsc::Sender<Message>>,
        rx: Option<mpsc::Receiver<Message>>,
    ) -> Result<Subscription> {
        if subject.is_empty() {
            return Err(Error::BadSubject);
        }
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        if st.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        let sid = inner.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = SubShared::new(
            sid,
            subject.to_string(),
            queue.map(str::to_string),
            kind,
            cb,
            tx,
            rx,
            Arc::downgrade(&self.inner),
        );
        st.subs.insert(sid, shared.clone());
        // While reconnecting the SUB line is deferred to the replay.
        if st.status != Status::Reconnecting {
            write_sub(&mut st.outbuf, subject, queue, sid);
        }
        drop(st);
        if kind == SubscriptionKind::Async {
            spawn_delivery_task(shared.clone());
        }
        inner.flush_kick.notify_one();
        Ok(Subscription::new(shared))
    }

    /// `max == 0` unsubscribes immediately; `max > 0` arms auto-unsubscribe
    /// after that many deliveries.
    pub(crate) fn unsubscribe(&self, shared: &Arc<SubShared>, max: u64) -> Result<()> {
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        if st.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        if !st.subs.contains_key(&shared.sid) {
            return Ok(());
        }
        let max_arg = if max > 0 {
            lock(&shared.state).max = max;
            Some(max)
        } else {
            if let Some(sub) = st.subs.remove(&shared.sid) {
                detach_sub(&sub, false);
            }
            None
        };
        if st.status != Status::Reconnecting {
            write_unsub(&mut st.outbuf, shared.sid, max_arg);
        }
        drop(st);
        inner.flush_kick.notify_one();
        Ok(())
    }

    /// Drop a subscription that reached its delivery cap.
    pub(crate) fn remove_subscription(&self, shared: &Arc<SubShared>) {
        let mut st = lock(&self.inner.state);
        let removed = st.subs.remove(&shared.sid);
        drop(st);
        if removed.is_some() {
            detach_sub(shared, false);
        }
    }

    // ---------------------------------------------------------------
    // Request / reply
    // ---------------------------------------------------------------

    /// Publish and wait for the first reply on a private inbox subject.
    /// The temporary subscription is removed on every exit path.
    pub async fn request(
        &self,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = new_inbox();
        let sub = self.subscribe_sync_with_cap(&inbox, None, REQUEST_CHAN_LEN)?;
        sub.auto_unsubscribe(1)?;
        self.publish_request(subject, &inbox, payload)?;
        let result = sub.next_msg(timeout).await;
        let _ = sub.unsubscribe();
        result
    }

    // ---------------------------------------------------------------
    // Flush
    // ---------------------------------------------------------------

    /// Round trip to the server: send a PING and wait for its PONG.
    pub async fn flush(&self) -> Result<()> {
        self.flush_timeout(Duration::from_secs(60)).await
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::BadTimeout);
        }
        let rx = {
            let mut st = lock(&self.inner.state);
            if st.status == Status::Closed {
                return Err(Error::ConnectionClosed);
            }
            let (tx, rx) = oneshot::channel();
            st.outbuf.extend_from_slice(PING_LINE);
            st.pongs.push_back(tx);
            rx
        };
        self.inner.flush_kick.notify_one();
        match tokio::time::timeout(timeout, rx).await {
            // A timed-out waiter stays in the queue; its eventual PONG
            // send just lands on a dropped receiver, keeping the
            // PING/PONG pairing aligned.
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Ok(Ok(())) => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // Inbound protocol events (called from the read loop's sink)
    // ---------------------------------------------------------------

    fn process_msg(&self, args: &MsgArgs, payload: &[u8]) {
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        st.stats.in_msgs += 1;
        st.stats.in_bytes += payload.len() as u64;
        // Unknown sid: the subscription was already torn down; drop.
        let Some(sub) = st.subs.get(&args.sid).cloned() else {
            return;
        };
        let msg = Message {
            subject: args.subject.clone(),
            reply: args.reply.clone(),
            payload: Bytes::copy_from_slice(payload),
            sid: args.sid,
        };
        let len = payload.len();
        let mut ss = lock(&sub.state);
        if sub.kind != SubscriptionKind::Channel {
            ss.pending_msgs += 1;
            ss.pending_bytes += len;
            if ss.pending_msgs > ss.pending_msgs_max {
                ss.pending_msgs_max = ss.pending_msgs;
            }
            if ss.pending_bytes > ss.pending_bytes_max {
                ss.pending_bytes_max = ss.pending_bytes;
            }
            let over = (ss.pending_msgs_limit > 0
                && ss.pending_msgs as i64 > ss.pending_msgs_limit)
                || (ss.pending_bytes_limit > 0
                    && ss.pending_bytes as i64 > ss.pending_bytes_limit);
            if over {
                self.flag_slow_consumer(&mut st, &sub, &mut ss, len, true);
                return;
            }
        }
        match sub.kind {
            SubscriptionKind::Async => {
                ss.pending.push_back(msg);
                sub.notify.notify_one();
            }
            SubscriptionKind::Sync | SubscriptionKind::Channel => {
                let Some(tx) = ss.tx.clone() else {
                    return;
                };
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.flag_slow_consumer(
                            &mut st,
                            &sub,
                            &mut ss,
                            len,
                            sub.kind != SubscriptionKind::Channel,
                        );
                        return;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return;
                    }
                }
            }
        }
        // A successful hand-off ends any slow-consumer streak.
        ss.slow_consumer = false;
    }

    /// Drop the message and raise at most one async-error notification
    /// per consecutive overflow streak.
    fn flag_slow_consumer(
        &self,
        st: &mut ConnState,
        sub: &Arc<SubShared>,
        ss: &mut SubState,
        len: usize,
        undo_stats: bool,
    ) {
        ss.dropped += 1;
        if undo_stats {
            ss.pending_msgs = ss.pending_msgs.saturating_sub(1);
            ss.pending_bytes = ss.pending_bytes.saturating_sub(len);
        }
        st.last_error = Some(Error::SlowConsumer);
        if !ss.slow_consumer && let Some(cb) = self.inner.opts.async_error_cb.clone() {
            let client = self.clone();
            let subscription = Subscription::new(sub.clone());
            enqueue_cb(st, Box::new(move || {
                cb(&client, Some(&subscription), &Error::SlowConsumer)
            }));
        }
        ss.slow_consumer = true;
    }

    fn process_ping(&self) {
        let mut st = lock(&self.inner.state);
        st.outbuf.extend_from_slice(PONG_LINE);
        drop(st);
        self.inner.flush_kick.notify_one();
    }

    fn process_pong(&self) {
        let mut st = lock(&self.inner.state);
        st.pout = 0;
        if let Some(tx) = st.pongs.pop_front() {
            let _ = tx.send(());
        }
    }

    /// Asynchronous INFO updates refresh server metadata and may grow the
    /// pool with advertised peers. Malformed updates are ignored.
    fn process_async_info(&self, json: &[u8]) {
        let Ok(info) = ServerInfo::parse(json) else {
            debug!("ignoring malformed INFO update");
            return;
        };
        let mut st = lock(&self.inner.state);
        let updated = st.pool.merge_discovered(&info.connect_urls);
        st.info = info;
        if updated && !self.inner.opts.no_randomize {
            st.pool.shuffle();
        }
    }

    fn process_err_line(&self, epoch: u64, raw: &[u8]) {
        let normalized = normalize_err(&String::from_utf8_lossy(raw));
        if normalized == "stale connection" {
            self.process_op_err(epoch, Error::StaleConnection);
        } else if normalized.starts_with("permissions violation") {
            // Credentials will not change on retry; notify, then tear down
            // instead of reconnecting.
            let err = Error::Permissions(normalized);
            {
                let mut st = lock(&self.inner.state);
                st.last_error = Some(err.clone());
                if let Some(cb) = self.inner.opts.async_error_cb.clone() {
                    let client = self.clone();
                    enqueue_cb(&mut st, Box::new(move || cb(&client, None, &err)));
                }
            }
            self.close_internal(true);
        } else if normalized.starts_with("authorization") {
            {
                let mut st = lock(&self.inner.state);
                st.last_error = Some(Error::Authorization);
            }
            self.close_internal(true);
        } else {
            {
                let mut st = lock(&self.inner.state);
                st.last_error = Some(Error::Server(normalized));
            }
            self.close_internal(true);
        }
    }

    // ---------------------------------------------------------------
    // Error handling / reconnect
    // ---------------------------------------------------------------

    /// Route an I/O, parse, or staleness error from a per-socket task.
    /// Ignored when another transition already retired that socket.
    fn process_op_err(&self, epoch: u64, err: Error) {
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        if st.epoch != epoch {
            return;
        }
        if matches!(
            st.status,
            Status::Connecting | Status::Closed | Status::Reconnecting
        ) {
            return;
        }
        if inner.opts.allow_reconnect && st.status == Status::Connected {
            debug!(error = %err, "connection error, entering reconnect");
            st.status = Status::Reconnecting;
            st.epoch += 1;
            inner.epoch_tx.send_replace(st.epoch);
            drop(st);
            let client = self.clone();
            tokio::spawn(async move { client.do_reconnect().await });
        } else {
            st.status = Status::Disconnected;
            st.last_error = Some(err);
            drop(st);
            self.close_internal(true);
        }
    }

    async fn do_reconnect(self) {
        {
            let mut st = lock(&self.inner.state);
            // Release pending flush waiters; their PINGs died with the
            // socket.
            st.pongs.clear();
            st.last_error = None;
            if let Some(cb) = self.inner.opts.disconnected_cb.clone() {
                let client = self.clone();
                enqueue_cb(&mut st, Box::new(move || cb(&client)));
            }
        }
        loop {
            let next = {
                let mut st = lock(&self.inner.state);
                if st.status == Status::Closed {
                    return;
                }
                match st.pool.select_next(self.inner.opts.max_reconnect) {
                    Some(server) => {
                        let url = server.url.clone();
                        let wait = match server.last_attempt {
                            Some(at) => {
                                self.inner.opts.reconnect_wait.saturating_sub(at.elapsed())
                            }
                            None => Duration::ZERO,
                        };
                        Some((url, wait))
                    }
                    None => None,
                }
            };
            let Some((url, wait)) = next else {
                break;
            };
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            } else {
                tokio::task::yield_now().await;
            }
            {
                let mut st = lock(&self.inner.state);
                if st.status == Status::Closed {
                    return;
                }
                if let Some(server) = st.pool.current_mut() {
                    server.reconnects += 1;
                    server.last_attempt = Some(Instant::now());
                }
            }
            debug!(server = %url.display(), "reconnect attempt");
            let outcome = match self.connect_attempt(&url).await {
                Ok(outcome) => outcome,
                Err(AttemptError::Dial(_)) => continue,
                Err(AttemptError::Handshake(err)) => {
                    let mut st = lock(&self.inner.state);
                    if st.status == Status::Closed {
                        return;
                    }
                    st.last_error = Some(err);
                    continue;
                }
            };
            let HandshakeOutcome {
                mut stream,
                leftover,
                info,
            } = outcome;

            // Replay live subscription state, then the staged writes, on
            // the fresh socket before declaring the connection usable.
            let (replay, staged) = {
                let mut st = lock(&self.inner.state);
                if st.status == Status::Closed {
                    return;
                }
                st.last_error = None;
                let mut replay = BytesMut::with_capacity(256);
                for sub in st.subs.values() {
                    let ss = lock(&sub.state);
                    if ss.closed {
                        continue;
                    }
                    let remaining = if ss.max > 0 {
                        let left = ss.max.saturating_sub(ss.delivered);
                        if left == 0 {
                            // Cap already reached; tell the server to
                            // forget the sid without re-subscribing.
                            write_unsub(&mut replay, sub.sid, None);
                            continue;
                        }
                        Some(left)
                    } else {
                        None
                    };
                    write_sub(&mut replay, &sub.subject, sub.queue.as_deref(), sub.sid);
                    if let Some(left) = remaining {
                        write_unsub(&mut replay, sub.sid, Some(left));
                    }
                }
                let staged = std::mem::take(&mut st.outbuf);
                (replay, staged)
            };
            let mut full = BytesMut::with_capacity(replay.len() + staged.len());
            full.extend_from_slice(&replay);
            full.extend_from_slice(&staged);
            if let Err(err) = stream.write_all(&full).await {
                let mut st = lock(&self.inner.state);
                if st.status == Status::Closed {
                    return;
                }
                // Put the staged user writes back for the next attempt.
                let mut restored = BytesMut::with_capacity(staged.len() + st.outbuf.len());
                restored.extend_from_slice(&staged);
                restored.extend_from_slice(&st.outbuf);
                st.outbuf = restored;
                st.last_error = Some(err.into());
                continue;
            }
            {
                let mut st = lock(&self.inner.state);
                if st.status == Status::Closed {
                    return;
                }
                st.stats.reconnects += 1;
                if let Some(server) = st.pool.current_mut() {
                    server.did_connect = true;
                    server.reconnects = 0;
                }
                self.install_connection(
                    &mut st,
                    HandshakeOutcome {
                        stream,
                        leftover,
                        info,
                    },
                );
                debug!(server = %url.display(), "reconnected");
                if let Some(cb) = self.inner.opts.reconnected_cb.clone() {
                    let client = self.clone();
                    enqueue_cb(&mut st, Box::new(move || cb(&client)));
                }
            }
            self.inner.flush_kick.notify_one();
            return;
        }
        {
            let mut st = lock(&self.inner.state);
            if st.last_error.is_none() {
                st.last_error = Some(Error::NoServers);
            }
        }
        self.close_internal(true);
    }

    // ---------------------------------------------------------------
    // Close
    // ---------------------------------------------------------------

    /// Tear the connection down and release every blocked caller. Safe to
    /// call any number of times; teardown runs once.
    pub fn close(&self) {
        self.close_internal(true);
    }

    fn close_internal(&self, do_cbs: bool) {
        let inner = &self.inner;
        let mut st = lock(&inner.state);
        if st.status == Status::Closed {
            return;
        }
        // Disconnected is the error-path transition out of Connected, so a
        // socket existed there too; Reconnecting has already reported its
        // disconnect.
        let had_socket = matches!(st.status, Status::Connected | Status::Disconnected);
        st.status = Status::Closed;
        // Same epoch, new version: wakes the watchers so the read loop and
        // ping timer observe Closed, while the flusher performs its final
        // drain before retiring the socket.
        let epoch = st.epoch;
        inner.epoch_tx.send_replace(epoch);
        inner.flush_kick.notify_one();
        st.pongs.clear();
        let subs: Vec<Arc<SubShared>> = st.subs.drain().map(|(_, sub)| sub).collect();
        for sub in &subs {
            detach_sub(sub, true);
        }
        if do_cbs {
            if had_socket && let Some(cb) = inner.opts.disconnected_cb.clone() {
                let client = self.clone();
                enqueue_cb(&mut st, Box::new(move || cb(&client)));
            }
            if let Some(cb) = inner.opts.closed_cb.clone() {
                let client = self.clone();
                enqueue_cb(&mut st, Box::new(move || cb(&client)));
            }
        }
        // Callback channel closes after the final callbacks drain.
        st.cb_tx = None;
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    pub fn status(&self) -> Status {
        lock(&self.inner.state).status
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == Status::Reconnecting
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Most recent terminal error; readable from within the closed
    /// callback to learn why the connection went away.
    pub fn last_error(&self) -> Option<Error> {
        lock(&self.inner.state).last_error.clone()
    }

    pub fn connected_url(&self) -> Option<String> {
        let st = lock(&self.inner.state);
        if st.status != Status::Connected {
            return None;
        }
        st.pool.current().map(|server| server.url.display())
    }

    pub fn connected_server_id(&self) -> Option<String> {
        let st = lock(&self.inner.state);
        if st.status != Status::Connected {
            return None;
        }
        Some(st.info.server_id.clone())
    }

    /// Payload size limit advertised by the connected server.
    pub fn max_payload(&self) -> i64 {
        lock(&self.inner.state).info.max_payload
    }

    pub fn auth_required(&self) -> bool {
        lock(&self.inner.state).info.auth_required
    }

    pub fn tls_required(&self) -> bool {
        lock(&self.inner.state).info.tls_required
    }

    /// Every known server, configured and discovered.
    pub fn servers(&self) -> Vec<String> {
        lock(&self.inner.state).pool.urls(false)
    }

    /// Servers learned from INFO advertisements only.
    pub fn discovered_servers(&self) -> Vec<String> {
        lock(&self.inner.state).pool.urls(true)
    }

    pub fn stats(&self) -> Statistics {
        lock(&self.inner.state).stats
    }

    /// Bytes queued for the flusher but not yet written.
    pub fn buffered(&self) -> Result<usize> {
        let st = lock(&self.inner.state);
        if st.status == Status::Closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(st.outbuf.len())
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.state).subs.len()
    }

    /// Route an error through the connection's async-error callback. Used
    /// by layers above the core client (e.g. typed façades reporting
    /// decode failures) so their errors surface on the same path as slow
    /// consumers.
    pub fn notify_async_error(&self, err: Error) {
        let mut st = lock(&self.inner.state);
        if let Some(cb) = self.inner.opts.async_error_cb.clone() {
            let client = self.clone();
            enqueue_cb(&mut st, Box::new(move || cb(&client, None, &err)));
        }
    }
}

/// Release a subscription's waiters and sever its connection link.
fn detach_sub(sub: &Arc<SubShared>, conn_closed: bool) {
    let mut ss = lock(&sub.state);
    ss.tx = None;
    ss.closed = true;
    if conn_closed {
        ss.conn_closed = true;
    }
    drop(ss);
    *lock(&sub.client) = None;
    sub.notify.notify_one();
}

fn enqueue_cb(st: &mut ConnState, f: AsyncCb) {
    if let Some(tx) = st.cb_tx.as_ref() {
        let _ = tx.send(f);
    }
}

/// Process-unique reply subject for request/reply.
pub fn new_inbox() -> String {
    let mut rng = rand::thread_rng();
    let token: String = (0..22)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect();
    format!("_INBOX.{token}")
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    // Certificate policy is a pass-through: with no caller-supplied
    // config the handshake runs against an empty root store and will
    // reject unverifiable servers.
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth(),
    )
}

fn split_control(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((op, args)) => (op, args.trim()),
        None => (line.trim(), ""),
    }
}

// Buffered line reads for the handshake phase. Bytes read past the last
// line are handed to the read loop so no frame is lost at the switchover.
struct LineReader {
    stream: BoxedStream,
    buf: BytesMut,
}

impl LineReader {
    fn new(stream: BoxedStream) -> Self {
        Self::with_leftover(stream, BytesMut::new())
    }

    fn with_leftover(stream: BoxedStream, buf: BytesMut) -> Self {
        Self { stream, buf }
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let line = &line[..line.len() - 1];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                return Ok(String::from_utf8_lossy(line).into_owned());
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    fn into_parts(self) -> (BoxedStream, BytesMut) {
        (self.stream, self.buf)
    }
}

// Bridges parser events into connection processing.
struct ConnSink {
    client: Client,
    epoch: u64,
}

impl FrameSink for ConnSink {
    fn on_msg(&mut self, args: &MsgArgs, payload: &[u8]) {
        self.client.process_msg(args, payload);
    }
    fn on_info(&mut self, json: &[u8]) {
        self.client.process_async_info(json);
    }
    fn on_ping(&mut self) {
        self.client.process_ping();
    }
    fn on_pong(&mut self) {
        self.client.process_pong();
    }
    fn on_ok(&mut self) {}
    fn on_err(&mut self, msg: &[u8]) {
        self.client.process_err_line(self.epoch, msg);
    }
}

/// Reads the socket and feeds the parser until an error or until this
/// socket's epoch is retired.
async fn read_loop(
    client: Client,
    mut reader: ReadHalf<BoxedStream>,
    leftover: BytesMut,
    epoch: u64,
) {
    let mut parser = Parser::new();
    let mut sink = ConnSink {
        client: client.clone(),
        epoch,
    };
    let mut epoch_rx = client.inner.epoch_tx.subscribe();
    if !leftover.is_empty()
        && let Err(err) = parser.parse(&mut sink, &leftover)
    {
        client.process_op_err(epoch, err.into());
        return;
    }
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        {
            let st = lock(&client.inner.state);
            if st.epoch != epoch || st.status != Status::Connected {
                return;
            }
        }
        tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    let eof = std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    );
                    client.process_op_err(epoch, eof.into());
                    return;
                }
                Ok(n) => {
                    if let Err(err) = parser.parse(&mut sink, &buf[..n]) {
                        client.process_op_err(epoch, err.into());
                        return;
                    }
                }
                Err(err) => {
                    client.process_op_err(epoch, err.into());
                    return;
                }
            },
            res = epoch_rx.changed() => {
                if res.is_err() {
                    return;
                }
                // Loop to re-check status/epoch under the lock.
            }
        }
    }
}

/// Owns the socket write half. Waits for a kick, swaps the outbound
/// buffer out under the lock, and writes it without holding the lock.
async fn flusher(client: Client, mut writer: WriteHalf<BoxedStream>, epoch: u64) {
    let mut epoch_rx = client.inner.epoch_tx.subscribe();
    enum Action {
        Write(BytesMut),
        Drain(BytesMut),
        Exit,
        Idle,
    }
    loop {
        let action = {
            let mut st = lock(&client.inner.state);
            if st.epoch != epoch {
                Action::Exit
            } else if st.status == Status::Closed {
                Action::Drain(std::mem::take(&mut st.outbuf))
            } else if st.status == Status::Connected && !st.outbuf.is_empty() {
                Action::Write(std::mem::take(&mut st.outbuf))
            } else {
                Action::Idle
            }
        };
        match action {
            Action::Exit => return,
            Action::Drain(data) => {
                // Final flush on close, then retire the socket.
                if !data.is_empty() {
                    let _ = writer.write_all(&data).await;
                }
                let _ = writer.shutdown().await;
                return;
            }
            Action::Write(data) => {
                if let Err(err) = writer.write_all(&data).await {
                    client.process_op_err(epoch, err.into());
                    return;
                }
            }
            Action::Idle => {
                tokio::select! {
                    _ = client.inner.flush_kick.notified() => {}
                    res = epoch_rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Periodic liveness probe. Too many unanswered pings declares the
/// connection stale and hands it to the reconnect machinery.
async fn ping_timer(client: Client, epoch: u64) {
    let interval = client.inner.opts.ping_interval;
    let mut epoch_rx = client.inner.epoch_tx.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            res = epoch_rx.changed() => {
                if res.is_err() {
                    return;
                }
                let st = lock(&client.inner.state);
                if st.epoch != epoch || st.status != Status::Connected {
                    return;
                }
                continue;
            }
        }
        let stale = {
            let mut st = lock(&client.inner.state);
            if st.epoch != epoch || st.status != Status::Connected {
                return;
            }
            st.pout += 1;
            if st.pout > client.inner.opts.max_pings_out {
                true
            } else {
                st.outbuf.extend_from_slice(PING_LINE);
                false
            }
        };
        if stale {
            client.process_op_err(epoch, Error::StaleConnection);
            return;
        }
        client.inner.flush_kick.notify_one();
    }
}
