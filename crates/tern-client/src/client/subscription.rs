// Subscription kinds, per-subscription delivery queues, and the dedicated
// consumer task that drains async subscriptions in FIFO order.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use crate::client::connection::{Client, Inner};
use crate::client::lock;
use crate::config::{DEFAULT_PENDING_BYTES_LIMIT, DEFAULT_PENDING_MSGS_LIMIT};
use crate::errors::{Error, Result};

/// A delivered message. Ownership moves from the wire, through the
/// subscription's queue or channel, to the consumer.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub(crate) sid: u64,
}

impl Message {
    /// Id of the subscription this message was delivered on.
    pub fn sid(&self) -> u64 {
        self.sid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Callback-driven; a dedicated task drains the pending queue.
    Async,
    /// Polled via `next_msg` over an internally owned channel.
    Sync,
    /// Delivery into a caller-supplied channel sender.
    Channel,
}

pub(crate) type MsgCallback = Arc<dyn Fn(Message) + Send + Sync>;

pub(crate) struct SubState {
    // Delivery-side handle; dropping it releases blocked receivers.
    pub tx: Option<mpsc::Sender<Message>>,
    // In-flight messages for async subscriptions, strict FIFO.
    pub pending: VecDeque<Message>,
    pub delivered: u64,
    pub max: u64,
    pub closed: bool,
    pub conn_closed: bool,
    pub slow_consumer: bool,
    pub pending_msgs: usize,
    pub pending_bytes: usize,
    pub pending_msgs_max: usize,
    pub pending_bytes_max: usize,
    pub pending_msgs_limit: i64,
    pub pending_bytes_limit: i64,
    pub dropped: u64,
}

impl SubState {
    fn new(tx: Option<mpsc::Sender<Message>>) -> Self {
        Self {
            tx,
            pending: VecDeque::new(),
            delivered: 0,
            max: 0,
            closed: false,
            conn_closed: false,
            slow_consumer: false,
            pending_msgs: 0,
            pending_bytes: 0,
            pending_msgs_max: 0,
            pending_bytes_max: 0,
            pending_msgs_limit: DEFAULT_PENDING_MSGS_LIMIT,
            pending_bytes_limit: DEFAULT_PENDING_BYTES_LIMIT,
            dropped: 0,
        }
    }
}

pub(crate) struct SubShared {
    pub sid: u64,
    pub subject: String,
    pub queue: Option<String>,
    pub kind: SubscriptionKind,
    pub cb: Option<MsgCallback>,
    pub state: Mutex<SubState>,
    // Wakes the async delivery task; one waiter at most.
    pub notify: Notify,
    // Back-reference to the owning connection, weak so a torn-down
    // connection cannot be resurrected through a stale subscription.
    pub client: Mutex<Option<Weak<Inner>>>,
    // Receiver half for sync subscriptions; None for the other kinds.
    pub rx: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

impl SubShared {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        queue: Option<String>,
        kind: SubscriptionKind,
        cb: Option<MsgCallback>,
        tx: Option<mpsc::Sender<Message>>,
        rx: Option<mpsc::Receiver<Message>>,
        client: Weak<Inner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid,
            subject,
            queue,
            kind,
            cb,
            state: Mutex::new(SubState::new(tx)),
            notify: Notify::new(),
            client: Mutex::new(Some(client)),
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

/// Interest in a subject, optionally load-shared through a queue group.
///
/// Cheap to clone; all clones refer to the same underlying subscription.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) shared: Arc<SubShared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.shared.sid)
            .field("subject", &self.shared.subject)
            .field("queue", &self.shared.queue)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubShared>) -> Self {
        Self { shared }
    }

    pub fn subject(&self) -> &str {
        &self.shared.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.shared.queue.as_deref()
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.shared.kind
    }

    /// Whether the subscription is still registered with a live connection.
    pub fn is_valid(&self) -> bool {
        lock(&self.shared.client)
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some()
    }

    fn client(&self) -> Result<Client> {
        lock(&self.shared.client)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Client::from_inner)
            .ok_or(Error::BadSubscription)
    }

    /// Remove interest in the subject.
    pub fn unsubscribe(&self) -> Result<()> {
        self.client()?.unsubscribe(&self.shared, 0)
    }

    /// Unsubscribe automatically once `max` messages have been delivered.
    /// Useful when the number of responders is unknown; `request` relies
    /// on this with `max == 1`.
    pub fn auto_unsubscribe(&self, max: u64) -> Result<()> {
        self.client()?.unsubscribe(&self.shared, max)
    }

    /// Wait for the next message on a sync subscription.
    ///
    /// Returns `Error::Timeout` when no message arrives in time, and
    /// `Error::ConnectionClosed` once the connection has been torn down,
    /// so callers can tell "nothing yet" from "nothing ever again".
    pub async fn next_msg(&self, timeout: Duration) -> Result<Message> {
        {
            let mut st = lock(&self.shared.state);
            if st.conn_closed {
                return Err(Error::ConnectionClosed);
            }
            if st.closed {
                if st.max > 0 && st.delivered >= st.max {
                    return Err(Error::MaxMessages);
                }
                return Err(Error::BadSubscription);
            }
            if self.shared.cb.is_some() {
                return Err(Error::SyncRequired);
            }
            if st.slow_consumer {
                st.slow_consumer = false;
                return Err(Error::SlowConsumer);
            }
        }

        let mut rx_guard = self.shared.rx.lock().await;
        let rx = rx_guard.as_mut().ok_or(Error::TypeSubscription)?;
        let msg = match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => return Err(Error::Timeout),
            Ok(None) => return Err(Error::ConnectionClosed),
            Ok(Some(msg)) => msg,
        };

        let (max, delivered) = {
            let mut st = lock(&self.shared.state);
            st.delivered += 1;
            st.pending_msgs = st.pending_msgs.saturating_sub(1);
            st.pending_bytes = st.pending_bytes.saturating_sub(msg.payload.len());
            (st.max, st.delivered)
        };
        if max > 0 {
            if delivered > max {
                return Err(Error::MaxMessages);
            }
            if delivered == max
                && let Ok(client) = self.client()
            {
                client.remove_subscription(&self.shared);
            }
        }
        Ok(msg)
    }

    /// Queued message and byte counts not yet handed to the consumer.
    pub fn pending(&self) -> Result<(usize, usize)> {
        self.introspect()
    }

    /// High-water marks for the pending counts.
    pub fn max_pending(&self) -> Result<(usize, usize)> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        if self.shared.kind == SubscriptionKind::Channel {
            return Err(Error::TypeSubscription);
        }
        let st = lock(&self.shared.state);
        Ok((st.pending_msgs_max, st.pending_bytes_max))
    }

    pub fn clear_max_pending(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        if self.shared.kind == SubscriptionKind::Channel {
            return Err(Error::TypeSubscription);
        }
        let mut st = lock(&self.shared.state);
        st.pending_msgs_max = 0;
        st.pending_bytes_max = 0;
        Ok(())
    }

    /// Current pending limits; a negative value means unlimited.
    pub fn pending_limits(&self) -> Result<(i64, i64)> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        if self.shared.kind == SubscriptionKind::Channel {
            return Err(Error::TypeSubscription);
        }
        let st = lock(&self.shared.state);
        Ok((st.pending_msgs_limit, st.pending_bytes_limit))
    }

    /// Set pending limits. Zero is invalid; negative disables the limit.
    pub fn set_pending_limits(&self, msgs: i64, bytes: i64) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        if self.shared.kind == SubscriptionKind::Channel {
            return Err(Error::TypeSubscription);
        }
        if msgs == 0 || bytes == 0 {
            return Err(Error::InvalidArg);
        }
        let mut st = lock(&self.shared.state);
        st.pending_msgs_limit = msgs;
        st.pending_bytes_limit = bytes;
        Ok(())
    }

    pub fn delivered(&self) -> Result<u64> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        Ok(lock(&self.shared.state).delivered)
    }

    /// Messages dropped under the slow-consumer policy.
    pub fn dropped(&self) -> Result<u64> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        Ok(lock(&self.shared.state).dropped)
    }

    fn introspect(&self) -> Result<(usize, usize)> {
        if !self.is_valid() {
            return Err(Error::BadSubscription);
        }
        if self.shared.kind == SubscriptionKind::Channel {
            return Err(Error::TypeSubscription);
        }
        let st = lock(&self.shared.state);
        Ok((st.pending_msgs, st.pending_bytes))
    }
}

/// Drain loop for one async subscription. Messages are handed to the
/// callback one at a time, preserving arrival order; callbacks across
/// different subscriptions run on independent tasks.
pub(crate) fn spawn_delivery_task(shared: Arc<SubShared>) {
    tokio::spawn(async move {
        loop {
            let popped = {
                let mut st = lock(&shared.state);
                if st.closed {
                    break;
                }
                match st.pending.pop_front() {
                    Some(msg) => {
                        st.pending_msgs = st.pending_msgs.saturating_sub(1);
                        st.pending_bytes = st.pending_bytes.saturating_sub(msg.payload.len());
                        st.delivered += 1;
                        Some((msg, st.max, st.delivered))
                    }
                    None => None,
                }
            };
            match popped {
                Some((msg, max, delivered)) => {
                    if let Some(cb) = shared.cb.as_ref()
                        && (max == 0 || delivered <= max)
                    {
                        cb(msg);
                    }
                    if max > 0 && delivered >= max {
                        let client = lock(&shared.client).as_ref().and_then(Weak::upgrade);
                        if let Some(inner) = client {
                            Client::from_inner(inner).remove_subscription(&shared);
                        }
                        break;
                    }
                }
                None => shared.notify.notified().await,
            }
        }
    });
}
