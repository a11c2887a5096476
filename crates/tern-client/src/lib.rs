// Publish/subscribe client for the Tern text protocol.
//
// CLIENT-SIDE DESIGN INTENT
// -------------------------
// The socket is a single-writer resource. Every publish and control write
// lands in one coalescing buffer under the connection mutex and a
// dedicated flusher task pushes it to the socket; nothing else writes.
// This keeps the hot path a short critical section plus a non-blocking
// wakeup, and it gives reconnection a single place to stage writes while
// no socket exists.
//
// On the inbound side one read loop feeds a resumable parser. Dispatch
// never runs user code: async subscription callbacks execute on their own
// per-subscription task, sync subscriptions hand off through a bounded
// channel, and lifecycle/error callbacks are serialized on a dispatch
// task. A subscriber that cannot keep up loses messages (slow consumer)
// rather than stalling the read loop.
//
// ```no_run
// use std::time::Duration;
// use tern_client::Client;
//
// async fn demo() -> tern_client::Result<()> {
//     let client = Client::connect("nats://localhost:4222").await?;
//     let sub = client.subscribe_sync("updates")?;
//     client.publish("updates", b"hello")?;
//     let msg = sub.next_msg(Duration::from_secs(1)).await?;
//     assert_eq!(msg.payload.as_ref(), b"hello");
//     client.close();
//     Ok(())
// }
// ```

mod client;
pub mod config;
mod errors;

pub use client::connection::{Client, Statistics, Status, new_inbox};
pub use client::subscription::{Message, Subscription, SubscriptionKind};
pub use config::{ClientOptions, ConnCallback, Dialer, ErrorCallback, TcpDialer};
pub use errors::{Error, Result};
