mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tern_client::{Client, Error};
use tokio::time::timeout;

use common::{MockServer, base_options, connect_client, eventually};

#[tokio::test]
async fn concurrent_close_tears_down_exactly_once() {
    let server = MockServer::bind().await;
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_seen = closes.clone();
    let mut opts = base_options(&server);
    opts.closed_cb = Some(Arc::new(move |_client: &Client| {
        closes_seen.fetch_add(1, Ordering::SeqCst);
    }));
    let (client, _conn) = connect_client(&server, opts).await;

    let a = client.clone();
    let b = client.clone();
    let (ra, rb) = tokio::join!(
        tokio::task::spawn_blocking(move || a.close()),
        tokio::task::spawn_blocking(move || b.close()),
    );
    ra.expect("close a");
    rb.expect("close b");

    assert!(client.is_closed());
    eventually("closed callback fired", || closes.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1, "teardown must run once");

    // And a later close stays a no-op.
    client.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_releases_blocked_next_msg_and_flush() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let sub = client.subscribe_sync("quiet").expect("subscribe");
    let _sid = conn.expect_sub("quiet").await;

    let blocked_next = tokio::spawn({
        let sub = sub.clone();
        async move { sub.next_msg(Duration::from_secs(30)).await }
    });
    let blocked_flush = tokio::spawn({
        let client = client.clone();
        async move { client.flush_timeout(Duration::from_secs(30)).await }
    });
    // Let both park.
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close();

    let next_err = timeout(Duration::from_secs(2), blocked_next)
        .await
        .expect("next released promptly")
        .expect("join")
        .expect_err("no message");
    assert!(matches!(next_err, Error::ConnectionClosed));

    let flush_err = timeout(Duration::from_secs(2), blocked_flush)
        .await
        .expect("flush released promptly")
        .expect("join")
        .expect_err("no pong");
    assert!(matches!(flush_err, Error::ConnectionClosed));
}

#[tokio::test]
async fn operations_after_close_fail_fast() {
    let server = MockServer::bind().await;
    let (client, _conn) = connect_client(&server, base_options(&server)).await;
    let sub = client.subscribe_sync("s").expect("subscribe");

    client.close();

    assert!(matches!(
        client.publish("s", b"x").expect_err("closed"),
        Error::ConnectionClosed
    ));
    assert!(matches!(
        client.subscribe_sync("t").expect_err("closed"),
        Error::ConnectionClosed
    ));
    assert!(matches!(
        client.flush_timeout(Duration::from_secs(1)).await.expect_err("closed"),
        Error::ConnectionClosed
    ));
    assert!(matches!(
        sub.next_msg(Duration::from_millis(50)).await.expect_err("closed"),
        Error::ConnectionClosed
    ));
    assert!(matches!(
        sub.unsubscribe().expect_err("closed"),
        Error::BadSubscription
    ));
    assert!(client.buffered().is_err());
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn close_wakes_async_delivery_tasks() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_seen = calls.clone();
    let sub = client
        .subscribe("work", move |_msg| {
            calls_seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");
    let sid = conn.expect_sub("work").await;

    conn.send_msg("work", sid, None, b"one").await;
    eventually("callback ran", || calls.load(Ordering::SeqCst) == 1).await;

    client.close();
    assert!(!sub.is_valid());
    // Frames after close never reach the callback.
    conn.send_msg("work", sid, None, b"two").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
