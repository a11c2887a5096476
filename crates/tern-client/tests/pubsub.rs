mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tern_client::{ClientOptions, Error};
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{MockServer, base_options, connect_client, eventually};

#[tokio::test]
async fn publish_subscribe_round_trip() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let sub = client.subscribe_sync("greet").expect("subscribe");
    let sid = conn.expect_sub("greet").await;

    let large = vec![7u8; 1024];
    for payload in [&b""[..], &b"x"[..], &large[..]] {
        client.publish("greet", payload).expect("publish");
        let (subject, reply, seen) = conn.read_pub().await;
        assert_eq!(subject, "greet");
        assert_eq!(reply, None);
        assert_eq!(seen, payload);

        conn.send_msg("greet", sid, None, payload).await;
        let msg = sub.next_msg(Duration::from_secs(2)).await.expect("next_msg");
        assert_eq!(msg.subject, "greet");
        assert_eq!(msg.reply, None);
        assert_eq!(msg.payload.as_ref(), payload);
    }
    client.close();
}

#[tokio::test]
async fn async_subscription_delivers_in_order() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = client
        .subscribe("seq", move |msg| {
            tx.send(msg.payload.to_vec()).expect("forward");
        })
        .expect("subscribe");
    let sid = conn.expect_sub("seq").await;

    for i in 0..5u8 {
        conn.send_msg("seq", sid, None, &[i]).await;
    }
    for i in 0..5u8 {
        let seen = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timely")
            .expect("delivery");
        assert_eq!(seen, vec![i]);
    }
    client.close();
}

#[tokio::test]
async fn empty_subject_is_rejected() {
    let server = MockServer::bind().await;
    let (client, _conn) = connect_client(&server, base_options(&server)).await;

    assert!(matches!(
        client.publish("", b"x").expect_err("bad subject"),
        Error::BadSubject
    ));
    assert!(matches!(
        client.subscribe_sync("").expect_err("bad subject"),
        Error::BadSubject
    ));
    client.close();
}

#[tokio::test]
async fn auto_unsubscribe_delivers_exactly_max() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let sub = client.subscribe_sync("capped").expect("subscribe");
    let sid = conn.expect_sub("capped").await;
    sub.auto_unsubscribe(2).expect("auto unsubscribe");
    let (unsub_sid, max) = conn.expect_unsub().await;
    assert_eq!(unsub_sid, sid);
    assert_eq!(max, Some(2));

    for i in 0..3u8 {
        conn.send_msg("capped", sid, None, &[i]).await;
    }
    let first = sub.next_msg(Duration::from_secs(2)).await.expect("first");
    assert_eq!(first.payload.as_ref(), &[0u8][..]);
    let second = sub.next_msg(Duration::from_secs(2)).await.expect("second");
    assert_eq!(second.payload.as_ref(), &[1u8][..]);

    // Reaching the cap removed the subscription from the registry; the
    // third frame was silently dropped.
    assert!(matches!(
        sub.next_msg(Duration::from_millis(100)).await.expect_err("capped"),
        Error::MaxMessages
    ));
    assert!(!sub.is_valid());
    assert_eq!(client.subscription_count(), 0);
    client.close();
}

#[tokio::test]
async fn full_channel_marks_slow_consumer_and_drops() {
    let server = MockServer::bind().await;
    let errors = Arc::new(AtomicUsize::new(0));
    let errors_seen = errors.clone();
    let mut opts = base_options(&server);
    opts.async_error_cb = Some(Arc::new(
        move |_client: &tern_client::Client,
              _sub: Option<&tern_client::Subscription>,
              err: &Error| {
            if matches!(*err, Error::SlowConsumer) {
                errors_seen.fetch_add(1, Ordering::SeqCst);
            }
        },
    ));
    let (client, mut conn) = connect_client(&server, opts).await;

    let (tx, mut rx) = mpsc::channel(1);
    let sub = client.chan_subscribe("firehose", tx).expect("subscribe");
    let sid = conn.expect_sub("firehose").await;

    // Three messages into a one-slot channel nobody is draining: the
    // first is queued, the other two are dropped without blocking the
    // read loop.
    for i in 0..3u8 {
        conn.send_msg("firehose", sid, None, &[i]).await;
    }
    let (flushed, ()) = tokio::join!(client.flush_timeout(Duration::from_secs(2)), async {
        conn.expect_ping().await;
        conn.pong().await;
    });
    flushed.expect("flush");

    assert_eq!(sub.dropped().expect("dropped"), 2);
    // One notification per overflow streak, not per dropped message.
    eventually("slow consumer callback fired once", || {
        errors.load(Ordering::SeqCst) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    let first = rx.recv().await.expect("queued message");
    assert_eq!(first.payload.as_ref(), &[0u8][..]);
    assert!(matches!(client.last_error(), Some(Error::SlowConsumer)));
    client.close();
}

#[tokio::test]
async fn unsubscribed_sid_never_invokes_callback() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_seen = calls.clone();
    let sub = client
        .subscribe("gone", move |_msg| {
            calls_seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");
    let sid = conn.expect_sub("gone").await;

    sub.unsubscribe().expect("unsubscribe");
    let (unsub_sid, max) = conn.expect_unsub().await;
    assert_eq!(unsub_sid, sid);
    assert_eq!(max, None);
    assert_eq!(client.subscription_count(), 0);

    // A frame for the freed sid is dropped; the round trip proves the
    // read loop processed it.
    conn.send_msg("gone", sid, None, b"stale").await;
    let (flushed, ()) = tokio::join!(client.flush_timeout(Duration::from_secs(2)), async {
        conn.expect_ping().await;
        conn.pong().await;
    });
    flushed.expect("flush");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    client.close();
}

#[tokio::test]
async fn queue_group_is_sent_on_the_wire() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_client(&server, base_options(&server)).await;

    let _sub = client
        .queue_subscribe_sync("jobs", "workers")
        .expect("subscribe");
    let line = loop {
        let line = conn.read_line().await;
        if line.starts_with("SUB ") {
            break line;
        }
    };
    let tokens: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(tokens[0], "SUB");
    assert_eq!(tokens[1], "jobs");
    assert_eq!(tokens[2], "workers");
    client.close();
}

#[tokio::test]
async fn max_payload_is_enforced_client_side() {
    let server = MockServer::bind().await;
    let opts = ClientOptions {
        servers: vec![server.url()],
        no_randomize: true,
        ping_interval: Duration::ZERO,
        ..ClientOptions::default()
    };
    let connect = tokio::spawn(opts.connect());
    let mut conn = server.accept().await;
    conn.handshake(r#"{"server_id":"mock","max_payload":16}"#).await;
    let client = connect.await.expect("join").expect("connect");

    client.publish("small", &[0u8; 16]).expect("within limit");
    assert!(matches!(
        client.publish("big", &[0u8; 17]).expect_err("over limit"),
        Error::MaxPayload
    ));
    assert_eq!(client.max_payload(), 16);
    client.close();
}
