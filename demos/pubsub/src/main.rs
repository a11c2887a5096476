//! # Purpose
//! Demonstrate end-to-end publish/subscribe and request/reply against an
//! in-process server, using only the public client API.
//!
//! # Flow summary
//! 1. Start a minimal in-process server on a random local port.
//! 2. Connect a client and a sync subscription; publish and receive.
//! 3. Run a typed (JSON) subscription through the codec façade.
//! 4. Answer a request from a responder subscription.
//!
//! # Notes
//! - The embedded server speaks just enough of the wire protocol for the
//!   demo: INFO/CONNECT/PING/PONG, SUB/UNSUB bookkeeping, and exact-match
//!   PUB fan-out back to the same connection.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use tern_client::ClientOptions;
use tern_codec::{Handler, TypedClient};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    name: String,
    count: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = start_embedded_server().await?;
    info!(%addr, "embedded server listening");

    let opts = ClientOptions {
        servers: vec![format!("nats://{addr}")],
        name: "pubsub-demo".to_string(),
        ping_interval: Duration::ZERO,
        ..ClientOptions::default()
    };
    let client = opts.connect().await.context("connect")?;
    info!(url = ?client.connected_url(), "connected");

    // Raw bytes round trip through a sync subscription.
    let sub = client.subscribe_sync("demo.raw").context("subscribe")?;
    client.flush_timeout(Duration::from_secs(2)).await?;
    client.publish("demo.raw", b"hello over the wire")?;
    let msg = sub.next_msg(Duration::from_secs(2)).await?;
    info!(
        subject = %msg.subject,
        payload = %String::from_utf8_lossy(&msg.payload),
        "raw round trip"
    );
    sub.unsubscribe()?;

    // Typed round trip through the JSON façade.
    let typed = TypedClient::json(client.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let typed_sub = typed.subscribe_with(
        "demo.typed",
        Handler::Payload(Box::new(move |greeting: Greeting| {
            let _ = tx.send(greeting);
        })),
    )?;
    client.flush_timeout(Duration::from_secs(2)).await?;
    typed.publish(
        "demo.typed",
        &Greeting {
            name: "tern".to_string(),
            count: 1,
        },
    )?;
    let greeting = rx.recv().await.context("typed delivery")?;
    info!(?greeting, "typed round trip");
    typed_sub.unsubscribe()?;

    // Request/reply: a responder echoes the payload back to the reply
    // subject.
    let responder = {
        let client = client.clone();
        client.clone().subscribe("demo.echo", move |msg| {
            if let Some(reply) = msg.reply.as_deref() {
                let _ = client.publish(reply, &msg.payload);
            }
        })?
    };
    client.flush_timeout(Duration::from_secs(2)).await?;
    let reply = client
        .request("demo.echo", b"anyone there?", Duration::from_secs(2))
        .await?;
    info!(
        payload = %String::from_utf8_lossy(&reply.payload),
        "request answered"
    );
    responder.unsubscribe()?;

    client.close();
    info!("done");
    Ok(())
}

/// Accept one client and route frames back at it.
async fn start_embedded_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let _ = serve_connection(stream).await;
        }
    });
    Ok(addr)
}

async fn serve_connection(stream: TcpStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    write
        .write_all(b"INFO {\"server_id\":\"embedded\",\"max_payload\":1048576}\r\n")
        .await?;

    let mut subs: HashMap<String, Vec<u64>> = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with("CONNECT ") {
            continue;
        }
        if line == "PING" {
            write.write_all(b"PONG\r\n").await?;
            continue;
        }
        if let Some(rest) = line.strip_prefix("SUB ") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            if let [subject, sid] | [subject, _, sid] = tokens.as_slice() {
                subs.entry((*subject).to_string())
                    .or_default()
                    .push(sid.parse().unwrap_or(0));
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("UNSUB ") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            // A max-messages argument arms auto-unsubscribe; only a bare
            // UNSUB removes interest outright.
            if let [sid] = tokens.as_slice()
                && let Ok(sid) = sid.parse::<u64>()
            {
                for sids in subs.values_mut() {
                    sids.retain(|&known| known != sid);
                }
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("PUB ") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let (subject, reply, size) = match tokens.as_slice() {
                [subject, size] => (*subject, None, size.parse::<usize>()?),
                [subject, reply, size] => (*subject, Some(*reply), size.parse::<usize>()?),
                _ => anyhow::bail!("bad PUB line: {line:?}"),
            };
            let mut payload = vec![0u8; size + 2];
            reader.read_exact(&mut payload).await?;
            payload.truncate(size);
            if let Some(sids) = subs.get(subject) {
                for sid in sids.clone() {
                    let header = match reply {
                        Some(reply) => {
                            format!("MSG {subject} {sid} {reply} {}\r\n", payload.len())
                        }
                        None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
                    };
                    write.write_all(header.as_bytes()).await?;
                    write.write_all(&payload).await?;
                    write.write_all(b"\r\n").await?;
                }
            }
        }
    }
}
