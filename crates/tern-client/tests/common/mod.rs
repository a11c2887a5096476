// Scripted in-process server for driving the client over real sockets.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use tern_client::{Client, ClientOptions};

pub const DEFAULT_INFO: &str = r#"{"server_id":"mock","max_payload":1048576}"#;

pub struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        Self { listener, addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub async fn accept(&self) -> MockConn {
        let (stream, _) = timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("accept timely")
            .expect("accept");
        MockConn::new(stream)
    }

    /// Accept a connection and run the INFO/CONNECT/PING handshake.
    pub async fn accept_and_handshake(&self) -> MockConn {
        let mut conn = self.accept().await;
        conn.handshake(DEFAULT_INFO).await;
        conn
    }
}

pub struct MockConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl MockConn {
    fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    pub async fn send_info(&mut self, json: &str) {
        self.write_raw(format!("INFO {json}\r\n").as_bytes()).await;
    }

    pub async fn pong(&mut self) {
        self.write_raw(b"PONG\r\n").await;
    }

    pub async fn send_err(&mut self, reason: &str) {
        self.write_raw(format!("-ERR '{reason}'\r\n").as_bytes())
            .await;
    }

    pub async fn send_msg(&mut self, subject: &str, sid: u64, reply: Option<&str>, payload: &[u8]) {
        let header = match reply {
            Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
            None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
        };
        let mut frame = header.into_bytes();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.write_raw(&frame).await;
    }

    /// Serve INFO and consume CONNECT + PING, answering PONG. Returns the
    /// raw CONNECT line for assertions.
    pub async fn handshake(&mut self, info: &str) -> String {
        self.send_info(info).await;
        let connect = self.read_line().await;
        assert!(
            connect.starts_with("CONNECT "),
            "expected CONNECT, got {connect:?}"
        );
        let ping = self.read_line().await;
        assert_eq!(ping, "PING", "expected PING after CONNECT");
        self.pong().await;
        connect
    }

    /// Handshake variant for verbose clients: +OK precedes the PONG.
    pub async fn handshake_verbose(&mut self, info: &str) -> String {
        self.send_info(info).await;
        let connect = self.read_line().await;
        assert!(connect.starts_with("CONNECT "));
        let ping = self.read_line().await;
        assert_eq!(ping, "PING");
        self.write_raw(b"+OK\r\nPONG\r\n").await;
        connect
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("line timely")
            .expect("read line");
        assert!(n > 0, "peer closed while a line was expected");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Skip to the next SUB for `subject` and return its sid. Answers any
    /// interleaved PINGs to keep the client's flusher happy.
    pub async fn expect_sub(&mut self, subject: &str) -> u64 {
        loop {
            let line = self.read_line().await;
            if line == "PING" {
                self.pong().await;
                continue;
            }
            if let Some(rest) = line.strip_prefix("SUB ") {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                match tokens.as_slice() {
                    [subj, sid] if *subj == subject => return sid.parse().expect("sid"),
                    [subj, _queue, sid] if *subj == subject => return sid.parse().expect("sid"),
                    _ => continue,
                }
            }
        }
    }

    /// Skip to the next SUB whose subject starts with `prefix`; returns
    /// (subject, sid).
    pub async fn expect_sub_prefix(&mut self, prefix: &str) -> (String, u64) {
        loop {
            let line = self.read_line().await;
            if line == "PING" {
                self.pong().await;
                continue;
            }
            if let Some(rest) = line.strip_prefix("SUB ") {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                if let [subj, sid] = tokens.as_slice()
                    && subj.starts_with(prefix)
                {
                    return ((*subj).to_string(), sid.parse().expect("sid"));
                }
            }
        }
    }

    /// Skip to the next UNSUB; returns (sid, max).
    pub async fn expect_unsub(&mut self) -> (u64, Option<u64>) {
        loop {
            let line = self.read_line().await;
            if line == "PING" {
                self.pong().await;
                continue;
            }
            if let Some(rest) = line.strip_prefix("UNSUB ") {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                return match tokens.as_slice() {
                    [sid] => (sid.parse().expect("sid"), None),
                    [sid, max] => (
                        sid.parse().expect("sid"),
                        Some(max.parse().expect("max")),
                    ),
                    _ => panic!("bad UNSUB line: {line:?}"),
                };
            }
        }
    }

    /// Skip to the next PUB frame; returns (subject, reply, payload).
    pub async fn read_pub(&mut self) -> (String, Option<String>, Vec<u8>) {
        loop {
            let line = self.read_line().await;
            if line == "PING" {
                self.pong().await;
                continue;
            }
            if let Some(rest) = line.strip_prefix("PUB ") {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                let (subject, reply, size) = match tokens.as_slice() {
                    [subj, size] => ((*subj).to_string(), None, size.parse().expect("size")),
                    [subj, reply, size] => (
                        (*subj).to_string(),
                        Some((*reply).to_string()),
                        size.parse().expect("size"),
                    ),
                    _ => panic!("bad PUB line: {line:?}"),
                };
                let mut payload = vec![0u8; size + 2];
                timeout(Duration::from_secs(5), self.reader.read_exact(&mut payload))
                    .await
                    .expect("payload timely")
                    .expect("payload");
                payload.truncate(size);
                return (subject, reply, payload);
            }
        }
    }

    /// Skip to the next standalone PING without answering it.
    pub async fn expect_ping(&mut self) {
        loop {
            if self.read_line().await == "PING" {
                return;
            }
        }
    }
}

pub fn base_options(server: &MockServer) -> ClientOptions {
    ClientOptions {
        servers: vec![server.url()],
        no_randomize: true,
        ping_interval: Duration::ZERO,
        ..ClientOptions::default()
    }
}

/// Drive `opts.connect()` against the mock handshake concurrently.
pub async fn connect_client(server: &MockServer, opts: ClientOptions) -> (Client, MockConn) {
    let connect = tokio::spawn(opts.connect());
    let conn = server.accept_and_handshake().await;
    let client = timeout(Duration::from_secs(5), connect)
        .await
        .expect("connect timely")
        .expect("join")
        .expect("connect");
    (client, conn)
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
