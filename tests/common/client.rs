//! Scripted IRC client for driving the bouncer from tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use tether_proto::Message;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    /// Everything received so far, for failure dumps.
    log: Vec<String>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to bouncer");
        let (read, writer) = stream.into_split();
        TestClient {
            reader: BufReader::new(read).lines(),
            writer,
            log: Vec::new(),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to bouncer");
    }

    /// Next line, within the timeout; `None` on EOF.
    pub async fn recv(&mut self) -> Option<Message> {
        let line = timeout(RECV_TIMEOUT, self.reader.next_line())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a line; log: {:#?}", self.log))
            .expect("read from bouncer")?;
        self.log.push(line.clone());
        Some(line.parse().expect("bouncer sent an unparseable line"))
    }

    /// Read until a message satisfies `pred`, skipping everything else.
    pub async fn expect<F>(&mut self, what: &str, pred: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}; log: {:#?}", self.log);
            }
            match self.recv().await {
                Some(msg) if pred(&msg) => return msg,
                Some(_) => continue,
                None => panic!("connection closed waiting for {what}; log: {:#?}", self.log),
            }
        }
    }

    pub async fn expect_cmd(&mut self, command: &str) -> Message {
        self.expect(command, |msg| msg.command == command).await
    }

    /// Read until a NOTICE whose text contains `needle`.
    pub async fn expect_notice_containing(&mut self, needle: &str) -> Message {
        let needle_owned = needle.to_string();
        self.expect(needle, move |msg| {
            msg.command == "NOTICE"
                && msg
                    .params
                    .get(1)
                    .is_some_and(|text| text.contains(&needle_owned))
        })
        .await
    }

    /// Assert nothing arrives for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        match timeout(window, self.reader.next_line()).await {
            Err(_) => {}
            Ok(Ok(Some(line))) => panic!("expected silence, got {line:?}"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => panic!("read error while expecting silence: {e}"),
        }
    }

    /// Assert no message matching `pred` is in the log so far.
    pub fn assert_never_saw<F>(&self, what: &str, pred: F)
    where
        F: Fn(&Message) -> bool,
    {
        for line in &self.log {
            if let Ok(msg) = line.parse::<Message>() {
                if pred(&msg) {
                    panic!("unexpectedly saw {what}: {line:?}");
                }
            }
        }
    }

    /// Plain password registration; waits out the whole welcome burst
    /// (001-005, then the MOTD numerics) so later calls don't race
    /// against the tail of it.
    pub async fn register(&mut self, nick: &str, username: &str, password: &str) {
        self.send(&format!("PASS {password}")).await;
        self.send(&format!("NICK {nick}")).await;
        self.send(&format!("USER {username} 0 * :{nick}")).await;
        self.expect("end of welcome burst", |m| m.command == "376" || m.command == "422")
            .await;
    }

    /// Registration with a capability request before USER.
    pub async fn register_with_caps(
        &mut self,
        nick: &str,
        username: &str,
        password: &str,
        caps: &[&str],
    ) {
        self.send("CAP LS 302").await;
        self.expect("CAP LS", |m| m.command == "CAP" && m.param(1) == Some("LS"))
            .await;
        self.send(&format!("CAP REQ :{}", caps.join(" "))).await;
        self.expect("CAP ACK", |m| m.command == "CAP" && m.param(1) == Some("ACK"))
            .await;
        self.send("CAP END").await;
        self.register(nick, username, password).await;
    }
}
