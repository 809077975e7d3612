//! A minimal fake IRC server playing the upstream role.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use tether_proto::Message;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FakeUpstream {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake");
        let addr = listener.local_addr().expect("local addr");
        FakeUpstream { listener, addr }
    }

    /// Wait for the bouncer to dial in.
    pub async fn accept(&self) -> FakeUpstreamConn {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for the bouncer to connect")
            .expect("accept");
        let (read, writer) = stream.into_split();
        FakeUpstreamConn {
            reader: BufReader::new(read).lines(),
            writer,
            log: Vec::new(),
        }
    }
}

pub struct FakeUpstreamConn {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    log: Vec<String>,
}

impl FakeUpstreamConn {
    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to bouncer");
    }

    pub async fn recv(&mut self) -> Option<Message> {
        let line = timeout(RECV_TIMEOUT, self.reader.next_line())
            .await
            .unwrap_or_else(|_| panic!("timed out; upstream log: {:#?}", self.log))
            .expect("read")?;
        self.log.push(line.clone());
        Some(line.parse().expect("bouncer sent an unparseable line"))
    }

    pub async fn expect<F>(&mut self, what: &str, pred: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        loop {
            match self.recv().await {
                Some(msg) if pred(&msg) => return msg,
                Some(_) => continue,
                None => panic!("bouncer closed; waiting for {what}; log: {:#?}", self.log),
            }
        }
    }

    pub async fn expect_cmd(&mut self, command: &str) -> Message {
        self.expect(command, |msg| msg.command == command).await
    }

    /// Play the server side of registration.
    ///
    /// `caps` is what the fake advertises; requested caps are ACKed
    /// wholesale. Ends after 001/005 with the bouncer registered.
    pub async fn handshake(&mut self, nick: &str, caps: &[&str]) {
        self.expect("CAP LS", |m| m.command == "CAP" && m.param(0) == Some("LS"))
            .await;
        self.send(&format!(":fake.server CAP * LS :{}", caps.join(" ")))
            .await;

        if !caps.is_empty() {
            let req = self
                .expect("CAP REQ", |m| m.command == "CAP" && m.param(0) == Some("REQ"))
                .await;
            let requested = req.param(1).unwrap_or_default().to_string();
            self.send(&format!(":fake.server CAP * ACK :{requested}"))
                .await;
        }

        self.expect("CAP END", |m| m.command == "CAP" && m.param(0) == Some("END"))
            .await;
        self.expect_cmd("NICK").await;
        self.expect_cmd("USER").await;

        self.send(&format!(":fake.server 001 {nick} :Welcome to the fake network"))
            .await;
        self.send(&format!(
            ":fake.server 005 {nick} CASEMAPPING=rfc1459 CHANTYPES=#& PREFIX=(ov)@+ \
             NETWORK=FakeNet :are supported by this server"
        ))
        .await;
    }

    /// Raw lines received so far.
    pub fn log_lines(&self) -> &[String] {
        &self.log
    }

    /// Assert no JOIN for `channel` was received so far.
    pub fn assert_never_joined(&self, channel: &str) {
        for line in &self.log {
            if let Ok(msg) = line.parse::<Message>() {
                if msg.command == "JOIN"
                    && msg
                        .param(0)
                        .is_some_and(|chans| chans.split(',').any(|c| c == channel))
                {
                    panic!("bouncer joined {channel}: {line:?}");
                }
            }
        }
    }
}
