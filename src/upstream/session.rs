//! The upstream connection state machine.
//!
//! One invocation of [`run`] owns the (user, network) pair for its whole
//! lifetime: dialing, registration (CAP → SASL → NICK/USER → 001),
//! steady-state relay, and the reconnect loop with backoff. The socket
//! never leaves this task; the hub talks through the command inbox.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_proto::{sasl, Isupport, Message, ProtocolError, MAX_LINE_LEN};

use crate::db::{Channel, Network, Sasl};
use crate::error::MalformedCounter;
use crate::hub::HubEvent;
use crate::network::tls::upstream_connector;
use crate::network::{IdentRegistry, Transport};
use crate::upstream::backoff::{Backoff, STABLE_CONNECTION};
use crate::upstream::{UpstreamCommand, UpstreamEvent, UpstreamPhase};

/// Capabilities the bouncer knows how to use; the request set is the
/// intersection of this list with the server's advertisement.
pub const REQUESTED_CAPS: &[&str] = &[
    "sasl",
    "message-tags",
    "server-time",
    "batch",
    "labeled-response",
    "cap-notify",
    "multi-prefix",
    "away-notify",
    "account-notify",
    "extended-join",
    "chghost",
    "setname",
    "echo-message",
];

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Fallback ping interval; servers rarely advertise one.
const PING_INTERVAL: Duration = Duration::from_secs(5 * 60);
const PING_CHECK_PERIOD: Duration = Duration::from_secs(15);

pub(super) struct SessionConfig {
    pub network: Network,
    pub channels: Vec<Channel>,
    /// Bouncer account name, reported to ident queries.
    pub username: String,
}

enum Outcome {
    /// Stop was requested; do not reconnect.
    Stopped,
    /// Reload changed connection identity; reconnect without backoff.
    Reconnect,
    /// The connection failed; reconnect after backoff.
    Failed(String),
}

/// Task entry point: the reconnect loop.
pub(super) async fn run(
    mut cfg: SessionConfig,
    network_id: i64,
    hub_tx: mpsc::Sender<HubEvent>,
    ident: Option<Arc<IdentRegistry>>,
    cancel: CancellationToken,
    mut rx: mpsc::Receiver<UpstreamCommand>,
) {
    let mut backoff = Backoff::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Stopped,
            outcome = connection(&mut cfg, network_id, &hub_tx, ident.as_ref(), &cancel, &mut rx) => outcome,
        };

        match outcome {
            Outcome::Stopped => break,
            Outcome::Reconnect => {
                info!(network_id, "reconnecting after reload");
                continue;
            }
            Outcome::Failed(error) => {
                let failure = crate::error::SessionError::UpstreamDisconnected(error.clone());
                warn!(network_id, error = %failure, "upstream connection lost");
                emit(
                    &hub_tx,
                    network_id,
                    UpstreamEvent::StateChange {
                        phase: UpstreamPhase::Disconnected,
                        error: Some(error),
                    },
                )
                .await;

                if started.elapsed() >= STABLE_CONNECTION {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                debug!(network_id, delay_ms = delay.as_millis() as u64, "backing off");
                if wait_backoff(delay, &cancel, &mut rx, &mut cfg).await {
                    break;
                }
            }
        }
    }

    emit(
        &hub_tx,
        network_id,
        UpstreamEvent::StateChange {
            phase: UpstreamPhase::Disconnected,
            error: None,
        },
    )
    .await;
}

/// Sleep out the backoff delay while still honoring Stop and Reload.
/// Returns true when the session should stop for good.
async fn wait_backoff(
    delay: Duration,
    cancel: &CancellationToken,
    rx: &mut mpsc::Receiver<UpstreamCommand>,
    cfg: &mut SessionConfig,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = rx.recv() => match cmd {
                None | Some(UpstreamCommand::Stop) => return true,
                Some(UpstreamCommand::Reload { network, channels }) => {
                    cfg.network = network;
                    cfg.channels = channels;
                }
                // Nothing to write to while disconnected.
                Some(UpstreamCommand::Send(_)) => {}
            },
        }
    }
}

async fn emit(hub_tx: &mpsc::Sender<HubEvent>, network_id: i64, event: UpstreamEvent) {
    let _ = hub_tx.send(HubEvent::Upstream { network_id, event }).await;
}

/// Removes the ident entry when the connection goes away.
struct IdentGuard {
    registry: Option<Arc<IdentRegistry>>,
    local_port: u16,
    remote_port: u16,
}

impl Drop for IdentGuard {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            registry.remove(self.local_port, self.remote_port);
        }
    }
}

/// One full connection attempt: dial, register, steady state.
async fn connection(
    cfg: &mut SessionConfig,
    network_id: i64,
    hub_tx: &mpsc::Sender<HubEvent>,
    ident: Option<&Arc<IdentRegistry>>,
    cancel: &CancellationToken,
    rx: &mut mpsc::Receiver<UpstreamCommand>,
) -> Outcome {
    emit(
        hub_tx,
        network_id,
        UpstreamEvent::StateChange {
            phase: UpstreamPhase::Dialing,
            error: None,
        },
    )
    .await;

    let dialed = match timeout(DIAL_TIMEOUT, dial(&cfg.network)).await {
        Ok(Ok(dialed)) => dialed,
        Ok(Err(e)) => return Outcome::Failed(e),
        Err(_) => return Outcome::Failed(format!("dialing {} timed out", cfg.network.addr)),
    };
    let (transport, local_port, remote_port) = dialed;

    let _ident_guard = IdentGuard {
        registry: ident.map(|r| {
            r.insert(local_port, remote_port, &cfg.username);
            Arc::clone(r)
        }),
        local_port,
        remote_port,
    };

    emit(
        hub_tx,
        network_id,
        UpstreamEvent::StateChange {
            phase: UpstreamPhase::Registering,
            error: None,
        },
    )
    .await;

    let mut session = Session {
        transport,
        network_id,
        hub_tx: hub_tx.clone(),
        current_nick: cfg.network.nick.clone(),
        isupport: Isupport::default(),
        caps: BTreeSet::new(),
        joined: HashSet::new(),
        malformed: MalformedCounter::default(),
        last_read: Instant::now(),
        ping_pending: false,
    };

    match timeout(REGISTRATION_TIMEOUT, session.register(cfg)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Outcome::Failed(e),
        Err(_) => return Outcome::Failed("registration timed out".to_string()),
    }

    info!(network_id, nick = %session.current_nick, addr = %cfg.network.addr, "upstream registered");
    emit(
        hub_tx,
        network_id,
        UpstreamEvent::StateChange {
            phase: UpstreamPhase::Connected,
            error: None,
        },
    )
    .await;
    emit(
        hub_tx,
        network_id,
        UpstreamEvent::Registered {
            nick: session.current_nick.clone(),
            caps: session.caps.clone(),
        },
    )
    .await;

    // Post-registration commands, verbatim.
    for raw in &cfg.network.connect_commands {
        match raw.parse::<Message>() {
            Ok(msg) => {
                if let Err(e) = session.transport.write_message(&msg).await {
                    return Outcome::Failed(e.to_string());
                }
            }
            Err(e) => warn!(network_id, command = %raw, error = %e, "invalid connect command"),
        }
    }

    // Auto-join every persisted channel that is not detached.
    let attached: Vec<&Channel> = cfg.channels.iter().filter(|c| !c.detached).collect();
    for msg in batch_join(&attached) {
        if let Err(e) = session.transport.write_message(&msg).await {
            return Outcome::Failed(e.to_string());
        }
    }
    for channel in &attached {
        session
            .joined
            .insert(session.isupport.casemapping.fold(&channel.name));
    }

    session.steady(cfg, cancel, rx).await
}

async fn dial(network: &Network) -> Result<(Transport, u16, u16), String> {
    let (host, port, use_tls) = parse_upstream_addr(&network.addr)?;

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| format!("failed to connect to {}: {e}", network.addr))?;
    let local_port = stream
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| e.to_string())?;

    if !use_tls {
        return Ok((Transport::tcp(stream), local_port, port));
    }

    let client_cert = match &network.sasl {
        Some(Sasl::External { cert, key }) => Some((cert.clone(), key.clone())),
        _ => None,
    };
    let connector = upstream_connector(client_cert).map_err(|e| e.to_string())?;
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| format!("invalid server name {host:?}"))?;
    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| format!("TLS handshake with {} failed: {e}", network.addr))?;

    Ok((Transport::client_tls(tls_stream), local_port, port))
}

/// Parse a network address: `[scheme://]host[:port]`, TLS implied unless
/// the scheme says otherwise.
pub(crate) fn parse_upstream_addr(addr: &str) -> Result<(String, u16, bool), String> {
    let (scheme, rest) = addr.split_once("://").unwrap_or(("ircs", addr));
    let (use_tls, default_port) = match scheme {
        "ircs" => (true, 6697),
        "irc+insecure" => (false, 6667),
        other => return Err(format!("unsupported upstream scheme {other:?}")),
    };

    let (host, port) = if let Some(v6_end) = rest.rfind(']') {
        let host = rest[..=v6_end].trim_matches(['[', ']']).to_string();
        match rest[v6_end + 1..].strip_prefix(':') {
            Some(port) => (host, port.parse().map_err(|_| "invalid port".to_string())?),
            None => (host, default_port),
        }
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().map_err(|_| "invalid port".to_string())?,
            ),
            None => (rest.to_string(), default_port),
        }
    };

    if host.is_empty() {
        return Err(format!("missing host in {addr:?}"));
    }
    Ok((host, port, use_tls))
}

/// Pack JOINs for the given channels into as few lines as fit the wire
/// budget. Channels with keys come first so key positions line up.
fn batch_join(channels: &[&Channel]) -> Vec<Message> {
    let mut ordered: Vec<&&Channel> = channels.iter().collect();
    ordered.sort_by_key(|c| c.key.is_none());

    let mut messages = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut keys: Vec<String> = Vec::new();
    let mut flush = |names: &mut Vec<String>, keys: &mut Vec<String>| {
        if names.is_empty() {
            return;
        }
        let mut params = vec![names.join(",")];
        if !keys.is_empty() {
            params.push(keys.join(","));
        }
        messages.push(Message::new("JOIN", params));
        names.clear();
        keys.clear();
    };

    for channel in ordered {
        let extra_key = channel.key.as_deref().map(|k| k.len() + 1).unwrap_or(0);
        // "JOIN " + names + "," + name + " " + keys + CRLF
        let projected = 5
            + names.iter().map(|n| n.len() + 1).sum::<usize>()
            + channel.name.len()
            + keys.iter().map(|k| k.len() + 1).sum::<usize>()
            + extra_key
            + 2;
        if !names.is_empty() && projected > MAX_LINE_LEN {
            flush(&mut names, &mut keys);
        }
        names.push(channel.name.clone());
        if let Some(key) = &channel.key {
            keys.push(key.clone());
        }
    }
    flush(&mut names, &mut keys);
    messages
}

/// Whether an edited network record requires a reconnect.
fn identity_changed(old: &Network, new: &Network) -> bool {
    old.addr != new.addr
        || old.nick != new.nick
        || old.username != new.username
        || old.realname != new.realname
        || old.pass != new.pass
        || old.sasl != new.sasl
}

struct Session {
    transport: Transport,
    network_id: i64,
    hub_tx: mpsc::Sender<HubEvent>,
    current_nick: String,
    isupport: Isupport,
    caps: BTreeSet<String>,
    /// Folded names of channels we are joined to upstream.
    joined: HashSet<String>,
    malformed: MalformedCounter,
    last_read: Instant,
    ping_pending: bool,
}

impl Session {
    async fn emit(&self, event: UpstreamEvent) {
        emit(&self.hub_tx, self.network_id, event).await;
    }

    async fn write(&mut self, msg: Message) -> Result<(), String> {
        self.transport
            .write_message(&msg)
            .await
            .map_err(|e| e.to_string())
    }

    async fn read(&mut self) -> Result<Option<Message>, String> {
        loop {
            match self.transport.read_message().await {
                Ok(msg) => return Ok(msg),
                Err(ProtocolError::Io(e)) => return Err(e.to_string()),
                Err(e) => {
                    warn!(network_id = self.network_id, error = %e, "dropping malformed line");
                    if self.malformed.record(Instant::now()) {
                        return Err("too many malformed lines".to_string());
                    }
                }
            }
        }
    }

    /// Drive registration to numeric 001.
    async fn register(&mut self, cfg: &SessionConfig) -> Result<(), String> {
        self.write(Message::new("CAP", vec!["LS".into(), "302".into()]))
            .await?;

        let mut advertised: HashMap<String, Option<String>> = HashMap::new();
        let mut registration_sent = false;

        loop {
            let msg = self
                .read()
                .await?
                .ok_or_else(|| "connection closed during registration".to_string())?;

            match msg.command.as_str() {
                "PING" => {
                    let token = msg.param(0).unwrap_or_default().to_string();
                    self.write(Message::pong(token)).await?;
                }
                "CAP" => {
                    match msg.param(1) {
                        Some("LS") => {
                            let more = msg.param(2) == Some("*");
                            let list = if more { msg.param(3) } else { msg.param(2) };
                            for cap in list.unwrap_or_default().split_whitespace() {
                                let (name, value) = match cap.split_once('=') {
                                    Some((name, value)) => (name, Some(value.to_string())),
                                    None => (cap, None),
                                };
                                advertised.insert(name.to_string(), value);
                            }
                            if !more {
                                let request = requested_caps(&advertised);
                                if request.is_empty() {
                                    self.finish_registration(cfg, &mut registration_sent)
                                        .await?;
                                } else {
                                    self.write(Message::new(
                                        "CAP",
                                        vec!["REQ".into(), request.join(" ")],
                                    ))
                                    .await?;
                                }
                            }
                        }
                        Some("ACK") => {
                            for cap in msg.param(2).unwrap_or_default().split_whitespace() {
                                self.caps.insert(cap.to_string());
                            }
                            if self.caps.contains("sasl") && cfg.network.sasl.is_some() {
                                self.authenticate(cfg).await?;
                            }
                            self.finish_registration(cfg, &mut registration_sent).await?;
                        }
                        Some("NAK") => {
                            self.finish_registration(cfg, &mut registration_sent).await?;
                        }
                        _ => {}
                    }
                }
                "001" => {
                    if let Some(nick) = msg.param(0) {
                        if !nick.is_empty() && nick != "*" {
                            self.current_nick = nick.to_string();
                        }
                    }
                    return Ok(());
                }
                "432" | "433" => {
                    // Desired nick rejected or taken; degrade and retry.
                    self.current_nick.push('_');
                    let nick = self.current_nick.clone();
                    self.write(Message::nick(nick)).await?;
                }
                "ERROR" => {
                    return Err(format!(
                        "server error: {}",
                        msg.param(0).unwrap_or("unknown")
                    ));
                }
                _ => {}
            }
        }
    }

    async fn finish_registration(
        &mut self,
        cfg: &SessionConfig,
        registration_sent: &mut bool,
    ) -> Result<(), String> {
        if *registration_sent {
            return Ok(());
        }
        *registration_sent = true;

        self.write(Message::new("CAP", vec!["END".into()])).await?;
        if let Some(pass) = &cfg.network.pass {
            self.write(Message::new("PASS", vec![pass.clone()])).await?;
        }
        let nick = self.current_nick.clone();
        self.write(Message::nick(nick.clone())).await?;
        let username = cfg.network.username.clone().unwrap_or_else(|| nick.clone());
        let realname = cfg.network.realname.clone().unwrap_or_else(|| nick.clone());
        self.write(Message::new(
            "USER",
            vec![username, "0".into(), "*".into(), realname],
        ))
        .await?;
        Ok(())
    }

    /// Run the SASL exchange after the `sasl` cap was acknowledged.
    async fn authenticate(&mut self, cfg: &SessionConfig) -> Result<(), String> {
        let mechanism = match &cfg.network.sasl {
            Some(sasl) => sasl.mechanism(),
            None => return Ok(()),
        };
        if mechanism == "EXTERNAL" && !matches!(self.transport, Transport::ClientTls(_)) {
            return Err("SASL EXTERNAL requires a TLS connection".to_string());
        }

        self.write(Message::new("AUTHENTICATE", vec![mechanism.into()]))
            .await?;
        self.await_authenticate_continuation().await?;

        match &cfg.network.sasl {
            Some(Sasl::Plain { username, password }) => {
                let encoded = sasl::encode_plain(username, password);
                for chunk in sasl::authenticate_chunks(&encoded) {
                    self.write(Message::new("AUTHENTICATE", vec![chunk])).await?;
                }
            }
            Some(Sasl::External { .. }) => {
                self.write(Message::new("AUTHENTICATE", vec!["+".into()]))
                    .await?;
            }
            None => {}
        }

        // Await the verdict.
        loop {
            let msg = self
                .read()
                .await?
                .ok_or_else(|| "connection closed during SASL".to_string())?;
            match msg.command.as_str() {
                "903" => return Ok(()),
                "900" => continue,
                "902" | "904" | "905" | "906" | "907" | "908" => {
                    return Err(format!(
                        "SASL authentication failed ({})",
                        msg.command
                    ));
                }
                "PING" => {
                    let token = msg.param(0).unwrap_or_default().to_string();
                    self.write(Message::pong(token)).await?;
                }
                "ERROR" => {
                    return Err(format!(
                        "server error: {}",
                        msg.param(0).unwrap_or("unknown")
                    ));
                }
                _ => {}
            }
        }
    }

    async fn await_authenticate_continuation(&mut self) -> Result<(), String> {
        loop {
            let msg = self
                .read()
                .await?
                .ok_or_else(|| "connection closed during SASL".to_string())?;
            match msg.command.as_str() {
                "AUTHENTICATE" if msg.param(0) == Some("+") => return Ok(()),
                "902" | "904" | "905" | "906" | "907" | "908" => {
                    return Err(format!("SASL authentication failed ({})", msg.command));
                }
                "PING" => {
                    let token = msg.param(0).unwrap_or_default().to_string();
                    self.write(Message::pong(token)).await?;
                }
                "ERROR" => {
                    return Err(format!(
                        "server error: {}",
                        msg.param(0).unwrap_or("unknown")
                    ));
                }
                _ => {}
            }
        }
    }

    /// Post-registration relay loop.
    async fn steady(
        &mut self,
        cfg: &mut SessionConfig,
        cancel: &CancellationToken,
        rx: &mut mpsc::Receiver<UpstreamCommand>,
    ) -> Outcome {
        let mut check = interval(PING_CHECK_PERIOD);
        check.tick().await; // the first tick fires immediately
        self.last_read = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.emit(UpstreamEvent::StateChange {
                        phase: UpstreamPhase::Closing,
                        error: None,
                    })
                    .await;
                    let _ = self.write(Message::quit("shutting down")).await;
                    return Outcome::Stopped;
                }

                cmd = rx.recv() => match cmd {
                    None => return Outcome::Stopped,
                    Some(UpstreamCommand::Stop) => {
                        let _ = self.write(Message::quit("network removed")).await;
                        return Outcome::Stopped;
                    }
                    Some(UpstreamCommand::Send(msg)) => {
                        if let Err(e) = self.write(msg).await {
                            return Outcome::Failed(e);
                        }
                    }
                    Some(UpstreamCommand::Reload { network, channels }) => {
                        if identity_changed(&cfg.network, &network) {
                            cfg.network = network;
                            cfg.channels = channels;
                            let _ = self.write(Message::quit("reconnecting")).await;
                            return Outcome::Reconnect;
                        }
                        if let Err(e) = self.apply_channel_diff(&channels).await {
                            return Outcome::Failed(e);
                        }
                        cfg.network = network;
                        cfg.channels = channels;
                    }
                },

                result = self.transport.read_message() => match result {
                    Ok(Some(msg)) => {
                        self.last_read = Instant::now();
                        self.ping_pending = false;
                        if let Err(e) = self.handle_message(msg).await {
                            return Outcome::Failed(e);
                        }
                    }
                    Ok(None) => return Outcome::Failed("connection closed".to_string()),
                    Err(ProtocolError::Io(e)) => return Outcome::Failed(e.to_string()),
                    Err(e) => {
                        warn!(network_id = self.network_id, error = %e, "dropping malformed line");
                        if self.malformed.record(Instant::now()) {
                            return Outcome::Failed("too many malformed lines".to_string());
                        }
                    }
                },

                _ = check.tick() => {
                    let idle = self.last_read.elapsed();
                    if idle >= PING_INTERVAL * 2 {
                        return Outcome::Failed(format!(
                            "ping timeout ({}s idle)", idle.as_secs()
                        ));
                    }
                    if idle >= PING_INTERVAL && !self.ping_pending {
                        let token = cfg.network.addr.clone();
                        if let Err(e) = self.write(Message::ping(token)).await {
                            return Outcome::Failed(e);
                        }
                        self.ping_pending = true;
                    }
                }
            }
        }
    }

    /// JOIN channels that became wanted, PART channels that stopped
    /// being wanted, per an edited channel set.
    async fn apply_channel_diff(&mut self, channels: &[Channel]) -> Result<(), String> {
        let casemap = self.isupport.casemapping;
        let fold = move |name: &str| casemap.fold(name);
        let wanted: HashMap<String, &Channel> = channels
            .iter()
            .filter(|c| !c.detached)
            .map(|c| (fold(&c.name), c))
            .collect();

        for (folded, channel) in &wanted {
            if !self.joined.contains(folded) {
                self.write(Message::join(channel.name.clone(), channel.key.clone()))
                    .await?;
            }
        }
        let parted: Vec<String> = self
            .joined
            .iter()
            .filter(|folded| !wanted.contains_key(*folded))
            .cloned()
            .collect();
        for folded in parted {
            self.write(Message::part(folded, None)).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, mut msg: Message) -> Result<(), String> {
        let casemap = self.isupport.casemapping;
        let fold = move |s: &str| casemap.fold(s);
        let own_nick = fold(&self.current_nick);
        let from_self = msg
            .source_name()
            .map(|name| fold(name) == own_nick)
            .unwrap_or(false);

        match msg.command.as_str() {
            // Answered locally, never reaches the hub.
            "PING" => {
                let token = msg.param(0).unwrap_or_default().to_string();
                self.write(Message::pong(token)).await?;
                return Ok(());
            }
            "PONG" => return Ok(()),
            "ERROR" => {
                return Err(format!(
                    "server error: {}",
                    msg.param(0).unwrap_or("unknown")
                ));
            }
            // The downstream welcome burst is synthesized by the
            // bouncer; the upstream's own is consumed here.
            "001" | "002" | "003" | "004" | "375" | "372" | "376" | "422" => return Ok(()),
            "005" => {
                let params = &msg.params;
                if params.len() > 2 {
                    self.isupport.ingest(&params[1..params.len() - 1]);
                    self.emit(UpstreamEvent::Isupport(Box::new(self.isupport.clone())))
                        .await;
                }
                return Ok(());
            }
            "AUTHENTICATE" => return Ok(()),
            "CAP" => {
                // cap-notify: track additions and removals quietly.
                match msg.param(1) {
                    Some("NEW") => {
                        let known: HashMap<String, Option<String>> = msg
                            .param(2)
                            .unwrap_or_default()
                            .split_whitespace()
                            .map(|c| {
                                let name = c.split('=').next().unwrap_or(c);
                                (name.to_string(), None)
                            })
                            .collect();
                        let request = requested_caps(&known);
                        if !request.is_empty() {
                            self.write(Message::new("CAP", vec!["REQ".into(), request.join(" ")]))
                                .await?;
                        }
                    }
                    Some("DEL") => {
                        for cap in msg.param(2).unwrap_or_default().split_whitespace() {
                            self.caps.remove(cap);
                        }
                    }
                    Some("ACK") => {
                        for cap in msg.param(2).unwrap_or_default().split_whitespace() {
                            self.caps.insert(cap.to_string());
                        }
                    }
                    _ => {}
                }
                return Ok(());
            }
            "NICK" if from_self => {
                if let Some(new_nick) = msg.param(0) {
                    self.current_nick = new_nick.to_string();
                    self.emit(UpstreamEvent::NickChanged(new_nick.to_string()))
                        .await;
                }
            }
            "JOIN" if from_self => {
                if let Some(channel) = msg.param(0) {
                    self.joined.insert(fold(channel));
                }
            }
            "PART" if from_self => {
                if let Some(channel) = msg.param(0) {
                    self.joined.remove(&fold(channel));
                }
            }
            "KICK" => {
                if let (Some(channel), Some(victim)) = (msg.param(0), msg.param(1)) {
                    if fold(victim) == own_nick {
                        self.joined.remove(&fold(channel));
                    }
                }
            }
            _ => {}
        }

        // One timestamp per inbound message, shared by every fan-out
        // copy downstream.
        if msg.server_time().is_none() {
            let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            msg.tags.insert(
                0,
                tether_proto::Tag {
                    key: "time".to_string(),
                    value: Some(stamp),
                },
            );
        }
        self.emit(UpstreamEvent::Message(msg)).await;
        Ok(())
    }
}

/// The intersection of our implementer set with an advertisement.
fn requested_caps(advertised: &HashMap<String, Option<String>>) -> Vec<&'static str> {
    REQUESTED_CAPS
        .iter()
        .copied()
        .filter(|cap| advertised.contains_key(*cap))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str, key: Option<&str>) -> Channel {
        Channel {
            name: name.to_string(),
            key: key.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn parse_addr_schemes() {
        assert_eq!(
            parse_upstream_addr("irc.libera.chat:6697").unwrap(),
            ("irc.libera.chat".to_string(), 6697, true)
        );
        assert_eq!(
            parse_upstream_addr("ircs://irc.libera.chat").unwrap(),
            ("irc.libera.chat".to_string(), 6697, true)
        );
        assert_eq!(
            parse_upstream_addr("irc+insecure://irc.example.org").unwrap(),
            ("irc.example.org".to_string(), 6667, false)
        );
        assert_eq!(
            parse_upstream_addr("ircs://[2001:db8::1]:7000").unwrap(),
            ("2001:db8::1".to_string(), 7000, true)
        );
        assert!(parse_upstream_addr("http://x").is_err());
        assert!(parse_upstream_addr("ircs://").is_err());
    }

    #[test]
    fn requested_caps_is_an_intersection() {
        let mut advertised = HashMap::new();
        advertised.insert("sasl".to_string(), Some("PLAIN,EXTERNAL".to_string()));
        advertised.insert("server-time".to_string(), None);
        advertised.insert("draft/chathistory".to_string(), None);
        let request = requested_caps(&advertised);
        assert!(request.contains(&"sasl"));
        assert!(request.contains(&"server-time"));
        assert!(!request.iter().any(|c| *c == "draft/chathistory"));
        assert!(!request.contains(&"batch"));
    }

    #[test]
    fn batch_join_single_line() {
        let a = channel("#a", None);
        let b = channel("#b", Some("k"));
        let msgs = batch_join(&[&a, &b]);
        assert_eq!(msgs.len(), 1);
        // Keyed channel first so the key position matches.
        assert_eq!(msgs[0].to_string(), "JOIN #b,#a k");
    }

    #[test]
    fn batch_join_splits_on_line_budget() {
        let channels: Vec<Channel> = (0..40)
            .map(|i| channel(&format!("#channel-with-a-long-name-{i:03}"), None))
            .collect();
        let refs: Vec<&Channel> = channels.iter().collect();
        let msgs = batch_join(&refs);
        assert!(msgs.len() > 1);
        for msg in &msgs {
            assert!(msg.to_string().len() + 2 <= MAX_LINE_LEN);
        }
        let joined: usize = msgs
            .iter()
            .map(|m| m.param(0).unwrap().split(',').count())
            .sum();
        assert_eq!(joined, 40);
    }

    #[test]
    fn identity_change_detection() {
        let base = Network {
            addr: "ircs://irc.libera.chat".into(),
            nick: "ada".into(),
            ..Default::default()
        };
        let mut same = base.clone();
        same.connect_commands = vec!["MODE ada +i".into()];
        assert!(!identity_changed(&base, &same));

        let mut renicked = base.clone();
        renicked.nick = "grace".into();
        assert!(identity_changed(&base, &renicked));

        let mut resasl = base.clone();
        resasl.sasl = Some(Sasl::Plain {
            username: "ada".into(),
            password: "pw".into(),
        });
        assert!(identity_changed(&base, &resasl));
    }
}
