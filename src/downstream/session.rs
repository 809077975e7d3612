//! The downstream client session.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tether_proto::{sasl, Message, ProtocolError, Source};

use crate::config::Config;
use crate::db::User;
use crate::downstream::render;
use crate::downstream::OFFERED_CAPS;
use crate::error::{MalformedCounter, SessionError};
use crate::hub::{ClientCommand, Delivery, DownstreamInfo, HubHandle, Scope, QUEUE_DEPTH};
use crate::network::Transport;
use crate::server::ServerHandle;
use crate::service::SERVICE_NICK;

/// Entry point: drive one accepted client connection to completion.
pub async fn run(
    server: ServerHandle,
    id: u64,
    mut transport: Transport,
    peer: String,
    cancel: CancellationToken,
) {
    let registered = tokio::select! {
        _ = cancel.cancelled() => return,
        result = register(&server, &mut transport, &peer) => result,
    };

    let registered = match registered {
        Ok(Some(registered)) => registered,
        Ok(None) => {
            debug!(%peer, "client went away during registration");
            return;
        }
        Err(error) => {
            debug!(%peer, error = %error, "downstream registration failed");
            return;
        }
    };

    let mut session = match attach(&server, id, transport, registered, &peer).await {
        Some(session) => session,
        None => return,
    };

    session.run(cancel).await;
    session.hub.detach(id).await;
    info!(%peer, "downstream closed");
}

// ----------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------

struct Registered {
    user: User,
    /// Network suffix from `<user>/<network>`, unresolved.
    network_suffix: Option<String>,
    nick: String,
    caps: HashSet<String>,
}

struct RegistrationState {
    caps: HashSet<String>,
    cap_negotiating: bool,
    nick: Option<String>,
    username: Option<String>,
    pass: Option<String>,
    /// Username verified through SASL PLAIN, suffix included.
    sasl_user: Option<String>,
    sasl_in_flight: bool,
}

/// Run the pre-registration exchange until NICK+USER (and CAP END) are
/// in, then authenticate against the store.
/// `Ok(None)` means the client went away cleanly before registering.
async fn register(
    server: &ServerHandle,
    transport: &mut Transport,
    peer: &str,
) -> Result<Option<Registered>, SessionError> {
    let mut state = RegistrationState {
        caps: HashSet::new(),
        cap_negotiating: false,
        nick: None,
        username: None,
        pass: None,
        sasl_user: None,
        sasl_in_flight: false,
    };
    let mut malformed = MalformedCounter::default();

    loop {
        if state.nick.is_some() && state.username.is_some() && !state.cap_negotiating {
            if state.sasl_user.is_some() || state.pass.is_some() {
                break;
            }
            // Clients may send PASS after USER; keep reading while the
            // account actually requires a password.
            let full = state.username.as_deref().expect("checked above");
            let (username, _) = split_suffix(full);
            match server.db().get_user(&username).await {
                Ok(user) if user.password.is_some() => {}
                _ => break,
            }
        }

        let msg = match transport.read_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(None),
            Err(ProtocolError::Io(e)) => return Err(SessionError::Io(e)),
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed line");
                if malformed.record(Instant::now()) {
                    return Err(SessionError::MalformedFlood);
                }
                continue;
            }
        };

        match msg.command.as_str() {
            "CAP" => handle_cap_prereg(server, transport, &mut state, &msg).await?,
            "PASS" => state.pass = msg.param(0).map(String::from),
            "NICK" => state.nick = msg.param(0).map(String::from),
            "USER" => state.username = msg.param(0).map(String::from),
            "AUTHENTICATE" => handle_sasl(server, transport, &mut state, &msg).await?,
            "PING" => {
                let token = msg.param(0).unwrap_or_default().to_string();
                write(transport, Message::pong(token)).await?;
            }
            "QUIT" => return Ok(None),
            _ => {
                let nick = state.nick.as_deref().unwrap_or("*").to_string();
                let hostname = server.config().hostname.clone();
                let mut reply = Message::new(
                    "451",
                    vec![nick, "You have not registered".into()],
                );
                reply.source = Some(Source::new(hostname));
                write(transport, reply).await?;
            }
        }
    }

    let nick = state.nick.clone().expect("checked by the loop");

    // The bouncer username comes from USER (or SASL), possibly with a
    // /network suffix.
    let full_username = state
        .sasl_user
        .clone()
        .or_else(|| state.username.clone())
        .expect("checked by the loop");
    let (username, network_suffix) = split_suffix(&full_username);

    let user = match server.db().get_user(&username).await {
        Ok(user) => user,
        Err(_) => {
            fail_auth(server, transport, &nick, "unknown user").await;
            return Err(SessionError::AuthFailed(format!("unknown user {username:?}")));
        }
    };

    // SASL already proved the password; otherwise PASS must match.
    if state.sasl_user.is_none() {
        let Some(stored_hash) = user.password.clone() else {
            fail_auth(server, transport, &nick, "password login disabled").await;
            return Err(SessionError::AuthFailed("password login disabled".into()));
        };
        let Some(pass) = state.pass.clone() else {
            fail_auth(server, transport, &nick, "password required").await;
            return Err(SessionError::AuthFailed("password required".into()));
        };
        if !crate::auth::verify_password(pass, stored_hash).await {
            fail_auth(server, transport, &nick, "invalid password").await;
            return Err(SessionError::AuthFailed("invalid password".into()));
        }
    }

    Ok(Some(Registered {
        user,
        network_suffix,
        nick,
        caps: state.caps,
    }))
}

fn split_suffix(full: &str) -> (String, Option<String>) {
    match full.split_once('/') {
        Some((user, network)) if !network.is_empty() => {
            (user.to_string(), Some(network.to_string()))
        }
        _ => (full.to_string(), None),
    }
}

async fn write(transport: &mut Transport, msg: Message) -> Result<(), SessionError> {
    transport
        .write_message(&msg)
        .await
        .map_err(SessionError::from)
}

async fn fail_auth(server: &ServerHandle, transport: &mut Transport, nick: &str, reason: &str) {
    let hostname = server.config().hostname.clone();
    let mut reply = Message::new(
        "464",
        vec![nick.to_string(), format!("Authentication failed: {reason}")],
    );
    reply.source = Some(Source::new(hostname));
    let _ = transport.write_message(&reply).await;
    let _ = transport
        .write_message(&Message::new(
            "ERROR",
            vec!["Authentication failed".to_string()],
        ))
        .await;
}

async fn handle_cap_prereg(
    server: &ServerHandle,
    transport: &mut Transport,
    state: &mut RegistrationState,
    msg: &Message,
) -> Result<(), SessionError> {
    let hostname = server.config().hostname.clone();
    let nick = state.nick.clone().unwrap_or_else(|| "*".to_string());
    match msg.param(0) {
        Some("LS") => {
            state.cap_negotiating = true;
            let version_302 = msg.param(1) == Some("302");
            let caps = offered_caps_line(version_302);
            let mut reply = Message::new("CAP", vec![nick, "LS".into(), caps]);
            reply.source = Some(Source::new(hostname));
            write(transport, reply).await?;
        }
        Some("LIST") => {
            let mut enabled: Vec<&str> = state.caps.iter().map(String::as_str).collect();
            enabled.sort_unstable();
            let mut reply = Message::new("CAP", vec![nick, "LIST".into(), enabled.join(" ")]);
            reply.source = Some(Source::new(hostname));
            write(transport, reply).await?;
        }
        Some("REQ") => {
            state.cap_negotiating = true;
            let requested: Vec<&str> = msg.param(1).unwrap_or_default().split_whitespace().collect();
            let all_known = requested.iter().all(|cap| {
                let name = cap.strip_prefix('-').unwrap_or(cap);
                OFFERED_CAPS.contains(&name)
            });
            let verb = if all_known { "ACK" } else { "NAK" };
            if all_known {
                for cap in &requested {
                    match cap.strip_prefix('-') {
                        Some(name) => {
                            state.caps.remove(name);
                        }
                        None => {
                            state.caps.insert(cap.to_string());
                        }
                    }
                }
            }
            let mut reply = Message::new(
                "CAP",
                vec![nick, verb.into(), requested.join(" ")],
            );
            reply.source = Some(Source::new(hostname));
            write(transport, reply).await?;
        }
        Some("END") => state.cap_negotiating = false,
        _ => {}
    }
    Ok(())
}

fn offered_caps_line(version_302: bool) -> String {
    OFFERED_CAPS
        .iter()
        .map(|cap| {
            if *cap == "sasl" && version_302 {
                "sasl=PLAIN".to_string()
            } else {
                (*cap).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Downstream SASL PLAIN: the client proves the bouncer account.
async fn handle_sasl(
    server: &ServerHandle,
    transport: &mut Transport,
    state: &mut RegistrationState,
    msg: &Message,
) -> Result<(), SessionError> {
    let hostname = server.config().hostname.clone();
    let nick = state.nick.clone().unwrap_or_else(|| "*".to_string());
    let numeric = |cmd: &str, params: Vec<String>| {
        let mut reply = Message::new(cmd, params);
        reply.source = Some(Source::new(hostname.clone()));
        reply
    };

    if !state.sasl_in_flight {
        match msg.param(0) {
            Some("PLAIN") => {
                state.sasl_in_flight = true;
                write(transport, Message::new("AUTHENTICATE", vec!["+".into()])).await?;
            }
            Some("*") => {
                write(
                    transport,
                    numeric("906", vec![nick, "SASL authentication aborted".into()]),
                )
                .await?;
            }
            _ => {
                write(
                    transport,
                    numeric(
                        "908",
                        vec![nick, "PLAIN".into(), "are available SASL mechanisms".into()],
                    ),
                )
                .await?;
            }
        }
        return Ok(());
    }

    state.sasl_in_flight = false;
    let payload = msg
        .param(0)
        .and_then(sasl::decode_payload)
        .and_then(|p| sasl::split_plain(&p));
    let Some((_authzid, authcid, password)) = payload else {
        write(
            transport,
            numeric("904", vec![nick, "SASL authentication failed".into()]),
        )
        .await?;
        return Ok(());
    };

    let (username, _suffix) = split_suffix(&authcid);
    let verified = match server.db().get_user(&username).await {
        Ok(user) => match user.password {
            Some(hash) => crate::auth::verify_password(password, hash).await,
            None => false,
        },
        Err(_) => false,
    };

    if verified {
        state.sasl_user = Some(authcid.clone());
        write(
            transport,
            numeric(
                "900",
                vec![
                    nick.clone(),
                    format!("{nick}!{username}@{hostname}"),
                    username,
                    "You are now logged in".into(),
                ],
            ),
        )
        .await?;
        write(
            transport,
            numeric("903", vec![nick, "SASL authentication successful".into()]),
        )
        .await?;
    } else {
        write(
            transport,
            numeric("904", vec![nick, "SASL authentication failed".into()]),
        )
        .await?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Attach and the relay loop
// ----------------------------------------------------------------------

struct NetInfo {
    name: String,
    nick: String,
}

struct Session {
    id: u64,
    transport: Transport,
    hub: HubHandle,
    server: ServerHandle,
    rx: mpsc::Receiver<Delivery>,
    caps: HashSet<String>,
    scope: Scope,
    /// Whether the client is shown the upstream's nick as its own.
    impersonate: bool,
    /// Whether channel names carry the `<network>/` prefix.
    prefix: bool,
    /// What the client currently believes its nick is.
    visible_nick: String,
    networks: HashMap<i64, NetInfo>,
    malformed: MalformedCounter,
}

async fn attach(
    server: &ServerHandle,
    id: u64,
    mut transport: Transport,
    registered: Registered,
    peer: &str,
) -> Option<Session> {
    let config = server.config();

    // Resolve the network suffix against the user's stored networks.
    let scope = match resolve_scope(server, &registered, &config).await {
        Ok(scope) => scope,
        Err(reason) => {
            fail_auth(server, &mut transport, &registered.nick, &reason).await;
            return None;
        }
    };

    let hub = server.hub_for(&registered.user).await;
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let attached = hub
        .attach(DownstreamInfo { id, scope, tx })
        .await
        .unwrap_or_default();

    info!(%peer, user = %registered.user.username, ?scope, "downstream attached");

    let impersonate = matches!(scope, Scope::Network(_));
    let mut session = Session {
        id,
        transport,
        hub,
        server: server.clone(),
        rx,
        caps: registered.caps,
        scope,
        impersonate,
        prefix: scope == Scope::All && config.multi_upstream,
        visible_nick: registered.nick.clone(),
        networks: attached
            .iter()
            .map(|n| {
                (
                    n.id,
                    NetInfo {
                        name: n.name.clone(),
                        nick: n.nick.clone(),
                    },
                )
            })
            .collect(),
        malformed: MalformedCounter::default(),
    };

    if session.welcome_burst(&config).await.is_err() {
        return None;
    }

    // Scoped clients identify as the upstream's current nick.
    if session.impersonate {
        if let Some(info) = attached.first() {
            if info.connected && info.nick != session.visible_nick {
                let old = session.visible_nick.clone();
                let mut rename = Message::nick(info.nick.clone());
                rename.source = Some(Source::new(old));
                if session.write(rename).await.is_err() {
                    return None;
                }
                session.visible_nick = info.nick.clone();
            }
        }
    }

    if attached.is_empty() {
        let text = "no networks configured; send \"help\" to BouncerServ to add one";
        let _ = session.service_notice(text).await;
    }

    Some(session)
}

/// Turn the registration suffix into a hub scope.
async fn resolve_scope(
    server: &ServerHandle,
    registered: &Registered,
    config: &Config,
) -> Result<Scope, String> {
    let networks = server
        .db()
        .list_networks(registered.user.id)
        .await
        .map_err(|e| e.to_string())?;

    match &registered.network_suffix {
        Some(suffix) => networks
            .iter()
            .find(|n| n.display_name() == suffix)
            .map(|n| Scope::Network(n.id))
            .ok_or_else(|| format!("unknown network {suffix:?}")),
        None if config.multi_upstream => Ok(Scope::All),
        None => match networks.len() {
            0 => Ok(Scope::All),
            1 => Ok(Scope::Network(networks[0].id)),
            _ => Err("several networks exist; connect as <user>/<network>".to_string()),
        },
    }
}

impl Session {
    fn hostname(&self) -> String {
        self.server.config().hostname.clone()
    }

    async fn write(&mut self, msg: Message) -> Result<(), String> {
        self.transport
            .write_message(&msg)
            .await
            .map_err(|e| e.to_string())
    }

    /// A numeric or command from the bouncer itself.
    fn from_server(&self, command: &str, params: Vec<String>) -> Message {
        let mut msg = Message::new(command, params);
        msg.source = Some(Source::new(self.hostname()));
        msg
    }

    fn service_source(&self) -> Source {
        Source {
            name: SERVICE_NICK.to_string(),
            user: Some("service".to_string()),
            host: Some(self.hostname()),
        }
    }

    async fn service_notice(&mut self, text: &str) -> Result<(), String> {
        let mut msg = Message::notice(self.visible_nick.clone(), text.to_string());
        msg.source = Some(self.service_source());
        self.write(msg).await
    }

    async fn welcome_burst(&mut self, config: &Config) -> Result<(), String> {
        let nick = self.visible_nick.clone();
        let hostname = config.hostname.clone();

        let burst = vec![
            self.from_server(
                "001",
                vec![nick.clone(), format!("Welcome to tetherd, {nick}")],
            ),
            self.from_server(
                "002",
                vec![
                    nick.clone(),
                    format!("Your host is {hostname}, running tetherd"),
                ],
            ),
            self.from_server(
                "003",
                vec![nick.clone(), "This server is always on".to_string()],
            ),
            self.from_server(
                "004",
                vec![
                    nick.clone(),
                    hostname.clone(),
                    "tetherd".to_string(),
                    "o".to_string(),
                    "o".to_string(),
                ],
            ),
            self.from_server(
                "005",
                vec![
                    nick.clone(),
                    "CASEMAPPING=rfc1459".to_string(),
                    "CHANTYPES=#&".to_string(),
                    format!("NETWORK={}", config.title.as_deref().unwrap_or("tetherd")),
                    "are supported by this server".to_string(),
                ],
            ),
        ];
        for msg in burst {
            self.write(msg).await?;
        }

        match &config.motd {
            Some(motd) => {
                let start = self.from_server(
                    "375",
                    vec![nick.clone(), format!("- {hostname} Message of the day")],
                );
                self.write(start).await?;
                for line in motd.lines() {
                    let msg =
                        self.from_server("372", vec![nick.clone(), format!("- {line}")]);
                    self.write(msg).await?;
                }
                let end = self.from_server("376", vec![nick, "End of /MOTD command".into()]);
                self.write(end).await?;
            }
            None => {
                let msg =
                    self.from_server("422", vec![nick, "MOTD File is missing".into()]);
                self.write(msg).await?;
            }
        }
        Ok(())
    }

    async fn run(&mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self
                        .write(Message::new("ERROR", vec!["Server shutting down".into()]))
                        .await;
                    return;
                }

                delivery = self.rx.recv() => match delivery {
                    // The hub dropped us (slow client or shutdown).
                    None => {
                        let _ = self
                            .write(Message::new("ERROR", vec!["Closing link".into()]))
                            .await;
                        return;
                    }
                    Some(delivery) => {
                        if self.render_delivery(delivery).await.is_err() {
                            return;
                        }
                    }
                },

                result = self.transport.read_message() => match result {
                    Ok(Some(msg)) => {
                        if !self.handle_client_message(msg).await {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(ProtocolError::Io(_)) => return,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed line from client");
                        if self.malformed.record(Instant::now()) {
                            let _ = self
                                .write(Message::new(
                                    "ERROR",
                                    vec!["Too many malformed lines".into()],
                                ))
                                .await;
                            return;
                        }
                    }
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Client → hub
    // ------------------------------------------------------------------

    /// Returns false when the session should close.
    async fn handle_client_message(&mut self, msg: Message) -> bool {
        let label = if self.caps.contains("labeled-response") {
            msg.label().map(String::from)
        } else {
            None
        };

        match msg.command.as_str() {
            "PING" => {
                let token = msg.param(0).unwrap_or_default().to_string();
                let pong = Message::pong(token);
                return self.send_labeled(label.as_deref(), vec![pong]).await.is_ok();
            }
            "PONG" => true,
            "QUIT" => {
                let _ = self
                    .write(Message::new("ERROR", vec!["Closing link".into()]))
                    .await;
                false
            }
            "CAP" => self.handle_cap_postreg(&msg).await.is_ok(),
            "NICK" => {
                let Some(new_nick) = msg.param(0).map(String::from) else {
                    return true;
                };
                if self.networks.is_empty() {
                    // No upstream to impersonate; rename locally.
                    let mut rename = Message::nick(new_nick.clone());
                    rename.source = Some(Source::new(self.visible_nick.clone()));
                    self.visible_nick = new_nick;
                    return self.write(rename).await.is_ok();
                }
                self.hub
                    .command(self.id, ClientCommand::Nick { nick: new_nick })
                    .await;
                true
            }
            "JOIN" => {
                let channels = msg.param(0).unwrap_or_default().to_string();
                let keys: Vec<Option<String>> = msg
                    .param(1)
                    .unwrap_or_default()
                    .split(',')
                    .map(|k| {
                        if k.is_empty() {
                            None
                        } else {
                            Some(k.to_string())
                        }
                    })
                    .chain(std::iter::repeat(None))
                    .take(channels.split(',').count())
                    .collect();
                for (channel, key) in channels.split(',').zip(keys) {
                    if channel.is_empty() {
                        continue;
                    }
                    match self.resolve_target(channel) {
                        Ok((network_id, bare)) => {
                            self.hub
                                .command(
                                    self.id,
                                    ClientCommand::Join {
                                        network_id,
                                        channel: bare,
                                        key,
                                    },
                                )
                                .await;
                        }
                        Err(reason) => {
                            let _ = self.service_notice(&reason).await;
                        }
                    }
                }
                true
            }
            "PART" => {
                let channels = msg.param(0).unwrap_or_default().to_string();
                let reason = msg.param(1).map(String::from);
                for channel in channels.split(',').filter(|c| !c.is_empty()) {
                    match self.resolve_target(channel) {
                        Ok((network_id, bare)) => {
                            self.hub
                                .command(
                                    self.id,
                                    ClientCommand::Part {
                                        network_id,
                                        channel: bare,
                                        reason: reason.clone(),
                                    },
                                )
                                .await;
                        }
                        Err(reason) => {
                            let _ = self.service_notice(&reason).await;
                        }
                    }
                }
                true
            }
            "PRIVMSG" | "NOTICE" => self.handle_chat(msg, label.as_deref()).await,
            "AWAY" => {
                let ids: Vec<i64> = self.networks.keys().copied().collect();
                for network_id in ids {
                    self.hub
                        .command(
                            self.id,
                            ClientCommand::Raw {
                                network_id,
                                msg: msg.clone(),
                            },
                        )
                        .await;
                }
                true
            }
            "AUTHENTICATE" => {
                let reply = self.from_server(
                    "462",
                    vec![
                        self.visible_nick.clone(),
                        "You may not reregister".to_string(),
                    ],
                );
                self.write(reply).await.is_ok()
            }
            _ => {
                // Everything else is passed through to the scoped
                // upstream, with the network prefix stripped off the
                // first parameter where present.
                let mut forwarded = msg.clone();
                forwarded.tags.clear();
                let resolved = match forwarded.params.first().cloned() {
                    Some(target) => self.resolve_target(&target).map(|(id, bare)| {
                        forwarded.params[0] = bare;
                        id
                    }),
                    None => self.sole_network(),
                };
                match resolved {
                    Ok(network_id) => {
                        self.hub
                            .command(
                                self.id,
                                ClientCommand::Raw {
                                    network_id,
                                    msg: forwarded,
                                },
                            )
                            .await;
                    }
                    Err(reason) => {
                        let _ = self.service_notice(&reason).await;
                    }
                }
                true
            }
        }
    }

    async fn handle_chat(&mut self, msg: Message, label: Option<&str>) -> bool {
        let Some(target) = msg.param(0).map(String::from) else {
            return true;
        };
        let Some(text) = msg.param(1).map(String::from) else {
            return true;
        };

        // The bouncer's own command surface.
        if target.eq_ignore_ascii_case(SERVICE_NICK) {
            let replies = self.hub.service(self.id, text).await;
            let source = self.service_source();
            let nick = self.visible_nick.clone();
            let messages: Vec<Message> = replies
                .into_iter()
                .map(|line| {
                    let mut notice = Message::notice(nick.clone(), line);
                    notice.source = Some(source.clone());
                    notice
                })
                .collect();
            return self.send_labeled(label, messages).await.is_ok();
        }

        match self.resolve_target(&target) {
            Ok((network_id, bare)) => {
                self.hub
                    .command(
                        self.id,
                        ClientCommand::Privmsg {
                            network_id,
                            command: msg.command.clone(),
                            target: bare,
                            text,
                        },
                    )
                    .await;
                true
            }
            Err(reason) => {
                let _ = self.service_notice(&reason).await;
                true
            }
        }
    }

    async fn handle_cap_postreg(&mut self, msg: &Message) -> Result<(), String> {
        let nick = self.visible_nick.clone();
        match msg.param(0) {
            Some("LS") => {
                let caps = offered_caps_line(msg.param(1) == Some("302"));
                let reply = self.from_server("CAP", vec![nick, "LS".into(), caps]);
                self.write(reply).await
            }
            Some("LIST") => {
                let mut enabled: Vec<&str> = self.caps.iter().map(String::as_str).collect();
                enabled.sort_unstable();
                let list = enabled.join(" ");
                let reply = self.from_server("CAP", vec![nick, "LIST".into(), list]);
                self.write(reply).await
            }
            Some("REQ") => {
                let requested: Vec<String> = msg
                    .param(1)
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(String::from)
                    .collect();
                let all_known = requested.iter().all(|cap| {
                    let name = cap.strip_prefix('-').unwrap_or(cap);
                    OFFERED_CAPS.contains(&name)
                });
                if all_known {
                    for cap in &requested {
                        match cap.strip_prefix('-') {
                            Some(name) => {
                                self.caps.remove(name);
                            }
                            None => {
                                self.caps.insert(cap.clone());
                            }
                        }
                    }
                }
                let verb = if all_known { "ACK" } else { "NAK" };
                let reply =
                    self.from_server("CAP", vec![nick, verb.into(), requested.join(" ")]);
                self.write(reply).await
            }
            _ => Ok(()),
        }
    }

    /// Map a client-side name to (network, upstream-side name).
    fn resolve_target(&self, name: &str) -> Result<(i64, String), String> {
        match self.scope {
            Scope::Network(id) => Ok((id, name.to_string())),
            Scope::All => {
                if let Some((network, bare)) = render::split_network_prefix(name) {
                    if let Some((id, _)) = self
                        .networks
                        .iter()
                        .find(|(_, info)| info.name == network)
                    {
                        return Ok((*id, bare.to_string()));
                    }
                }
                self.sole_network().map(|id| (id, name.to_string()))
            }
        }
    }

    fn sole_network(&self) -> Result<i64, String> {
        match self.networks.len() {
            1 => Ok(*self.networks.keys().next().expect("len checked")),
            0 => Err("no networks configured".to_string()),
            _ => Err("ambiguous target: prefix it with <network>/".to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Hub → client
    // ------------------------------------------------------------------

    async fn render_delivery(&mut self, delivery: Delivery) -> Result<(), String> {
        match delivery {
            Delivery::Upstream {
                network_id,
                network,
                mut msg,
                echo_origin,
            } => {
                self.remember_network(network_id, &network);

                // Echoes go back to their sender only with echo-message.
                if echo_origin == Some(self.id) && !self.caps.contains("echo-message") {
                    return Ok(());
                }
                // Our own upstream nick change is rendered via OwnNick
                // for impersonated sessions.
                if self.impersonate
                    && msg.command == "NICK"
                    && msg.param(0) == Some(self.visible_nick.as_str())
                {
                    return Ok(());
                }
                if !render::adapt_to_caps(&mut msg, &self.caps) {
                    return Ok(());
                }
                if self.prefix {
                    render::prefix_channels(&mut msg, &network);
                }
                render::filter_tags(&mut msg, &self.caps);
                self.write(msg).await
            }

            Delivery::Joined {
                network_id,
                network,
                own_nick,
                sync,
            } => {
                self.remember_network(network_id, &network);
                let visible = self.visible_nick_for(network_id, &own_nick);
                let channel = if self.prefix {
                    render::add_network_prefix(&network, &sync.channel)
                } else {
                    sync.channel.clone()
                };

                let mut join = Message::join(channel.clone(), None);
                join.source = Some(Source::new(visible.clone()));
                self.write(join).await?;

                if let Some(topic) = &sync.topic {
                    let reply = self.from_server(
                        "332",
                        vec![visible.clone(), channel.clone(), topic.clone()],
                    );
                    self.write(reply).await?;
                }
                let names = self.from_server(
                    "353",
                    vec![
                        visible.clone(),
                        "=".to_string(),
                        channel.clone(),
                        sync.members.join(" "),
                    ],
                );
                self.write(names).await?;
                let end = self.from_server(
                    "366",
                    vec![visible, channel, "End of /NAMES list".to_string()],
                );
                self.write(end).await
            }

            Delivery::Parted {
                network_id,
                network,
                own_nick,
                channel,
            } => {
                self.remember_network(network_id, &network);
                let visible = self.visible_nick_for(network_id, &own_nick);
                let channel = if self.prefix {
                    render::add_network_prefix(&network, &channel)
                } else {
                    channel
                };
                let mut part = Message::part(channel, None);
                part.source = Some(Source::new(visible));
                self.write(part).await
            }

            Delivery::OwnNick {
                network_id,
                network,
                nick,
            } => {
                self.remember_network(network_id, &network);
                if let Some(info) = self.networks.get_mut(&network_id) {
                    info.nick = nick.clone();
                }
                if self.impersonate && self.visible_nick != nick {
                    let mut rename = Message::nick(nick.clone());
                    rename.source = Some(Source::new(self.visible_nick.clone()));
                    self.visible_nick = nick;
                    self.write(rename).await?;
                }
                Ok(())
            }

            Delivery::ServiceNotice(text) => self.service_notice(&text).await,
        }
    }

    fn remember_network(&mut self, network_id: i64, name: &str) {
        self.networks
            .entry(network_id)
            .and_modify(|info| info.name = name.to_string())
            .or_insert_with(|| NetInfo {
                name: name.to_string(),
                nick: String::new(),
            });
    }

    /// The nick this client sees itself as, for messages about itself
    /// on one network.
    fn visible_nick_for(&self, _network_id: i64, own_nick: &str) -> String {
        if self.impersonate {
            own_nick.to_string()
        } else {
            self.visible_nick.clone()
        }
    }

    /// Send replies to a labeled command, batching when there are
    /// several.
    async fn send_labeled(
        &mut self,
        label: Option<&str>,
        messages: Vec<Message>,
    ) -> Result<(), String> {
        let Some(label) = label else {
            for msg in messages {
                self.write(msg).await?;
            }
            return Ok(());
        };

        match messages.len() {
            0 => {
                let mut ack = self.from_server("ACK", Vec::new());
                ack.tags.push(tether_proto::Tag {
                    key: "label".into(),
                    value: Some(label.to_string()),
                });
                self.write(ack).await
            }
            1 => {
                let mut msg = messages.into_iter().next().expect("len checked");
                msg.tags.push(tether_proto::Tag {
                    key: "label".into(),
                    value: Some(label.to_string()),
                });
                self.write(msg).await
            }
            _ => {
                let batch_ref = Uuid::new_v4().simple().to_string();
                let mut start = self.from_server(
                    "BATCH",
                    vec![format!("+{batch_ref}"), "labeled-response".to_string()],
                );
                start.tags.push(tether_proto::Tag {
                    key: "label".into(),
                    value: Some(label.to_string()),
                });
                self.write(start).await?;
                for mut msg in messages {
                    msg.tags.push(tether_proto::Tag {
                        key: "batch".into(),
                        value: Some(batch_ref.clone()),
                    });
                    self.write(msg).await?;
                }
                let end = self.from_server("BATCH", vec![format!("-{batch_ref}")]);
                self.write(end).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_suffix_parsing() {
        assert_eq!(split_suffix("ada"), ("ada".to_string(), None));
        assert_eq!(
            split_suffix("ada/libera"),
            ("ada".to_string(), Some("libera".to_string()))
        );
        assert_eq!(split_suffix("ada/"), ("ada/".to_string(), None));
    }

    #[test]
    fn offered_caps_advertise_sasl_mechanism_at_302() {
        let plain = offered_caps_line(false);
        assert!(plain.split_whitespace().any(|c| c == "sasl"));
        let v302 = offered_caps_line(true);
        assert!(v302.split_whitespace().any(|c| c == "sasl=PLAIN"));
        assert!(v302.split_whitespace().any(|c| c == "labeled-response"));
    }
}
