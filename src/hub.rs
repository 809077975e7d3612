//! The per-user hub: one task aggregating a user's upstream sessions and
//! attached downstream clients.
//!
//! The hub is the center of a star. Upstream and downstream tasks hold
//! only a sender into the hub's inbox; the hub holds the canonical live
//! view (per network: joined channels, members, topics, own nick) and
//! fans deltas out to every downstream whose scope includes the network.
//! Teardown always flows hub → children.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tether_proto::{CaseMapping, Isupport, Message, Source, Tag};

use crate::config::Config;
use crate::db::{Channel, Database, MessageFilter, Network, Sasl, User};
use crate::network::IdentRegistry;
use crate::service::{self, ChannelFlags, NetworkFlags, ServiceCommand};
use crate::upstream::{self, UpstreamEvent, UpstreamHandle, UpstreamPhase};

/// Depth of every hub-adjacent queue. A downstream that falls this far
/// behind is dropped as a slow client.
pub const QUEUE_DEPTH: usize = 256;

/// Tag marking messages relayed from a detached channel.
const DETACHED_TAG_VALUE: &str = "soju.im/detached";

/// How often the detach-after sweep runs.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Visibility of one downstream: every network, or a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Network(i64),
}

impl Scope {
    pub fn includes(&self, network_id: i64) -> bool {
        match self {
            Scope::All => true,
            Scope::Network(id) => *id == network_id,
        }
    }
}

/// Synthesized channel state handed to a downstream on (re)attach.
#[derive(Debug, Clone)]
pub struct ChannelSync {
    pub channel: String,
    pub topic: Option<String>,
    /// Members with their NAMES prefixes, e.g. `@ada`.
    pub members: Vec<String>,
}

/// What the hub delivers to an attached downstream.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Verbatim upstream traffic (server-time already stamped).
    Upstream {
        network_id: i64,
        network: String,
        msg: Message,
        /// Set when this is the echo of a message one of our own
        /// downstreams sent; carries the sender's downstream id.
        echo_origin: Option<u64>,
    },
    /// Synthesized JOIN plus channel state.
    Joined {
        network_id: i64,
        network: String,
        own_nick: String,
        sync: ChannelSync,
    },
    /// Synthesized PART (the channel detached).
    Parted {
        network_id: i64,
        network: String,
        own_nick: String,
        channel: String,
    },
    /// Our nick on one network (initial, or after a change upstream).
    OwnNick {
        network_id: i64,
        network: String,
        nick: String,
    },
    /// NOTICE from the bouncer service user.
    ServiceNotice(String),
}

/// One attached downstream, as the hub sees it.
pub struct DownstreamInfo {
    pub id: u64,
    pub scope: Scope,
    pub tx: mpsc::Sender<Delivery>,
}

/// Snapshot returned to a downstream when it attaches.
#[derive(Debug, Clone)]
pub struct AttachedNetwork {
    pub id: i64,
    pub name: String,
    pub nick: String,
    pub connected: bool,
}

/// Client commands that touch hub state.
#[derive(Debug)]
pub enum ClientCommand {
    Join {
        network_id: i64,
        channel: String,
        key: Option<String>,
    },
    Part {
        network_id: i64,
        channel: String,
        reason: Option<String>,
    },
    /// PRIVMSG or NOTICE toward an upstream target.
    Privmsg {
        network_id: i64,
        command: String,
        target: String,
        text: String,
    },
    /// Nick change, applied to every network in the sender's scope.
    Nick { nick: String },
    /// Verbatim passthrough to one network.
    Raw { network_id: i64, msg: Message },
}

/// Requests a hub escalates to the server.
#[derive(Debug)]
pub enum ServerOp {
    /// A user record was deleted; its hub (if live) must stop.
    UserDeleted { username: String },
    /// An admin asked for a config reload.
    ReloadConfig,
}

/// The hub inbox.
pub enum HubEvent {
    Upstream {
        network_id: i64,
        event: UpstreamEvent,
    },
    Attach {
        info: DownstreamInfo,
        reply: oneshot::Sender<Vec<AttachedNetwork>>,
    },
    Detach {
        downstream_id: u64,
    },
    Command {
        downstream_id: u64,
        command: ClientCommand,
    },
    /// One line addressed to the service user; replies go back as
    /// notices through the oneshot so the caller can batch them.
    Service {
        downstream_id: u64,
        line: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Stop,
}

/// Handle to a running hub. Cheap to clone.
#[derive(Clone)]
pub struct HubHandle {
    pub username: String,
    tx: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    /// Attach a downstream; returns the networks in its scope, or `None`
    /// if the hub is gone.
    pub async fn attach(&self, info: DownstreamInfo) -> Option<Vec<AttachedNetwork>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HubEvent::Attach { info, reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn detach(&self, downstream_id: u64) {
        let _ = self.tx.send(HubEvent::Detach { downstream_id }).await;
    }

    pub async fn command(&self, downstream_id: u64, command: ClientCommand) {
        let _ = self
            .tx
            .send(HubEvent::Command {
                downstream_id,
                command,
            })
            .await;
    }

    /// Run a service command, returning its reply lines.
    pub async fn service(&self, downstream_id: u64, line: String) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(HubEvent::Service {
                downstream_id,
                line,
                reply,
            })
            .await
            .is_err()
        {
            return vec!["bouncer is shutting down".to_string()];
        }
        rx.await.unwrap_or_default()
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(HubEvent::Stop).await;
    }
}

/// Live state for one network inside the hub.
struct NetworkState {
    record: Network,
    handle: UpstreamHandle,
    phase: UpstreamPhase,
    last_error: Option<String>,
    /// Current nick upstream (desired nick until registered).
    nick: String,
    caps: BTreeSet<String>,
    isupport: Isupport,
    /// Persisted channel configs, keyed by folded name.
    channels: HashMap<String, ChannelState>,
    /// Live membership view, keyed by folded channel name.
    view: HashMap<String, ChannelView>,
}

impl NetworkState {
    fn fold(&self, s: &str) -> String {
        self.isupport.casemapping.fold(s)
    }
}

/// Persisted channel config plus detach-policy runtime.
struct ChannelState {
    record: Channel,
    /// Last time a downstream spoke in the channel (or the channel
    /// became attached). Drives the detach-after sweep.
    last_activity: Instant,
}

/// Live view of one joined channel.
#[derive(Default)]
struct ChannelView {
    /// Display-case name as the server sent it.
    name: String,
    topic: Option<String>,
    /// folded nick → (display nick, NAMES prefixes).
    members: HashMap<String, (String, String)>,
}

impl ChannelView {
    fn sync(&self) -> ChannelSync {
        let mut members: Vec<String> = self
            .members
            .values()
            .map(|(nick, prefixes)| format!("{prefixes}{nick}"))
            .collect();
        members.sort();
        ChannelSync {
            channel: self.name.clone(),
            topic: self.topic.clone(),
            members,
        }
    }
}

/// Spawn the hub task for one user.
pub fn spawn(
    user: User,
    db: Database,
    config_rx: watch::Receiver<Arc<Config>>,
    ident: Option<Arc<IdentRegistry>>,
    server_ops: mpsc::Sender<ServerOp>,
    parent: &CancellationToken,
) -> HubHandle {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let handle = HubHandle {
        username: user.username.clone(),
        tx: tx.clone(),
    };
    let cancel = parent.child_token();

    tokio::spawn(async move {
        let mut hub = Hub {
            user,
            db,
            config_rx,
            ident,
            server_ops,
            cancel,
            tx,
            networks: HashMap::new(),
            downstreams: HashMap::new(),
            pending_echo: VecDeque::new(),
        };
        hub.run(rx).await;
    });

    handle
}

struct Hub {
    user: User,
    db: Database,
    config_rx: watch::Receiver<Arc<Config>>,
    ident: Option<Arc<IdentRegistry>>,
    server_ops: mpsc::Sender<ServerOp>,
    cancel: CancellationToken,
    tx: mpsc::Sender<HubEvent>,
    networks: HashMap<i64, NetworkState>,
    downstreams: HashMap<u64, DownstreamInfo>,
    /// Sent messages awaiting an upstream echo:
    /// (network id, downstream id, folded target, text).
    pending_echo: VecDeque<(i64, u64, String, String)>,
}

impl Hub {
    async fn run(&mut self, mut rx: mpsc::Receiver<HubEvent>) {
        if let Err(e) = self.start_networks().await {
            warn!(user = %self.user.username, error = %e, "failed to load networks");
            self.notice_all("failed to load networks from the store").await;
        }

        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    None | Some(HubEvent::Stop) => break,
                    Some(event) => self.handle_event(event).await,
                },
                _ = sweep.tick() => self.detach_sweep().await,
            }
        }

        info!(user = %self.user.username, "hub stopping");
        for state in self.networks.values() {
            state.handle.stop();
        }
        self.cancel.cancel();
    }

    async fn start_networks(&mut self) -> Result<(), crate::db::DbError> {
        let networks = self.db.list_networks(self.user.id).await?;
        for network in networks {
            let channels = self.db.list_channels(network.id).await?;
            self.start_upstream(network, channels);
        }
        Ok(())
    }

    fn start_upstream(&mut self, network: Network, channels: Vec<Channel>) {
        let handle = upstream::spawn(
            network.clone(),
            channels.clone(),
            self.user.username.clone(),
            self.tx.clone(),
            self.ident.clone(),
            &self.cancel,
        );
        let nick = network.nick.clone();
        let now = Instant::now();
        let channel_states = channels
            .into_iter()
            .map(|record| {
                let key = CaseMapping::default().fold(&record.name);
                (
                    key,
                    ChannelState {
                        record,
                        last_activity: now,
                    },
                )
            })
            .collect();

        self.networks.insert(
            network.id,
            NetworkState {
                record: network,
                handle,
                phase: UpstreamPhase::Disconnected,
                last_error: None,
                nick,
                caps: BTreeSet::new(),
                isupport: Isupport::default(),
                channels: channel_states,
                view: HashMap::new(),
            },
        );
    }

    fn config(&self) -> Arc<Config> {
        self.config_rx.borrow().clone()
    }

    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Upstream { network_id, event } => {
                self.handle_upstream(network_id, event).await;
            }
            HubEvent::Attach { info, reply } => {
                let networks = self.attach(info).await;
                let _ = reply.send(networks);
            }
            HubEvent::Detach { downstream_id } => {
                self.downstreams.remove(&downstream_id);
            }
            HubEvent::Command {
                downstream_id,
                command,
            } => {
                self.handle_command(downstream_id, command).await;
            }
            HubEvent::Service {
                downstream_id: _,
                line,
                reply,
            } => {
                let replies = self.run_service(&line).await;
                let _ = reply.send(replies);
            }
            HubEvent::Stop => unreachable!("handled by the select loop"),
        }
    }

    // ------------------------------------------------------------------
    // Downstream lifecycle
    // ------------------------------------------------------------------

    async fn attach(&mut self, info: DownstreamInfo) -> Vec<AttachedNetwork> {
        let scope = info.scope;
        let downstream_id = info.id;
        self.downstreams.insert(info.id, info);

        let mut networks = Vec::new();
        let mut syncs = Vec::new();
        for state in self.networks.values() {
            if !scope.includes(state.record.id) {
                continue;
            }
            networks.push(AttachedNetwork {
                id: state.record.id,
                name: state.record.display_name().to_string(),
                nick: state.nick.clone(),
                connected: state.phase == UpstreamPhase::Connected,
            });
            // Bring the client into every attached channel we are in.
            for (folded, channel) in &state.channels {
                if channel.record.detached {
                    continue;
                }
                if let Some(view) = state.view.get(folded) {
                    syncs.push(Delivery::Joined {
                        network_id: state.record.id,
                        network: state.record.display_name().to_string(),
                        own_nick: state.nick.clone(),
                        sync: view.sync(),
                    });
                }
            }
        }

        for delivery in syncs {
            self.deliver_to(downstream_id, delivery).await;
        }
        networks
    }

    /// Send one delivery to one downstream, dropping it if its queue is
    /// full (SlowClient).
    async fn deliver_to(&mut self, downstream_id: u64, delivery: Delivery) {
        let Some(info) = self.downstreams.get(&downstream_id) else {
            return;
        };
        match info.tx.try_send(delivery) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    user = %self.user.username,
                    downstream_id,
                    "downstream queue full, dropping slow client"
                );
                self.downstreams.remove(&downstream_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.downstreams.remove(&downstream_id);
            }
        }
    }

    /// Fan a delivery out to every downstream whose scope covers the
    /// network.
    async fn fan_out(&mut self, network_id: i64, delivery: Delivery) {
        let targets: Vec<u64> = self
            .downstreams
            .values()
            .filter(|d| d.scope.includes(network_id))
            .map(|d| d.id)
            .collect();
        for id in targets {
            self.deliver_to(id, delivery.clone()).await;
        }
    }

    async fn notice_all(&mut self, text: &str) {
        let targets: Vec<u64> = self.downstreams.keys().copied().collect();
        for id in targets {
            self.deliver_to(id, Delivery::ServiceNotice(text.to_string()))
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Upstream events
    // ------------------------------------------------------------------

    async fn handle_upstream(&mut self, network_id: i64, event: UpstreamEvent) {
        match event {
            UpstreamEvent::StateChange { phase, error } => {
                let display_name;
                {
                    let Some(state) = self.networks.get_mut(&network_id) else {
                        return;
                    };
                    state.phase = phase;
                    if phase != UpstreamPhase::Connected {
                        state.view.clear();
                    }
                    state.last_error = error.clone();
                    display_name = state.record.display_name().to_string();
                }
                if let Some(error) = error {
                    let text = format!("disconnected from {display_name}: {error}");
                    let targets: Vec<u64> = self
                        .downstreams
                        .values()
                        .filter(|d| d.scope.includes(network_id))
                        .map(|d| d.id)
                        .collect();
                    for id in targets {
                        self.deliver_to(id, Delivery::ServiceNotice(text.clone()))
                            .await;
                    }
                }
            }
            UpstreamEvent::Registered { nick, caps } => {
                let (network, nick_clone) = {
                    let Some(state) = self.networks.get_mut(&network_id) else {
                        return;
                    };
                    state.nick = nick.clone();
                    state.caps = caps;
                    (state.record.display_name().to_string(), nick)
                };
                self.fan_out(
                    network_id,
                    Delivery::OwnNick {
                        network_id,
                        network,
                        nick: nick_clone,
                    },
                )
                .await;
            }
            UpstreamEvent::Isupport(isupport) => {
                if let Some(state) = self.networks.get_mut(&network_id) {
                    state.isupport = *isupport;
                }
            }
            UpstreamEvent::NickChanged(nick) => {
                let network = {
                    let Some(state) = self.networks.get_mut(&network_id) else {
                        return;
                    };
                    state.nick = nick.clone();
                    state.record.display_name().to_string()
                };
                self.fan_out(
                    network_id,
                    Delivery::OwnNick {
                        network_id,
                        network,
                        nick,
                    },
                )
                .await;
            }
            UpstreamEvent::Message(msg) => {
                self.handle_upstream_message(network_id, msg).await;
            }
        }
    }

    async fn handle_upstream_message(&mut self, network_id: i64, msg: Message) {
        self.update_view(network_id, &msg);

        let Some(state) = self.networks.get(&network_id) else {
            return;
        };
        let network_name = state.record.display_name().to_string();

        // Channel-targeted PRIVMSG/NOTICE goes through the detachment
        // policy; everything else fans out untouched.
        let target_channel = match msg.command.as_str() {
            "PRIVMSG" | "NOTICE" => msg
                .param(0)
                .filter(|t| state.isupport.is_channel(t))
                .map(|t| state.fold(t)),
            _ => None,
        };

        let echo_origin = self.match_echo(network_id, &msg);

        if let Some(folded) = target_channel {
            let decision = {
                let state = self.networks.get(&network_id).expect("checked above");
                match state.channels.get(&folded) {
                    Some(channel) => policy_decision(
                        &channel.record,
                        &msg,
                        &state.nick,
                        state.isupport.casemapping,
                    ),
                    None => PolicyDecision::Deliver,
                }
            };

            match decision {
                PolicyDecision::Deliver => {}
                PolicyDecision::Suppress => return,
                PolicyDecision::RelayDetached => {
                    let mut tagged = msg.clone();
                    tagged.tags.push(Tag {
                        key: "batch".to_string(),
                        value: Some(DETACHED_TAG_VALUE.to_string()),
                    });
                    self.fan_out(
                        network_id,
                        Delivery::Upstream {
                            network_id,
                            network: network_name,
                            msg: tagged,
                            echo_origin,
                        },
                    )
                    .await;
                    return;
                }
                PolicyDecision::Reattach => {
                    self.set_detached(network_id, &folded, false).await;
                }
            }
        }

        self.fan_out(
            network_id,
            Delivery::Upstream {
                network_id,
                network: network_name,
                msg,
                echo_origin,
            },
        )
        .await;
    }

    /// Match an upstream echo of one of our own messages back to the
    /// downstream that sent it.
    fn match_echo(&mut self, network_id: i64, msg: &Message) -> Option<u64> {
        if !matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE") {
            return None;
        }
        let state = self.networks.get(&network_id)?;
        let source = msg.source_name()?;
        if state.fold(source) != state.fold(&state.nick) {
            return None;
        }
        let target = state.fold(msg.param(0)?);
        let text = msg.params.get(1)?.clone();
        let position = self
            .pending_echo
            .iter()
            .position(|(net, _, t, body)| *net == network_id && *t == target && *body == text)?;
        let (_, downstream_id, _, _) = self.pending_echo.remove(position)?;
        Some(downstream_id)
    }

    /// Keep the membership/topic view current.
    fn update_view(&mut self, network_id: i64, msg: &Message) {
        let Some(state) = self.networks.get_mut(&network_id) else {
            return;
        };
        let casemap = state.isupport.casemapping;
        let fold = |s: &str| casemap.fold(s);
        let own = fold(&state.nick);
        let from_self = msg
            .source_name()
            .map(|n| fold(n) == own)
            .unwrap_or(false);

        match msg.command.as_str() {
            "JOIN" => {
                let Some(channel) = msg.param(0) else { return };
                let folded = fold(channel);
                if from_self {
                    state.view.insert(
                        folded,
                        ChannelView {
                            name: channel.to_string(),
                            ..Default::default()
                        },
                    );
                } else if let (Some(view), Some(nick)) =
                    (state.view.get_mut(&folded), msg.source_name())
                {
                    view.members
                        .insert(fold(nick), (nick.to_string(), String::new()));
                }
            }
            "PART" => {
                let Some(channel) = msg.param(0) else { return };
                let folded = fold(channel);
                if from_self {
                    state.view.remove(&folded);
                } else if let (Some(view), Some(nick)) =
                    (state.view.get_mut(&folded), msg.source_name())
                {
                    view.members.remove(&fold(nick));
                }
            }
            "KICK" => {
                let (Some(channel), Some(victim)) = (msg.param(0), msg.param(1)) else {
                    return;
                };
                let folded = fold(channel);
                if fold(victim) == own {
                    state.view.remove(&folded);
                } else if let Some(view) = state.view.get_mut(&folded) {
                    view.members.remove(&fold(victim));
                }
            }
            "QUIT" => {
                let Some(nick) = msg.source_name() else { return };
                let folded_nick = fold(nick);
                for view in state.view.values_mut() {
                    view.members.remove(&folded_nick);
                }
            }
            "NICK" => {
                let (Some(old), Some(new)) = (msg.source_name(), msg.param(0)) else {
                    return;
                };
                let old_folded = fold(old);
                let new_folded = fold(new);
                for view in state.view.values_mut() {
                    if let Some((_, prefixes)) = view.members.remove(&old_folded) {
                        view.members
                            .insert(new_folded.clone(), (new.to_string(), prefixes));
                    }
                }
            }
            "TOPIC" => {
                let (Some(channel), Some(topic)) = (msg.param(0), msg.param(1)) else {
                    return;
                };
                if let Some(view) = state.view.get_mut(&fold(channel)) {
                    view.topic = if topic.is_empty() {
                        None
                    } else {
                        Some(topic.to_string())
                    };
                }
            }
            // RPL_TOPIC
            "332" => {
                let (Some(channel), Some(topic)) = (msg.param(1), msg.param(2)) else {
                    return;
                };
                if let Some(view) = state.view.get_mut(&fold(channel)) {
                    view.topic = Some(topic.to_string());
                }
            }
            // RPL_NAMREPLY: <me> <sym> <channel> :prefixed nicks
            "353" => {
                let (Some(channel), Some(names)) = (msg.param(2), msg.param(3)) else {
                    return;
                };
                let folded = fold(channel);
                let is_prefix = |c: char| state.isupport.is_prefix_symbol(c);
                if let Some(view) = state.view.get_mut(&folded) {
                    for entry in names.split_whitespace() {
                        let stripped = entry.trim_start_matches(is_prefix);
                        let prefixes = &entry[..entry.len() - stripped.len()];
                        view.members.insert(
                            fold(stripped),
                            (stripped.to_string(), prefixes.to_string()),
                        );
                    }
                }
            }
            "MODE" => {
                let Some(target) = msg.param(0) else { return };
                let folded = fold(target);
                if state.view.contains_key(&folded) {
                    apply_prefix_modes(state, &folded, &msg.params[1..]);
                }
            }
            "CHGHOST" | "AWAY" | "SETNAME" | "ACCOUNT" => {}
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Detachment
    // ------------------------------------------------------------------

    /// Flip a channel's detached flag, persist it, and sync downstreams.
    async fn set_detached(&mut self, network_id: i64, folded: &str, detached: bool) {
        let (record, network_name, own_nick, sync, channel_name) = {
            let Some(state) = self.networks.get_mut(&network_id) else {
                return;
            };
            let Some(channel) = state.channels.get_mut(folded) else {
                return;
            };
            if channel.record.detached == detached {
                return;
            }
            channel.record.detached = detached;
            channel.last_activity = Instant::now();
            (
                channel.record.clone(),
                state.record.display_name().to_string(),
                state.nick.clone(),
                state.view.get(folded).map(|v| v.sync()),
                channel.record.name.clone(),
            )
        };

        let mut record = record;
        if let Err(e) = self.db.store_channel(network_id, &mut record).await {
            warn!(error = %e, channel = %channel_name, "failed to persist detach flag");
        }
        if let Some(state) = self.networks.get_mut(&network_id) {
            if let Some(channel) = state.channels.get_mut(folded) {
                channel.record = record;
            }
        }

        if detached {
            info!(user = %self.user.username, channel = %channel_name, "channel detached");
            self.fan_out(
                network_id,
                Delivery::Parted {
                    network_id,
                    network: network_name,
                    own_nick,
                    channel: channel_name,
                },
            )
            .await;
        } else {
            info!(user = %self.user.username, channel = %channel_name, "channel reattached");
            let sync = sync.unwrap_or(ChannelSync {
                channel: channel_name,
                topic: None,
                members: Vec::new(),
            });
            self.fan_out(
                network_id,
                Delivery::Joined {
                    network_id,
                    network: network_name,
                    own_nick,
                    sync,
                },
            )
            .await;
        }
    }

    /// Detach every attached channel whose inactivity window expired.
    async fn detach_sweep(&mut self) {
        let now = Instant::now();
        let mut expired: Vec<(i64, String)> = Vec::new();
        for (network_id, state) in &self.networks {
            for (folded, channel) in &state.channels {
                if channel.record.detached {
                    continue;
                }
                let after = channel.record.detach_after;
                if after.is_zero() {
                    continue;
                }
                if now.duration_since(channel.last_activity) >= after {
                    expired.push((*network_id, folded.clone()));
                }
            }
        }
        for (network_id, folded) in expired {
            self.set_detached(network_id, &folded, true).await;
        }
    }

    /// Record downstream speech in a channel for the detach timer.
    fn record_downstream_activity(&mut self, network_id: i64, target: &str, text: &str) {
        let Some(state) = self.networks.get_mut(&network_id) else {
            return;
        };
        let folded = state.isupport.casemapping.fold(target);
        let casemap = state.isupport.casemapping;
        let nick = state.nick.clone();
        if let Some(channel) = state.channels.get_mut(&folded) {
            let filter = resolve_filter(channel.record.detach_on, FilterRole::DetachOn);
            let probe = Message::privmsg(target, text);
            if filter_matches(filter, &probe, &nick, casemap) {
                channel.last_activity = Instant::now();
            }
        }
    }

    // ------------------------------------------------------------------
    // Client commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, downstream_id: u64, command: ClientCommand) {
        match command {
            ClientCommand::Join {
                network_id,
                channel,
                key,
            } => {
                self.client_join(network_id, channel, key).await;
            }
            ClientCommand::Part {
                network_id,
                channel,
                reason,
            } => {
                self.client_part(network_id, channel, reason).await;
            }
            ClientCommand::Privmsg {
                network_id,
                command,
                target,
                text,
            } => {
                self.client_privmsg(downstream_id, network_id, command, target, text)
                    .await;
            }
            ClientCommand::Nick { nick } => {
                let scope = self
                    .downstreams
                    .get(&downstream_id)
                    .map(|d| d.scope)
                    .unwrap_or(Scope::All);
                let targets: Vec<i64> = self
                    .networks
                    .keys()
                    .copied()
                    .filter(|id| scope.includes(*id))
                    .collect();
                for network_id in targets {
                    if let Some(state) = self.networks.get(&network_id) {
                        state.handle.send(Message::nick(nick.clone())).await;
                    }
                }
            }
            ClientCommand::Raw { network_id, msg } => {
                if let Some(state) = self.networks.get(&network_id) {
                    state.handle.send(msg).await;
                }
            }
        }
    }

    async fn client_join(&mut self, network_id: i64, channel: String, key: Option<String>) {
        let (folded, existing_detached, joined_upstream) = {
            let Some(state) = self.networks.get(&network_id) else {
                return;
            };
            let folded = state.fold(&channel);
            let existing = state.channels.get(&folded);
            (
                folded.clone(),
                existing.map(|c| c.record.detached),
                state.view.contains_key(&folded),
            )
        };

        match existing_detached {
            // Known channel, currently detached: reattach. If we are
            // still joined upstream, state is synthesized locally with
            // no JOIN traffic upstream.
            Some(true) => {
                self.set_detached(network_id, &folded, false).await;
                if !joined_upstream {
                    if let Some(state) = self.networks.get(&network_id) {
                        let key = state
                            .channels
                            .get(&folded)
                            .and_then(|c| c.record.key.clone());
                        state.handle.send(Message::join(channel, key)).await;
                    }
                }
            }
            // Known and attached: make sure we are joined, and resync
            // the requester via the normal attach path.
            Some(false) => {
                if !joined_upstream {
                    if let Some(state) = self.networks.get(&network_id) {
                        state.handle.send(Message::join(channel, key)).await;
                    }
                } else {
                    let delivery = {
                        let state = self.networks.get(&network_id).expect("checked above");
                        state.view.get(&folded).map(|view| Delivery::Joined {
                            network_id,
                            network: state.record.display_name().to_string(),
                            own_nick: state.nick.clone(),
                            sync: view.sync(),
                        })
                    };
                    if let Some(delivery) = delivery {
                        self.fan_out(network_id, delivery).await;
                    }
                }
            }
            // New channel: persist, then join upstream.
            None => {
                let mut record = Channel {
                    name: channel.clone(),
                    key: key.clone(),
                    ..Default::default()
                };
                if let Err(e) = self.db.store_channel(network_id, &mut record).await {
                    warn!(error = %e, channel = %channel, "failed to persist channel");
                    return;
                }
                if let Some(state) = self.networks.get_mut(&network_id) {
                    state.channels.insert(
                        folded,
                        ChannelState {
                            record,
                            last_activity: Instant::now(),
                        },
                    );
                    state.handle.send(Message::join(channel, key)).await;
                }
            }
        }
    }

    async fn client_part(&mut self, network_id: i64, channel: String, reason: Option<String>) {
        let (folded, channel_id) = {
            let Some(state) = self.networks.get(&network_id) else {
                return;
            };
            let folded = state.fold(&channel);
            let id = state.channels.get(&folded).map(|c| c.record.id);
            (folded, id)
        };

        if let Some(state) = self.networks.get(&network_id) {
            state.handle.send(Message::part(channel, reason)).await;
        }
        // PART means forget: the channel row goes away.
        if let Some(id) = channel_id {
            if let Err(e) = self.db.delete_channel(id).await {
                warn!(error = %e, "failed to delete channel");
            }
            if let Some(state) = self.networks.get_mut(&network_id) {
                state.channels.remove(&folded);
            }
        }
    }

    async fn client_privmsg(
        &mut self,
        downstream_id: u64,
        network_id: i64,
        command: String,
        target: String,
        text: String,
    ) {
        self.record_downstream_activity(network_id, &target, &text);

        let (upstream_echoes, network_name, nick) = {
            let Some(state) = self.networks.get(&network_id) else {
                return;
            };
            (
                state.caps.contains("echo-message"),
                state.record.display_name().to_string(),
                state.nick.clone(),
            )
        };

        if let Some(state) = self.networks.get(&network_id) {
            state
                .handle
                .send(Message::new(
                    command.clone(),
                    vec![target.clone(), text.clone()],
                ))
                .await;
        }

        if upstream_echoes {
            // The server will echo; remember who to attribute it to.
            let folded = self
                .networks
                .get(&network_id)
                .map(|s| s.fold(&target))
                .unwrap_or_else(|| target.clone());
            self.pending_echo
                .push_back((network_id, downstream_id, folded, text));
            if self.pending_echo.len() > 64 {
                self.pending_echo.pop_front();
            }
        } else {
            // Synthesize the echo ourselves.
            let mut echo = Message::new(command, vec![target, text]);
            echo.source = Some(Source::new(nick));
            let stamp = chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string();
            echo.tags.push(Tag {
                key: "time".to_string(),
                value: Some(stamp),
            });
            self.fan_out(
                network_id,
                Delivery::Upstream {
                    network_id,
                    network: network_name,
                    msg: echo,
                    echo_origin: Some(downstream_id),
                },
            )
            .await;
        }
    }
}

// ----------------------------------------------------------------------
// Service command execution
// ----------------------------------------------------------------------

impl Hub {
    async fn run_service(&mut self, line: &str) -> Vec<String> {
        let command = match service::parse(line) {
            Ok(command) => command,
            Err(e) => return vec![e],
        };
        match command {
            ServiceCommand::Help => service::help_text(),
            ServiceCommand::NetworkCreate(flags) => self.service_network_create(flags).await,
            ServiceCommand::NetworkUpdate { name, flags } => {
                self.service_network_update(&name, flags).await
            }
            ServiceCommand::NetworkDelete { name } => self.service_network_delete(&name).await,
            ServiceCommand::NetworkStatus => self.service_network_status(),
            ServiceCommand::ChannelStatus { network } => {
                self.service_channel_status(network.as_deref())
            }
            ServiceCommand::ChannelUpdate {
                name,
                network,
                flags,
            } => self.service_channel_update(&name, network.as_deref(), flags).await,
            ServiceCommand::UserCreate {
                username,
                password,
                admin,
            } => self.service_user_create(username, password, admin).await,
            ServiceCommand::UserDelete { username } => self.service_user_delete(&username).await,
            ServiceCommand::Reload => {
                if !self.user.admin {
                    return vec!["permission denied: admin only".to_string()];
                }
                let _ = self.server_ops.send(ServerOp::ReloadConfig).await;
                vec!["reloading configuration".to_string()]
            }
        }
    }

    fn find_network(&self, name: &str) -> Option<i64> {
        self.networks
            .values()
            .find(|s| s.record.display_name() == name)
            .map(|s| s.record.id)
    }

    async fn service_network_create(&mut self, flags: NetworkFlags) -> Vec<String> {
        let config = self.config();
        if !config.may_add_network(self.networks.len()) {
            return vec![format!(
                "cannot create network: limit of {} reached",
                config.max_user_networks
            )];
        }

        let mut network = Network {
            id: 0,
            name: flags.name.clone(),
            addr: flags.addr.clone().expect("checked by the parser"),
            nick: flags
                .nick
                .clone()
                .unwrap_or_else(|| self.user.username.clone()),
            username: flags.username.clone(),
            realname: flags.realname.clone(),
            pass: flags.pass.clone(),
            connect_commands: flags.connect_commands.clone(),
            sasl: sasl_from_flags(&flags, None),
        };

        match self.db.store_network(self.user.id, &mut network).await {
            Ok(()) => {
                let display = network.display_name().to_string();
                self.start_upstream(network, Vec::new());
                vec![format!("created network {display}")]
            }
            Err(e) => vec![format!("cannot create network: {e}")],
        }
    }

    async fn service_network_update(&mut self, name: &str, flags: NetworkFlags) -> Vec<String> {
        let Some(network_id) = self.find_network(name) else {
            return vec![format!("no such network {name:?}")];
        };

        let (mut record, channels) = {
            let state = self.networks.get(&network_id).expect("id from find_network");
            (
                state.record.clone(),
                state
                    .channels
                    .values()
                    .map(|c| c.record.clone())
                    .collect::<Vec<_>>(),
            )
        };

        if let Some(addr) = &flags.addr {
            record.addr = addr.clone();
        }
        if let Some(name) = &flags.name {
            record.name = Some(name.clone());
        }
        if let Some(nick) = &flags.nick {
            record.nick = nick.clone();
        }
        if let Some(username) = &flags.username {
            record.username = Some(username.clone());
        }
        if let Some(realname) = &flags.realname {
            record.realname = Some(realname.clone());
        }
        if let Some(pass) = &flags.pass {
            record.pass = Some(pass.clone());
        }
        if !flags.connect_commands.is_empty() {
            record.connect_commands = flags.connect_commands.clone();
        }
        record.sasl = sasl_from_flags(&flags, record.sasl.take());

        if let Err(e) = self.db.store_network(self.user.id, &mut record).await {
            return vec![format!("cannot update network: {e}")];
        }

        let state = self.networks.get_mut(&network_id).expect("id from find_network");
        state.record = record.clone();
        state.handle.reload(record, channels).await;
        vec![format!("updated network {name}")]
    }

    async fn service_network_delete(&mut self, name: &str) -> Vec<String> {
        let Some(network_id) = self.find_network(name) else {
            return vec![format!("no such network {name:?}")];
        };
        if let Err(e) = self.db.delete_network(network_id).await {
            return vec![format!("cannot delete network: {e}")];
        }
        if let Some(state) = self.networks.remove(&network_id) {
            state.handle.stop();
        }
        vec![format!("deleted network {name}")]
    }

    fn service_network_status(&self) -> Vec<String> {
        if self.networks.is_empty() {
            return vec!["no networks configured; use \"network create\"".to_string()];
        }
        let mut lines: Vec<String> = self
            .networks
            .values()
            .map(|state| {
                let mut line = format!(
                    "{} ({}): {}",
                    state.record.display_name(),
                    state.record.addr,
                    state.phase
                );
                if state.phase == UpstreamPhase::Connected {
                    line.push_str(&format!(" as {}", state.nick));
                }
                if let Some(error) = &state.last_error {
                    line.push_str(&format!(" ({error})"));
                }
                line
            })
            .collect();
        lines.sort();
        lines
    }

    fn service_channel_status(&self, network: Option<&str>) -> Vec<String> {
        let mut lines = Vec::new();
        for state in self.networks.values() {
            if let Some(filter) = network {
                if state.record.display_name() != filter {
                    continue;
                }
            }
            for channel in state.channels.values() {
                let mode = if channel.record.detached {
                    "detached"
                } else {
                    "attached"
                };
                lines.push(format!(
                    "{} ({}): {mode}",
                    channel.record.name,
                    state.record.display_name(),
                ));
            }
        }
        if lines.is_empty() {
            lines.push("no channels".to_string());
        }
        lines.sort();
        lines
    }

    async fn service_channel_update(
        &mut self,
        name: &str,
        network: Option<&str>,
        flags: ChannelFlags,
    ) -> Vec<String> {
        // Resolve the owning network: explicit flag, or unambiguous.
        let mut candidates: Vec<(i64, String)> = Vec::new();
        for state in self.networks.values() {
            if let Some(filter) = network {
                if state.record.display_name() != filter {
                    continue;
                }
            }
            let folded = state.fold(name);
            if state.channels.contains_key(&folded) {
                candidates.push((state.record.id, folded));
            }
        }
        let (network_id, folded) = match candidates.as_slice() {
            [] => return vec![format!("no such channel {name:?}")],
            [one] => one.clone(),
            _ => {
                return vec![format!(
                    "channel {name:?} exists on several networks; use -network"
                )]
            }
        };

        let mut record = {
            let state = self.networks.get(&network_id).expect("resolved above");
            state.channels.get(&folded).expect("resolved above").record.clone()
        };
        if let Some(key) = &flags.key {
            record.key = Some(key.clone());
        }
        if let Some(filter) = flags.relay_detached {
            record.relay_detached = filter;
        }
        if let Some(filter) = flags.reattach_on {
            record.reattach_on = filter;
        }
        if let Some(after) = flags.detach_after {
            record.detach_after = after;
        }
        if let Some(filter) = flags.detach_on {
            record.detach_on = filter;
        }

        if let Err(e) = self.db.store_channel(network_id, &mut record).await {
            return vec![format!("cannot update channel: {e}")];
        }
        if let Some(state) = self.networks.get_mut(&network_id) {
            if let Some(channel) = state.channels.get_mut(&folded) {
                channel.record = record;
                channel.last_activity = Instant::now();
            }
        }
        vec![format!("updated channel {name}")]
    }

    async fn service_user_create(
        &mut self,
        username: String,
        password: String,
        admin: bool,
    ) -> Vec<String> {
        if !self.user.admin {
            return vec!["permission denied: admin only".to_string()];
        }
        let hash = match crate::auth::hash_password(password).await {
            Ok(hash) => hash,
            Err(e) => return vec![format!("cannot hash password: {e}")],
        };
        let mut user = User {
            id: 0,
            username: username.clone(),
            password: Some(hash),
            admin,
        };
        match self.db.store_user(&mut user).await {
            Ok(()) => vec![format!("created user {username}")],
            Err(e) => vec![format!("cannot create user: {e}")],
        }
    }

    async fn service_user_delete(&mut self, username: &str) -> Vec<String> {
        if !self.user.admin {
            return vec!["permission denied: admin only".to_string()];
        }
        let user = match self.db.get_user(username).await {
            Ok(user) => user,
            Err(e) => return vec![format!("cannot delete user: {e}")],
        };
        if let Err(e) = self.db.delete_user(user.id).await {
            return vec![format!("cannot delete user: {e}")];
        }
        let _ = self
            .server_ops
            .send(ServerOp::UserDeleted {
                username: username.to_string(),
            })
            .await;
        vec![format!("deleted user {username}")]
    }
}

/// Merge SASL flags into an existing credential block.
fn sasl_from_flags(flags: &NetworkFlags, existing: Option<Sasl>) -> Option<Sasl> {
    match flags.sasl.as_deref() {
        None => existing,
        Some("none") => None,
        Some("plain") => Some(Sasl::Plain {
            username: flags.sasl_username.clone().unwrap_or_default(),
            password: flags.sasl_password.clone().unwrap_or_default(),
        }),
        // The parser rejects anything else.
        Some(_) => existing,
    }
}

/// Membership-prefix MODE changes (+o, +v, ...) applied to the view.
fn apply_prefix_modes(state: &mut NetworkState, folded_channel: &str, params: &[String]) {
    let Some(modestring) = params.first() else {
        return;
    };
    let prefix_table = state.isupport.prefix.clone();
    let casemap = state.isupport.casemapping;
    let Some(view) = state.view.get_mut(folded_channel) else {
        return;
    };

    let mut adding = true;
    let mut args = params[1..].iter();
    for c in modestring.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            mode => {
                let Some((_, symbol)) = prefix_table.iter().find(|(m, _)| *m == mode) else {
                    // Not a membership mode; argument consumption for
                    // arbitrary channel modes is not tracked here.
                    continue;
                };
                let Some(nick) = args.next() else { return };
                if let Some((_, prefixes)) = view.members.get_mut(&casemap.fold(nick)) {
                    if adding {
                        if !prefixes.contains(*symbol) {
                            prefixes.push(*symbol);
                        }
                    } else {
                        prefixes.retain(|c| c != *symbol);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Detachment policy
// ----------------------------------------------------------------------

/// Which config field a filter is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRole {
    DetachOn,
    ReattachOn,
    RelayDetached,
}

/// Resolve `default` to the role's concrete filter.
///
/// Kept as the single seam for future per-user default overrides.
pub fn resolve_filter(filter: MessageFilter, role: FilterRole) -> MessageFilter {
    match filter {
        MessageFilter::Default => match role {
            FilterRole::DetachOn | FilterRole::ReattachOn => MessageFilter::Message,
            FilterRole::RelayDetached => MessageFilter::Highlight,
        },
        other => other,
    }
}

/// Whether `text` contains `nick` as a standalone word under `casemap`.
pub fn is_highlight(text: &str, nick: &str, casemap: CaseMapping) -> bool {
    if nick.is_empty() {
        return false;
    }
    let text = casemap.fold(text);
    let nick = casemap.fold(nick);

    let mut start = 0;
    while let Some(pos) = text[start..].find(&nick) {
        let begin = start + pos;
        let end = begin + nick.len();
        let boundary_before = begin == 0
            || !text[..begin]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let boundary_after = end == text.len()
            || !text[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if boundary_before && boundary_after {
            return true;
        }
        start = begin + 1;
    }
    false
}

/// Whether a resolved filter matches an inbound message.
pub fn filter_matches(
    filter: MessageFilter,
    msg: &Message,
    nick: &str,
    casemap: CaseMapping,
) -> bool {
    let is_chat = matches!(msg.command.as_str(), "PRIVMSG" | "NOTICE");
    match filter {
        MessageFilter::None => false,
        MessageFilter::Message => is_chat,
        MessageFilter::Highlight => {
            is_chat
                && msg
                    .params
                    .get(1)
                    .is_some_and(|text| is_highlight(text, nick, casemap))
        }
        // Resolved before this point; an unresolved default acts like
        // the role-independent conservative choice.
        MessageFilter::Default => is_chat,
    }
}

/// What to do with one channel-targeted upstream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Relay normally.
    Deliver,
    /// Detached and not worth relaying.
    Suppress,
    /// Detached, but the relay filter matched: deliver with marking.
    RelayDetached,
    /// Detached and the reattach filter matched: reattach, then deliver.
    Reattach,
}

/// Decide the fate of a channel message under the channel's policy.
///
/// Deciding twice for the same message yields the same end state: a
/// reattach resets the activity clock, so the second evaluation of the
/// now-attached channel simply delivers.
pub fn policy_decision(
    channel: &Channel,
    msg: &Message,
    nick: &str,
    casemap: CaseMapping,
) -> PolicyDecision {
    if !channel.detached {
        return PolicyDecision::Deliver;
    }
    let reattach = resolve_filter(channel.reattach_on, FilterRole::ReattachOn);
    if filter_matches(reattach, msg, nick, casemap) {
        return PolicyDecision::Reattach;
    }
    let relay = resolve_filter(channel.relay_detached, FilterRole::RelayDetached);
    if filter_matches(relay, msg, nick, casemap) {
        return PolicyDecision::RelayDetached;
    }
    PolicyDecision::Suppress
}
