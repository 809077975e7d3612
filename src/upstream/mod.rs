//! Upstream sessions: one task per (user, network) connection.
//!
//! The hub starts an [`UpstreamHandle`] per configured network. The task
//! owns the socket exclusively; the hub talks to it through its command
//! inbox and hears back through the hub event queue.

pub mod backoff;
mod session;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use tether_proto::{Isupport, Message};

use crate::db::{Channel, Network};
use crate::hub::HubEvent;
use crate::network::IdentRegistry;

/// Depth of the hub → upstream command queue. Senders block when it
/// fills; an upstream must not be starved by a fast producer.
const COMMAND_QUEUE_DEPTH: usize = 256;

/// Connection phase, reported to the hub on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPhase {
    Disconnected,
    Dialing,
    Registering,
    Connected,
    Closing,
}

impl std::fmt::Display for UpstreamPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpstreamPhase::Disconnected => "disconnected",
            UpstreamPhase::Dialing => "dialing",
            UpstreamPhase::Registering => "registering",
            UpstreamPhase::Connected => "connected",
            UpstreamPhase::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Events an upstream session emits toward its hub.
#[derive(Debug)]
pub enum UpstreamEvent {
    /// Phase transition, with the cause when it is a failure.
    StateChange {
        phase: UpstreamPhase,
        error: Option<String>,
    },
    /// Registration completed: the nick the server accepted and the
    /// negotiated capability set.
    Registered {
        nick: String,
        caps: BTreeSet<String>,
    },
    /// Fresh ISUPPORT snapshot after a 005 burst.
    Isupport(Box<Isupport>),
    /// Our own nick changed.
    NickChanged(String),
    /// An inbound message for fan-out, `time` tag already stamped.
    Message(Message),
}

/// Commands a hub sends to an upstream session.
#[derive(Debug)]
pub enum UpstreamCommand {
    /// Write one message to the server.
    Send(Message),
    /// Apply an edited network record and channel set.
    Reload {
        network: Network,
        channels: Vec<Channel>,
    },
    /// Quit and stop reconnecting.
    Stop,
}

/// Handle the hub keeps per network.
pub struct UpstreamHandle {
    pub network_id: i64,
    tx: mpsc::Sender<UpstreamCommand>,
    cancel: CancellationToken,
}

impl UpstreamHandle {
    /// Enqueue a message for the server. Blocks when the queue is full.
    pub async fn send(&self, msg: Message) {
        if self.tx.send(UpstreamCommand::Send(msg)).await.is_err() {
            warn!(network_id = self.network_id, "upstream task gone, dropping send");
        }
    }

    pub async fn reload(&self, network: Network, channels: Vec<Channel>) {
        let _ = self
            .tx
            .send(UpstreamCommand::Reload { network, channels })
            .await;
    }

    /// Stop the session: QUIT if connected, cancel any backoff sleep.
    pub fn stop(&self) {
        let _ = self.tx.try_send(UpstreamCommand::Stop);
        self.cancel.cancel();
    }
}

/// Start the session task for one network.
pub fn spawn(
    network: Network,
    channels: Vec<Channel>,
    username: String,
    hub_tx: mpsc::Sender<HubEvent>,
    ident: Option<Arc<IdentRegistry>>,
    parent: &CancellationToken,
) -> UpstreamHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let cancel = parent.child_token();
    let network_id = network.id;

    tokio::spawn(session::run(
        session::SessionConfig {
            network,
            channels,
            username,
        },
        network_id,
        hub_tx,
        ident,
        cancel.clone(),
        rx,
    ));

    UpstreamHandle {
        network_id,
        tx,
        cancel,
    }
}
