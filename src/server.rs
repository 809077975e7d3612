//! The process-wide server: hub registry, accept loops, configuration
//! snapshot publication, graceful shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{Database, User};
use crate::downstream;
use crate::hub::{self, HubHandle, ServerOp};
use crate::network::gateway::{establish_downstream, BoundListener};
use crate::network::{ident, IdentRegistry, TlsSettings, Transport};

/// Shared server state.
struct Inner {
    db: Database,
    config_tx: watch::Sender<Arc<Config>>,
    /// Active user hubs, keyed by lowercased username.
    hubs: DashMap<String, HubHandle>,
    ident: Option<Arc<IdentRegistry>>,
    cancel: CancellationToken,
    next_downstream_id: AtomicU64,
    ops_tx: mpsc::Sender<ServerOp>,
}

/// Cloneable handle to the server. Everything the listeners, hubs, and
/// downstream sessions need flows through here.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

impl ServerHandle {
    /// Create the server. Returns the handle and the receiver for
    /// operations hubs escalate (user deletion, config reload).
    pub fn new(
        db: Database,
        config: Config,
        ident: Option<Arc<IdentRegistry>>,
    ) -> (Self, mpsc::Receiver<ServerOp>) {
        let (config_tx, _) = watch::channel(Arc::new(config));
        let (ops_tx, ops_rx) = mpsc::channel(16);
        let handle = ServerHandle {
            inner: Arc::new(Inner {
                db,
                config_tx,
                hubs: DashMap::new(),
                ident,
                cancel: CancellationToken::new(),
                next_downstream_id: AtomicU64::new(1),
                ops_tx,
            }),
        };
        (handle, ops_rx)
    }

    /// The current config snapshot. Taken fresh per operation, never
    /// cached across them.
    pub fn config(&self) -> Arc<Config> {
        self.inner.config_tx.borrow().clone()
    }

    /// Subscribe to snapshot updates (hubs hold one of these).
    pub fn config_rx(&self) -> watch::Receiver<Arc<Config>> {
        self.inner.config_tx.subscribe()
    }

    /// Publish a new snapshot; readers pick it up on their next access.
    pub fn publish_config(&self, config: Config) {
        let _ = self.inner.config_tx.send(Arc::new(config));
        info!("configuration snapshot published");
    }

    pub fn db(&self) -> Database {
        self.inner.db.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn next_downstream_id(&self) -> u64 {
        self.inner.next_downstream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the user's hub, starting it on first attach.
    pub async fn hub_for(&self, user: &User) -> HubHandle {
        let key = user.username.to_lowercase();
        if let Some(handle) = self.inner.hubs.get(&key) {
            return handle.clone();
        }
        info!(user = %user.username, "starting hub");
        let handle = hub::spawn(
            user.clone(),
            self.db(),
            self.config_rx(),
            self.inner.ident.clone(),
            self.inner.ops_tx.clone(),
            &self.inner.cancel,
        );
        self.inner.hubs.insert(key, handle.clone());
        handle
    }

    /// Stop and forget one user's hub, if running.
    pub async fn stop_hub(&self, username: &str) {
        if let Some((_, handle)) = self.inner.hubs.remove(&username.to_lowercase()) {
            info!(user = %username, "stopping hub");
            handle.stop().await;
        }
    }

    /// Graceful shutdown: stop accepting, quit upstreams, close
    /// downstreams, close the store.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let usernames: Vec<String> = self
            .inner
            .hubs
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for username in usernames {
            self.stop_hub(&username).await;
        }
        self.inner.cancel.cancel();
        self.inner.db.close().await;
    }

    /// Run the accept loop for one bound listener until shutdown.
    pub async fn serve(&self, listener: BoundListener, tls: Option<TlsSettings>) {
        let cancel = self.cancel_token();
        match listener {
            BoundListener::Tcp { mode, listener } => loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            let config = server.config();
                            match establish_downstream(stream, peer, mode, tls.as_ref(), &config)
                                .await
                            {
                                Ok((transport, peer)) => {
                                    server.handle_downstream(transport, peer.to_string()).await;
                                }
                                Err(e) => {
                                    warn!(%peer, error = %e, "connection setup failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            },
            BoundListener::Unix { listener } => loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server
                                .handle_downstream(Transport::unix(stream), "unix".to_string())
                                .await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed on unix socket");
                    }
                }
            },
            BoundListener::Ident { listener } => {
                let registry = self
                    .inner
                    .ident
                    .clone()
                    .unwrap_or_else(IdentRegistry::new);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = ident::serve(listener, registry) => {}
                }
            }
        }
    }

    /// Hand one established connection to a downstream session task.
    pub async fn handle_downstream(&self, transport: Transport, peer: String) {
        let id = self.next_downstream_id();
        let cancel = self.inner.cancel.child_token();
        info!(%peer, downstream_id = id, "downstream connected");
        downstream::run(self.clone(), id, transport, peer, cancel).await;
    }

    /// Drain hub-escalated operations. `reload` is invoked for
    /// [`ServerOp::ReloadConfig`]; the binary wires it to the config
    /// file and TLS paths.
    pub async fn run_ops<F>(&self, mut ops_rx: mpsc::Receiver<ServerOp>, mut reload: F)
    where
        F: FnMut() + Send,
    {
        let cancel = self.cancel_token();
        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => break,
                op = ops_rx.recv() => op,
            };
            match op {
                None => break,
                Some(ServerOp::UserDeleted { username }) => {
                    self.stop_hub(&username).await;
                }
                Some(ServerOp::ReloadConfig) => reload(),
            }
        }
    }
}
