//! Listener binding and per-connection setup.
//!
//! Binds one socket per configured listen URI and turns each accepted
//! connection into a [`Transport`]: PROXY header (trusted peers only),
//! TLS handshake, WebSocket upgrade, keep-alive, in that order.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as _};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::debug;

use crate::config::{Config, ListenAddr};

use super::proxy_protocol;
use super::tls::TlsSettings;
use super::transport::Transport;

/// Downstream TCP keep-alive. Clients sit idle for a long time; the
/// bouncer should not be the side that gives up.
const KEEPALIVE: Duration = Duration::from_secs(60 * 60);

/// How long a trusted proxy gets to produce its header.
const PROXY_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// What an accepted TCP connection should be wrapped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    Irc,
    Ircs,
    Ws,
    Wss,
}

/// A bound listener socket.
pub enum BoundListener {
    Tcp {
        mode: TcpMode,
        listener: TcpListener,
    },
    Unix {
        listener: UnixListener,
    },
    Ident {
        listener: TcpListener,
    },
}

impl BoundListener {
    /// Bind the socket for one listen URI.
    pub async fn bind(addr: &ListenAddr) -> anyhow::Result<Self> {
        let bound = match addr {
            ListenAddr::Ircs(host) => BoundListener::Tcp {
                mode: TcpMode::Ircs,
                listener: bind_tcp(host).await?,
            },
            ListenAddr::IrcInsecure(host) => BoundListener::Tcp {
                mode: TcpMode::Irc,
                listener: bind_tcp(host).await?,
            },
            ListenAddr::Wss(host) => BoundListener::Tcp {
                mode: TcpMode::Wss,
                listener: bind_tcp(host).await?,
            },
            ListenAddr::WsInsecure(host) => BoundListener::Tcp {
                mode: TcpMode::Ws,
                listener: bind_tcp(host).await?,
            },
            ListenAddr::Unix(path) => BoundListener::Unix {
                listener: bind_unix(path)?,
            },
            ListenAddr::Ident(host) => BoundListener::Ident {
                listener: bind_tcp(host).await?,
            },
        };
        Ok(bound)
    }

    /// The bound TCP address, for ephemeral-port listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundListener::Tcp { listener, .. } | BoundListener::Ident { listener } => {
                listener.local_addr().ok()
            }
            BoundListener::Unix { .. } => None,
        }
    }
}

async fn bind_tcp(host: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(host)
        .await
        .with_context(|| format!("failed to bind {host}"))
}

fn bind_unix(path: &Path) -> anyhow::Result<UnixListener> {
    // A previous run may have left the socket file behind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

/// Wrap an accepted TCP connection according to the listener mode.
///
/// Returns the transport and the effective peer address (the PROXY
/// header source when the raw peer is a trusted proxy).
pub async fn establish_downstream(
    mut stream: TcpStream,
    mut peer: SocketAddr,
    mode: TcpMode,
    tls: Option<&TlsSettings>,
    config: &Config,
) -> anyhow::Result<(Transport, SocketAddr)> {
    if let Err(e) = enable_keepalive(&stream) {
        debug!(error = %e, "failed to enable TCP keepalive");
    }

    if config.is_trusted_proxy(peer.ip()) {
        let header = timeout(PROXY_HEADER_TIMEOUT, proxy_protocol::read_header(&mut stream))
            .await
            .context("timed out reading PROXY header")??;
        if let Some(source) = header {
            debug!(proxy = %peer, source = %source, "PROXY header accepted");
            peer = source;
        }
    }

    let transport = match mode {
        TcpMode::Irc => Transport::tcp(stream),
        TcpMode::Ircs => {
            let Some(tls) = tls else {
                bail!("ircs listener without TLS configuration");
            };
            Transport::tls(tls.irc_acceptor().accept(stream).await?)
        }
        TcpMode::Ws => {
            let ws = accept_websocket(stream, config).await?;
            Transport::websocket(ws)
        }
        TcpMode::Wss => {
            let Some(tls) = tls else {
                bail!("wss listener without TLS configuration");
            };
            let stream = tls.ws_acceptor().accept(stream).await?;
            let ws = accept_websocket(stream, config).await?;
            Transport::websocket_tls(ws)
        }
    };

    Ok((transport, peer))
}

async fn accept_websocket<S>(
    stream: S,
    config: &Config,
) -> anyhow::Result<tokio_tungstenite::WebSocketStream<S>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let callback = |request: &Request, response: Response| {
        let origin = request
            .headers()
            .get("Origin")
            .and_then(|v| v.to_str().ok());
        match origin {
            // Non-browser clients send no Origin; nothing to enforce.
            None => Ok(response),
            Some(origin) => {
                let host = request.headers().get("Host").and_then(|v| v.to_str().ok());
                let same_host = host
                    .map(|h| {
                        origin
                            .strip_prefix("https://")
                            .or_else(|| origin.strip_prefix("http://"))
                            == Some(h)
                    })
                    .unwrap_or(false);
                let allowed = same_host || config.allows_origin(origin);
                if allowed {
                    Ok(response)
                } else {
                    let mut resp = ErrorResponse::new(Some("origin not allowed".into()));
                    *resp.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
                    Err(resp)
                }
            }
        }
    };

    tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("WebSocket handshake failed")
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
    sock.set_tcp_keepalive(&keepalive)
}
