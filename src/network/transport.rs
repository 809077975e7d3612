//! Framed IRC transport over TCP, TLS, Unix sockets, and WebSocket.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::Framed;
use tracing::warn;

use tether_proto::{IrcCodec, Message, ProtocolError, MAX_LINE_LEN, MAX_TAGS_LEN};

/// One framed IRC connection, either side of the bouncer.
#[allow(clippy::large_enum_variant)]
pub enum Transport {
    /// Plain TCP.
    Tcp(Framed<TcpStream, IrcCodec>),
    /// Server-side TLS (a downstream client connected over ircs).
    Tls(Framed<ServerTlsStream<TcpStream>, IrcCodec>),
    /// Client-side TLS (the bouncer dialed an upstream over ircs).
    ClientTls(Framed<ClientTlsStream<TcpStream>, IrcCodec>),
    /// Unix stream socket.
    Unix(Framed<UnixStream, IrcCodec>),
    /// Plain WebSocket, one IRC message per text frame.
    WebSocket(Box<WebSocketStream<TcpStream>>),
    /// WebSocket over TLS.
    WebSocketTls(Box<WebSocketStream<ServerTlsStream<TcpStream>>>),
}

impl Transport {
    pub fn tcp(stream: TcpStream) -> Self {
        Transport::Tcp(Framed::new(stream, IrcCodec::new()))
    }

    pub fn tls(stream: ServerTlsStream<TcpStream>) -> Self {
        Transport::Tls(Framed::new(stream, IrcCodec::new()))
    }

    pub fn client_tls(stream: ClientTlsStream<TcpStream>) -> Self {
        Transport::ClientTls(Framed::new(stream, IrcCodec::new()))
    }

    pub fn unix(stream: UnixStream) -> Self {
        Transport::Unix(Framed::new(stream, IrcCodec::new()))
    }

    pub fn websocket(stream: WebSocketStream<TcpStream>) -> Self {
        Transport::WebSocket(Box::new(stream))
    }

    pub fn websocket_tls(stream: WebSocketStream<ServerTlsStream<TcpStream>>) -> Self {
        Transport::WebSocketTls(Box::new(stream))
    }

    /// Read the next message. `Ok(None)` means the peer closed cleanly.
    pub async fn read_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        macro_rules! read_framed {
            ($framed:expr) => {
                match $framed.next().await {
                    Some(Ok(msg)) => Ok(Some(msg)),
                    Some(Err(e)) => Err(e),
                    None => Ok(None),
                }
            };
        }

        match self {
            Transport::Tcp(framed) => read_framed!(framed),
            Transport::Tls(framed) => read_framed!(framed),
            Transport::ClientTls(framed) => read_framed!(framed),
            Transport::Unix(framed) => read_framed!(framed),
            Transport::WebSocket(stream) => read_websocket(stream).await,
            Transport::WebSocketTls(stream) => read_websocket(stream).await,
        }
    }

    /// Write one message, flushing it to the wire.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        match self {
            Transport::Tcp(framed) => framed.send(msg).await,
            Transport::Tls(framed) => framed.send(msg).await,
            Transport::ClientTls(framed) => framed.send(msg).await,
            Transport::Unix(framed) => framed.send(msg).await,
            Transport::WebSocket(stream) => write_websocket(stream, msg).await,
            Transport::WebSocketTls(stream) => write_websocket(stream, msg).await,
        }
    }
}

async fn read_websocket<S>(
    stream: &mut WebSocketStream<S>,
) -> Result<Option<Message>, ProtocolError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if text.len() > MAX_TAGS_LEN + MAX_LINE_LEN {
                    return Err(ProtocolError::LineTooLong {
                        actual: text.len(),
                        limit: MAX_TAGS_LEN + MAX_LINE_LEN,
                    });
                }
                let trimmed = text.trim_end_matches(['\r', '\n']);
                if trimmed.is_empty() {
                    continue;
                }
                return trimmed.parse::<Message>().map(Some);
            }
            Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
            Some(Ok(WsMessage::Binary(_))) => {
                warn!("ignoring binary WebSocket frame");
                continue;
            }
            Some(Err(e)) => {
                return Err(ProtocolError::Io(std::io::Error::other(e)));
            }
        }
    }
}

async fn write_websocket<S>(
    stream: &mut WebSocketStream<S>,
    msg: &Message,
) -> Result<(), ProtocolError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream
        .send(WsMessage::Text(msg.to_string()))
        .await
        .map_err(|e| ProtocolError::Io(std::io::Error::other(e)))
}
