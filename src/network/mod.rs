//! Listener plumbing: socket binding, TLS, WebSocket, PROXY protocol,
//! and the ident responder.
//!
//! Everything here is an adapter in front of the core: it turns an
//! accepted socket into a [`Transport`] plus a peer address and hands it
//! to the server. No IRC state lives in this module.

pub mod gateway;
pub mod ident;
pub mod proxy_protocol;
pub mod tls;
pub mod transport;

pub use gateway::{establish_downstream, BoundListener};
pub use ident::IdentRegistry;
pub use tls::TlsSettings;
pub use transport::Transport;
