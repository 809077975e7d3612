//! Ident (RFC 1413) responder.
//!
//! IRC servers commonly ask the connecting host who owns an outgoing
//! connection. The registry maps (local port, remote port) of live
//! upstream connections to the owning bouncer username; everything else
//! gets `NO-USER`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Registry of live upstream connections for ident lookups.
#[derive(Default)]
pub struct IdentRegistry {
    entries: DashMap<(u16, u16), String>,
}

impl IdentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record an upstream connection owned by `username`.
    pub fn insert(&self, local_port: u16, remote_port: u16, username: &str) {
        self.entries
            .insert((local_port, remote_port), username.to_string());
    }

    /// Drop a record when the upstream connection closes.
    pub fn remove(&self, local_port: u16, remote_port: u16) {
        self.entries.remove(&(local_port, remote_port));
    }

    fn lookup(&self, local_port: u16, remote_port: u16) -> Option<String> {
        self.entries
            .get(&(local_port, remote_port))
            .map(|e| e.clone())
    }
}

/// Serve ident queries until the listener is closed.
pub async fn serve(listener: TcpListener, registry: Arc<IdentRegistry>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "ident accept failed");
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            // One query per connection is the common case; answer until
            // the client goes away.
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = answer(&registry, &line);
                debug!(%peer, query = %line.trim(), reply = %reply, "ident query");
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

fn answer(registry: &IdentRegistry, query: &str) -> String {
    let mut parts = query.split(',');
    let local = parts.next().and_then(|s| s.trim().parse::<u16>().ok());
    let remote = parts.next().and_then(|s| s.trim().parse::<u16>().ok());

    match (local, remote) {
        (Some(local), Some(remote)) => match registry.lookup(local, remote) {
            Some(username) => {
                format!("{local}, {remote} : USERID : UNIX : {username}\r\n")
            }
            None => format!("{local}, {remote} : ERROR : NO-USER\r\n"),
        },
        _ => format!("{} : ERROR : INVALID-PORT\r\n", query.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_known_connection() {
        let registry = IdentRegistry::default();
        registry.insert(50_000, 6697, "ada");
        let reply = answer(&registry, "50000, 6697");
        assert_eq!(reply, "50000, 6697 : USERID : UNIX : ada\r\n");
    }

    #[test]
    fn answers_unknown_connection() {
        let registry = IdentRegistry::default();
        let reply = answer(&registry, "1, 2");
        assert_eq!(reply, "1, 2 : ERROR : NO-USER\r\n");
    }

    #[test]
    fn rejects_garbage() {
        let registry = IdentRegistry::default();
        let reply = answer(&registry, "nonsense");
        assert!(reply.contains("INVALID-PORT"));
    }

    #[test]
    fn remove_clears_entry() {
        let registry = IdentRegistry::default();
        registry.insert(50_000, 6697, "ada");
        registry.remove(50_000, 6697);
        assert!(answer(&registry, "50000, 6697").contains("NO-USER"));
    }
}
