//! In-process bouncer instance for tests.

use std::net::SocketAddr;
use std::time::Duration;

use tetherd::config::{Config, FileConfig, ListenAddr};
use tetherd::db::{Channel, Database, Network, User};
use tetherd::network::gateway::BoundListener;
use tetherd::server::ServerHandle;

/// A bouncer listening on an ephemeral plain-TCP port with an
/// in-memory store.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub db: Database,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(Self::default_config()).await
    }

    pub fn default_config() -> Config {
        let mut config = FileConfig::default()
            .build_snapshot(false)
            .expect("default config");
        config.hostname = "bnc.test".to_string();
        config
    }

    pub async fn start_with(config: Config) -> Self {
        let db = Database::open(":memory:").await.expect("open store");
        let (handle, ops_rx) = ServerHandle::new(db.clone(), config, None);

        let listener = BoundListener::bind(&ListenAddr::IrcInsecure("127.0.0.1:0".into()))
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("ephemeral addr");

        {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle.serve(listener, None).await;
            });
        }
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle.run_ops(ops_rx, || {}).await;
            });
        }

        TestServer { addr, handle, db }
    }

    /// Create a user with a hashed password.
    pub async fn add_user(&self, username: &str, password: &str, admin: bool) -> User {
        let hash = tetherd::auth::hash_password(password.to_string())
            .await
            .expect("hash password");
        let mut user = User {
            id: 0,
            username: username.to_string(),
            password: Some(hash),
            admin,
        };
        self.db.store_user(&mut user).await.expect("store user");
        user
    }

    /// Create a plain-TCP network record pointing at `addr`.
    pub async fn add_network(
        &self,
        user_id: i64,
        name: &str,
        addr: SocketAddr,
        nick: &str,
    ) -> Network {
        let mut network = Network {
            id: 0,
            name: Some(name.to_string()),
            addr: format!("irc+insecure://{addr}"),
            nick: nick.to_string(),
            ..Default::default()
        };
        self.db
            .store_network(user_id, &mut network)
            .await
            .expect("store network");
        network
    }

    pub async fn add_channel(&self, network_id: i64, mut channel: Channel) -> Channel {
        self.db
            .store_channel(network_id, &mut channel)
            .await
            .expect("store channel");
        channel
    }

    /// Let background tasks make progress.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
