//! Persistent store for users, networks, and channels.
//!
//! Backed by a single-file SQLite database through sqlx. Reads run under
//! a shared lock, writes and the schema upgrade under an exclusive lock;
//! the pool is pinned to one connection so a transaction can never
//! interleave with another writer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// How long a store operation may wait for the connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Store errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The on-disk schema was produced by a newer build.
    #[error("schema version {stored} is newer than supported version {supported}")]
    SchemaTooNew { stored: i64, supported: i64 },

    #[error("migration #{index} failed: {source}")]
    Migration {
        index: usize,
        #[source]
        source: sqlx::Error,
    },

    /// A write violated a uniqueness invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported SASL mechanism: {0}")]
    UnsupportedSasl(String),
}

/// A bouncer account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Argon2 hash; `None` disables password login.
    pub password: Option<String>,
    pub admin: bool,
}

/// SASL credentials for an upstream network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sasl {
    Plain { username: String, password: String },
    External { cert: Vec<u8>, key: Vec<u8> },
}

impl Sasl {
    pub fn mechanism(&self) -> &'static str {
        match self {
            Sasl::Plain { .. } => "PLAIN",
            Sasl::External { .. } => "EXTERNAL",
        }
    }
}

/// One upstream binding owned by a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub id: i64,
    /// Display name; unique per user when set.
    pub name: Option<String>,
    /// Server address, `host:port` with an optional scheme.
    pub addr: String,
    pub nick: String,
    pub username: Option<String>,
    pub realname: Option<String>,
    pub pass: Option<String>,
    /// Raw lines sent verbatim after registration.
    pub connect_commands: Vec<String>,
    pub sasl: Option<Sasl>,
}

impl Network {
    /// The name shown to the user: explicit name, or the address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.addr)
    }
}

/// Predicate over inbound messages used by the detachment policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageFilter {
    /// Context-dependent default, resolved at evaluation time.
    #[default]
    Default,
    /// Never matches.
    None,
    /// Matches messages containing the current nick as a word.
    Highlight,
    /// Matches any PRIVMSG or NOTICE.
    Message,
}

impl MessageFilter {
    fn from_i64(v: i64) -> Self {
        match v {
            1 => MessageFilter::None,
            2 => MessageFilter::Highlight,
            3 => MessageFilter::Message,
            _ => MessageFilter::Default,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            MessageFilter::Default => 0,
            MessageFilter::None => 1,
            MessageFilter::Highlight => 2,
            MessageFilter::Message => 3,
        }
    }

    /// Parse a user-facing filter name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(MessageFilter::Default),
            "none" => Some(MessageFilter::None),
            "highlight" => Some(MessageFilter::Highlight),
            "message" => Some(MessageFilter::Message),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageFilter::Default => "default",
            MessageFilter::None => "none",
            MessageFilter::Highlight => "highlight",
            MessageFilter::Message => "message",
        }
    }
}

/// Persistent per-network channel configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub key: Option<String>,
    pub detached: bool,
    pub relay_detached: MessageFilter,
    pub reattach_on: MessageFilter,
    /// Zero disables the detach-after policy.
    pub detach_after: Duration,
    pub detach_on: MessageFilter,
}

const INIT_SCHEMA: &str = r#"
CREATE TABLE User (
    id INTEGER PRIMARY KEY,
    username VARCHAR(255) NOT NULL UNIQUE,
    password VARCHAR(255),
    admin INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE Network (
    id INTEGER PRIMARY KEY,
    name VARCHAR(255),
    user INTEGER NOT NULL,
    addr VARCHAR(255) NOT NULL,
    nick VARCHAR(255) NOT NULL,
    username VARCHAR(255),
    realname VARCHAR(255),
    pass VARCHAR(255),
    connect_commands VARCHAR(1023),
    sasl_mechanism VARCHAR(255),
    sasl_plain_username VARCHAR(255),
    sasl_plain_password VARCHAR(255),
    sasl_external_cert BLOB DEFAULT NULL,
    sasl_external_key BLOB DEFAULT NULL,
    FOREIGN KEY(user) REFERENCES User(id),
    UNIQUE(user, addr, nick),
    UNIQUE(user, name)
);

CREATE TABLE Channel (
    id INTEGER PRIMARY KEY,
    network INTEGER NOT NULL,
    name VARCHAR(255) NOT NULL,
    key VARCHAR(255),
    detached INTEGER NOT NULL DEFAULT 0,
    relay_detached INTEGER NOT NULL DEFAULT 0,
    reattach_on INTEGER NOT NULL DEFAULT 0,
    detach_after INTEGER NOT NULL DEFAULT 0,
    detach_on INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(network) REFERENCES Network(id),
    UNIQUE(network, name)
);
"#;

/// Forward migrations, applied in order as opaque SQL. Index 0 is
/// reserved: a fresh database gets [`INIT_SCHEMA`] instead. The stored
/// `user_version` equals the number of entries once upgraded.
const MIGRATIONS: &[&str] = &[
    "", // reserved for schema initialization
    "ALTER TABLE Network ADD COLUMN connect_commands VARCHAR(1023)",
    "ALTER TABLE Channel ADD COLUMN detached INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE Network ADD COLUMN sasl_external_cert BLOB DEFAULT NULL",
    "ALTER TABLE Network ADD COLUMN sasl_external_key BLOB DEFAULT NULL",
    "ALTER TABLE User ADD COLUMN admin INTEGER NOT NULL DEFAULT 0",
    r#"
    CREATE TABLE UserNew (
        id INTEGER PRIMARY KEY,
        username VARCHAR(255) NOT NULL UNIQUE,
        password VARCHAR(255),
        admin INTEGER NOT NULL DEFAULT 0
    );
    INSERT INTO UserNew SELECT rowid, username, password, admin FROM User;
    DROP TABLE User;
    ALTER TABLE UserNew RENAME TO User;
    "#,
    r#"
    CREATE TABLE NetworkNew (
        id INTEGER PRIMARY KEY,
        name VARCHAR(255),
        user INTEGER NOT NULL,
        addr VARCHAR(255) NOT NULL,
        nick VARCHAR(255) NOT NULL,
        username VARCHAR(255),
        realname VARCHAR(255),
        pass VARCHAR(255),
        connect_commands VARCHAR(1023),
        sasl_mechanism VARCHAR(255),
        sasl_plain_username VARCHAR(255),
        sasl_plain_password VARCHAR(255),
        sasl_external_cert BLOB DEFAULT NULL,
        sasl_external_key BLOB DEFAULT NULL,
        FOREIGN KEY(user) REFERENCES User(id),
        UNIQUE(user, addr, nick),
        UNIQUE(user, name)
    );
    INSERT INTO NetworkNew
        SELECT Network.id, name, User.id as user, addr, nick,
            Network.username, realname, pass, connect_commands,
            sasl_mechanism, sasl_plain_username, sasl_plain_password,
            sasl_external_cert, sasl_external_key
        FROM Network
        JOIN User ON Network.user = User.username;
    DROP TABLE Network;
    ALTER TABLE NetworkNew RENAME TO Network;
    "#,
    r#"
    ALTER TABLE Channel ADD COLUMN relay_detached INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE Channel ADD COLUMN reattach_on INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE Channel ADD COLUMN detach_after INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE Channel ADD COLUMN detach_on INTEGER NOT NULL DEFAULT 0;
    "#,
];

/// Store handle. Cheap to clone; all clones share the lock.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    lock: Arc<RwLock<()>>,
}

impl Database {
    /// Open (creating if missing) and upgrade the database at `source`.
    pub async fn open(source: &str) -> Result<Self, DbError> {
        let options = if source == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            if let Some(parent) = Path::new(source).parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            SqliteConnectOptions::new()
                .filename(source)
                .create_if_missing(true)
        };

        // One connection: the exclusive-writer contract must hold even
        // inside multi-statement transactions.
        // The single connection must never be recycled: an in-memory
        // database lives and dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database {
            pool,
            lock: Arc::new(RwLock::new(())),
        };
        db.upgrade().await?;
        info!(source = %source, "store opened");
        Ok(db)
    }

    /// Bring the schema up to the current version.
    async fn upgrade(&self) -> Result<(), DbError> {
        let _guard = self.lock.write().await;

        let stored: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        let supported = MIGRATIONS.len() as i64;

        if stored == supported {
            return Ok(());
        }
        if stored > supported {
            return Err(DbError::SchemaTooNew { stored, supported });
        }

        let mut tx = self.pool.begin().await?;
        if stored == 0 {
            sqlx::raw_sql(INIT_SCHEMA)
                .execute(&mut *tx)
                .await
                .map_err(|source| DbError::Migration { index: 0, source })?;
        } else {
            for (index, migration) in MIGRATIONS.iter().enumerate().skip(stored as usize) {
                sqlx::raw_sql(migration)
                    .execute(&mut *tx)
                    .await
                    .map_err(|source| DbError::Migration { index, source })?;
            }
        }
        sqlx::raw_sql(&format!("PRAGMA user_version = {supported}"))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(from = stored, to = supported, "schema upgraded");
        Ok(())
    }

    /// Close the store, waiting for the connection to drain.
    pub async fn close(&self) {
        let _guard = self.lock.write().await;
        self.pool.close().await;
    }

    pub async fn list_users(&self) -> Result<Vec<User>, DbError> {
        let _guard = self.lock.read().await;
        let rows = sqlx::query_as::<_, (i64, String, Option<String>, bool)>(
            "SELECT id, username, password, admin FROM User",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, username, password, admin)| User {
                id,
                username,
                password,
                admin,
            })
            .collect())
    }

    pub async fn get_user(&self, username: &str) -> Result<User, DbError> {
        let _guard = self.lock.read().await;
        let row = sqlx::query_as::<_, (i64, Option<String>, bool)>(
            "SELECT id, password, admin FROM User WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        let (id, password, admin) =
            row.ok_or_else(|| DbError::NotFound(format!("user {username:?}")))?;
        Ok(User {
            id,
            username: username.to_string(),
            password,
            admin,
        })
    }

    /// Insert (`id == 0`, assigning the new id) or update a user.
    pub async fn store_user(&self, user: &mut User) -> Result<(), DbError> {
        let _guard = self.lock.write().await;
        if user.id != 0 {
            sqlx::query("UPDATE User SET password = ?, admin = ? WHERE id = ?")
                .bind(&user.password)
                .bind(user.admin)
                .bind(user.id)
                .execute(&self.pool)
                .await?;
        } else {
            let result = sqlx::query("INSERT INTO User(username, password, admin) VALUES (?, ?, ?)")
                .bind(&user.username)
                .bind(&user.password)
                .bind(user.admin)
                .execute(&self.pool)
                .await
                .map_err(|e| map_conflict(e, "username already in use"))?;
            user.id = result.last_insert_rowid();
        }
        Ok(())
    }

    /// Delete a user and everything it owns, atomically.
    pub async fn delete_user(&self, id: i64) -> Result<(), DbError> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"DELETE FROM Channel WHERE id IN (
                SELECT Channel.id FROM Channel
                JOIN Network ON Channel.network = Network.id
                WHERE Network.user = ?
            )"#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM Network WHERE user = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM User WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_networks(&self, user_id: i64) -> Result<Vec<Network>, DbError> {
        let _guard = self.lock.read().await;
        type Row = (
            i64,
            Option<String>,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<Vec<u8>>,
            Option<Vec<u8>>,
        );
        let rows = sqlx::query_as::<_, Row>(
            r#"SELECT id, name, addr, nick, username, realname, pass,
                connect_commands, sasl_mechanism, sasl_plain_username,
                sasl_plain_password, sasl_external_cert, sasl_external_key
            FROM Network WHERE user = ?"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    name,
                    addr,
                    nick,
                    username,
                    realname,
                    pass,
                    connect_commands,
                    mechanism,
                    plain_user,
                    plain_pass,
                    cert,
                    key,
                )| {
                    let sasl = match mechanism.as_deref() {
                        Some("PLAIN") => Some(Sasl::Plain {
                            username: plain_user.unwrap_or_default(),
                            password: plain_pass.unwrap_or_default(),
                        }),
                        Some("EXTERNAL") => Some(Sasl::External {
                            cert: cert.unwrap_or_default(),
                            key: key.unwrap_or_default(),
                        }),
                        _ => None,
                    };
                    Network {
                        id,
                        name,
                        addr,
                        nick,
                        username,
                        realname,
                        pass,
                        connect_commands: connect_commands
                            .map(|s| s.split("\r\n").map(String::from).collect())
                            .unwrap_or_default(),
                        sasl,
                    }
                },
            )
            .collect())
    }

    /// Insert (`id == 0`) or update a network. Storing PLAIN credentials
    /// clears any EXTERNAL blobs and vice versa.
    pub async fn store_network(&self, user_id: i64, network: &mut Network) -> Result<(), DbError> {
        let _guard = self.lock.write().await;

        let connect_commands = if network.connect_commands.is_empty() {
            None
        } else {
            Some(network.connect_commands.join("\r\n"))
        };

        let (mechanism, plain_user, plain_pass, cert, key) = match &network.sasl {
            None => (None, None, None, None, None),
            Some(Sasl::Plain { username, password }) => (
                Some("PLAIN"),
                Some(username.clone()),
                Some(password.clone()),
                None,
                None,
            ),
            Some(Sasl::External { cert, key }) => (
                Some("EXTERNAL"),
                None,
                None,
                Some(cert.clone()),
                Some(key.clone()),
            ),
        };

        if network.id != 0 {
            sqlx::query(
                r#"UPDATE Network
                SET name = ?, addr = ?, nick = ?, username = ?, realname = ?,
                    pass = ?, connect_commands = ?, sasl_mechanism = ?,
                    sasl_plain_username = ?, sasl_plain_password = ?,
                    sasl_external_cert = ?, sasl_external_key = ?
                WHERE id = ?"#,
            )
            .bind(&network.name)
            .bind(&network.addr)
            .bind(&network.nick)
            .bind(&network.username)
            .bind(&network.realname)
            .bind(&network.pass)
            .bind(&connect_commands)
            .bind(mechanism)
            .bind(&plain_user)
            .bind(&plain_pass)
            .bind(&cert)
            .bind(&key)
            .bind(network.id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_conflict(e, "network name or address already in use"))?;
        } else {
            let result = sqlx::query(
                r#"INSERT INTO Network(user, name, addr, nick, username, realname,
                    pass, connect_commands, sasl_mechanism, sasl_plain_username,
                    sasl_plain_password, sasl_external_cert, sasl_external_key)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(user_id)
            .bind(&network.name)
            .bind(&network.addr)
            .bind(&network.nick)
            .bind(&network.username)
            .bind(&network.realname)
            .bind(&network.pass)
            .bind(&connect_commands)
            .bind(mechanism)
            .bind(&plain_user)
            .bind(&plain_pass)
            .bind(&cert)
            .bind(&key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_conflict(e, "network name or address already in use"))?;
            network.id = result.last_insert_rowid();
        }
        Ok(())
    }

    /// Delete a network and its channels, atomically.
    pub async fn delete_network(&self, id: i64) -> Result<(), DbError> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM Channel WHERE network = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM Network WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_channels(&self, network_id: i64) -> Result<Vec<Channel>, DbError> {
        let _guard = self.lock.read().await;
        type Row = (i64, String, Option<String>, bool, i64, i64, i64, i64);
        let rows = sqlx::query_as::<_, Row>(
            r#"SELECT id, name, key, detached, relay_detached, reattach_on,
                detach_after, detach_on
            FROM Channel WHERE network = ?"#,
        )
        .bind(network_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, name, key, detached, relay_detached, reattach_on, detach_after, detach_on)| {
                    Channel {
                        id,
                        name,
                        key,
                        detached,
                        relay_detached: MessageFilter::from_i64(relay_detached),
                        reattach_on: MessageFilter::from_i64(reattach_on),
                        detach_after: Duration::from_secs(detach_after.max(0) as u64),
                        detach_on: MessageFilter::from_i64(detach_on),
                    }
                },
            )
            .collect())
    }

    /// Insert (`id == 0`) or update a channel. `detach_after` is stored
    /// as whole seconds, rounded up.
    pub async fn store_channel(&self, network_id: i64, channel: &mut Channel) -> Result<(), DbError> {
        let _guard = self.lock.write().await;

        let detach_after = channel.detach_after.as_secs_f64().ceil() as i64;

        if channel.id != 0 {
            sqlx::query(
                r#"UPDATE Channel
                SET network = ?, name = ?, key = ?, detached = ?, relay_detached = ?,
                    reattach_on = ?, detach_after = ?, detach_on = ?
                WHERE id = ?"#,
            )
            .bind(network_id)
            .bind(&channel.name)
            .bind(&channel.key)
            .bind(channel.detached)
            .bind(channel.relay_detached.as_i64())
            .bind(channel.reattach_on.as_i64())
            .bind(detach_after)
            .bind(channel.detach_on.as_i64())
            .bind(channel.id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_conflict(e, "channel already exists"))?;
        } else {
            let result = sqlx::query(
                r#"INSERT INTO Channel(network, name, key, detached, relay_detached,
                    reattach_on, detach_after, detach_on)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(network_id)
            .bind(&channel.name)
            .bind(&channel.key)
            .bind(channel.detached)
            .bind(channel.relay_detached.as_i64())
            .bind(channel.reattach_on.as_i64())
            .bind(detach_after)
            .bind(channel.detach_on.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| map_conflict(e, "channel already exists"))?;
            channel.id = result.last_insert_rowid();
        }
        Ok(())
    }

    pub async fn delete_channel(&self, id: i64) -> Result<(), DbError> {
        let _guard = self.lock.write().await;
        sqlx::query("DELETE FROM Channel WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_conflict(e: sqlx::Error, what: &str) -> DbError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return DbError::Conflict(what.to_string());
        }
    }
    DbError::Sqlx(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_memory() -> Database {
        Database::open(":memory:").await.expect("open store")
    }

    fn sample_network() -> Network {
        Network {
            id: 0,
            name: Some("libera".into()),
            addr: "ircs://irc.libera.chat:6697".into(),
            nick: "ada".into(),
            username: Some("ada".into()),
            realname: Some("Ada L.".into()),
            pass: None,
            connect_commands: vec!["MODE ada +i".into()],
            sasl: Some(Sasl::Plain {
                username: "ada".into(),
                password: "hunter2".into(),
            }),
        }
    }

    #[tokio::test]
    async fn user_roundtrip() {
        let db = open_memory().await;
        let mut user = User {
            id: 0,
            username: "ada".into(),
            password: Some("$argon2id$stub".into()),
            admin: true,
        };
        db.store_user(&mut user).await.unwrap();
        assert_ne!(user.id, 0);

        let fetched = db.get_user("ada").await.unwrap();
        assert_eq!(fetched, user);

        let all = db.list_users().await.unwrap();
        assert_eq!(all, vec![user]);
    }

    #[tokio::test]
    async fn get_user_not_found() {
        let db = open_memory().await;
        assert!(matches!(
            db.get_user("ghost").await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let db = open_memory().await;
        let mut a = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut a).await.unwrap();
        let mut b = User {
            username: "ada".into(),
            ..Default::default()
        };
        assert!(matches!(
            db.store_user(&mut b).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn network_roundtrip_preserves_fields() {
        let db = open_memory().await;
        let mut user = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();

        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();
        assert_ne!(network.id, 0);

        let listed = db.list_networks(user.id).await.unwrap();
        assert_eq!(listed, vec![network.clone()]);

        // Update in place keeps the id stable.
        network.nick = "ada_".into();
        db.store_network(user.id, &mut network).await.unwrap();
        let listed = db.list_networks(user.id).await.unwrap();
        assert_eq!(listed[0].nick, "ada_");
        assert_eq!(listed[0].id, network.id);
    }

    #[tokio::test]
    async fn storing_plain_clears_external() {
        let db = open_memory().await;
        let mut user = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();

        let mut network = sample_network();
        network.sasl = Some(Sasl::External {
            cert: vec![1, 2, 3],
            key: vec![4, 5, 6],
        });
        db.store_network(user.id, &mut network).await.unwrap();

        network.sasl = Some(Sasl::Plain {
            username: "ada".into(),
            password: "pw".into(),
        });
        db.store_network(user.id, &mut network).await.unwrap();

        let listed = db.list_networks(user.id).await.unwrap();
        match &listed[0].sasl {
            Some(Sasl::Plain { username, .. }) => assert_eq!(username, "ada"),
            other => panic!("expected PLAIN, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_connect_commands_stored_as_null() {
        let db = open_memory().await;
        let mut user = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();

        let mut network = sample_network();
        network.connect_commands = Vec::new();
        db.store_network(user.id, &mut network).await.unwrap();

        let raw: Option<String> =
            sqlx::query_scalar("SELECT connect_commands FROM Network WHERE id = ?")
                .bind(network.id)
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(raw, None);

        let listed = db.list_networks(user.id).await.unwrap();
        assert!(listed[0].connect_commands.is_empty());
    }

    #[tokio::test]
    async fn channel_roundtrip_and_detach_after_rounding() {
        let db = open_memory().await;
        let mut user = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();

        let mut channel = Channel {
            id: 0,
            name: "#rust".into(),
            key: Some("sekrit".into()),
            detached: true,
            relay_detached: MessageFilter::Highlight,
            reattach_on: MessageFilter::Message,
            detach_after: Duration::from_millis(1500),
            detach_on: MessageFilter::None,
        };
        db.store_channel(network.id, &mut channel).await.unwrap();

        let listed = db.list_channels(network.id).await.unwrap();
        // 1.5s rounds up to 2s on disk.
        assert_eq!(listed[0].detach_after, Duration::from_secs(2));
        assert_eq!(listed[0].relay_detached, MessageFilter::Highlight);
        assert!(listed[0].detached);
    }

    #[tokio::test]
    async fn delete_user_cascades() {
        let db = open_memory().await;
        let mut user = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();
        let mut channel = Channel {
            name: "#rust".into(),
            ..Default::default()
        };
        db.store_channel(network.id, &mut channel).await.unwrap();

        db.delete_user(user.id).await.unwrap();

        assert!(db.list_users().await.unwrap().is_empty());
        assert!(db.list_networks(user.id).await.unwrap().is_empty());
        assert!(db.list_channels(network.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_network_cascades_to_channels() {
        let db = open_memory().await;
        let mut user = User {
            username: "ada".into(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();
        let mut channel = Channel {
            name: "#rust".into(),
            ..Default::default()
        };
        db.store_channel(network.id, &mut channel).await.unwrap();

        db.delete_network(network.id).await.unwrap();
        assert!(db.list_networks(user.id).await.unwrap().is_empty());
        assert!(db.list_channels(network.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schema_too_new_is_rejected() {
        let db = open_memory().await;
        let bumped = MIGRATIONS.len() as i64 + 1;
        sqlx::raw_sql(&format!("PRAGMA user_version = {bumped}"))
            .execute(&db.pool)
            .await
            .unwrap();
        assert!(matches!(
            db.upgrade().await,
            Err(DbError::SchemaTooNew { .. })
        ));
    }

    #[tokio::test]
    async fn upgrade_is_idempotent() {
        let db = open_memory().await;
        db.upgrade().await.unwrap();
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn filter_parse_names() {
        assert_eq!(MessageFilter::parse("highlight"), Some(MessageFilter::Highlight));
        assert_eq!(MessageFilter::parse("bogus"), None);
        assert_eq!(MessageFilter::Message.as_str(), "message");
    }
}
