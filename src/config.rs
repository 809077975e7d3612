//! Configuration loading and the runtime snapshot.
//!
//! Two layers: [`FileConfig`] is the TOML file as written on disk
//! (listeners, TLS material, database source, consumed once at startup
//! or reload), and [`Config`] is the
//! immutable runtime snapshot the sessions read. The server publishes a
//! fresh `Arc<Config>` through a watch channel on reload; readers borrow
//! it once per operation and never cache it.

use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported sql driver {0:?} (only \"sqlite3\" is supported)")]
    UnsupportedDriver(String),
    #[error("invalid accept-proxy-ip entry {0:?}")]
    InvalidProxyCidr(String),
    #[error("invalid listen URI {0:?}: {1}")]
    InvalidListenUri(String, String),
    #[error("listener {0:?} requires a tls block")]
    MissingTls(String),
}

/// TLS listener material.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TlsFileConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Database driver and source.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlConfig {
    #[serde(default = "default_sql_driver")]
    pub driver: String,
    #[serde(default = "default_sql_source")]
    pub source: String,
}

fn default_sql_driver() -> String {
    "sqlite3".to_string()
}

fn default_sql_source() -> String {
    "tetherd.db".to_string()
}

impl Default for SqlConfig {
    fn default() -> Self {
        SqlConfig {
            driver: default_sql_driver(),
            source: default_sql_source(),
        }
    }
}

/// The configuration file as written on disk.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub hostname: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub listen: Vec<String>,
    pub tls: Option<TlsFileConfig>,
    #[serde(default)]
    pub sql: SqlConfig,
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub http_origins: Vec<String>,
    #[serde(default)]
    pub accept_proxy_ip: Vec<String>,
    pub max_user_networks: Option<i64>,
    pub multi_upstream: Option<bool>,
    pub motd_path: Option<PathBuf>,
}

impl FileConfig {
    /// Load and parse the TOML file at `path`.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&content)?;
        if config.sql.driver != "sqlite3" {
            return Err(ConfigError::UnsupportedDriver(config.sql.driver));
        }
        Ok(config)
    }

    /// Build the runtime snapshot: resolve the MOTD file and parse the
    /// trusted proxy CIDR list.
    pub fn build_snapshot(&self, debug: bool) -> Result<Config, ConfigError> {
        let motd = match &self.motd_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Some(text.trim_end_matches('\n').to_string())
            }
            None => None,
        };

        let mut accept_proxy_ips = Vec::new();
        for entry in &self.accept_proxy_ip {
            let net = entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::InvalidProxyCidr(entry.clone()))?;
            accept_proxy_ips.push(net);
        }

        Ok(Config {
            hostname: self
                .hostname
                .clone()
                .unwrap_or_else(|| "localhost".to_string()),
            title: self.title.clone(),
            motd,
            log_path: self.log_path.clone(),
            http_origins: self.http_origins.clone(),
            accept_proxy_ips,
            max_user_networks: self.max_user_networks.unwrap_or(-1),
            multi_upstream: self.multi_upstream.unwrap_or(true),
            debug,
        })
    }
}

/// The immutable runtime snapshot consumed by the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname the bouncer identifies as to downstreams.
    pub hostname: String,
    /// Server title shown in the welcome burst.
    pub title: Option<String>,
    /// MOTD text, trailing newline stripped.
    pub motd: Option<String>,
    /// Message log directory, if logging is enabled.
    pub log_path: Option<PathBuf>,
    /// Allowed WebSocket origins (glob patterns). Empty allows none.
    pub http_origins: Vec<String>,
    /// Sources trusted to send a PROXY protocol header.
    pub accept_proxy_ips: Vec<IpNet>,
    /// Per-user network cap; -1 means unlimited.
    pub max_user_networks: i64,
    /// Whether one downstream may see several networks at once.
    pub multi_upstream: bool,
    pub debug: bool,
}

impl Config {
    /// Whether `ip` is inside the trusted proxy set.
    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.accept_proxy_ips.iter().any(|net| net.contains(&ip))
    }

    /// Whether a WebSocket `Origin` header value is acceptable.
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.http_origins
            .iter()
            .any(|pattern| glob_match(pattern, origin))
    }

    /// Whether a user owning `current` networks may add another one.
    pub fn may_add_network(&self, current: usize) -> bool {
        self.max_user_networks < 0 || (current as i64) < self.max_user_networks
    }
}

impl Default for Config {
    fn default() -> Self {
        FileConfig::default()
            .build_snapshot(false)
            .expect("default config is valid")
    }
}

/// A listener endpoint, parsed from its URI form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TLS over TCP, ALPN `irc`.
    Ircs(String),
    /// Plain TCP.
    IrcInsecure(String),
    /// Unix stream socket.
    Unix(PathBuf),
    /// IRC over TLS WebSocket.
    Wss(String),
    /// IRC over plain WebSocket.
    WsInsecure(String),
    /// Ident responder.
    Ident(String),
}

impl ListenAddr {
    /// Whether this listener needs the TLS keypair.
    pub fn needs_tls(&self) -> bool {
        matches!(self, ListenAddr::Ircs(_) | ListenAddr::Wss(_))
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Ircs(addr) => write!(f, "ircs://{addr}"),
            ListenAddr::IrcInsecure(addr) => write!(f, "irc+insecure://{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
            ListenAddr::Wss(addr) => write!(f, "wss://{addr}"),
            ListenAddr::WsInsecure(addr) => write!(f, "ws+insecure://{addr}"),
            ListenAddr::Ident(addr) => write!(f, "ident://{addr}"),
        }
    }
}

/// Append `:port` when the host part carries none.
fn with_default_port(host: &str, port: u16) -> String {
    let has_port = if let Some(end) = host.rfind(']') {
        // Bracketed IPv6 literal; a port sits after the bracket.
        host[end..].contains(':')
    } else {
        host.contains(':')
    };
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else if has_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

/// Parse one entry of the listen list.
pub fn parse_listen_uri(uri: &str) -> Result<ListenAddr, ConfigError> {
    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        // Bare host[:port] is shorthand for ircs://.
        None => ("ircs", uri),
    };

    let err = |msg: &str| ConfigError::InvalidListenUri(uri.to_string(), msg.to_string());

    match scheme {
        "ircs" | "" => Ok(ListenAddr::Ircs(with_default_port(rest, 6697))),
        "irc+insecure" => Ok(ListenAddr::IrcInsecure(with_default_port(rest, 6667))),
        "unix" => {
            if rest.is_empty() || !rest.starts_with('/') {
                return Err(err("unix socket path must be absolute"));
            }
            Ok(ListenAddr::Unix(PathBuf::from(rest)))
        }
        "wss" => Ok(ListenAddr::Wss(with_default_port(rest, 443))),
        "ws+insecure" => Ok(ListenAddr::WsInsecure(with_default_port(rest, 80))),
        "ident" => Ok(ListenAddr::Ident(with_default_port(rest, 113))),
        other => Err(err(&format!("unsupported scheme {other:?}"))),
    }
}

/// Minimal glob: `*` matches any run of characters.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..])),
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}
