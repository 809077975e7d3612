//! tetherd entry point: CLI, logging, listener setup, signal handling.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tetherd::config::{parse_listen_uri, FileConfig, ListenAddr};
use tetherd::db::Database;
use tetherd::network::gateway::BoundListener;
use tetherd::network::tls::TlsMaterial;
use tetherd::network::{IdentRegistry, TlsSettings};
use tetherd::server::ServerHandle;

#[derive(Debug, Parser)]
#[command(name = "tetherd", about = "A persistent IRC bouncer")]
struct Cli {
    /// Listening address (repeatable), e.g. ircs://0.0.0.0:6697
    #[arg(long)]
    listen: Vec<String>,
    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let base_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base_filter)),
        )
        .with_target(true)
        .init();

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FileConfig::default(),
    };
    let snapshot = file_config.build_snapshot(cli.debug)?;

    let mut listen: Vec<String> = file_config.listen.clone();
    listen.extend(cli.listen.iter().cloned());
    if listen.is_empty() {
        listen.push("ircs://".to_string());
    }
    let listen_addrs = listen
        .iter()
        .map(|uri| parse_listen_uri(uri))
        .collect::<Result<Vec<_>, _>>()?;

    if let Err(e) = bump_nofile_limit() {
        warn!(error = %e, "failed to raise the open-file limit");
    }

    // TLS material, shared by every TLS listener and swapped on reload.
    let tls = match &file_config.tls {
        Some(tls_config) => Some(TlsSettings::new(TlsMaterial::load(
            &tls_config.cert_path,
            &tls_config.key_path,
        )?)),
        None => {
            if let Some(addr) = listen_addrs.iter().find(|a| a.needs_tls()) {
                anyhow::bail!("listener {addr} requires a [tls] block in the config");
            }
            None
        }
    };

    let ident = listen_addrs
        .iter()
        .any(|a| matches!(a, ListenAddr::Ident(_)))
        .then(IdentRegistry::new);

    let db = Database::open(&file_config.sql.source)
        .await
        .context("failed to open the store")?;

    let (server, ops_rx) = ServerHandle::new(db, snapshot, ident);

    for addr in &listen_addrs {
        let listener = BoundListener::bind(addr).await?;
        info!(listener = %addr, "listening");
        let server = server.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            server.serve(listener, tls).await;
        });
    }

    // Reload shared by SIGHUP and the admin "reload" command.
    let reload = {
        let server = server.clone();
        let config_path = cli.config.clone();
        let tls = tls.clone();
        let debug = cli.debug;
        move || {
            info!("reloading configuration");
            let loaded = match &config_path {
                Some(path) => FileConfig::load(path),
                None => Ok(FileConfig::default()),
            };
            let loaded = match loaded {
                Ok(loaded) => loaded,
                Err(e) => {
                    error!(error = %e, "config reload failed");
                    return;
                }
            };
            match loaded.build_snapshot(debug) {
                Ok(snapshot) => server.publish_config(snapshot),
                Err(e) => {
                    error!(error = %e, "config reload failed");
                    return;
                }
            }
            if let (Some(tls), Some(tls_config)) = (&tls, &loaded.tls) {
                match TlsMaterial::load(&tls_config.cert_path, &tls_config.key_path) {
                    Ok(material) => tls.reload(material),
                    Err(e) => error!(error = %e, "TLS keypair reload failed"),
                }
            }
        }
    };

    {
        let server = server.clone();
        let reload = reload.clone();
        tokio::spawn(async move {
            server.run_ops(ops_rx, reload).await;
        });
    }

    let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => reload(),
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    server.shutdown().await;
    info!("bye");
    Ok(())
}

/// Raise RLIMIT_NOFILE to its hard cap; a bouncer holds a lot of
/// sockets.
fn bump_nofile_limit() -> std::io::Result<()> {
    unsafe {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        rlim.rlim_cur = rlim.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
