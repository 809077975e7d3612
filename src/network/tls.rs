//! TLS material: server-side keypair with hot reload, client-side
//! connector for dialing upstreams.

use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::ConfigError;

/// Server configs built from one keypair load. ircs listeners advertise
/// ALPN `irc`; WebSocket listeners leave ALPN to the HTTP stack.
pub struct TlsMaterial {
    irc: Arc<ServerConfig>,
    ws: Arc<ServerConfig>,
}

impl TlsMaterial {
    /// Load a PEM keypair from disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ConfigError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut irc = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| {
                ConfigError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
        irc.alpn_protocols = vec![b"irc".to_vec()];

        let ws = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                ConfigError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;

        Ok(TlsMaterial {
            irc: Arc::new(irc),
            ws: Arc::new(ws),
        })
    }
}

/// Pointer-swapped TLS keypair shared by all TLS listeners. Reload
/// publishes new configs; in-flight handshakes keep the old ones.
#[derive(Clone)]
pub struct TlsSettings {
    inner: Arc<RwLock<Arc<TlsMaterial>>>,
}

impl TlsSettings {
    pub fn new(material: TlsMaterial) -> Self {
        TlsSettings {
            inner: Arc::new(RwLock::new(Arc::new(material))),
        }
    }

    /// Swap in a freshly loaded keypair.
    pub fn reload(&self, material: TlsMaterial) {
        *self.inner.write().expect("tls lock poisoned") = Arc::new(material);
    }

    /// Acceptor for ircs listeners (ALPN `irc`).
    pub fn irc_acceptor(&self) -> TlsAcceptor {
        let material = self.inner.read().expect("tls lock poisoned").clone();
        TlsAcceptor::from(material.irc.clone())
    }

    /// Acceptor for wss listeners.
    pub fn ws_acceptor(&self) -> TlsAcceptor {
        let material = self.inner.read().expect("tls lock poisoned").clone();
        TlsAcceptor::from(material.ws.clone())
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no certificates in {}", path.display()),
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no private key in {}", path.display()),
        ))
    })
}

/// Connector for dialing upstream servers. When DER client credentials
/// are supplied (SASL EXTERNAL), the certificate is presented during the
/// handshake.
pub fn upstream_connector(
    client_cert: Option<(Vec<u8>, Vec<u8>)>,
) -> Result<TlsConnector, std::io::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match client_cert {
        Some((cert, key)) => {
            let cert = CertificateDer::from(cert);
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key));
            builder
                .with_client_auth_cert(vec![cert], key)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}
