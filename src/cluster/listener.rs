use std::{collections::HashMap, fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::RwLock;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig, SignatureScheme,
    client::ResolvesClientCert,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName},
    server::{Acceptor, WebPkiClientVerifier},
    sign::CertifiedKey,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use super::{
    ClusterClient, ClusterConn, ClusterHandler, ClusterListener, Dialer, HandoffContext,
};
use crate::{BoxFuture, cluster_identity::ClusterIdentity};

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub accept_drain_interval: Duration,
    pub handshake_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            accept_drain_interval: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl ListenerOptions {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            accept_drain_interval: Duration::from_millis(config.accept_drain_ms),
            handshake_timeout: Duration::from_millis(config.dial_timeout_ms),
            dial_timeout: Duration::from_millis(config.dial_timeout_ms),
        }
    }
}

#[derive(Debug)]
pub enum ListenerError {
    Io(io::Error),
    Tls(rustls::Error),
    Verifier(rustls::server::VerifierBuilderError),
    NoHandler { offered: Vec<String> },
    NoServerIdentity { alpn: String },
    NoClient { alpn: String },
    NoCaCert { alpn: String },
    InvalidServerName(String),
    Timeout,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "cluster connection io: {err}"),
            Self::Tls(err) => write!(f, "cluster tls: {err}"),
            Self::Verifier(err) => write!(f, "cluster client verifier: {err}"),
            Self::NoHandler { offered } => {
                write!(f, "no handler registered for offered alpn {offered:?}")
            }
            Self::NoServerIdentity { alpn } => {
                write!(f, "got {alpn} connection but no local cert")
            }
            Self::NoClient { alpn } => write!(f, "no cluster client registered for {alpn}"),
            Self::NoCaCert { alpn } => write!(f, "no ca certificate available for {alpn}"),
            Self::InvalidServerName(name) => write!(f, "invalid cluster server name: {name:?}"),
            Self::Timeout => write!(f, "cluster handshake timed out"),
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Tls(err) => Some(err),
            Self::Verifier(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ListenerError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rustls::Error> for ListenerError {
    fn from(value: rustls::Error) -> Self {
        Self::Tls(value)
    }
}

impl From<rustls::server::VerifierBuilderError> for ListenerError {
    fn from(value: rustls::server::VerifierBuilderError) -> Self {
        Self::Verifier(value)
    }
}

struct HandlerEntry {
    handler: Arc<dyn ClusterHandler>,
    close: CancellationToken,
}

struct ListenerInner {
    local_addr: SocketAddr,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    clients: RwLock<HashMap<String, Arc<dyn ClusterClient>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    provider: Arc<CryptoProvider>,
    opts: ListenerOptions,
}

/// TLS cluster listener with ALPN dispatch.
///
/// Server and client TLS configs are built per handshake from whatever identity the
/// registered handler or client reports at that moment, so rotated identities take effect
/// on the next connection without restarting the listener.
#[derive(Clone)]
pub struct TlsClusterListener {
    inner: Arc<ListenerInner>,
}

impl TlsClusterListener {
    /// Binds `addr` and starts accepting.
    pub async fn bind(addr: SocketAddr, opts: ListenerOptions) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let inner = Arc::new(ListenerInner {
            local_addr,
            handlers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            opts,
        });

        inner.tracker.spawn(accept_loop(inner.clone(), tcp));
        info!(addr = %local_addr, "cluster listener started");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The URL other nodes dial to reach this listener.
    pub fn cluster_addr(&self) -> String {
        format!("https://{}", self.inner.local_addr)
    }

    /// Stops every handler, then the accept loop, and waits for all connection tasks.
    pub async fn stop(&self) {
        let entries: Vec<(String, HandlerEntry)> = self.inner.handlers.write().drain().collect();
        for (alpn, entry) in entries {
            debug!(alpn, "stopping cluster handler");
            entry.handler.stop().await;
            entry.close.cancel();
        }
        self.inner.clients.write().clear();

        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(addr = %self.inner.local_addr, "cluster listener stopped");
    }
}

impl ClusterListener for TlsClusterListener {
    fn add_handler(&self, alpn: &str, handler: Arc<dyn ClusterHandler>) {
        let entry = HandlerEntry {
            handler,
            close: self.inner.shutdown.child_token(),
        };
        let replaced = self.inner.handlers.write().insert(alpn.to_string(), entry);
        debug!(alpn, "cluster handler registered");
        if let Some(old) = replaced {
            self.inner.tracker.spawn(async move {
                old.handler.stop().await;
                old.close.cancel();
            });
        }
    }

    fn remove_handler(&self, alpn: &str) -> BoxFuture<'_, ()> {
        let removed = self.inner.handlers.write().remove(alpn);
        let alpn = alpn.to_string();
        Box::pin(async move {
            let Some(entry) = removed else {
                return;
            };
            entry.handler.stop().await;
            entry.close.cancel();
            debug!(alpn, "cluster handler stopped");
        })
    }

    fn add_client(&self, alpn: &str, client: Arc<dyn ClusterClient>) {
        self.inner.clients.write().insert(alpn.to_string(), client);
    }

    fn remove_client(&self, alpn: &str) {
        self.inner.clients.write().remove(alpn);
    }

    fn dialer(&self, alpn: &str) -> Dialer {
        let inner = self.inner.clone();
        let alpn = alpn.to_string();
        Arc::new(move |addr: String| -> BoxFuture<'static, io::Result<ClusterConn>> {
            let inner = inner.clone();
            let alpn = alpn.clone();
            Box::pin(async move {
                dial(&inner, &alpn, &addr)
                    .await
                    .map_err(|err| match err {
                        ListenerError::Io(err) => err,
                        other => io::Error::other(other),
                    })
            })
        })
    }

    fn accept_drain_interval(&self) -> Duration {
        self.inner.opts.accept_drain_interval
    }
}

async fn accept_loop(inner: Arc<ListenerInner>, tcp: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = tcp.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "cluster listener accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let conn_inner = inner.clone();
        inner.tracker.spawn(async move {
            if let Err(err) = accept_connection(&conn_inner, stream, peer).await {
                debug!(%peer, %err, "cluster connection rejected");
            }
        });
    }
    debug!(addr = %inner.local_addr, "cluster accept loop exited");
}

async fn accept_connection(
    inner: &ListenerInner,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ListenerError> {
    stream.set_nodelay(true)?;
    let handshake = async {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;
        let offered: Vec<String> = start
            .client_hello()
            .alpn()
            .map(|protos| {
                protos
                    .filter_map(|p| std::str::from_utf8(p).ok().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let (alpn, handler, close) = {
            let handlers = inner.handlers.read();
            offered
                .iter()
                .find_map(|alpn| {
                    handlers
                        .get(alpn)
                        .map(|e| (alpn.clone(), e.handler.clone(), e.close.child_token()))
                })
                .ok_or_else(|| ListenerError::NoHandler {
                    offered: offered.clone(),
                })?
        };

        let identity = handler
            .server_lookup()
            .ok_or_else(|| ListenerError::NoServerIdentity { alpn: alpn.clone() })?;
        let config = server_config(inner, &alpn, &identity, handler.ca_lookup())?;
        let tls = start.into_stream(config).await?;
        Ok::<_, ListenerError>((tls, handler, close))
    };

    let (tls, handler, close) = tokio::select! {
        _ = inner.shutdown.cancelled() => return Ok(()),
        res = tokio::time::timeout(inner.opts.handshake_timeout, handshake) => {
            res.map_err(|_| ListenerError::Timeout)??
        }
    };

    handler.handoff(
        Box::new(tls),
        HandoffContext {
            shutdown: inner.shutdown.clone(),
            close,
            tracker: inner.tracker.clone(),
            peer_addr: Some(peer),
        },
    );
    Ok(())
}

fn server_config(
    inner: &ListenerInner,
    alpn: &str,
    identity: &ClusterIdentity,
    cas: Vec<CertificateDer<'static>>,
) -> Result<Arc<ServerConfig>, ListenerError> {
    let mut roots = RootCertStore::empty();
    for ca in cas {
        roots.add(ca)?;
    }
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), inner.provider.clone())
            .build()?;

    let mut config = ServerConfig::builder_with_provider(inner.provider.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![identity.certificate().clone()], identity.private_key())?;
    config.alpn_protocols = vec![alpn.as_bytes().to_vec()];
    Ok(Arc::new(config))
}

async fn dial(inner: &ListenerInner, alpn: &str, addr: &str) -> Result<ClusterConn, ListenerError> {
    let client = inner
        .clients
        .read()
        .get(alpn)
        .cloned()
        .ok_or_else(|| ListenerError::NoClient {
            alpn: alpn.to_string(),
        })?;

    let ca = client.ca_cert().ok_or_else(|| ListenerError::NoCaCert {
        alpn: alpn.to_string(),
    })?;
    let mut roots = RootCertStore::empty();
    roots.add(ca)?;

    let mut config = ClientConfig::builder_with_provider(inner.provider.clone())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_cert_resolver(Arc::new(ClientIdentityResolver {
            client: client.clone(),
        }));
    config.alpn_protocols = vec![alpn.as_bytes().to_vec()];

    let name = client.server_name();
    let server_name =
        ServerName::try_from(name.clone()).map_err(|_| ListenerError::InvalidServerName(name))?;
    let connector = TlsConnector::from(Arc::new(config));

    let connect = async {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        connector.connect(server_name, tcp).await
    };
    let tls = tokio::time::timeout(inner.opts.dial_timeout, connect)
        .await
        .map_err(|_| ListenerError::Timeout)??;
    debug!(addr, alpn, "cluster connection dialed");
    Ok(Box::new(tls))
}

struct ClientIdentityResolver {
    client: Arc<dyn ClusterClient>,
}

impl fmt::Debug for ClientIdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentityResolver").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for ClientIdentityResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.client
            .client_lookup(root_hint_subjects)
            .map(|identity| identity.certified_key())
    }

    fn has_certs(&self) -> bool {
        true
    }
}
