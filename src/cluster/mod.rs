//! The shared cluster port.
//!
//! One TLS listener serves every intra-cluster sub-protocol; connections are routed by the
//! ALPN protocol the dialing node offers. Sub-protocols plug in through [`ClusterHandler`]
//! (inbound) and [`ClusterClient`] (outbound) and never touch sockets or handshakes themselves.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{BoxFuture, cluster_identity::ClusterIdentity};

pub mod listener;

pub use listener::{ListenerError, ListenerOptions, TlsClusterListener};

pub trait ClusterStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ClusterStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An established, already authenticated cluster connection.
pub type ClusterConn = Box<dyn ClusterStream>;

/// Opens an outbound connection to `host:port` for one ALPN protocol.
pub type Dialer = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<ClusterConn>> + Send + Sync>;

/// Signals and bookkeeping that come with a handed-off connection.
#[derive(Clone)]
pub struct HandoffContext {
    /// Fires when the whole listener shuts down.
    pub shutdown: CancellationToken,
    /// Fires when the listener wants this particular connection gone.
    pub close: CancellationToken,
    /// Tasks spawned for the connection must be tracked here; the listener waits on it
    /// before reporting itself stopped.
    pub tracker: TaskTracker,
    pub peer_addr: Option<SocketAddr>,
}

/// Inbound side of a sub-protocol.
pub trait ClusterHandler: Send + Sync + 'static {
    /// Identity presented to the dialing node; `None` fails the handshake.
    fn server_lookup(&self) -> Option<Arc<ClusterIdentity>>;

    /// Trust anchors for the dialing node's client certificate.
    fn ca_lookup(&self) -> Vec<CertificateDer<'static>>;

    /// Takes ownership of a handshaken connection. Must not block.
    fn handoff(&self, conn: ClusterConn, ctx: HandoffContext);

    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Outbound side of a sub-protocol.
pub trait ClusterClient: Send + Sync + 'static {
    /// Client certificate for a handshake, given the CA subjects the server accepts.
    fn client_lookup(&self, acceptable_issuers: &[&[u8]]) -> Option<Arc<ClusterIdentity>>;

    fn server_name(&self) -> String;

    fn ca_cert(&self) -> Option<CertificateDer<'static>>;
}

pub trait ClusterListener: Send + Sync + 'static {
    /// Registers `handler` for `alpn`, stopping any handler it replaces.
    fn add_handler(&self, alpn: &str, handler: Arc<dyn ClusterHandler>);

    /// Unregisters and stops the handler for `alpn`. No-op when none is registered.
    fn remove_handler(&self, alpn: &str) -> BoxFuture<'_, ()>;

    fn add_client(&self, alpn: &str, client: Arc<dyn ClusterClient>);

    fn remove_client(&self, alpn: &str);

    fn dialer(&self, alpn: &str) -> Dialer;

    /// How long an accept loop may take to notice shutdown.
    fn accept_drain_interval(&self) -> Duration;
}
