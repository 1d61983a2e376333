//! Standby to active request forwarding.
//!
//! The active node registers a [`ForwardingServer`] on the cluster listener; standbys hold at
//! most one [`ForwardingConnection`] to it and replay client requests over gRPC. Both sides
//! authenticate with the shared cluster identity.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tonic::{Status, transport::Channel};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    cluster::ClusterListener, cluster_identity::ClusterIdentityHolder, config::Config, metrics,
};

pub mod client;
pub mod proto;
pub mod server;
pub mod wire;

pub use client::{ForwardingClient, ForwardingClusterClient};
pub use server::{
    ForwardingServer, ForwardingServerOptions, RequestHandler, StandbyInfo, StandbyRegistry,
};
pub use wire::{ForwardedRemoteAddr, LocalRequest, WireError};

/// ALPN protocol of the forwarding sub-protocol on the cluster port.
pub const REQUEST_FORWARDING_ALPN: &str = "req_fw_sb-act_v1";

/// Standbys silent for this many heartbeat intervals are no longer listed.
const STANDBY_TTL_HEARTBEATS: u32 = 10;

#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub ha_enabled: bool,
    pub heartbeat_interval: Duration,
    /// Reported to the active node with every heartbeat.
    pub node_id: String,
    pub cluster_addr: String,
}

impl ForwarderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ha_enabled: config.ha_enabled,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            node_id: config
                .node_id
                .clone()
                .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4().simple())),
            cluster_addr: config.advertised_cluster_addr(),
        }
    }
}

/// A standby's live link to the active node.
pub struct ForwardingConnection {
    pub remote_address: Url,
    channel: Channel,
    /// Cancelled on teardown; stops the heartbeat.
    cancel: CancellationToken,
    client: ForwardingClient,
    heartbeat_period: Duration,
    heartbeat: JoinHandle<()>,
}

impl fmt::Debug for ForwardingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingConnection")
            .field("remote_address", &self.remote_address.as_str())
            .field("heartbeat_period", &self.heartbeat_period)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum RefreshError {
    InvalidAddress { addr: String, reason: String },
    NoLocalIdentity,
    NoClusterListener,
    Dial(tonic::transport::Error),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidAddress { addr, reason } => {
                write!(f, "error parsing leader cluster address {addr:?}: {reason}")
            }
            Self::NoLocalIdentity => write!(f, "no local cluster identity to dial with"),
            Self::NoClusterListener => write!(f, "no cluster listener to dial through"),
            Self::Dial(err) => write!(f, "error dialing active node: {err}"),
        }
    }
}

impl std::error::Error for RefreshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dial(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ForwardError {
    /// No connection to an active node; callers usually answer the client themselves.
    CannotForward,
    RequestCreation(WireError),
    Rpc(Status),
    InvalidResponse(WireError),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CannotForward => write!(
                f,
                "cannot forward request; no connection or address not known"
            ),
            Self::RequestCreation(err) => write!(f, "error creating forwarding RPC request: {err}"),
            // Detail is logged where the failure happens.
            Self::Rpc(_) => write!(f, "error during forwarding RPC request"),
            Self::InvalidResponse(err) => write!(f, "error reading forwarded response: {err}"),
        }
    }
}

impl std::error::Error for ForwardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RequestCreation(err) | Self::InvalidResponse(err) => Some(err),
            Self::Rpc(status) => Some(status),
            Self::CannotForward => None,
        }
    }
}

/// Owns both forwarding roles of a node.
///
/// Connection state lives behind one async lock: refresh and clear take it for writing
/// (the dial included), forwards take it for reading.
pub struct RequestForwarder {
    options: ForwarderOptions,
    identity: Arc<ClusterIdentityHolder>,
    listener: Option<Arc<dyn ClusterListener>>,
    handler: Arc<dyn RequestHandler>,
    standbys: Arc<StandbyRegistry>,
    connection: RwLock<Option<ForwardingConnection>>,
}

impl RequestForwarder {
    pub fn new(
        options: ForwarderOptions,
        identity: Arc<ClusterIdentityHolder>,
        listener: Option<Arc<dyn ClusterListener>>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            options,
            identity,
            listener,
            handler,
            standbys: Arc::new(StandbyRegistry::default()),
            connection: RwLock::new(None),
        }
    }

    /// Takes the active role: drops any standby connection and starts serving forwarded
    /// requests. No-op without HA or a cluster listener.
    pub async fn start_forwarding(&self) {
        let mut slot = self.connection.write().await;
        self.clear_locked(&mut slot);

        if !self.options.ha_enabled {
            return;
        }
        let Some(listener) = &self.listener else {
            return;
        };

        let server = ForwardingServer::new(
            ForwardingServerOptions {
                ha_enabled: self.options.ha_enabled,
                drain_interval: listener.accept_drain_interval(),
                heartbeat_interval: self.options.heartbeat_interval,
            },
            self.identity.clone(),
            self.handler.clone(),
            self.standbys.clone(),
        );
        listener.add_handler(REQUEST_FORWARDING_ALPN, Arc::new(server));
        info!("request forwarding server started");
    }

    /// Leaves the active role. In-flight forwarded requests are allowed to finish.
    pub async fn stop_forwarding(&self) {
        let Some(listener) = &self.listener else {
            return;
        };
        listener.remove_handler(REQUEST_FORWARDING_ALPN).await;
        debug!("request forwarding server stopped");
    }

    /// Replaces the connection to the active node with one to `active_addr`.
    ///
    /// An empty address only tears the current connection down.
    pub async fn refresh_connection(&self, active_addr: &str) -> Result<(), RefreshError> {
        let mut slot = self.connection.write().await;
        self.clear_locked(&mut slot);

        if active_addr.is_empty() {
            return Ok(());
        }

        let (remote_address, authority) = parse_cluster_addr(active_addr)?;
        if self.identity.current().is_none() {
            return Err(RefreshError::NoLocalIdentity);
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or(RefreshError::NoClusterListener)?;

        listener.add_client(
            REQUEST_FORWARDING_ALPN,
            Arc::new(ForwardingClusterClient::new(self.identity.clone())),
        );

        let period = self.options.heartbeat_interval;
        let dialer = listener.dialer(REQUEST_FORWARDING_ALPN);
        let channel = match client::connect(&authority, dialer, period * 2).await {
            Ok(channel) => channel,
            Err(err) => {
                listener.remove_client(REQUEST_FORWARDING_ALPN);
                error!(addr = %remote_address, %err, "error dialing active node for forwarding");
                return Err(RefreshError::Dial(err));
            }
        };

        let cancel = CancellationToken::new();
        let client = ForwardingClient::new(channel.clone());
        let heartbeat = client.spawn_heartbeat(
            period,
            cancel.clone(),
            proto::EchoRequest {
                message: "ping".to_string(),
                cluster_addr: self.options.cluster_addr.clone(),
                node_id: self.options.node_id.clone(),
            },
        );

        info!(addr = %remote_address, "connected to active node for request forwarding");
        *slot = Some(ForwardingConnection {
            remote_address,
            channel,
            cancel,
            client,
            heartbeat_period: period,
            heartbeat,
        });
        Ok(())
    }

    pub async fn clear_connection(&self) {
        let mut slot = self.connection.write().await;
        self.clear_locked(&mut slot);
    }

    fn clear_locked(&self, slot: &mut Option<ForwardingConnection>) {
        let Some(conn) = slot.take() else {
            return;
        };
        conn.cancel.cancel();
        if let Some(listener) = &self.listener {
            listener.remove_client(REQUEST_FORWARDING_ALPN);
        }
        // The heartbeat exits on the cancelled token; the channel closes once its last
        // clone is dropped.
        drop(conn.heartbeat);
        drop(conn.channel);
        debug!(addr = %conn.remote_address, "request forwarding connection cleared");
    }

    /// Replays `local` on the active node and returns its response.
    pub async fn forward(
        &self,
        local: &LocalRequest,
    ) -> Result<http::Response<Bytes>, ForwardError> {
        // Held for the whole call so a reconfiguration waits for in-flight forwards.
        let slot = self.connection.read().await;
        let conn = slot.as_ref().ok_or(ForwardError::CannotForward)?;

        let freq = wire::generate_forwarded_request(local).map_err(|err| {
            error!(%err, "error creating forwarding RPC request");
            ForwardError::RequestCreation(err)
        })?;

        let timer = metrics::FORWARD_SECONDS.start_timer();
        let res = conn.client.forward(freq).await;
        timer.observe_duration();

        let resp = res.map_err(|status| {
            metrics::FORWARD_ERRORS_TOTAL.inc();
            error!(
                code = ?status.code(),
                message = status.message(),
                "error during forwarded RPC request"
            );
            ForwardError::Rpc(status)
        })?;
        wire::decode_response(resp).map_err(|err| {
            metrics::FORWARD_ERRORS_TOTAL.inc();
            warn!(%err, "invalid forwarded response");
            ForwardError::InvalidResponse(err)
        })
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    pub async fn remote_address(&self) -> Option<Url> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|conn| conn.remote_address.clone())
    }

    /// Standbys that heartbeated this node recently, ordered by cluster address.
    pub fn known_standbys(&self) -> Vec<StandbyInfo> {
        self.standbys
            .active_within(self.options.heartbeat_interval * STANDBY_TTL_HEARTBEATS)
    }
}

/// Splits a cluster URL into the parsed URL and the `host:port` to dial.
fn parse_cluster_addr(addr: &str) -> Result<(Url, String), RefreshError> {
    let invalid = |reason: String| RefreshError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };
    let url = Url::parse(addr).map_err(|err| invalid(err.to_string()))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| invalid("missing host".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port".to_string()))?;
    let authority = format!("{host}:{port}");
    Ok((url, authority))
}
