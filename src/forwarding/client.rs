use std::{sync::Arc, time::Duration};

use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tonic::{
    Status,
    transport::{Channel, Endpoint, Uri},
};
use tracing::{debug, warn};

use super::proto::{
    EchoReply, EchoRequest, ForwardedRequest, ForwardedResponse,
    request_forwarding_client::RequestForwardingClient,
};
use crate::{
    cluster::{ClusterClient, Dialer},
    cluster_identity::{ClusterIdentity, ClusterIdentityHolder},
    metrics,
};

/// TLS identity the standby presents when dialing the active node.
///
/// All cluster members share one key pair, so the certificate we present is also the only
/// one we trust.
pub struct ForwardingClusterClient {
    identity: Arc<ClusterIdentityHolder>,
}

impl ForwardingClusterClient {
    pub fn new(identity: Arc<ClusterIdentityHolder>) -> Self {
        Self { identity }
    }
}

impl ClusterClient for ForwardingClusterClient {
    fn client_lookup(&self, acceptable_issuers: &[&[u8]]) -> Option<Arc<ClusterIdentity>> {
        // A mismatch means the cluster identity rotated under us: decline so the handshake
        // fails and the next refresh reconnects with the current one.
        self.identity
            .current()
            .filter(|identity| identity.issued_by_any(acceptable_issuers))
    }

    fn server_name(&self) -> String {
        self.identity
            .current()
            .map(|identity| identity.common_name().to_string())
            .unwrap_or_default()
    }

    fn ca_cert(&self) -> Option<CertificateDer<'static>> {
        self.identity
            .current()
            .map(|identity| identity.certificate().clone())
    }
}

/// Opens the gRPC channel to the active node through the cluster listener's dialer.
pub async fn connect(
    authority: &str,
    dialer: Dialer,
    keep_alive: Duration,
) -> Result<Channel, tonic::transport::Error> {
    // Plain h2 on top of a stream the dialer already secured.
    let endpoint = Endpoint::from_shared(format!("http://{authority}"))?
        .http2_keep_alive_interval(keep_alive)
        .keep_alive_while_idle(true);

    let addr = authority.to_string();
    endpoint
        .connect_with_connector(tower::service_fn(move |_uri: Uri| {
            let dialer = dialer.clone();
            let addr = addr.clone();
            async move {
                let conn = dialer(addr).await?;
                Ok::<_, std::io::Error>(TokioIo::new(conn))
            }
        }))
        .await
}

#[derive(Clone)]
pub struct ForwardingClient {
    rpc: RequestForwardingClient<Channel>,
}

impl ForwardingClient {
    pub fn new(channel: Channel) -> Self {
        let rpc = RequestForwardingClient::new(channel)
            .max_decoding_message_size(usize::MAX)
            .max_encoding_message_size(usize::MAX);
        Self { rpc }
    }

    pub async fn forward(&self, req: ForwardedRequest) -> Result<ForwardedResponse, Status> {
        let mut rpc = self.rpc.clone();
        Ok(rpc.forward_request(req).await?.into_inner())
    }

    pub async fn echo(&self, req: EchoRequest) -> Result<EchoReply, Status> {
        let mut rpc = self.rpc.clone();
        Ok(rpc.echo(req).await?.into_inner())
    }

    /// Periodically echoes the active node until `cancel` fires.
    ///
    /// Keeps the channel's keep-alive state fresh and surfaces a dead connection early.
    /// Failures are logged only; the next forward reports them to callers.
    pub fn spawn_heartbeat(
        &self,
        period: Duration,
        cancel: CancellationToken,
        echo: EchoRequest,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failing = false;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let res = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = tokio::time::timeout(period, client.echo(echo.clone())) => res,
                };
                match res {
                    Ok(Ok(_)) => {
                        if failing {
                            debug!("forwarding heartbeat recovered");
                        }
                        failing = false;
                    }
                    Ok(Err(status)) => {
                        metrics::HEARTBEAT_FAILURES_TOTAL.inc();
                        if !failing {
                            warn!(
                                code = ?status.code(),
                                message = status.message(),
                                "forwarding heartbeat failed"
                            );
                        }
                        failing = true;
                    }
                    Err(_elapsed) => {
                        metrics::HEARTBEAT_FAILURES_TOTAL.inc();
                        if !failing {
                            warn!(timeout = ?period, "forwarding heartbeat timed out");
                        }
                        failing = true;
                    }
                }
            }
            debug!("forwarding heartbeat stopped");
        })
    }
}
