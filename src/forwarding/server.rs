use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::server::conn::http2;
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    service::TowerToHyperService,
};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use tokio::{io::AsyncWriteExt as _, time::Instant};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, service::Routes};
use tracing::{debug, warn};

use super::{
    proto::{
        EchoReply, EchoRequest, ForwardedRequest, ForwardedResponse,
        request_forwarding_server::{RequestForwarding, RequestForwardingServer},
    },
    wire,
};
use crate::{
    BoxFuture,
    cluster::{ClusterConn, ClusterHandler, HandoffContext},
    cluster_identity::{ClusterIdentity, ClusterIdentityHolder},
    metrics,
};

/// The local request pipeline the active node uses for its direct clients.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, req: http::Request<Bytes>) -> BoxFuture<'_, http::Response<Bytes>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyInfo {
    pub node_id: String,
    pub cluster_addr: String,
    pub last_seen_at: DateTime<Utc>,
}

/// Standbys seen through heartbeats, keyed by cluster address.
#[derive(Debug, Default)]
pub struct StandbyRegistry {
    seen: Mutex<HashMap<String, (Instant, StandbyInfo)>>,
}

impl StandbyRegistry {
    pub fn record(&self, node_id: &str, cluster_addr: &str) {
        let info = StandbyInfo {
            node_id: node_id.to_string(),
            cluster_addr: cluster_addr.to_string(),
            last_seen_at: Utc::now(),
        };
        self.seen
            .lock()
            .insert(cluster_addr.to_string(), (Instant::now(), info));
    }

    /// Standbys heard from within `ttl`; older entries are dropped.
    pub fn active_within(&self, ttl: Duration) -> Vec<StandbyInfo> {
        let mut seen = self.seen.lock();
        seen.retain(|_, (at, _)| at.elapsed() <= ttl);
        let mut out: Vec<StandbyInfo> = seen.values().map(|(_, info)| info.clone()).collect();
        out.sort_by(|a, b| a.cluster_addr.cmp(&b.cluster_addr));
        out
    }
}

struct ForwardedRequestRpcServer {
    handler: Arc<dyn RequestHandler>,
    standbys: Arc<StandbyRegistry>,
}

#[tonic::async_trait]
impl RequestForwarding for ForwardedRequestRpcServer {
    async fn forward_request(
        &self,
        request: Request<ForwardedRequest>,
    ) -> Result<Response<ForwardedResponse>, Status> {
        let req = wire::parse_forwarded_request(request.into_inner()).map_err(|err| {
            warn!(%err, "error parsing forwarded request");
            Status::invalid_argument(err.to_string())
        })?;
        metrics::SERVER_FORWARDED_REQUESTS_TOTAL.inc();
        debug!(method = %req.method(), path = req.uri().path(), "serving forwarded request");

        let resp = self.handler.handle(req).await;
        let resp = wire::encode_response(resp).map_err(|err| {
            warn!(%err, "error encoding forwarded response");
            Status::internal(err.to_string())
        })?;
        Ok(Response::new(resp))
    }

    async fn echo(&self, request: Request<EchoRequest>) -> Result<Response<EchoReply>, Status> {
        let req = request.into_inner();
        if !req.cluster_addr.is_empty() {
            self.standbys.record(&req.node_id, &req.cluster_addr);
        }
        Ok(Response::new(EchoReply {
            message: "pong".to_string(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct ForwardingServerOptions {
    pub ha_enabled: bool,
    /// Grace period between the stop signal and the hard stop.
    pub drain_interval: Duration,
    pub heartbeat_interval: Duration,
}

/// Serves forwarded requests on the active node.
///
/// Unstarted until registered with a cluster listener; `stop` is terminal and a fresh
/// server must be built to serve again.
pub struct ForwardingServer {
    identity: Arc<ClusterIdentityHolder>,
    routes: Option<Routes>,
    opts: ForwardingServerOptions,
    stop: CancellationToken,
    halt: CancellationToken,
}

impl ForwardingServer {
    pub fn new(
        opts: ForwardingServerOptions,
        identity: Arc<ClusterIdentityHolder>,
        handler: Arc<dyn RequestHandler>,
        standbys: Arc<StandbyRegistry>,
    ) -> Self {
        let routes = opts.ha_enabled.then(|| {
            let svc = RequestForwardingServer::new(ForwardedRequestRpcServer { handler, standbys })
                .max_decoding_message_size(usize::MAX)
                .max_encoding_message_size(usize::MAX);
            Routes::new(svc)
        });

        Self {
            identity,
            routes,
            opts,
            stop: CancellationToken::new(),
            halt: CancellationToken::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.halt.is_cancelled()
    }
}

impl ClusterHandler for ForwardingServer {
    fn server_lookup(&self) -> Option<Arc<ClusterIdentity>> {
        let identity = self.identity.current();
        if identity.is_none() {
            warn!("got forwarding connection but no local cert");
        }
        identity
    }

    fn ca_lookup(&self) -> Vec<CertificateDer<'static>> {
        match self.identity.current() {
            Some(identity) => vec![identity.certificate().clone()],
            None => {
                warn!("forwarding connection client but no local cert");
                Vec::new()
            }
        }
    }

    fn handoff(&self, conn: ClusterConn, ctx: HandoffContext) {
        let Some(routes) = self.routes.clone() else {
            ctx.tracker.spawn(async move {
                let mut conn = conn;
                let _ = conn.shutdown().await;
            });
            return;
        };

        debug!(peer = ?ctx.peer_addr, "got request forwarding connection");

        // Cancelled by whichever side finishes first; the other then exits too.
        let quit = CancellationToken::new();

        let watcher_quit = quit.clone();
        let close = ctx.close.clone();
        let shutdown = ctx.shutdown.clone();
        let halt = self.halt.clone();
        ctx.tracker.spawn(async move {
            tokio::select! {
                _ = watcher_quit.cancelled() => {}
                _ = close.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = halt.cancelled() => {}
            }
            watcher_quit.cancel();
        });

        let stop = self.stop.clone();
        let keep_alive = self.opts.heartbeat_interval * 2;
        ctx.tracker.spawn(async move {
            serve_connection(conn, routes, keep_alive, stop, quit.clone()).await;
            quit.cancel();
        });
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.stop.is_cancelled() {
                return;
            }
            debug!("stopping request forwarding server");
            self.stop.cancel();
            // Let in-flight RPCs and accepts drain before closing connections.
            tokio::time::sleep(self.opts.drain_interval).await;
            self.halt.cancel();
        })
    }
}

async fn serve_connection(
    conn: ClusterConn,
    routes: Routes,
    keep_alive: Duration,
    stop: CancellationToken,
    quit: CancellationToken,
) {
    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder
        .timer(TokioTimer::new())
        .keep_alive_interval(Some(keep_alive));
    let served = builder.serve_connection(TokioIo::new(conn), TowerToHyperService::new(routes));
    tokio::pin!(served);

    let mut draining = false;
    loop {
        tokio::select! {
            res = served.as_mut() => {
                if let Err(err) = res {
                    debug!(%err, "request forwarding connection ended with error");
                }
                return;
            }
            _ = stop.cancelled(), if !draining => {
                draining = true;
                served.as_mut().graceful_shutdown();
            }
            _ = quit.cancelled() => {
                debug!("closing request forwarding connection");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt as _;
    use tokio_util::task::TaskTracker;

    struct Unused;

    impl RequestHandler for Unused {
        fn handle(&self, _req: http::Request<Bytes>) -> BoxFuture<'_, http::Response<Bytes>> {
            Box::pin(async { http::Response::new(Bytes::new()) })
        }
    }

    fn server(ha_enabled: bool) -> ForwardingServer {
        ForwardingServer::new(
            ForwardingServerOptions {
                ha_enabled,
                drain_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_secs(1),
            },
            Arc::new(ClusterIdentityHolder::new()),
            Arc::new(Unused),
            Arc::new(StandbyRegistry::default()),
        )
    }

    #[test]
    fn standby_registry_expires_entries() {
        let registry = StandbyRegistry::default();
        registry.record("node-b", "https://10.0.0.2:8201");
        registry.record("node-a", "https://10.0.0.1:8201");

        let active = registry.active_within(Duration::from_secs(60));
        let addrs: Vec<&str> = active.iter().map(|s| s.cluster_addr.as_str()).collect();
        assert_eq!(addrs, vec!["https://10.0.0.1:8201", "https://10.0.0.2:8201"]);
        assert_eq!(active[0].node_id, "node-a");

        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.active_within(Duration::from_millis(5)).is_empty());
        assert!(registry.active_within(Duration::from_secs(60)).is_empty());
    }

    #[tokio::test]
    async fn stop_is_terminal_and_idempotent() {
        let server = server(true);
        assert!(!server.is_stopped());
        assert!(server.server_lookup().is_none());
        assert!(server.ca_lookup().is_empty());

        server.stop().await;
        assert!(server.is_stopped());
        server.stop().await;
        assert!(server.is_stopped());
    }

    #[tokio::test]
    async fn handoff_without_ha_closes_the_connection() {
        let server = server(false);
        assert!(server.routes.is_none());

        let (mut local, remote) = tokio::io::duplex(1024);
        let tracker = TaskTracker::new();
        server.handoff(
            Box::new(remote),
            HandoffContext {
                shutdown: CancellationToken::new(),
                close: CancellationToken::new(),
                tracker: tracker.clone(),
                peer_addr: None,
            },
        );

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), local.read_to_end(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap();
        assert_eq!(read, 0);

        tracker.close();
        tracker.wait().await;
    }
}
