use std::{sync::Arc, time::Duration};

use axum::body::Body;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower::util::ServiceExt;

use fwd::{
    BoxFuture,
    cluster::{ClusterListener, ListenerOptions, TlsClusterListener},
    cluster_identity::{ClusterIdentity, ClusterIdentityHolder},
    forwarding::{
        ForwardError, ForwarderOptions, LocalRequest, RefreshError, RequestForwarder,
        RequestHandler,
    },
    http::{FrontState, NodeRole, build_router, local_router},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Seen {
    method: String,
    uri: String,
    x_test: Vec<String>,
    body: Vec<u8>,
}

/// Records what it receives and answers like the active node in the scenario.
struct LeaderPipeline {
    seen: Mutex<Vec<Seen>>,
    delay: Duration,
    reply: &'static str,
}

impl LeaderPipeline {
    fn new(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            reply,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            delay,
            reply: "done",
        })
    }
}

impl RequestHandler for LeaderPipeline {
    fn handle(&self, req: Request<Bytes>) -> BoxFuture<'_, Response<Bytes>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().await.push(Seen {
                method: req.method().to_string(),
                uri: req.uri().to_string(),
                x_test: req
                    .headers()
                    .get_all("x-test")
                    .iter()
                    .map(|v| v.to_str().unwrap().to_string())
                    .collect(),
                body: req.body().to_vec(),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("x-echo", "ok")
                .body(Bytes::from_static(self.reply.as_bytes()))
                .unwrap()
        })
    }
}

struct Node {
    listener: TlsClusterListener,
    forwarder: Arc<RequestForwarder>,
}

impl Node {
    async fn start(
        identity: &Arc<ClusterIdentityHolder>,
        handler: Arc<dyn RequestHandler>,
        drain: Duration,
    ) -> Self {
        let listener = TlsClusterListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            ListenerOptions {
                accept_drain_interval: drain,
                handshake_timeout: Duration::from_secs(5),
                dial_timeout: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();
        let forwarder = Arc::new(RequestForwarder::new(
            ForwarderOptions {
                ha_enabled: true,
                heartbeat_interval: Duration::from_millis(200),
                node_id: format!("node-{}", listener.local_addr().port()),
                cluster_addr: listener.cluster_addr(),
            },
            identity.clone(),
            Some(Arc::new(listener.clone()) as Arc<dyn ClusterListener>),
            handler,
        ));
        Self {
            listener,
            forwarder,
        }
    }

    async fn shutdown(self) {
        self.forwarder.clear_connection().await;
        self.forwarder.stop_forwarding().await;
        self.listener.stop().await;
    }
}

fn shared_identity() -> Arc<ClusterIdentityHolder> {
    Arc::new(ClusterIdentityHolder::with_identity(
        ClusterIdentity::generate().unwrap(),
    ))
}

fn scenario_request() -> LocalRequest {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/v1/secret/foo")
        .header("x-test", "1")
        .header("x-test", "2")
        .body(Bytes::from_static(b"payload"))
        .unwrap();
    LocalRequest::new(req)
}

#[tokio::test]
async fn standby_forwards_request_with_repeated_headers() {
    let identity = shared_identity();
    let pipeline = LeaderPipeline::new("done");
    let active = Node::start(&identity, pipeline.clone(), Duration::from_millis(100)).await;
    let standby = Node::start(
        &identity,
        LeaderPipeline::new("unused"),
        Duration::from_millis(100),
    )
    .await;

    active.forwarder.start_forwarding().await;
    standby
        .forwarder
        .refresh_connection(&active.listener.cluster_addr())
        .await
        .unwrap();

    let resp = standby.forwarder.forward(&scenario_request()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let echoed: Vec<&str> = resp
        .headers()
        .get_all("x-echo")
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(echoed, vec!["ok"]);
    assert_eq!(resp.body().as_ref(), b"done");

    let seen = pipeline.seen.lock().await.clone();
    assert_eq!(
        seen,
        vec![Seen {
            method: "POST".to_string(),
            uri: "/v1/secret/foo".to_string(),
            x_test: vec!["1".to_string(), "2".to_string()],
            body: b"payload".to_vec(),
        }]
    );

    standby.shutdown().await;
    active.shutdown().await;
}

#[tokio::test]
async fn stopping_the_server_drains_in_flight_requests() {
    let identity = shared_identity();
    let active = Node::start(
        &identity,
        LeaderPipeline::slow(Duration::from_millis(100)),
        Duration::from_millis(500),
    )
    .await;
    let standby = Node::start(
        &identity,
        LeaderPipeline::new("unused"),
        Duration::from_millis(100),
    )
    .await;

    active.forwarder.start_forwarding().await;
    standby
        .forwarder
        .refresh_connection(&active.listener.cluster_addr())
        .await
        .unwrap();

    let forwarder = standby.forwarder.clone();
    let in_flight = tokio::spawn(async move { forwarder.forward(&scenario_request()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    active.forwarder.stop_forwarding().await;
    let resp = in_flight.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"done");

    // The server is gone, so later calls fail as RPC errors rather than "not connected".
    let err = standby
        .forwarder
        .forward(&scenario_request())
        .await
        .unwrap_err();
    assert!(matches!(err, ForwardError::Rpc(_)), "unexpected {err:?}");

    standby.shutdown().await;
    active.shutdown().await;
}

#[tokio::test]
async fn refresh_waits_for_in_flight_forwards() {
    let identity = shared_identity();
    let active = Node::start(
        &identity,
        LeaderPipeline::slow(Duration::from_millis(300)),
        Duration::from_millis(50),
    )
    .await;
    let standby = Node::start(
        &identity,
        LeaderPipeline::new("unused"),
        Duration::from_millis(50),
    )
    .await;
    active.forwarder.start_forwarding().await;
    let addr = active.listener.cluster_addr();
    standby.forwarder.refresh_connection(&addr).await.unwrap();

    let forwarder = standby.forwarder.clone();
    let in_flight = tokio::spawn(async move { forwarder.forward(&scenario_request()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    standby.forwarder.refresh_connection(&addr).await.unwrap();
    // The refresh only gets the connection once the forward has released it.
    assert!(in_flight.is_finished());
    let resp = in_flight.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"done");

    // The new connection serves later calls.
    let resp = standby.forwarder.forward(&scenario_request()).await.unwrap();
    assert_eq!(resp.body().as_ref(), b"done");

    standby.shutdown().await;
    active.shutdown().await;
}

#[tokio::test]
async fn refresh_moves_the_connection_to_the_new_active_node() {
    let identity = shared_identity();
    let first = Node::start(
        &identity,
        LeaderPipeline::new("first"),
        Duration::from_millis(50),
    )
    .await;
    let second = Node::start(
        &identity,
        LeaderPipeline::new("second"),
        Duration::from_millis(50),
    )
    .await;
    let standby = Node::start(
        &identity,
        LeaderPipeline::new("unused"),
        Duration::from_millis(50),
    )
    .await;
    first.forwarder.start_forwarding().await;
    second.forwarder.start_forwarding().await;

    standby
        .forwarder
        .refresh_connection(&first.listener.cluster_addr())
        .await
        .unwrap();
    let resp = standby.forwarder.forward(&scenario_request()).await.unwrap();
    assert_eq!(resp.body().as_ref(), b"first");

    standby
        .forwarder
        .refresh_connection(&second.listener.cluster_addr())
        .await
        .unwrap();
    let resp = standby.forwarder.forward(&scenario_request()).await.unwrap();
    assert_eq!(resp.body().as_ref(), b"second");
    assert_eq!(
        standby.forwarder.remote_address().await.unwrap().port(),
        Some(second.listener.local_addr().port())
    );

    standby.shutdown().await;
    second.shutdown().await;
    first.shutdown().await;
}

#[tokio::test]
async fn mismatched_identity_cannot_connect() {
    let active = Node::start(
        &shared_identity(),
        LeaderPipeline::new("done"),
        Duration::from_millis(50),
    )
    .await;
    let stranger = Node::start(
        &shared_identity(),
        LeaderPipeline::new("unused"),
        Duration::from_millis(50),
    )
    .await;
    active.forwarder.start_forwarding().await;

    let err = stranger
        .forwarder
        .refresh_connection(&active.listener.cluster_addr())
        .await
        .unwrap_err();
    assert!(matches!(err, RefreshError::Dial(_)), "unexpected {err:?}");
    assert!(!stranger.forwarder.is_connected().await);
    assert!(matches!(
        stranger.forwarder.forward(&scenario_request()).await,
        Err(ForwardError::CannotForward)
    ));

    stranger.shutdown().await;
    active.shutdown().await;
}

#[tokio::test]
async fn standby_front_writes_through_to_the_active_store() {
    let identity = shared_identity();
    let active_local = local_router();
    let active = Node::start(
        &identity,
        Arc::new(active_local.clone()),
        Duration::from_millis(50),
    )
    .await;
    let standby_local = local_router();
    let standby = Node::start(
        &identity,
        Arc::new(standby_local.clone()),
        Duration::from_millis(50),
    )
    .await;
    active.forwarder.start_forwarding().await;
    standby
        .forwarder
        .refresh_connection(&active.listener.cluster_addr())
        .await
        .unwrap();

    let front = build_router(
        FrontState {
            forwarder: standby.forwarder.clone(),
            role: NodeRole::Standby,
        },
        standby_local,
    );
    let res = front
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri("/v1/secret/app/db")
                .body(Body::from(json!({ "user": "svc" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    // Reads on the standby are forwarded too and see the active node's data.
    let res = front
        .oneshot(
            Request::builder()
                .uri("/v1/secret/app/db")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "key": "app/db", "data": { "user": "svc" } }));

    let direct = active_local
        .handle(
            Request::builder()
                .uri("/v1/secret/app/db")
                .body(Bytes::new())
                .unwrap(),
        )
        .await;
    assert_eq!(direct.status(), StatusCode::OK);

    standby.shutdown().await;
    active.shutdown().await;
}
