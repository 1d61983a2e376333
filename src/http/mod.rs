use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Extension, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tower::util::ServiceExt as _;
use tracing::{debug, warn};

use crate::{
    BoxFuture,
    forwarding::{
        ForwardError, ForwardedRemoteAddr, LocalRequest, RequestForwarder, RequestHandler,
        StandbyInfo,
    },
    metrics,
};

/// Largest request or response body the front buffers.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Whether this node serves requests itself or hands them to the active node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Active,
    Standby,
}

#[derive(Clone)]
pub struct FrontState {
    pub forwarder: Arc<RequestForwarder>,
    pub role: NodeRole,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new("service_unavailable", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new("bad_gateway", StatusCode::BAD_GATEWAY, message)
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

impl From<ForwardError> for ApiError {
    fn from(value: ForwardError) -> Self {
        match value {
            ForwardError::CannotForward => ApiError::service_unavailable("no active node"),
            ForwardError::RequestCreation(_) => ApiError::invalid_request(value.to_string()),
            ForwardError::Rpc(_) | ForwardError::InvalidResponse(_) => {
                ApiError::bad_gateway(value.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Runs requests through an axum router without a socket.
///
/// The active node uses this to serve requests replayed from standbys.
impl RequestHandler for Router {
    fn handle(&self, req: http::Request<Bytes>) -> BoxFuture<'_, http::Response<Bytes>> {
        let router = self.clone();
        Box::pin(async move {
            let resp = match router.oneshot(req.map(Body::from)).await {
                Ok(resp) => resp,
                Err(infallible) => match infallible {},
            };
            let (parts, body) = resp.into_parts();
            match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
                Ok(body) => http::Response::from_parts(parts, body),
                Err(err) => {
                    warn!(%err, "error buffering local response");
                    let mut resp = http::Response::new(Bytes::from_static(b"internal error"));
                    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    resp
                }
            }
        })
    }
}

type SecretStore = Arc<Mutex<BTreeMap<String, Value>>>;

/// The request pipeline the active node serves: a small in-memory secret store.
pub fn local_router() -> Router {
    let store: SecretStore = Arc::default();
    Router::new()
        .route(
            "/v1/secret/*key",
            get(read_secret)
                .put(write_secret)
                .post(write_secret)
                .delete(delete_secret),
        )
        .fallback(fallback_not_found)
        .layer(Extension(store))
}

async fn read_secret(
    Extension(store): Extension<SecretStore>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = store.lock().await;
    let data = store
        .get(&key)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("no secret at {key}")))?;
    Ok(Json(json!({ "key": key, "data": data })))
}

async fn write_secret(
    Extension(store): Extension<SecretStore>,
    Path(key): Path<String>,
    forwarded_from: Option<Extension<ForwardedRemoteAddr>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let data: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::invalid_request(format!("invalid json body: {e}")))?;
    if !data.is_object() {
        return Err(ApiError::invalid_request("secret data must be a json object")
            .with_detail("key", key));
    }
    if let Some(Extension(ForwardedRemoteAddr(client))) = forwarded_from {
        debug!(%key, %client, "writing forwarded secret");
    }
    store.lock().await.insert(key, data);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_secret(
    Extension(store): Extension<SecretStore>,
    Path(key): Path<String>,
) -> StatusCode {
    store.lock().await.remove(&key);
    StatusCode::NO_CONTENT
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

/// The node's HTTP front: `/sys/*` is always answered locally, everything else is served by
/// `local` on the active node and forwarded by standbys.
pub fn build_router(state: FrontState, local: Router) -> Router {
    let sys = Router::new()
        .route("/sys/metrics", get(sys_metrics))
        .route("/sys/forwarding", get(sys_forwarding))
        .with_state(state.clone());

    sys.merge(local)
        .layer(middleware::from_fn_with_state(state, forward_standby_requests))
}

async fn sys_metrics() -> String {
    metrics::gather_metrics()
}

#[derive(Serialize)]
struct ForwardingStatus {
    role: NodeRole,
    connected: bool,
    active_cluster_addr: Option<String>,
    standbys: Vec<StandbyStatus>,
}

#[derive(Serialize)]
struct StandbyStatus {
    node_id: String,
    cluster_addr: String,
    last_seen_at: String,
}

impl From<StandbyInfo> for StandbyStatus {
    fn from(value: StandbyInfo) -> Self {
        Self {
            node_id: value.node_id,
            cluster_addr: value.cluster_addr,
            last_seen_at: value.last_seen_at.to_rfc3339(),
        }
    }
}

async fn sys_forwarding(State(state): State<FrontState>) -> Json<ForwardingStatus> {
    let forwarder = &state.forwarder;
    Json(ForwardingStatus {
        role: state.role,
        connected: forwarder.is_connected().await,
        active_cluster_addr: forwarder
            .remote_address()
            .await
            .map(|url| url.to_string()),
        standbys: forwarder
            .known_standbys()
            .into_iter()
            .map(StandbyStatus::from)
            .collect(),
    })
}

async fn forward_standby_requests(
    State(state): State<FrontState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if state.role == NodeRole::Active || req.uri().path().starts_with("/sys/") {
        return next.run(req).await;
    }

    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return ApiError::invalid_request(format!("read body: {e}")).into_response(),
    };

    let mut local = LocalRequest::new(http::Request::from_parts(parts, body));
    if let Some(addr) = remote_addr {
        local = local.with_remote_addr(addr);
    }

    match state.forwarder.forward(&local).await {
        Ok(resp) => resp.map(Body::from),
        Err(err) => ApiError::from(err).into_response(),
    }
}
