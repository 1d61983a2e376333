//! Conversions between local HTTP exchanges and the forwarding wire records.

use std::{collections::HashMap, fmt, net::SocketAddr};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, header};

use super::proto::{ForwardedRequest, ForwardedResponse, HeaderEntry};

/// A request as seen by the local HTTP layer, about to be forwarded.
#[derive(Debug)]
pub struct LocalRequest {
    pub request: Request<Bytes>,
    /// Path as the client sent it, before any local routing rewrote the URI.
    pub original_path: String,
    pub remote_addr: Option<SocketAddr>,
}

impl LocalRequest {
    pub fn new(request: Request<Bytes>) -> Self {
        let original_path = request.uri().path().to_string();
        Self {
            request,
            original_path,
            remote_addr: None,
        }
    }

    pub fn with_original_path(mut self, path: impl Into<String>) -> Self {
        self.original_path = path.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

/// Remote address of the client that reached the standby, attached to replayed requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRemoteAddr(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    InvalidMethod(String),
    InvalidUri(String),
    InvalidHeaderName(String),
    InvalidHeaderValue(String),
    InvalidStatus(i32),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMethod(m) => write!(f, "invalid forwarded method: {m:?}"),
            Self::InvalidUri(u) => write!(f, "invalid forwarded url: {u:?}"),
            Self::InvalidHeaderName(n) => write!(f, "invalid forwarded header name: {n:?}"),
            Self::InvalidHeaderValue(n) => write!(f, "invalid value for forwarded header {n:?}"),
            Self::InvalidStatus(code) => write!(f, "invalid forwarded status code: {code}"),
        }
    }
}

impl std::error::Error for WireError {}

pub fn generate_forwarded_request(local: &LocalRequest) -> Result<ForwardedRequest, WireError> {
    let req = &local.request;
    let path = if local.original_path.is_empty() {
        req.uri().path()
    } else {
        local.original_path.as_str()
    };
    let url = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    Ok(ForwardedRequest {
        method: req.method().as_str().to_string(),
        url,
        header_entries: header_entries(req.headers())?,
        body: req.body().to_vec(),
        host,
        remote_addr: local
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
    })
}

/// Rebuilds the request the standby received so the local pipeline can serve it.
pub fn parse_forwarded_request(freq: ForwardedRequest) -> Result<Request<Bytes>, WireError> {
    let method = Method::from_bytes(freq.method.as_bytes())
        .map_err(|_| WireError::InvalidMethod(freq.method.clone()))?;
    let uri: Uri = freq
        .url
        .parse()
        .map_err(|_| WireError::InvalidUri(freq.url.clone()))?;

    let mut headers = header_map(freq.header_entries)?;
    if !freq.host.is_empty() && !headers.contains_key(header::HOST) {
        let host = HeaderValue::from_str(&freq.host)
            .map_err(|_| WireError::InvalidHeaderValue("host".to_string()))?;
        headers.insert(header::HOST, host);
    }

    let mut request = Request::new(Bytes::from(freq.body));
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    if !freq.remote_addr.is_empty() {
        request
            .extensions_mut()
            .insert(ForwardedRemoteAddr(freq.remote_addr));
    }
    Ok(request)
}

pub fn encode_response(resp: Response<Bytes>) -> Result<ForwardedResponse, WireError> {
    let (parts, body) = resp.into_parts();
    Ok(ForwardedResponse {
        status_code: i32::from(parts.status.as_u16()),
        header_entries: header_entries(&parts.headers)?,
        body: body.to_vec(),
    })
}

pub fn decode_response(resp: ForwardedResponse) -> Result<Response<Bytes>, WireError> {
    let status = u16::try_from(resp.status_code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or(WireError::InvalidStatus(resp.status_code))?;
    let headers = header_map(resp.header_entries)?;

    let mut response = Response::new(Bytes::from(resp.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn header_entries(headers: &HeaderMap) -> Result<HashMap<String, HeaderEntry>, WireError> {
    let mut entries = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(|v| {
                String::from_utf8(v.as_bytes().to_vec())
                    .map_err(|_| WireError::InvalidHeaderValue(name.as_str().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        entries.insert(name.as_str().to_string(), HeaderEntry { values });
    }
    Ok(entries)
}

fn header_map(entries: HashMap<String, HeaderEntry>) -> Result<HeaderMap, WireError> {
    let mut headers = HeaderMap::with_capacity(entries.len());
    for (name, entry) in entries {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| WireError::InvalidHeaderName(name.clone()))?;
        for value in entry.values {
            let value = HeaderValue::from_str(&value)
                .map_err(|_| WireError::InvalidHeaderValue(name.clone()))?;
            headers.append(header_name.clone(), value);
        }
    }
    Ok(headers)
}
