use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::manifest::RequestKey;

/// Headers that describe one hop and are never forwarded or stored.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

const SET_COOKIE: &str = "set-cookie";
const CREDENTIAL_HEADERS: [&str; 2] = ["authorization", "cookie"];

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("network transport failed: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestDestination {
    Document,
    Other,
}

impl RequestDestination {
    /// Maps a `Sec-Fetch-Dest` header value.
    pub fn from_fetch_dest(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(dest) if dest.eq_ignore_ascii_case("document") => Self::Document,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    method: String,
    target: String,
    destination: RequestDestination,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl FetchRequest {
    pub fn new(method: &str, target: impl Into<String>) -> Self {
        Self {
            method: method.trim().to_ascii_uppercase(),
            target: target.into(),
            destination: RequestDestination::Other,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn document(target: impl Into<String>) -> Self {
        Self::get(target).with_destination(RequestDestination::Document)
    }

    pub fn with_destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn destination(&self) -> RequestDestination {
        self.destination
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Requests carrying credentials get per-user answers, which must never
    /// be shared through the cache.
    #[must_use]
    pub fn carries_credentials(&self) -> bool {
        CREDENTIAL_HEADERS
            .iter()
            .any(|name| self.header(name).is_some())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.target)
    }

    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

/// A fully buffered response, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the origin allows this response to be shared with other
    /// clients: no `Set-Cookie`, no `private` or `no-store` directive.
    #[must_use]
    pub fn is_shareable(&self) -> bool {
        if self.header(SET_COOKIE).is_some() {
            return false;
        }
        !self
            .headers
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case("cache-control"))
            .flat_map(|(_, value)| value.split(','))
            .map(|directive| directive.trim().to_ascii_lowercase())
            .any(|directive| {
                directive == "no-store"
                    || directive == "private"
                    || directive.starts_with("private=")
            })
    }

    /// The response as it may be persisted: cookies set for one client are
    /// dropped.
    pub fn for_storage(mut self) -> Self {
        self.headers
            .retain(|(key, _)| !key.eq_ignore_ascii_case(SET_COOKIE));
        self
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Outbound transport used by the cache warm-up and the interceptor.
///
/// `Err` means the network could not be reached; any HTTP status, including
/// errors, is an `Ok` response.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse, NetworkError>;
}

/// [`Network`] over `reqwest`, resolving request targets against one origin.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    origin: String,
}

impl HttpNetwork {
    pub fn new(origin: &str, timeout: Option<Duration>) -> Result<Self, NetworkError> {
        let origin = origin.trim().trim_end_matches('/').to_string();
        if !origin.starts_with("http://") && !origin.starts_with("https://") {
            return Err(NetworkError::InvalidRequest(format!(
                "origin must be an http(s) URL, got '{origin}'"
            )));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|error| NetworkError::Transport(error.to_string()))?;

        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn url_for(&self, request: &FetchRequest) -> String {
        format!("{}{}", self.origin, request.key().target())
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse, NetworkError> {
        let method = Method::from_bytes(request.method().as_bytes())
            .map_err(|error| NetworkError::InvalidRequest(error.to_string()))?;
        let url = self.url_for(request);

        let mut outbound = self.client.request(method, &url);
        for (name, value) in request.headers() {
            if !is_hop_by_hop(name) {
                outbound = outbound.header(name.as_str(), value.as_str());
            }
        }
        if !request.body().is_empty() {
            outbound = outbound.body(request.body().to_vec());
        }

        let response = outbound
            .send()
            .await
            .map_err(|error| NetworkError::Transport(error.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|error| NetworkError::Transport(error.to_string()))?;

        tracing::debug!(
            target: "funnels.offline.network",
            url = %url,
            status,
            bytes = body.len(),
            "upstream fetch completed",
        );

        Ok(StoredResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Scripted network keyed by origin-relative target.
    #[derive(Default)]
    pub(crate) struct FakeNetwork {
        responses: Mutex<HashMap<String, StoredResponse>>,
        unreachable: Mutex<HashSet<String>>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeNetwork {
        pub(crate) fn with_shell_assets() -> Self {
            let network = Self::default();
            network.respond("/index.html", StoredResponse::new(200, "<html>shell</html>"));
            network.respond("/offline.html", StoredResponse::new(200, "<html>offline</html>"));
            network.respond("/css/offline.css", StoredResponse::new(200, "body{}"));
            network.respond("/manifest.json", StoredResponse::new(200, "{}"));
            network
        }

        pub(crate) fn respond(&self, target: &str, response: StoredResponse) {
            self.lock_responses().insert(target.to_string(), response);
        }

        pub(crate) fn fail(&self, target: &str) {
            self.unreachable
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(target.to_string());
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn reset_calls(&self) {
            self.calls.store(0, Ordering::SeqCst);
        }

        fn lock_responses(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredResponse>> {
            self.responses
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    #[async_trait]
    impl Network for FakeNetwork {
        async fn fetch(&self, request: &FetchRequest) -> Result<StoredResponse, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let target = request.key().target().to_string();
            let unreachable = self
                .unreachable
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(&target);
            if unreachable || self.offline.load(Ordering::SeqCst) {
                return Err(NetworkError::Transport(format!("{target} unreachable")));
            }
            Ok(self
                .lock_responses()
                .get(&target)
                .cloned()
                .unwrap_or_else(|| StoredResponse::new(404, "not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::get;

    use super::*;

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new().route(
            "/index.html",
            get(|headers: HeaderMap| async move {
                let tab = headers
                    .get("x-tab")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("none")
                    .to_string();
                ([("content-type", "text/html")], tab)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    #[test]
    fn destination_follows_sec_fetch_dest() {
        assert_eq!(
            RequestDestination::from_fetch_dest(Some("document")),
            RequestDestination::Document
        );
        assert_eq!(
            RequestDestination::from_fetch_dest(Some("style")),
            RequestDestination::Other
        );
        assert_eq!(
            RequestDestination::from_fetch_dest(None),
            RequestDestination::Other
        );
    }

    #[test]
    fn credentials_are_detected_case_insensitively() {
        assert!(!FetchRequest::get("/app.js").carries_credentials());
        assert!(
            FetchRequest::get("/me.js")
                .with_header("Cookie", "session=alice")
                .carries_credentials()
        );
        assert!(
            FetchRequest::get("/me.js")
                .with_header("AUTHORIZATION", "Bearer a")
                .carries_credentials()
        );
    }

    #[test]
    fn shareability_follows_cookies_and_cache_control() {
        assert!(StoredResponse::new(200, "x").is_shareable());
        assert!(
            StoredResponse::new(200, "x")
                .with_header("Cache-Control", "public, max-age=60")
                .is_shareable()
        );
        assert!(
            !StoredResponse::new(200, "x")
                .with_header("set-cookie", "id=1")
                .is_shareable()
        );
        for directive in ["no-store", "Private", "max-age=0, private=\"x-user\""] {
            let response = StoredResponse::new(200, "x").with_header("cache-control", directive);
            assert!(!response.is_shareable(), "{directive}");
        }

        let stored = StoredResponse::new(200, "x")
            .with_header("Set-Cookie", "a=1")
            .with_header("etag", "\"1\"")
            .with_header("set-cookie", "b=2")
            .for_storage();
        assert_eq!(stored.headers, vec![("etag".to_string(), "\"1\"".to_string())]);
    }

    #[test]
    fn origin_must_be_http() {
        assert!(matches!(
            HttpNetwork::new("ftp://example.com", None),
            Err(NetworkError::InvalidRequest(_))
        ));
        let network = HttpNetwork::new("http://127.0.0.1:5173/", None).expect("network");
        assert_eq!(network.origin(), "http://127.0.0.1:5173");
    }

    #[tokio::test]
    async fn http_network_buffers_upstream_responses() {
        let addr = spawn_upstream().await;
        let network = HttpNetwork::new(&format!("http://{addr}"), None).expect("network");

        let response = network
            .fetch(&FetchRequest::get("/index.html").with_header("x-tab", "3"))
            .await
            .expect("fetch");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"3");
        assert_eq!(response.header("Content-Type"), Some("text/html"));
        assert_eq!(response.header("content-length"), None);

        let missing = network
            .fetch(&FetchRequest::get("/missing"))
            .await
            .expect("http errors are responses");
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn unreachable_origin_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let network = HttpNetwork::new(&format!("http://{addr}"), None).expect("network");
        let result = network.fetch(&FetchRequest::get("/index.html")).await;
        assert!(matches!(result, Err(NetworkError::Transport(_))));
    }
}
