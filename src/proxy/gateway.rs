//! Request gateway
//!
//! Executes exactly one HTTP request, directly or through a proxy (Tor SOCKS5
//! or a public HTTP proxy), and turns every outcome into either a
//! [`ResponseView`] or a classified [`RequestFailure`]. Nothing escapes as a
//! panic or an untyped error.
//!
//! Each request builds its own client from its [`RequestContext`]; the client
//! and its connection pool are dropped when the request finishes, so no
//! session is ever shared between unrelated requests.

use crate::proxy::models::ProxyCandidate;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Proxy as ReqwestProxy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Default timeout for page and judge fetches in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default timeout for generic gateway requests in seconds
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 60;

/// Default cap on response bodies read from remote hosts
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

const DEFAULT_TOR_HOST: &str = "127.0.0.1";
const DEFAULT_TOR_PORT: u16 = 9050;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Body signatures of proxy software answering with a 5xx, checked in order
const PROXY_SIGNATURES: [(&str, &str); 3] = [
    ("squid", "squid"),
    ("privoxy", "privoxy"),
    ("bad gateway", "bad-gateway"),
];

/// Verb and proxying of a single request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetDirect,
    GetProxied,
    PostDirect,
    PostProxied,
}

impl RequestKind {
    pub fn is_post(self) -> bool {
        matches!(self, RequestKind::PostDirect | RequestKind::PostProxied)
    }

    pub fn is_proxied(self) -> bool {
        matches!(self, RequestKind::GetProxied | RequestKind::PostProxied)
    }
}

/// Which kind of proxy a proxied request goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Direct,
    Tor,
    PublicProxy,
}

/// Host and port of a proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-request transport settings
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub transport: Transport,
    pub endpoint: Option<Endpoint>,
    pub verify_tls: bool,
    pub timeout: Duration,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            transport: Transport::Direct,
            endpoint: None,
            verify_tls: true,
            timeout: Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
        }
    }
}

impl RequestContext {
    pub fn direct() -> Self {
        Self::default()
    }

    /// Route through Tor; `None` uses the gateway's configured SOCKS endpoint
    pub fn tor(endpoint: Option<Endpoint>) -> Self {
        Self {
            transport: Transport::Tor,
            endpoint,
            ..Self::default()
        }
    }

    pub fn public_proxy(endpoint: Endpoint) -> Self {
        Self {
            transport: Transport::PublicProxy,
            endpoint: Some(endpoint),
            ..Self::default()
        }
    }

    /// Route through a harvested candidate acting as a plain HTTP proxy
    pub fn through_candidate(candidate: &ProxyCandidate) -> Self {
        Self::public_proxy(Endpoint::new(candidate.ip.clone(), candidate.port))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// DNS, connect, TLS or timeout
    Transport,
    /// HTTP 4xx
    Blocked,
    /// HTTP 5xx carrying a known proxy software signature
    ProxyError,
    /// HTTP 5xx with an unrecognized body
    ServerDown,
    /// Judge body matched the hard failure marker
    BadIp,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transport => "transport",
            FailureKind::Blocked => "blocked",
            FailureKind::ProxyError => "proxy-error",
            FailureKind::ServerDown => "server-down",
            FailureKind::BadIp => "bad-ip",
        };
        f.write_str(s)
    }
}

/// A classified request failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}{}", .detail.as_ref().map(|d| format!(": {}", d)).unwrap_or_default())]
pub struct RequestFailure {
    pub kind: FailureKind,
    pub detail: Option<String>,
}

impl RequestFailure {
    pub fn new(kind: FailureKind, detail: Option<String>) -> Self {
        Self { kind, detail }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transport, Some(message.into()))
    }

    pub fn blocked() -> Self {
        Self::new(FailureKind::Blocked, None)
    }

    pub fn proxy_error(signature: &str) -> Self {
        Self::new(FailureKind::ProxyError, Some(signature.to_string()))
    }

    pub fn server_down() -> Self {
        Self::new(FailureKind::ServerDown, None)
    }

    pub fn bad_ip(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::BadIp, Some(detail.into()))
    }
}

impl From<reqwest::Error> for RequestFailure {
    fn from(e: reqwest::Error) -> Self {
        RequestFailure::transport(e.to_string())
    }
}

/// Classify a completed exchange by status code and body
pub fn classify(status: u16, body: &str) -> Result<(), RequestFailure> {
    match status {
        200..=399 => Ok(()),
        400..=499 => Err(RequestFailure::blocked()),
        500..=u16::MAX => {
            let lower = body.to_lowercase();
            for (needle, signature) in PROXY_SIGNATURES {
                if lower.contains(needle) {
                    return Err(RequestFailure::proxy_error(signature));
                }
            }
            Err(RequestFailure::server_down())
        }
        _ => Err(RequestFailure::server_down()),
    }
}

/// A successful response, fully read
#[derive(Debug, Clone)]
pub struct ResponseView {
    status: u16,
    headers: HeaderMap,
    url: String,
    body: Vec<u8>,
}

impl ResponseView {
    pub fn new(status: u16, headers: HeaderMap, url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            url: url.into(),
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body decoded as UTF-8, lossily
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as JSON, if it is JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Request payload: query parameters for GET, form fields for POST
pub type Payload = BTreeMap<String, String>;

/// Extra arguments attached to every request a gateway sends
#[derive(Debug, Clone, Default)]
pub struct RequestArgs {
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
}

impl RequestArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_param(mut self, name: &str, value: &str) -> Self {
        self.params.insert(name.to_string(), value.to_string());
        self
    }
}

/// Merge a payload into the caller's params; the caller wins on collision
///
/// The timeout is not part of either side: it always comes from the
/// [`RequestContext`].
pub fn merge_args(payload: Option<&Payload>, args: &RequestArgs) -> Payload {
    let mut merged = payload.cloned().unwrap_or_default();
    merged.extend(args.params.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Something that can perform one classified request
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        kind: RequestKind,
        url: &str,
        ctx: &RequestContext,
        payload: Option<&Payload>,
    ) -> Result<ResponseView, RequestFailure>;
}

/// Configuration for the request gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// SOCKS endpoint used for Tor when the context names none
    pub tor_endpoint: Endpoint,
    /// User agent for HTTP requests
    pub user_agent: String,
    /// Extra arguments sent with every request
    pub args: RequestArgs,
    /// Response bodies are truncated to this many bytes
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tor_endpoint: Endpoint::new(DEFAULT_TOR_HOST, DEFAULT_TOR_PORT),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            args: RequestArgs::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tor_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.tor_endpoint = endpoint;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_args(mut self, args: RequestArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

/// Executes single requests in blocking or async mode
#[derive(Debug, Clone, Default)]
pub struct RequestGateway {
    config: GatewayConfig,
}

impl RequestGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Execute a request without blocking the async scheduler
    pub async fn execute(
        &self,
        kind: RequestKind,
        url: &str,
        ctx: &RequestContext,
        payload: Option<&Payload>,
    ) -> Result<ResponseView, RequestFailure> {
        check_url(url)?;
        let session = self.async_session(kind, ctx)?;
        let params = merge_args(payload, &self.config.args);

        let mut request = if kind.is_post() {
            session.post(url).form(&params)
        } else if params.is_empty() {
            session.get(url)
        } else {
            session.get(url).query(&params)
        };
        for (name, value) in &self.config.args.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        trace!("{:?} {} via {:?}", kind, url, ctx.transport);
        let mut response = request.timeout(ctx.timeout).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().to_string();

        let limit = self.config.max_body_bytes;
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = limit - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                debug!("{} body truncated at {} bytes", url, limit);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        finish(url, ResponseView::new(status, headers, final_url, body))
    }

    /// Execute a request on the calling thread
    ///
    /// Must not be called from inside an async runtime; use [`Self::execute`]
    /// there.
    pub fn execute_blocking(
        &self,
        kind: RequestKind,
        url: &str,
        ctx: &RequestContext,
        payload: Option<&Payload>,
    ) -> Result<ResponseView, RequestFailure> {
        check_url(url)?;
        let session = self.blocking_session(kind, ctx)?;
        let params = merge_args(payload, &self.config.args);

        let mut request = if kind.is_post() {
            session.post(url).form(&params)
        } else if params.is_empty() {
            session.get(url)
        } else {
            session.get(url).query(&params)
        };
        for (name, value) in &self.config.args.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        trace!("{:?} {} via {:?} (blocking)", kind, url, ctx.transport);
        let response = request.timeout(ctx.timeout).send()?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().to_string();

        let mut body = Vec::new();
        response
            .take(self.config.max_body_bytes as u64)
            .read_to_end(&mut body)
            .map_err(|e| RequestFailure::transport(e.to_string()))?;

        finish(url, ResponseView::new(status, headers, final_url, body))
    }

    fn async_session(
        &self,
        kind: RequestKind,
        ctx: &RequestContext,
    ) -> Result<reqwest::Client, RequestFailure> {
        let mut builder = reqwest::Client::builder()
            .timeout(ctx.timeout)
            .user_agent(&self.config.user_agent)
            .danger_accept_invalid_certs(!ctx.verify_tls);
        if let Some(proxy_url) = self.proxy_url(kind, ctx)? {
            builder = builder.proxy(ReqwestProxy::all(&proxy_url)?);
        }
        Ok(builder.build()?)
    }

    fn blocking_session(
        &self,
        kind: RequestKind,
        ctx: &RequestContext,
    ) -> Result<reqwest::blocking::Client, RequestFailure> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(ctx.timeout)
            .user_agent(&self.config.user_agent)
            .danger_accept_invalid_certs(!ctx.verify_tls);
        if let Some(proxy_url) = self.proxy_url(kind, ctx)? {
            builder = builder.proxy(ReqwestProxy::all(&proxy_url)?);
        }
        Ok(builder.build()?)
    }

    /// Proxy URL for a request, or `None` when it goes out directly
    fn proxy_url(
        &self,
        kind: RequestKind,
        ctx: &RequestContext,
    ) -> Result<Option<String>, RequestFailure> {
        if !kind.is_proxied() {
            return Ok(None);
        }
        match ctx.transport {
            Transport::Direct => Ok(None),
            Transport::Tor => {
                let endpoint = ctx.endpoint.as_ref().unwrap_or(&self.config.tor_endpoint);
                Ok(Some(format!("socks5h://{}", endpoint)))
            }
            Transport::PublicProxy => match &ctx.endpoint {
                Some(endpoint) => Ok(Some(format!("http://{}", endpoint))),
                None => Err(RequestFailure::transport(
                    "public proxy transport without an endpoint",
                )),
            },
        }
    }
}

#[async_trait]
impl Fetcher for RequestGateway {
    async fn fetch(
        &self,
        kind: RequestKind,
        url: &str,
        ctx: &RequestContext,
        payload: Option<&Payload>,
    ) -> Result<ResponseView, RequestFailure> {
        self.execute(kind, url, ctx, payload).await
    }
}

fn check_url(url: &str) -> Result<(), RequestFailure> {
    if url.trim().is_empty() {
        return Err(RequestFailure::transport("empty url"));
    }
    Ok(())
}

fn finish(url: &str, view: ResponseView) -> Result<ResponseView, RequestFailure> {
    match classify(view.status(), &view.text()) {
        Ok(()) => Ok(view),
        Err(failure) => {
            debug!("{} answered {}: {}", url, view.status(), failure);
            Err(failure)
        }
    }
}

/// Discover our own public address from an IP echo endpoint
pub async fn fetch_public_ip<F: Fetcher + ?Sized>(
    fetcher: &F,
    url: &str,
) -> Result<String, RequestFailure> {
    let ctx = RequestContext::direct()
        .with_timeout(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS));
    let response = fetcher.fetch(RequestKind::GetDirect, url, &ctx, None).await?;
    let ip = response.text().trim().to_string();
    if ip.is_empty() {
        return Err(RequestFailure::server_down());
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    /// Serve one canned response on a local port and hand back the raw request
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (addr.to_string(), handle)
    }

    #[test]
    fn test_classify_success_range() {
        assert!(classify(200, "").is_ok());
        assert!(classify(301, "").is_ok());
        assert!(classify(399, "").is_ok());
    }

    #[test]
    fn test_classify_blocked() {
        assert_eq!(classify(403, "").unwrap_err(), RequestFailure::blocked());
        assert_eq!(classify(400, "").unwrap_err().kind, FailureKind::Blocked);
        assert_eq!(classify(499, "").unwrap_err().kind, FailureKind::Blocked);
    }

    #[test]
    fn test_classify_proxy_signatures() {
        assert_eq!(
            classify(502, "<h1>502 Bad Gateway</h1>").unwrap_err(),
            RequestFailure::proxy_error("bad-gateway")
        );
        assert_eq!(
            classify(503, "generated by SQUID/4.10").unwrap_err(),
            RequestFailure::proxy_error("squid")
        );
        assert_eq!(
            classify(500, "Privoxy encountered an error").unwrap_err(),
            RequestFailure::proxy_error("privoxy")
        );
        // first match wins
        assert_eq!(
            classify(502, "privoxy bad gateway squid").unwrap_err(),
            RequestFailure::proxy_error("squid")
        );
        assert_eq!(
            classify(500, "internal error").unwrap_err(),
            RequestFailure::server_down()
        );
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(RequestFailure::blocked().to_string(), "blocked");
        assert_eq!(
            RequestFailure::proxy_error("squid").to_string(),
            "proxy-error: squid"
        );
        assert_eq!(
            RequestFailure::transport("connection refused").to_string(),
            "transport: connection refused"
        );
    }

    #[test]
    fn test_merge_args_caller_wins() {
        let mut payload = Payload::new();
        payload.insert("page".to_string(), "1".to_string());
        payload.insert("limit".to_string(), "10".to_string());
        let args = RequestArgs::new().with_param("limit", "200");

        let merged = merge_args(Some(&payload), &args);
        assert_eq!(merged.get("page").map(String::as_str), Some("1"));
        assert_eq!(merged.get("limit").map(String::as_str), Some("200"));
        assert!(merge_args(None, &RequestArgs::new()).is_empty());
    }

    #[test]
    fn test_proxy_url_selection() {
        let gateway = RequestGateway::new();
        let public = RequestContext::public_proxy(Endpoint::new("1.2.3.4", 8080));
        let tor = RequestContext::tor(None);

        assert_eq!(
            gateway.proxy_url(RequestKind::GetProxied, &public).unwrap(),
            Some("http://1.2.3.4:8080".to_string())
        );
        assert_eq!(
            gateway.proxy_url(RequestKind::PostProxied, &tor).unwrap(),
            Some("socks5h://127.0.0.1:9050".to_string())
        );
        assert_eq!(gateway.proxy_url(RequestKind::GetDirect, &public).unwrap(), None);
        assert_eq!(
            gateway
                .proxy_url(RequestKind::GetProxied, &RequestContext::direct())
                .unwrap(),
            None
        );

        let mut no_endpoint = RequestContext::direct();
        no_endpoint.transport = Transport::PublicProxy;
        let err = gateway
            .proxy_url(RequestKind::GetProxied, &no_endpoint)
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);
    }

    #[test]
    fn test_context_defaults() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.transport, Transport::Direct);
        assert_eq!(ctx.timeout, Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS));
        assert!(ctx.verify_tls);

        let candidate = ProxyCandidate::new("5.6.7.8", 3128);
        let ctx = RequestContext::through_candidate(&candidate).with_verify_tls(false);
        assert_eq!(ctx.transport, Transport::PublicProxy);
        assert_eq!(ctx.endpoint, Some(Endpoint::new("5.6.7.8", 3128)));
        assert!(!ctx.verify_tls);
    }

    #[test]
    fn test_response_view_bodies() {
        let view = ResponseView::new(
            200,
            HeaderMap::new(),
            "http://ex.test/",
            br#"{"ip":"9.9.9.9"}"#.to_vec(),
        );
        assert_eq!(view.text(), r#"{"ip":"9.9.9.9"}"#);
        assert_eq!(view.json().unwrap()["ip"], "9.9.9.9");

        let html = ResponseView::new(200, HeaderMap::new(), "http://ex.test/", b"<html>".to_vec());
        assert!(html.json().is_none());
    }

    #[tokio::test]
    async fn test_execute_empty_url() {
        let gateway = RequestGateway::new();
        let err = gateway
            .execute(RequestKind::GetDirect, "  ", &RequestContext::direct(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);
    }

    #[tokio::test]
    async fn test_execute_success_with_query() {
        let (addr, server) = serve_once(http_response("200 OK", "1.2.3.4:8080")).await;
        let gateway = RequestGateway::with_config(
            GatewayConfig::new().with_args(RequestArgs::new().with_param("format", "txt")),
        );
        let mut payload = Payload::new();
        payload.insert("limit".to_string(), "5".to_string());

        let view = gateway
            .execute(
                RequestKind::GetDirect,
                &format!("http://{}/list", addr),
                &RequestContext::direct(),
                Some(&payload),
            )
            .await
            .unwrap();
        assert_eq!(view.status(), 200);
        assert_eq!(view.text(), "1.2.3.4:8080");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /list?"));
        assert!(request.contains("format=txt"));
        assert!(request.contains("limit=5"));
    }

    #[tokio::test]
    async fn test_execute_classifies_bad_gateway() {
        let (addr, _server) =
            serve_once(http_response("502 Bad Gateway", "...Bad Gateway...")).await;
        let err = RequestGateway::new()
            .execute(
                RequestKind::GetDirect,
                &format!("http://{}/", addr),
                &RequestContext::direct(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::proxy_error("bad-gateway"));
    }

    #[tokio::test]
    async fn test_execute_through_public_proxy() {
        let (addr, server) = serve_once(http_response("200 OK", "HTTP_USER_AGENT=x")).await;
        let (host, port) = addr.rsplit_once(':').unwrap();
        let ctx = RequestContext::public_proxy(Endpoint::new(host, port.parse().unwrap()));

        let view = RequestGateway::new()
            .execute(RequestKind::GetProxied, "http://judge.test/azenv.php", &ctx, None)
            .await
            .unwrap();
        assert!(view.text().contains("HTTP_USER_AGENT"));

        // a forward proxy sees the absolute URI
        let request = server.await.unwrap();
        assert!(request.starts_with("GET http://judge.test/azenv.php"));
    }

    #[tokio::test]
    async fn test_execute_connection_refused_is_transport() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = RequestGateway::new()
            .execute(
                RequestKind::GetDirect,
                &format!("http://{}/", addr),
                &RequestContext::direct().with_timeout(Duration::from_secs(2)),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);
        assert!(err.detail.is_some());
    }

    /// Blocking twin of `serve_once`; reads the full request body before answering
    fn serve_once_blocking(response: String) -> (String, std::thread::JoinHandle<String>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_lowercase();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= head_end + 4 + body_len {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });
        (addr.to_string(), handle)
    }

    const SQUID_PAGE: &str = "<html>ERROR: The requested URL could not be retrieved. Generated by squid/4.13</html>";

    #[test]
    fn test_execute_blocking_post() {
        let (addr, server) = serve_once_blocking(http_response("403 Forbidden", "nope"));

        let mut payload = Payload::new();
        payload.insert("q".to_string(), "1".to_string());
        let err = RequestGateway::new()
            .execute_blocking(
                RequestKind::PostDirect,
                &format!("http://{}/submit", addr),
                &RequestContext::direct(),
                Some(&payload),
            )
            .unwrap_err();
        assert_eq!(err, RequestFailure::blocked());

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /submit"));
        assert!(request.ends_with("q=1"));
    }

    #[test]
    fn test_execute_blocking_classifies_proxy_error() {
        let (addr, _server) =
            serve_once_blocking(http_response("503 Service Unavailable", SQUID_PAGE));
        let err = RequestGateway::new()
            .execute_blocking(
                RequestKind::GetDirect,
                &format!("http://{}/", addr),
                &RequestContext::direct(),
                None,
            )
            .unwrap_err();
        assert_eq!(err, RequestFailure::proxy_error("squid"));
    }

    #[tokio::test]
    async fn test_execute_classifies_proxy_error() {
        let (addr, _server) = serve_once(http_response("503 Service Unavailable", SQUID_PAGE)).await;
        let err = RequestGateway::new()
            .execute(
                RequestKind::GetDirect,
                &format!("http://{}/", addr),
                &RequestContext::direct(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::proxy_error("squid"));
    }

    #[test]
    fn test_execute_blocking_truncates_body() {
        let (addr, _server) = serve_once_blocking(http_response("200 OK", &"x".repeat(100)));
        let view = RequestGateway::with_config(GatewayConfig::new().with_max_body_bytes(10))
            .execute_blocking(
                RequestKind::GetDirect,
                &format!("http://{}/", addr),
                &RequestContext::direct(),
                None,
            )
            .unwrap();
        assert_eq!(view.bytes().len(), 10);
    }

    #[tokio::test]
    async fn test_execute_truncates_body() {
        let (addr, _server) = serve_once(http_response("200 OK", &"1.2.3.4:80\n".repeat(50))).await;
        let view = RequestGateway::with_config(GatewayConfig::new().with_max_body_bytes(16))
            .execute(
                RequestKind::GetDirect,
                &format!("http://{}/", addr),
                &RequestContext::direct(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(view.bytes().len(), 16);
        assert!(view.text().starts_with("1.2.3.4:80\n"));
    }

    #[tokio::test]
    async fn test_execute_through_tor_endpoint() {
        let (addr, server) = serve_once(http_response("200 OK", "direct")).await;
        let url = format!("http://{}/", addr);

        // nothing listens where the SOCKS endpoint points
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        let socks = Endpoint::new("127.0.0.1", dead.port());
        let short = Duration::from_secs(2);

        let err = RequestGateway::new()
            .execute(
                RequestKind::GetProxied,
                &url,
                &RequestContext::tor(Some(socks.clone())).with_timeout(short),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);

        // without an explicit endpoint the configured one is used
        let err = RequestGateway::with_config(GatewayConfig::new().with_tor_endpoint(socks.clone()))
            .execute(
                RequestKind::GetProxied,
                &url,
                &RequestContext::tor(None).with_timeout(short),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transport);

        // a direct kind ignores the Tor context
        let view = RequestGateway::new()
            .execute(
                RequestKind::GetDirect,
                &url,
                &RequestContext::tor(Some(socks)).with_timeout(short),
                None,
            )
            .await
            .unwrap();
        assert_eq!(view.text(), "direct");
        server.await.unwrap();
    }
}
