//! Scripted fetcher shared by the crawler, validator and harvest tests

use crate::proxy::gateway::{
    Fetcher, Payload, RequestContext, RequestFailure, RequestKind, ResponseView,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Answers requests from a fixed routing table
///
/// Routes are keyed by URL, or by `host:port|url` to script the answer a
/// request gets when it goes through one specific proxy. Unrouted requests
/// fail with a transport error.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: HashMap<String, Result<String, RequestFailure>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, body: &str) -> Self {
        self.routes.insert(url.to_string(), Ok(body.to_string()));
        self
    }

    pub fn failure(mut self, url: &str, failure: RequestFailure) -> Self {
        self.routes.insert(url.to_string(), Err(failure));
        self
    }

    /// Script the body a judge returns when probed through `proxy`
    pub fn via(mut self, proxy: &str, url: &str, body: &str) -> Self {
        self.routes
            .insert(format!("{}|{}", proxy, url), Ok(body.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _kind: RequestKind,
        url: &str,
        ctx: &RequestContext,
        _payload: Option<&Payload>,
    ) -> Result<ResponseView, RequestFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let key = match &ctx.endpoint {
            Some(endpoint) => format!("{}|{}", endpoint, url),
            None => url.to_string(),
        };
        self.calls.lock().push(key.clone());

        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let route = self.routes.get(&key).or_else(|| self.routes.get(url));
        match route {
            Some(Ok(body)) => Ok(ResponseView::new(
                200,
                HeaderMap::new(),
                url,
                body.as_bytes().to_vec(),
            )),
            Some(Err(failure)) => Err(failure.clone()),
            None => Err(RequestFailure::transport("connection refused")),
        }
    }
}
