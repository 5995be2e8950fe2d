use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::Stream;

use crate::error::{CoreResult, SearchError};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::SearchRequest;

/// Raw response body chunks, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// Opens one long-lived response body per query.
#[async_trait]
pub trait SearchTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn open(&self, req: &SearchRequest, ctx: &RequestCtx<'_>) -> CoreResult<ByteStream>;
}

/// POSTs the request as JSON to the configured search endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    url: String,
}

impl HttpTransport {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn from_config(cfg: &crate::config::Config) -> CoreResult<Self> {
        Ok(Self::new(
            HttpClient::from_config(&cfg.http)?,
            cfg.endpoint.url.clone(),
        ))
    }
}

#[async_trait]
impl SearchTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, req: &SearchRequest, ctx: &RequestCtx<'_>) -> CoreResult<ByteStream> {
        self.http.post_stream(&self.url, req, &[], ctx).await
    }
}

/// A transport that replays canned chunks for every query.
/// Useful for tests or for replaying a captured response body offline.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<std::sync::Mutex<std::collections::VecDeque<Script>>>,
}

#[derive(Debug, Clone)]
enum Script {
    Chunks(Vec<Bytes>),
    Refuse(u16),
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response body for the next `open`, split into the given chunks.
    pub fn push_body<I, B>(&self, chunks: I) -> &Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.queue(Script::Chunks(chunks.into_iter().map(Into::into).collect()))
    }

    /// Queue a refusal: the next `open` fails as if the endpoint answered `status`.
    pub fn push_refusal(&self, status: u16) -> &Self {
        self.queue(Script::Refuse(status))
    }

    fn queue(&self, script: Script) -> &Self {
        if let Ok(mut q) = self.scripts.lock() {
            q.push_back(script);
        }
        self
    }
}

#[async_trait]
impl SearchTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _req: &SearchRequest, _ctx: &RequestCtx<'_>) -> CoreResult<ByteStream> {
        let next = self
            .scripts
            .lock()
            .map_err(|_| SearchError::Other(anyhow::anyhow!("scripted transport poisoned")))?
            .pop_front();
        match next {
            Some(Script::Chunks(chunks)) => Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            ))),
            Some(Script::Refuse(status)) => Err(SearchError::Transport {
                status: Some(status),
                retry_after: None,
                message: "scripted refusal".into(),
            }),
            None => Err(SearchError::Transport {
                status: None,
                retry_after: None,
                message: "no scripted response left".into(),
            }),
        }
    }
}
