// HTTP transport: the request/response primitive the request queue drives.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode, Version};
use tracing::debug;
use url::Url;

use crate::config::MirrorConfig;
use crate::error::MirrorError;

/// A request waiting to be issued.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Status line and headers of a response whose body has not been read yet.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Two-phase HTTP capability: exchange headers, then stream the body.
///
/// Implementations need not be safe to call concurrently for the same
/// destination; the request queue never does so.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Response state carried from the header phase to the body phase.
    type Response: Send + 'static;

    async fn issue(
        &self,
        request: HttpRequest,
    ) -> Result<(ResponseHead, Self::Response), MirrorError>;

    async fn read_body(&self, response: Self::Response) -> Result<Bytes, MirrorError>;
}

/// Builds the HTTP client used for a mirroring session.
pub fn create_client(config: &MirrorConfig) -> Result<Client, MirrorError> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .http1_only();

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    builder = if config.follow_redirects {
        builder.redirect(reqwest::redirect::Policy::limited(10))
    } else {
        builder.redirect(reqwest::redirect::Policy::none())
    };

    if let Some(proxy_url) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| MirrorError::configuration(format!("invalid proxy `{proxy_url}`: {e}")))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// [`Transport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &MirrorConfig) -> Result<Self, MirrorError> {
        Ok(Self::new(create_client(config)?))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    type Response = reqwest::Response;

    async fn issue(
        &self,
        request: HttpRequest,
    ) -> Result<(ResponseHead, Self::Response), MirrorError> {
        let url = request.url.to_string();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let head = ResponseHead {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
        };
        debug!(
            url = %url,
            status = %head.status,
            version = ?head.version,
            headers = ?head.headers,
            "Received response head"
        );

        if !head.status.is_success() {
            return Err(MirrorError::http_status(head.status, url, "request"));
        }
        Ok((head, response))
    }

    async fn read_body(&self, response: Self::Response) -> Result<Bytes, MirrorError> {
        Ok(response.bytes().await?)
    }
}
