use std::{path::Path, time::Duration};

use async_trait::async_trait;
use common::payloads::*;
use log::{debug, warn};
use reqwest::{multipart, Body, Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("bad status code {0}")]
    BadStatusCode(u16),
    #[error("json decode error: {0}")]
    JsonDecode(#[from] serde_json::Error),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url {0} cannot carry a path")]
    BaseUrl(String),
    #[error("not an uploadable file: {0}")]
    BadPath(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backoff for the idempotent reads done at startup. Writes, uploads and
/// predictions are never retried.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_tries: u8,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        Self {
            max_tries: 1,
            base_delay: Duration::ZERO,
        }
    }
}

/// Runs an async expression returning Result in a loop with exponential backoff.
/// Evaluates to the first Ok, or to the last Err once the policy runs out.
macro_rules! with_retries {
    ($policy:expr, $what:expr, $a:expr) => {{
        let policy: RetryPolicy = $policy;
        let max_tries = u32::from(policy.max_tries.max(1));
        let mut i: u32 = 0;
        loop {
            match $a {
                Ok(resp) => break Ok(resp),
                Err(e) if i + 1 >= max_tries => {
                    warn!("{}: max tries reached; returning error", $what);
                    break Err(e);
                }
                Err(e) => {
                    let to_sleep = policy.base_delay * (1u32 << i.min(16));
                    warn!("{}: try {i} failed, sleeping {to_sleep:?}: {e}", $what);
                    sleep(to_sleep).await;
                    i += 1;
                }
            }
        }
    }};
}

/// Everything the client needs from the slide backend.
#[async_trait]
pub trait SlideService: Send + Sync {
    /// Sends one file and returns the id the backend assigned to it.
    async fn upload(&self, path: &Path) -> Result<UploadResponse, ApiError>;

    /// Stored file names, e.g. `<file_id>.png`.
    async fn list_slides(&self) -> Result<Vec<String>, ApiError>;

    async fn load_metadata(&self) -> Result<MetadataMap, ApiError>;

    async fn save_metadata(&self, file_id: &str, update: &MetadataUpdate) -> Result<(), ApiError>;

    async fn predict(&self, file_id: &str) -> Result<PredictResponse, ApiError>;

    async fn delete(&self, file_id: &str) -> Result<(), ApiError>;
}

#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl HttpBackend {
    pub fn new(base_url: Url, retry: RetryPolicy) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::BaseUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .user_agent(concat!("morphoview/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .build()?;
        Ok(Self {
            client,
            base_url,
            retry,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends path segments to the base url, escaping each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::BaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `/uploads/{saved_as}`: the original image.
    pub fn image_url(&self, saved_as: &str) -> Result<Url, ApiError> {
        self.endpoint(&["uploads", saved_as])
    }

    /// `/tiles/{file_id}.dzi`: the deep-zoom descriptor for the tiled viewer.
    pub fn tiles_url(&self, file_id: &str) -> Result<Url, ApiError> {
        self.endpoint(&["tiles", &format!("{file_id}.dzi")])
    }

    /// Resolves an asset path handed out by the backend, such as a heatmap.
    pub fn asset_url(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    /// Processes a response from the server.
    /// This involves checking the status code and decoding the body.
    async fn process_response<Resp: DeserializeOwned>(
        input: reqwest::Result<Response>,
    ) -> Result<Resp, ApiError> {
        let res = input?;
        let status_code = res.status();
        if !status_code.is_success() {
            debug!(
                "unexpected {status_code} body: {}",
                res.text().await.unwrap_or_default()
            );
            return Err(ApiError::BadStatusCode(status_code.as_u16()));
        }
        let text = res.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    fn check_ack(ack: Ack) -> Result<(), ApiError> {
        if ack.success {
            Ok(())
        } else {
            Err(ApiError::Rejected(
                ack.message.unwrap_or_else(|| "no reason given".to_string()),
            ))
        }
    }

    async fn get<Resp: DeserializeOwned>(&self, url: Url) -> Result<Resp, ApiError> {
        let res = self.client.get(url).send().await;
        Self::process_response(res).await
    }

    async fn post<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        url: Url,
        payload: &Req,
    ) -> Result<Resp, ApiError> {
        let res = self.client.post(url).json(payload).send().await;
        Self::process_response(res).await
    }
}

#[async_trait]
impl SlideService for HttpBackend {
    async fn upload(&self, path: &Path) -> Result<UploadResponse, ApiError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ApiError::BadPath(path.display().to_string()))?
            .to_string();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let part = multipart::Part::stream_with_length(
            Body::wrap_stream(ReaderStream::new(file)),
            size,
        )
        .file_name(name);
        let form = multipart::Form::new().part("file", part);
        let url = self.endpoint(&["upload"])?;
        let res = self.client.post(url).multipart(form).send().await;
        Self::process_response(res).await
    }

    async fn list_slides(&self) -> Result<Vec<String>, ApiError> {
        let url = self.endpoint(&["slides"])?;
        let listing: SlideListing =
            with_retries!(self.retry, "list slides", self.get(url.clone()).await)?;
        Ok(listing.slides)
    }

    async fn load_metadata(&self) -> Result<MetadataMap, ApiError> {
        let url = self.endpoint(&["slides", "metadata", "all"])?;
        with_retries!(self.retry, "load metadata", self.get(url.clone()).await)
    }

    async fn save_metadata(&self, file_id: &str, update: &MetadataUpdate) -> Result<(), ApiError> {
        let url = self.endpoint(&["slides", file_id, "metadata"])?;
        let ack: Ack = self.post(url, update).await?;
        Self::check_ack(ack)
    }

    async fn predict(&self, file_id: &str) -> Result<PredictResponse, ApiError> {
        let nl = self.endpoint(&["predict"])?;
        let url = Url::parse_with_params(nl.as_str(), &[("file_id", file_id)])?;
        let res = self.client.post(url).send().await;
        Self::process_response(res).await
    }

    async fn delete(&self, file_id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["upload", file_id])?;
        let res = self.client.delete(url).send().await;
        let ack: Ack = Self::process_response(res).await?;
        Self::check_ack(ack)
    }
}
