use std::{future::Future, time::Duration};

use reqwest::{header::AUTHORIZATION, Client, Method, StatusCode, Url};

use crate::{
    error::{DestreamError, DestreamResult},
    session::Session,
};

const USER_AGENT: &str = concat!("destream/", env!("CARGO_PKG_VERSION"));
const RETRY_STATUS: [StatusCode; 4] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
];

/// Authenticated access to the streaming platform.
///
/// Implementations are expected to retry transient failures themselves.
pub trait AuthenticatedFetch {
    fn get_text(&self, url: &str) -> impl Future<Output = DestreamResult<String>> + Send;

    fn get_bytes(&self, url: &str) -> impl Future<Output = DestreamResult<Vec<u8>>> + Send;

    fn post_bytes(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = DestreamResult<Vec<u8>>> + Send;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    session: Session,
    retries: u32,
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(session: Session) -> DestreamResult<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(7))
            .build()?;

        Ok(Self {
            client,
            session,
            retries: 6,
            retry_delay: Duration::from_secs(2),
        })
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Base delay of the linear backoff. The n-th retry waits `n * delay`.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Resolves `url` against the API base, leaving absolute URLs untouched.
    pub fn resolve_url(&self, url: &str) -> DestreamResult<Url> {
        match Url::parse(url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(Url::parse(&self.session.api_base)?.join(url)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Calls an API-relative path, appending the session's `api-version`.
    pub async fn call_api(&self, path: &str) -> DestreamResult<serde_json::Value> {
        let mut url = self.resolve_url(path)?;
        if let Some(version) = &self.session.api_version {
            url.query_pairs_mut().append_pair("api-version", version);
        }
        let body = self.request(Method::GET, url, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> DestreamResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header(
                    AUTHORIZATION,
                    format!("Bearer {}", self.session.bearer_token),
                );
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.bytes().await?.to_vec());
                }
                Ok(response) => {
                    let status = response.status();
                    if !RETRY_STATUS.contains(&status) {
                        return Err(DestreamError::HttpError(status));
                    }
                    DestreamError::HttpError(status)
                }
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => e.into(),
                Err(e) => return Err(e.into()),
            };

            if attempt >= self.retries {
                return Err(error);
            }
            attempt += 1;
            tracing::warn!("{error}. Retrying request to {url} ({attempt}/{})...", self.retries);
            tokio::time::sleep(self.retry_delay * attempt).await;
        }
    }
}

impl AuthenticatedFetch for ApiClient {
    async fn get_text(&self, url: &str) -> DestreamResult<String> {
        let bytes = self.get_bytes(url).await?;
        String::from_utf8(bytes)
            .map_err(|e| DestreamError::ManifestParse(format!("response is not UTF-8: {e}")))
    }

    async fn get_bytes(&self, url: &str) -> DestreamResult<Vec<u8>> {
        let url = self.resolve_url(url)?;
        self.request(Method::GET, url, None).await
    }

    async fn post_bytes(&self, url: &str, body: Vec<u8>) -> DestreamResult<Vec<u8>> {
        let url = self.resolve_url(url)?;
        self.request(Method::POST, url, Some(body)).await
    }
}
