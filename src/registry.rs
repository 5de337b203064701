//! # OCI Registry Client
//!
//! Speaks the subset of the OCI Distribution API needed to pull an image:
//! anonymous bearer-token acquisition, manifest fetch by tag or digest, and
//! streamed blob download.
//!
//! ## Wire Protocol
//!
//! ```text
//! GET <auth-url>?service=<service>&scope=repository:<repo>:pull  → {"token": "..."}
//! GET <registry>/v2/<repo>/manifests/<tag|digest>                → manifest JSON
//! GET <registry>/v2/<repo>/blobs/<digest>                        → layer bytes
//! ```
//!
//! One [`AuthToken`] is fetched per pull and reused for every manifest and
//! blob request of that image.
//!
//! ## Failure Model
//!
//! | Condition                          | Error                               |
//! |------------------------------------|-------------------------------------|
//! | Token endpoint down / non-200 / bad JSON | [`Error::Auth`]               |
//! | Manifest or blob non-200           | [`Error::Registry`] (with status)   |
//! | Connection failure                 | [`Error::RegistryUnreachable`]      |
//!
//! 429 and 5xx responses (and connection failures) are retried up to
//! `max_retries` times with exponential backoff. 4xx responses are final.
//!
//! ## Timeouts
//!
//! Token and manifest requests are bounded by `request_timeout` as a whole.
//! Blob downloads can legitimately take long, so they are bounded per chunk
//! instead: a stalled connection fails, a slow but progressing one does not.
//!
//! [`Error::Auth`]: crate::error::Error::Auth
//! [`Error::Registry`]: crate::error::Error::Registry
//! [`Error::RegistryUnreachable`]: crate::error::Error::RegistryUnreachable

use crate::config::RuntimeConfig;
use crate::constants::{
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE, MAX_MANIFEST_SIZE,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Bearer token scoped to pulling one repository.
///
/// Never persisted and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Which manifest shape a request negotiates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Manifest list / OCI index, falling back to a single manifest for
    /// single-platform images.
    List,
    /// Single-platform image manifest only.
    Image,
}

impl ManifestKind {
    /// `Accept` header value for this kind.
    pub fn accept_header(&self) -> String {
        match self {
            Self::List => [
                DOCKER_MANIFEST_LIST_MEDIA_TYPE,
                OCI_IMAGE_INDEX_MEDIA_TYPE,
                DOCKER_MANIFEST_MEDIA_TYPE,
                OCI_IMAGE_MANIFEST_MEDIA_TYPE,
            ]
            .join(", "),
            Self::Image => [DOCKER_MANIFEST_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE].join(", "),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// HTTP client for one registry + token service pair.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    auth_url: String,
    auth_service: String,
    registry_url: String,
    namespace: String,
    request_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl RegistryClient {
    /// Creates a client from runtime configuration.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .user_agent(concat!("magikjail/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            auth_url: config.auth_url.clone(),
            auth_service: config.auth_service.clone(),
            registry_url: config.registry_url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            request_timeout: config.request_timeout,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        })
    }

    /// Repository path for an image name (`alpine` → `library/alpine`).
    pub fn repository(&self, image_name: &str) -> String {
        if image_name.contains('/') || self.namespace.is_empty() {
            image_name.to_string()
        } else {
            format!("{}/{}", self.namespace, image_name)
        }
    }

    /// Fetches an anonymous pull token for `image_name`.
    pub async fn get_token(&self, image_name: &str) -> Result<AuthToken> {
        let scope = format!("repository:{}:pull", self.repository(image_name));
        let auth_err = |reason: String| Error::Auth {
            image: image_name.to_string(),
            reason,
        };

        debug!(url = %self.auth_url, scope = %scope, "Requesting registry token");

        let response = self
            .http
            .get(&self.auth_url)
            .query(&[("service", self.auth_service.as_str()), ("scope", scope.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| auth_err(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(auth_err(format!(
                "token endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_err(format!("malformed token response: {}", e)))?;

        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .map(AuthToken)
            .ok_or_else(|| auth_err("token response has no token".to_string()))
    }

    /// Fetches a manifest by tag or digest.
    pub async fn get_manifest(
        &self,
        token: &AuthToken,
        image_name: &str,
        reference: &str,
        kind: ManifestKind,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url,
            self.repository(image_name),
            reference
        );
        let accept = kind.accept_header();

        debug!(url = %url, kind = ?kind, "Fetching manifest");

        let mut response = self.send(&url, token, &accept, Some(self.request_timeout)).await?;

        if let Some(len) = response.content_length()
            && len > MAX_MANIFEST_SIZE as u64
        {
            return Err(Error::ImageTooLarge {
                what: "manifest bytes",
                size: len,
                limit: MAX_MANIFEST_SIZE as u64,
            });
        }

        // Chunked responses carry no length; bound the body as it arrives.
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| Error::RegistryUnreachable {
            url: url.clone(),
            reason: e.to_string(),
        })? {
            if body.len() + chunk.len() > MAX_MANIFEST_SIZE {
                return Err(Error::ImageTooLarge {
                    what: "manifest bytes",
                    size: (body.len() + chunk.len()) as u64,
                    limit: MAX_MANIFEST_SIZE as u64,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    /// Opens a streamed blob download.
    ///
    /// Nothing beyond the response headers is read until the caller pulls
    /// chunks from the returned [`BlobStream`].
    pub async fn get_blob(
        &self,
        token: &AuthToken,
        image_name: &str,
        digest: &str,
        accept_media_type: &str,
    ) -> Result<BlobStream> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url,
            self.repository(image_name),
            digest
        );

        debug!(url = %url, "Opening blob stream");

        let response = self.send(&url, token, accept_media_type, None).await?;

        Ok(BlobStream {
            response,
            url,
            chunk_timeout: self.request_timeout,
        })
    }

    /// Sends an authenticated GET, retrying 429/5xx and connection failures.
    async fn send(
        &self,
        url: &str,
        token: &AuthToken,
        accept: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;

        loop {
            let mut request = self
                .http
                .get(url)
                .header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
                .header(ACCEPT, accept);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let err = match request.send().await {
                Ok(response) if response.status() == StatusCode::OK => return Ok(response),
                Ok(response) => Error::Registry {
                    status: response.status().as_u16(),
                    url: url.to_string(),
                },
                Err(e) => Error::RegistryUnreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                },
            };

            if attempt >= self.max_retries || !err.is_retryable() {
                return Err(err);
            }

            let delay = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
            warn!(
                url = %url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Registry request failed ({}), retrying",
                err
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// A blob download in progress.
pub struct BlobStream {
    response: reqwest::Response,
    url: String,
    chunk_timeout: Duration,
}

impl BlobStream {
    /// Size announced by the registry, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// URL the blob is being read from.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Reads the next chunk; `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.chunk_timeout, self.response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(Error::RegistryUnreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout {
                operation: format!("read blob chunk from {}", self.url),
                duration: self.chunk_timeout,
            }),
        }
    }
}
