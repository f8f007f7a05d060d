//! HTTP backend
//!
//! Posts each request to the monitoring API's `timeSeries` collection for the
//! request's project. Credentials are a static bearer token, nothing, or an
//! access token from the metadata server, cached until shortly before it
//! expires.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{Backend, Error};
use crate::{metadata::Metadata, series::CreateTimeSeriesRequest};

/// The public monitoring API.
pub const DEFAULT_ENDPOINT: &str = "https://monitoring.googleapis.com";

/// Refresh metadata tokens this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
/// How requests are authorised
pub enum Credentials {
    /// Send no `Authorization` header.
    None,
    /// Send a fixed bearer token.
    Bearer {
        /// Token value
        token: String,
    },
    /// Fetch tokens for the default service account from the metadata
    /// server.
    #[default]
    Metadata,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

#[derive(Debug)]
enum Auth {
    None,
    Bearer(String),
    Metadata {
        metadata: Metadata,
        cached: Mutex<Option<CachedToken>>,
    },
}

/// Backend submitting over HTTP with JSON bodies.
#[derive(Debug)]
pub struct Http {
    client: reqwest::Client,
    endpoint: String,
    auth: Auth,
}

impl Http {
    /// Create a new [`Http`] backend posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or metadata client cannot be
    /// built.
    pub fn new(endpoint: impl Into<String>, credentials: &Credentials) -> Result<Self, Error> {
        let auth = match credentials {
            Credentials::None => Auth::None,
            Credentials::Bearer { token } => Auth::Bearer(token.clone()),
            Credentials::Metadata => Auth::Metadata {
                metadata: Metadata::new()?,
                cached: Mutex::new(None),
            },
        };
        Self::with_auth(endpoint.into(), auth)
    }

    /// Create a new [`Http`] backend authorised by tokens from `metadata`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_metadata(endpoint: impl Into<String>, metadata: Metadata) -> Result<Self, Error> {
        Self::with_auth(
            endpoint.into(),
            Auth::Metadata {
                metadata,
                cached: Mutex::new(None),
            },
        )
    }

    fn with_auth(endpoint: String, auth: Auth) -> Result<Self, Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth,
        })
    }

    async fn token(&self) -> Result<Option<String>, Error> {
        match &self.auth {
            Auth::None => Ok(None),
            Auth::Bearer(token) => Ok(Some(token.clone())),
            Auth::Metadata { metadata, cached } => {
                let mut cached = cached.lock().await;
                if let Some(current) = cached.as_ref() {
                    if Instant::now() < current.refresh_at {
                        return Ok(Some(current.token.clone()));
                    }
                }

                let fetched = metadata.access_token().await?;
                debug!(expires_in = fetched.expires_in, "fetched access token");
                let lifetime = Duration::from_secs(fetched.expires_in).saturating_sub(REFRESH_MARGIN);
                let now = Instant::now();
                let token = fetched.access_token;
                *cached = Some(CachedToken {
                    token: token.clone(),
                    refresh_at: now.checked_add(lifetime).unwrap_or(now),
                });
                Ok(Some(token))
            }
        }
    }
}

#[async_trait]
impl Backend for Http {
    async fn submit(&self, request: &CreateTimeSeriesRequest) -> Result<(), Error> {
        let url = format!("{}/v3/{}/timeSeries", self.endpoint, request.name);
        trace!(%url, series = request.time_series.len(), "submitting");

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = self.token().await? {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Status { status, body })
    }
}
