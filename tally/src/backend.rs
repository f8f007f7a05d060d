//! Time series submission backends
//!
//! A [`Backend`] takes one [`CreateTimeSeriesRequest`] per call. The reporter
//! never retries; a failed submission is handed to the error handler and its
//! points are dropped.

pub mod http;
pub mod jsonl;

use std::{fmt, fs::OpenOptions, io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::{metadata, series::CreateTimeSeriesRequest};

#[derive(thiserror::Error, Debug)]
/// Errors produced by a [`Backend`]
pub enum Error {
    /// The request could not be sent or its response read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend rejected the request.
    #[error("backend returned {status}: {body}")]
    Status {
        /// Status received
        status: StatusCode,
        /// Response body, possibly empty
        body: String,
    },
    /// Writing the request failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Serializing the request failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// No access token could be obtained.
    #[error("access token unavailable: {0}")]
    Token(#[from] metadata::Error),
}

#[async_trait]
/// Destination for time series
pub trait Backend: fmt::Debug + Send + Sync {
    /// Submit a single request.
    async fn submit(&self, request: &CreateTimeSeriesRequest) -> Result<(), Error>;
}

fn default_endpoint() -> String {
    http::DEFAULT_ENDPOINT.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
/// Configuration for a [`Backend`]
pub enum Config {
    /// Submit to the monitoring API over HTTP.
    Http {
        /// API root, without the version path.
        #[serde(default = "default_endpoint")]
        endpoint: String,
        /// How requests are authorised.
        #[serde(default)]
        credentials: http::Credentials,
    },
    /// Append each request as a JSON line to a file, or stdout when no path
    /// is given.
    Jsonl {
        /// Output file, created if missing and appended to.
        path: Option<PathBuf>,
    },
}

impl Default for Config {
    fn default() -> Self {
        Config::Http {
            endpoint: default_endpoint(),
            credentials: http::Credentials::default(),
        }
    }
}

impl Config {
    /// Construct the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the output file
    /// cannot be opened.
    pub fn build(&self) -> Result<Arc<dyn Backend>, Error> {
        let backend: Arc<dyn Backend> = match self {
            Config::Http {
                endpoint,
                credentials,
            } => Arc::new(http::Http::new(endpoint.clone(), credentials)?),
            Config::Jsonl { path: Some(path) } => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Arc::new(jsonl::Jsonl::new(file))
            }
            Config::Jsonl { path: None } => Arc::new(jsonl::Jsonl::new(io::stdout())),
        };
        Ok(backend)
    }
}
