//! Compute metadata server client
//!
//! Instances on the cloud platform can ask a link-local metadata server who
//! they are: project, instance, zone and short-lived access tokens. Lookups
//! here back resource detection and the default backend's credentials.
//! Off-platform every lookup fails quickly and detection falls back to empty
//! values.

use std::{env, time::Duration};

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::resource::Resource;

/// Overrides the metadata server host, e.g. `localhost:8080`.
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";
/// Names the project explicitly, skipping the metadata server.
pub const PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

const DEFAULT_HOST: &str = "169.254.169.254";
const FLAVOR_HEADER: &str = "Metadata-Flavor";
const FLAVOR: &str = "Google";
const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Metadata`]
pub enum Error {
    /// The request could not be built, sent or read.
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("metadata server returned {status} for {path}")]
    Status {
        /// Path requested
        path: String,
        /// Status received
        status: StatusCode,
    },
}

/// An access token issued to the instance's default service account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    /// Bearer token value.
    pub access_token: String,
    /// Seconds until the token expires.
    pub expires_in: u64,
    /// Token type, normally `Bearer`.
    #[serde(default)]
    pub token_type: String,
}

/// Client for the compute metadata server.
#[derive(Debug, Clone)]
pub struct Metadata {
    client: reqwest::Client,
    base: String,
}

impl Metadata {
    /// Create a client for the server named by `GCE_METADATA_HOST`, or the
    /// well-known link-local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self, Error> {
        let host = env::var(METADATA_HOST_ENV).unwrap_or_else(|_| DEFAULT_HOST.to_string());
        Self::with_host(&host)
    }

    /// Create a client for the server at `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_host(host: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(TIMEOUT).build()?;
        Ok(Self {
            client,
            base: format!("http://{host}/computeMetadata/v1"),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, Error> {
        let url = format!("{}/{path}", self.base);
        trace!(%url, "metadata lookup");
        let response = self
            .client
            .get(&url)
            .header(FLAVOR_HEADER, FLAVOR)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                path: path.to_string(),
                status,
            });
        }
        Ok(response)
    }

    async fn get_text(&self, path: &str) -> Result<String, Error> {
        let body = self.get(path).await?.text().await?;
        Ok(body.trim().to_string())
    }

    /// The project the instance belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or refuses the lookup.
    pub async fn project_id(&self) -> Result<String, Error> {
        self.get_text("project/project-id").await
    }

    /// The numeric instance identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or refuses the lookup.
    pub async fn instance_id(&self) -> Result<String, Error> {
        self.get_text("instance/id").await
    }

    /// The zone the instance runs in, e.g. `us-central1-a`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or refuses the lookup.
    pub async fn zone(&self) -> Result<String, Error> {
        // Served as `projects/<number>/zones/<zone>`.
        let full = self.get_text("instance/zone").await?;
        Ok(full.rsplit('/').next().unwrap_or_default().to_string())
    }

    /// A custom instance attribute, e.g. `cluster-name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or the attribute is not
    /// set.
    pub async fn instance_attribute(&self, attribute: &str) -> Result<String, Error> {
        self.get_text(&format!("instance/attributes/{attribute}"))
            .await
    }

    /// An access token for the default service account.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable, refuses the lookup or
    /// answers with an unexpected body.
    pub async fn access_token(&self) -> Result<AccessToken, Error> {
        let token = self
            .get("instance/service-accounts/default/token")
            .await?
            .json()
            .await?;
        Ok(token)
    }

    /// Describe this instance as a [`Resource::GceInstance`].
    ///
    /// Values that cannot be looked up are left empty.
    pub async fn detect_gce_instance(&self) -> Resource {
        Resource::GceInstance {
            project_id: detect_project_id(self).await.unwrap_or_default(),
            instance_id: ok_or_empty("instance_id", self.instance_id().await),
            zone: ok_or_empty("zone", self.zone().await),
        }
    }

    /// Describe the current container as a [`Resource::GkeContainer`].
    ///
    /// Cluster details come from the metadata server; namespace, pod and
    /// container are read from the `NAMESPACE`, `POD_ID` and `CONTAINER_NAME`
    /// environment variables, usually populated through the downward API.
    pub async fn detect_gke_container(&self) -> Resource {
        self.gke_container_from(|key| env::var(key).ok()).await
    }

    async fn gke_container_from<F>(&self, lookup: F) -> Resource
    where
        F: Fn(&str) -> Option<String>,
    {
        Resource::GkeContainer {
            project_id: detect_project_id_from(lookup(PROJECT_ENV), self)
                .await
                .unwrap_or_default(),
            cluster_name: ok_or_empty(
                "cluster_name",
                self.instance_attribute("cluster-name").await,
            ),
            instance_id: ok_or_empty("instance_id", self.instance_id().await),
            zone: ok_or_empty(
                "zone",
                self.instance_attribute("cluster-location").await,
            ),
            namespace_id: lookup("NAMESPACE").unwrap_or_default(),
            pod_id: lookup("POD_ID").unwrap_or_default(),
            container_name: lookup("CONTAINER_NAME").unwrap_or_default(),
        }
    }
}

fn ok_or_empty(field: &str, result: Result<String, Error>) -> String {
    result.unwrap_or_else(|err| {
        debug!(field, %err, "metadata lookup failed");
        String::new()
    })
}

/// The project to report under.
///
/// `GOOGLE_CLOUD_PROJECT` wins when set and non-empty, otherwise the metadata
/// server is asked. Returns `None` if neither yields a project.
pub async fn detect_project_id(metadata: &Metadata) -> Option<String> {
    detect_project_id_from(env::var(PROJECT_ENV).ok(), metadata).await
}

async fn detect_project_id_from(explicit: Option<String>, metadata: &Metadata) -> Option<String> {
    if let Some(project_id) = explicit.filter(|p| !p.is_empty()) {
        debug!(%project_id, "project id from environment");
        return Some(project_id);
    }
    match metadata.project_id().await {
        Ok(project_id) if !project_id.is_empty() => {
            debug!(%project_id, "project id from metadata server");
            Some(project_id)
        }
        Ok(_) => None,
        Err(err) => {
            debug!(%err, "project id detection failed");
            None
        }
    }
}
