//! Reporter configuration
//!
//! [`Config`] is the in-process form, applied once when a
//! [`Reporter`](crate::reporter::Reporter) is built. Anything left unset falls
//! back to a default: the HTTP backend with metadata credentials, a global
//! resource for the detected project, an error handler that does nothing and
//! a sixty second refresh interval. [`Settings`] is the file form, parsed
//! from YAML.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{self, Backend},
    clock::{Clock, RealClock},
    reporter::Reporter,
    resource::Resource,
};

/// Refresh interval used when none is configured.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Called with the reporter and the error whenever a submission fails.
pub type ErrorHandler<C> = Arc<dyn Fn(&Reporter<C>, &backend::Error) + Send + Sync>;

/// Errors produced by [`Settings`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The configured backend could not be built.
    #[error("Failed to build backend: {0}")]
    Backend(#[from] backend::Error),
}

/// Construction-time options for a [`Reporter`].
pub struct Config<C = RealClock> {
    pub(crate) clock: C,
    pub(crate) backend: Option<Arc<dyn Backend>>,
    pub(crate) resource: Option<Resource>,
    pub(crate) error_handler: Option<ErrorHandler<C>>,
    pub(crate) refresh_interval: Duration,
    pub(crate) cancellation: CancellationToken,
}

impl Default for Config<RealClock> {
    fn default() -> Self {
        Self::new(RealClock)
    }
}

impl<C> Config<C>
where
    C: Clock,
{
    /// Create a new [`Config`] reading time from `clock`, everything else
    /// defaulted.
    #[must_use]
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            backend: None,
            resource: None,
            error_handler: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            cancellation: CancellationToken::new(),
        }
    }

    /// Submit through `backend`.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Attribute every series to `resource`.
    #[must_use]
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Call `handler` on every failed submission.
    #[must_use]
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Reporter<C>, &backend::Error) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Flush every `interval` instead of every sixty seconds.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Stop the reporter, without a final flush, once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The configured refresh interval.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }
}

impl<C> fmt::Debug for Config<C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("clock", &self.clock)
            .field("backend", &self.backend)
            .field("resource", &self.resource)
            .field("error_handler", &self.error_handler.is_some())
            .field("refresh_interval", &self.refresh_interval)
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

fn default_refresh_interval_seconds() -> u64 {
    DEFAULT_REFRESH_INTERVAL.as_secs()
}

/// File form of [`Config`]
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Seconds between flushes.
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
    /// Resource to attribute series to. Detected when unset.
    #[serde(default)]
    pub resource: Option<Resource>,
    /// Where series are submitted. The HTTP API when unset.
    #[serde(default)]
    pub backend: Option<backend::Config>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_refresh_interval_seconds(),
            resource: None,
            backend: None,
        }
    }
}

impl Settings {
    /// Parse settings from a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid settings.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse settings from the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid settings.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Turn these settings into a [`Config`] on the real clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured backend cannot be built.
    pub fn into_config(self) -> Result<Config<RealClock>, Error> {
        let mut config =
            Config::default().with_refresh_interval(Duration::from_secs(self.refresh_interval_seconds));
        if let Some(resource) = self.resource {
            config = config.with_resource(resource);
        }
        if let Some(backend) = self.backend {
            config = config.with_backend(backend.build()?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use super::{Config, DEFAULT_REFRESH_INTERVAL, Error, Settings};
    use crate::{backend, clock::ManualClock, resource::Resource};

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert!(config.backend.is_none());
        assert!(config.resource.is_none());
        assert!(config.error_handler.is_none());
        assert!(!config.cancellation.is_cancelled());
    }

    #[test]
    fn builders_override() {
        let config = Config::new(ManualClock::from_unix_seconds(0))
            .with_refresh_interval(Duration::from_secs(10))
            .with_resource(Resource::global("tally"))
            .with_error_handler(|_, _| {});
        assert_eq!(config.refresh_interval(), Duration::from_secs(10));
        assert_eq!(config.resource, Some(Resource::global("tally")));
        assert!(config.error_handler.is_some());
    }

    #[test]
    fn empty_settings_are_defaults() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.refresh_interval_seconds, 60);
    }

    #[test]
    fn full_settings() {
        let settings = Settings::from_yaml(
            r"
refresh_interval_seconds: 15
resource:
  type: generic_task
  project_id: tally
  location: europe-west2
  namespace: ingest
  job: parser
  task_id: '3'
backend:
  type: jsonl
",
        )
        .unwrap();

        assert_eq!(settings.refresh_interval_seconds, 15);
        assert_eq!(
            settings.resource,
            Some(Resource::GenericTask {
                project_id: "tally".to_string(),
                location: "europe-west2".to_string(),
                namespace: "ingest".to_string(),
                job: "parser".to_string(),
                task_id: "3".to_string(),
            })
        );
        assert_eq!(settings.backend, Some(backend::Config::Jsonl { path: None }));

        let config = settings.into_config().unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(15));
        assert!(config.backend.is_some());
        assert!(config.resource.is_some());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Settings::from_yaml("refresh_interval: 15"),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.yaml");
        fs::write(&path, "refresh_interval_seconds: 30\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.refresh_interval_seconds, 30);
        assert_eq!(DEFAULT_REFRESH_INTERVAL, Duration::from_secs(60));
    }

    #[test]
    fn missing_file_names_path() {
        match Settings::load(Path::new("/definitely/not/here.yaml")) {
            Err(Error::ReadFile { path, .. }) => {
                assert_eq!(path, Path::new("/definitely/not/here.yaml"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
