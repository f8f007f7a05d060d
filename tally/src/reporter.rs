//! The reporting client
//!
//! A [`Reporter`] owns the registered counters and a [`Scheduler`] that
//! flushes them. Each flush drains every counter and turns each drained
//! window into a point. The backend accepts at most one point per metric
//! identity in a request, so points are spread over as many requests as the
//! busiest metric has windows: the first window of every metric goes in the
//! first request, the second in the second and so on. Requests are submitted
//! one after the other. A failed request is handed to the error handler and
//! does not stop the rest.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use crate::{
    backend::{
        self, Backend,
        http::{Credentials, DEFAULT_ENDPOINT, Http},
    },
    clock::{Clock, RealClock},
    config::{Config, ErrorHandler},
    counter::{self, Counter},
    metadata::{self, Metadata},
    resource::{self, Resource},
    scheduler::{self, Scheduler, Scope},
    series::{
        CreateTimeSeriesRequest, Metric, MetricKind, MonitoredResource, Point, TimeSeries,
        project_path,
    },
    validate,
};

/// Errors produced by [`Reporter`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The metric name is not acceptable to the backend.
    #[error("invalid name parameter provided: {0}")]
    InvalidName(String),
    /// A label key is not acceptable to the backend.
    #[error("invalid label key provided: {0}")]
    InvalidLabelKey(String),
    /// The refresh interval is zero.
    #[error("refresh interval must be greater than 0")]
    InvalidRefreshInterval,
    /// The counter could not be created.
    #[error(transparent)]
    Counter(#[from] counter::Error),
    /// The resource is incomplete.
    #[error(transparent)]
    Resource(#[from] resource::Error),
    /// The default backend could not be built.
    #[error(transparent)]
    Backend(#[from] backend::Error),
    /// The metadata client could not be built.
    #[error(transparent)]
    Metadata(#[from] metadata::Error),
}

struct Binding<C> {
    metric: Metric,
    counter: Arc<Counter<C>>,
}

struct Inner<C> {
    clock: C,
    backend: Arc<dyn Backend>,
    resource: MonitoredResource,
    project_path: String,
    error_handler: ErrorHandler<C>,
    bindings: RwLock<Vec<Binding<C>>>,
    scheduler: Scheduler,
    // Cancels the run loop once the last handle is gone.
    _shutdown: DropGuard,
}

/// Reports interval counters to a time series backend.
///
/// Cloning is cheap, clones share counters and the flush loop. The loop runs
/// until [`Reporter::stop`] is called, the configured cancellation token
/// fires or the last handle is dropped. Only `stop` flushes the window still
/// open.
pub struct Reporter<C = RealClock> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Reporter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Reporter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("resource", &self.inner.resource)
            .field("backend", &self.inner.backend)
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

fn ignore_errors<C>(_: &Reporter<C>, _: &backend::Error) {}

impl<C> Reporter<C>
where
    C: Clock,
{
    /// Create a new [`Reporter`] and start its flush loop.
    ///
    /// Without a configured resource the reporter describes itself as a
    /// global resource for the detected project. Without a configured backend
    /// it submits to the public API with metadata server credentials.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh interval is zero, no project id is
    /// configured or detected, or the default backend cannot be built.
    pub async fn new(config: Config<C>) -> Result<Self, Error> {
        let Config {
            clock,
            backend,
            resource,
            error_handler,
            refresh_interval,
            cancellation,
        } = config;

        let shutdown = cancellation.child_token();
        let scheduler = Scheduler::new(refresh_interval, shutdown.clone())
            .map_err(|scheduler::Error::ZeroPeriod| Error::InvalidRefreshInterval)?;

        let resource = match resource {
            Some(resource) => resource,
            None => {
                let metadata = Metadata::new()?;
                let project_id = metadata::detect_project_id(&metadata)
                    .await
                    .unwrap_or_default();
                Resource::global(project_id)
            }
        };
        let monitored = MonitoredResource::try_from(&resource)?;

        let backend = match backend {
            Some(backend) => backend,
            None => Arc::new(Http::new(DEFAULT_ENDPOINT, &Credentials::Metadata)?),
        };

        let inner = Arc::new(Inner {
            clock,
            backend,
            project_path: project_path(resource.project_id()),
            resource: monitored,
            error_handler: error_handler.unwrap_or_else(|| Arc::new(ignore_errors::<C>)),
            bindings: RwLock::new(Vec::new()),
            scheduler,
            _shutdown: shutdown.drop_guard(),
        });
        info!(
            resource = %inner.resource.resource_type,
            project = resource.project_id(),
            "reporter created"
        );

        let weak = Arc::downgrade(&inner);
        inner.scheduler.start(&inner.clock, move |scope| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    Reporter { inner }.report(scope).await;
                }
            }
        });

        Ok(Self { inner })
    }

    /// Register a new counter for the metric `name` with `labels`, bucketing
    /// increments into windows `interval` seconds long.
    ///
    /// # Errors
    ///
    /// Returns an error, and registers nothing, if the name or a label key is
    /// not acceptable to the backend or the interval is not positive.
    pub fn create_counter<I, K, V>(
        &self,
        name: &str,
        labels: I,
        interval: i64,
    ) -> Result<Arc<Counter<C>>, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        if !validate::is_valid_metric_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }

        let labels: BTreeMap<String, String> = labels
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        if let Some(key) = labels.keys().find(|key| !validate::is_valid_label_key(key)) {
            return Err(Error::InvalidLabelKey(key.clone()));
        }

        let counter = Arc::new(Counter::new(interval, self.inner.clock.clone())?);
        let metric = Metric::custom(name, labels);
        debug!(metric = %metric.metric_type, interval, "counter registered");

        self.inner
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Binding {
                metric,
                counter: Arc::clone(&counter),
            });
        Ok(counter)
    }

    /// The registered metric identities, in registration order.
    #[must_use]
    pub fn metrics(&self) -> Vec<Metric> {
        self.inner
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|binding| binding.metric.clone())
            .collect()
    }

    /// The resource every series is attributed to.
    #[must_use]
    pub fn resource(&self) -> &MonitoredResource {
        &self.inner.resource
    }

    /// Whether the flush loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.scheduler.is_running()
    }

    /// Drain every counter and submit the resulting points.
    ///
    /// Submission failures go to the error handler, never to the caller.
    pub async fn report(&self, scope: Scope) {
        let requests = self.batch(scope);
        if requests.is_empty() {
            return;
        }
        debug!(requests = requests.len(), ?scope, "reporting");

        for request in &requests {
            let points = u64::try_from(request.point_count()).unwrap_or(u64::MAX);
            match self.inner.backend.submit(request).await {
                Ok(()) => {
                    counter!("tally_batches_submitted").increment(1);
                    counter!("tally_points_submitted").increment(points);
                }
                Err(err) => {
                    warn!(%err, points, "submission failed, points dropped");
                    counter!("tally_submission_failures").increment(1);
                    (self.inner.error_handler)(self, &err);
                }
            }
        }
    }

    fn batch(&self, scope: Scope) -> Vec<CreateTimeSeriesRequest> {
        let bindings = self
            .inner
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut batches: Vec<Vec<TimeSeries>> = Vec::new();
        // Next batch index per metric identity. Bindings sharing an identity
        // share the slot so they never land in the same request.
        let mut next: FxHashMap<&Metric, usize> = FxHashMap::default();

        for binding in bindings.iter() {
            let windows = binding
                .counter
                .take_completed_windows(scope.includes_current());
            if windows.is_empty() {
                continue;
            }

            let slot = next.entry(&binding.metric).or_insert(0);
            for window in &windows {
                if batches.len() <= *slot {
                    batches.push(Vec::new());
                }
                batches[*slot].push(TimeSeries {
                    metric: binding.metric.clone(),
                    metric_kind: MetricKind::Cumulative,
                    resource: self.inner.resource.clone(),
                    points: vec![Point::from(window)],
                });
                *slot += 1;
            }
        }
        drop(bindings);

        batches
            .into_iter()
            .map(|time_series| CreateTimeSeriesRequest {
                name: self.inner.project_path.clone(),
                time_series,
            })
            .collect()
    }

    /// Stop the flush loop after one last flush that includes the window
    /// still open.
    ///
    /// Returns once the loop has exited. Does nothing if the loop is not
    /// running. Counts made after this returns are not reported.
    pub async fn stop(&self) {
        self.inner.scheduler.stop().await;
    }
}
