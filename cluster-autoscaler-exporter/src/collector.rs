//! Scrape-driven collector that turns the autoscaler status into Prometheus metrics.
//!
//! Every scrape runs one fetch → extract → publish cycle and encodes the
//! registry while still holding the collector lock, so concurrent scrapes
//! never overlap upstream calls and each response reflects exactly one cycle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ExporterConfig;
use crate::extractor::{ActivityTimestamps, ExtractError, StatusExtractor};
use crate::source::{ConfigMapRef, SourceError, StatusSource, fetch_with_timeout};

/// Prefix of every exporter metric except `up`.
pub const METRIC_NAMESPACE: &str = "cluster_autoscaler";

/// Labels of `cluster_autoscaler_last_activity`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ActivityLabels {
    pub activity: String,
}

/// Labels of `cluster_autoscaler_scrape_failures_total`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildLabels {
    name: String,
    version: String,
}

/// Why a scrape cycle failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScrapeError {
    /// The API could not be reached or did not answer in time.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(SourceError),

    /// The ConfigMap or its data key is absent.
    #[error("status not found: {0}")]
    NotFound(SourceError),

    /// The status document is malformed or incomplete.
    #[error("{0}")]
    Parse(ExtractError),

    /// A timestamp does not match its layout.
    #[error("{0}")]
    TimestampFormat(ExtractError),
}

impl ScrapeError {
    /// Stable label value for the failure counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Parse(_) => "parse",
            Self::TimestampFormat(_) => "timestamp_format",
        }
    }
}

impl From<SourceError> for ScrapeError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound { .. } | SourceError::MissingKey { .. } => Self::NotFound(err),
            SourceError::Timeout { .. } | SourceError::Connection(_) | SourceError::Client(_) => {
                Self::UpstreamUnavailable(err)
            }
        }
    }
}

impl From<ExtractError> for ScrapeError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Parse(_) => Self::Parse(err),
            ExtractError::TimestampFormat { .. } => Self::TimestampFormat(err),
        }
    }
}

/// Result of one scrape cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// All three timestamps were published.
    Success(ActivityTimestamps),
    /// The cycle failed and the failure indicator was set.
    Failure(ScrapeError),
}

impl ScrapeOutcome {
    /// Whether the cycle published fresh timestamps.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Metric handles registered in the collector's registry.
#[derive(Debug, Default)]
struct ExporterMetrics {
    up: Gauge,
    last_activity: Family<ActivityLabels, Gauge>,
    scrape_error: Gauge,
    scrapes: Counter,
    scrape_failures: Family<FailureLabels, Counter>,
    scrape_duration: Gauge<f64, AtomicU64>,
    start_time: Gauge,
}

impl ExporterMetrics {
    fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();

        registry.register(
            "up",
            "Whether the exporter is running",
            metrics.up.clone(),
        );

        let ca = registry.sub_registry_with_prefix(METRIC_NAMESPACE);
        ca.register(
            "last_activity",
            "LastProbeTime as reported in the cluster-autoscaler-status configmap",
            metrics.last_activity.clone(),
        );
        ca.register(
            "scrape_error",
            "Set to 0 for successful scrape, or 1 otherwise",
            metrics.scrape_error.clone(),
        );
        ca.register(
            "scrapes",
            "Number of scrape cycles run",
            metrics.scrapes.clone(),
        );
        ca.register(
            "scrape_failures",
            "Number of failed scrape cycles by reason",
            metrics.scrape_failures.clone(),
        );
        ca.register(
            "scrape_duration_seconds",
            "Duration of the last scrape cycle",
            metrics.scrape_duration.clone(),
        );
        ca.register(
            "start_time_seconds",
            "Start time of the exporter since unix epoch in seconds",
            metrics.start_time.clone(),
        );
        ca.register(
            "build",
            "Exporter build information",
            Info::new(BuildLabels {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        );

        metrics.up.set(1);
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        metrics.start_time.set(started as i64);

        metrics
    }
}

/// Thread-safe collector owning the metrics registry.
pub struct StatusCollector<S> {
    /// Held for the whole cycle; serialises upstream calls.
    source: Mutex<S>,
    target: ConfigMapRef,
    timeout: Duration,
    extractor: StatusExtractor,
    registry: Registry,
    metrics: ExporterMetrics,
    /// Set once any cycle succeeded.
    succeeded: AtomicBool,
}

/// Create a shareable collector handle.
pub type SharedCollector<S> = Arc<StatusCollector<S>>;

impl<S: StatusSource> StatusCollector<S> {
    /// Create a collector reading `target` through `source`.
    pub fn new(
        source: S,
        target: ConfigMapRef,
        timeout: Duration,
        extractor: StatusExtractor,
    ) -> Self {
        let mut registry = Registry::default();
        let metrics = ExporterMetrics::register(&mut registry);

        Self {
            source: Mutex::new(source),
            target,
            timeout,
            extractor,
            registry,
            metrics,
            succeeded: AtomicBool::new(false),
        }
    }

    /// Create a collector from the exporter configuration.
    pub fn from_config(source: S, config: &ExporterConfig) -> Self {
        Self::new(
            source,
            ConfigMapRef::from(&config.kubernetes),
            config.kubernetes.request_timeout(),
            StatusExtractor::new(config.extractor.mode),
        )
    }

    /// Run one cycle without rendering.
    pub async fn collect(&self) -> ScrapeOutcome {
        let source = self.source.lock().await;
        self.run_cycle(&source).await
    }

    /// Run one cycle and encode the registry before releasing the lock.
    pub async fn scrape(&self) -> (ScrapeOutcome, Result<String, fmt::Error>) {
        let source = self.source.lock().await;
        let outcome = self.run_cycle(&source).await;
        let body = self.render();
        (outcome, body)
    }

    /// Encode the registry in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }

    /// Whether at least one cycle has succeeded.
    pub fn has_succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// The ConfigMap this collector reads.
    pub fn target(&self) -> &ConfigMapRef {
        &self.target
    }

    async fn run_cycle(&self, source: &S) -> ScrapeOutcome {
        let started = Instant::now();
        self.metrics.scrapes.inc();

        let outcome = match self.fetch_and_extract(source).await {
            Ok(timestamps) => {
                self.publish(&timestamps);
                ScrapeOutcome::Success(timestamps)
            }
            Err(err) => {
                self.fail(&err);
                ScrapeOutcome::Failure(err)
            }
        };

        self.metrics
            .scrape_duration
            .set(started.elapsed().as_secs_f64());
        outcome
    }

    async fn fetch_and_extract(&self, source: &S) -> Result<ActivityTimestamps, ScrapeError> {
        let document = fetch_with_timeout(source, &self.target, self.timeout).await?;

        self.extractor.extract(&document).map_err(|err| {
            debug!(
                configmap = %self.target,
                mode = ?self.extractor.mode(),
                document = %document,
                "Could not extract timestamps from status document"
            );
            ScrapeError::from(err)
        })
    }

    fn publish(&self, timestamps: &ActivityTimestamps) {
        // Drop samples from a previous cycle before setting the new ones.
        self.metrics.last_activity.clear();

        for (activity, seconds) in timestamps.unix_seconds() {
            self.metrics
                .last_activity
                .get_or_create(&ActivityLabels {
                    activity: activity.as_str().to_string(),
                })
                .set(seconds);
        }

        self.metrics.scrape_error.set(0);

        if !self.succeeded.swap(true, Ordering::Relaxed) {
            info!(configmap = %self.target, "First successful scrape");
        }
        debug!(
            main = %timestamps.main,
            scale_up = %timestamps.scale_up,
            scale_down = %timestamps.scale_down,
            "Published activity timestamps"
        );
    }

    fn fail(&self, err: &ScrapeError) {
        // Failed cycles never leave stale activity values behind.
        self.metrics.last_activity.clear();
        self.metrics.scrape_error.set(1);
        self.metrics
            .scrape_failures
            .get_or_create(&FailureLabels {
                reason: err.reason().to_string(),
            })
            .inc();

        warn!(
            configmap = %self.target,
            reason = err.reason(),
            error = %err,
            "Scrape failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{Activity, ExtractMode};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    const LEGACY_LINE: &str =
        "LastProbeTime: 2022-09-11 11:21:27.046154458 +0000 UTC m=+25121.073170634\n";

    /// Source returning queued responses, repeating the last one.
    struct Scripted {
        responses: StdMutex<Vec<Result<String, SourceError>>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String, SourceError>>) -> Self {
            Self {
                responses: StdMutex::new(responses),
            }
        }
    }

    impl StatusSource for Scripted {
        async fn fetch(&self, _target: &ConfigMapRef) -> Result<String, SourceError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        }
    }

    /// Source that records how many fetches overlap.
    #[derive(Default)]
    struct Slow {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl StatusSource for Arc<Slow> {
        async fn fetch(&self, _target: &ConfigMapRef) -> Result<String, SourceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(LEGACY_LINE.repeat(3))
        }
    }

    struct Hanging;

    impl StatusSource for Hanging {
        async fn fetch(&self, _target: &ConfigMapRef) -> Result<String, SourceError> {
            std::future::pending().await
        }
    }

    fn collector<S: StatusSource>(source: S) -> StatusCollector<S> {
        StatusCollector::from_config(source, &ExporterConfig::default())
    }

    fn not_found() -> SourceError {
        SourceError::NotFound {
            namespace: "kube-system".to_string(),
            name: "cluster-autoscaler-status".to_string(),
        }
    }

    fn activity_samples(body: &str) -> Vec<&str> {
        body.lines()
            .filter(|line| line.starts_with("cluster_autoscaler_last_activity{"))
            .collect()
    }

    #[test]
    fn test_scrape_error_from_source_error() {
        assert_eq!(ScrapeError::from(not_found()).reason(), "not_found");
        assert_eq!(
            ScrapeError::from(SourceError::MissingKey {
                target: "kube-system/cluster-autoscaler-status".to_string(),
                key: "status".to_string(),
            })
            .reason(),
            "not_found"
        );
        assert_eq!(
            ScrapeError::from(SourceError::Timeout {
                target: "x".to_string(),
                after: Duration::from_secs(1),
            })
            .reason(),
            "upstream_unavailable"
        );
        assert_eq!(
            ScrapeError::from(SourceError::Connection("refused".to_string())).reason(),
            "upstream_unavailable"
        );
    }

    #[test]
    fn test_scrape_error_from_extract_error() {
        assert_eq!(
            ScrapeError::from(ExtractError::Parse("empty".to_string())).reason(),
            "parse"
        );
        assert_eq!(
            ScrapeError::from(ExtractError::TimestampFormat {
                activity: Activity::Main,
                value: "x".to_string(),
                reason: "bad".to_string(),
            })
            .reason(),
            "timestamp_format"
        );
    }

    #[test]
    fn test_render_before_first_scrape() {
        let collector = collector(Scripted::new(vec![Ok(String::new())]));
        let body = collector.render().unwrap();

        assert!(body.contains("up 1"));
        assert!(body.contains("# TYPE cluster_autoscaler_last_activity gauge"));
        assert!(body.contains("cluster_autoscaler_build_info{"));
        assert!(body.contains("cluster_autoscaler_start_time_seconds "));
        assert!(activity_samples(&body).is_empty());
        assert!(!collector.has_succeeded());
    }

    #[tokio::test]
    async fn test_successful_scrape_publishes_gauges() {
        let collector = collector(Scripted::new(vec![Ok(LEGACY_LINE.repeat(3))]));

        let (outcome, body) = collector.scrape().await;
        let body = body.unwrap();

        assert!(outcome.is_success());
        assert!(body.contains("cluster_autoscaler_last_activity{activity=\"main\"} 1662895287"));
        assert!(
            body.contains("cluster_autoscaler_last_activity{activity=\"scaleUp\"} 1662895287")
        );
        assert!(
            body.contains("cluster_autoscaler_last_activity{activity=\"scaleDown\"} 1662895287")
        );
        assert!(body.contains("cluster_autoscaler_scrape_error 0"));
        assert!(body.contains("cluster_autoscaler_scrapes_total 1"));
        assert!(collector.has_succeeded());
    }

    #[tokio::test]
    async fn test_not_found_publishes_failure_only() {
        let collector = collector(Scripted::new(vec![Err(not_found())]));

        let (outcome, body) = collector.scrape().await;
        let body = body.unwrap();

        assert!(matches!(
            outcome,
            ScrapeOutcome::Failure(ScrapeError::NotFound(_))
        ));
        assert!(body.contains("cluster_autoscaler_scrape_error 1"));
        assert!(
            body.contains("cluster_autoscaler_scrape_failures_total{reason=\"not_found\"} 1")
        );
        assert!(activity_samples(&body).is_empty());
    }

    #[tokio::test]
    async fn test_failure_clears_previous_values() {
        let collector = collector(Scripted::new(vec![
            Ok(LEGACY_LINE.repeat(3)),
            Ok(LEGACY_LINE.repeat(2)),
        ]));

        let (first, body) = collector.scrape().await;
        assert!(first.is_success());
        assert_eq!(activity_samples(&body.unwrap()).len(), 3);

        let (second, body) = collector.scrape().await;
        let body = body.unwrap();
        assert!(matches!(
            second,
            ScrapeOutcome::Failure(ScrapeError::Parse(_))
        ));
        assert!(activity_samples(&body).is_empty());
        assert!(body.contains("cluster_autoscaler_scrape_error 1"));
        // Readiness is sticky once reached.
        assert!(collector.has_succeeded());
    }

    #[tokio::test]
    async fn test_bad_timestamp_is_all_or_nothing() {
        let document = format!(
            "{}LastProbeTime: 2022-09-11 25:61:00 +0000 UTC\n{}",
            LEGACY_LINE, LEGACY_LINE
        );
        let collector = collector(Scripted::new(vec![Ok(document)]));

        let (outcome, body) = collector.scrape().await;

        assert!(matches!(
            outcome,
            ScrapeOutcome::Failure(ScrapeError::TimestampFormat(_))
        ));
        assert!(activity_samples(&body.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_structured_document() {
        let document = r#"
clusterWide:
  health:
    lastProbeTime: "2024-05-20T10:15:30Z"
  scaleUp:
    lastProbeTime: "2024-05-20T10:15:00Z"
  scaleDown:
    lastProbeTime: "2024-05-20T10:14:30Z"
"#;
        let collector = StatusCollector::new(
            Scripted::new(vec![Ok(document.to_string())]),
            ConfigMapRef::new("kube-system", "cluster-autoscaler-status", "status"),
            Duration::from_secs(1),
            StatusExtractor::new(ExtractMode::Structured),
        );

        let (_, body) = collector.scrape().await;
        let body = body.unwrap();

        assert!(body.contains("cluster_autoscaler_last_activity{activity=\"main\"} 1716200130"));
        assert!(
            body.contains("cluster_autoscaler_last_activity{activity=\"scaleUp\"} 1716200100")
        );
        assert!(
            body.contains("cluster_autoscaler_last_activity{activity=\"scaleDown\"} 1716200070")
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_cycle() {
        let collector = StatusCollector::new(
            Hanging,
            ConfigMapRef::new("kube-system", "cluster-autoscaler-status", "status"),
            Duration::from_secs(1),
            StatusExtractor::default(),
        );

        let started = Instant::now();
        let outcome = collector.collect().await;
        let elapsed = started.elapsed();

        assert!(matches!(
            outcome,
            ScrapeOutcome::Failure(ScrapeError::UpstreamUnavailable(SourceError::Timeout { .. }))
        ));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_concurrent_scrapes_are_serialised() {
        let slow = Arc::new(Slow::default());
        let collector = Arc::new(collector(slow.clone()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let collector = collector.clone();
                tokio::spawn(async move { collector.scrape().await.0 })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }

        assert_eq!(slow.calls.load(Ordering::SeqCst), 5);
        assert_eq!(slow.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
