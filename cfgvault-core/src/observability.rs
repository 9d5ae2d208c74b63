/*!
Observability setup for the collector.

- Structured logging through `tracing` with an `EnvFilter`
- Optional Prometheus metrics (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::error::ConfigError;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "cfgvault=info,cfgvault_core=info,cfgvault_retry=warn";

/// Global metrics instance; `None` when registration failed
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<CollectorMetrics>> = OnceLock::new();

/// Prometheus metrics for capture attempts and ingestion
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct CollectorMetrics {
    pub attempts_total: Counter,
    pub failures_total: Counter,
    pub retries_total: Counter,
    pub ingested_total: Counter,
    pub capture_seconds: Histogram,
    pub artifact_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl CollectorMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let attempts_total = Counter::new(
            "cfgvault_attempts_total",
            "Capture attempts made against devices",
        )?;
        let failures_total = Counter::new(
            "cfgvault_failures_total",
            "Collections that ended without an artifact",
        )?;
        let retries_total = Counter::new(
            "cfgvault_retries_total",
            "Capture attempts beyond the first",
        )?;
        let ingested_total = Counter::new(
            "cfgvault_ingested_total",
            "Relay uploads stored by the ingestion coordinator",
        )?;
        let capture_seconds = Histogram::with_opts(
            HistogramOpts::new("cfgvault_capture_seconds", "Duration of capture attempts in seconds")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        let artifact_bytes = Histogram::with_opts(
            HistogramOpts::new("cfgvault_artifact_bytes", "Size of stored configurations in bytes")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 8)?),
        )?;

        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(ingested_total.clone()))?;
        registry.register(Box::new(capture_seconds.clone()))?;
        registry.register(Box::new(artifact_bytes.clone()))?;

        Ok(Self {
            attempts_total,
            failures_total,
            retries_total,
            ingested_total,
            capture_seconds,
            artifact_bytes,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static CollectorMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to initialize collector metrics");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_attempt(&self, duration: std::time::Duration) {
        self.attempts_total.inc();
        self.capture_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_outcome(&self, success: bool, retries_used: u32) {
        if !success {
            self.failures_total.inc();
        }
        self.retries_total.inc_by(f64::from(retries_used));
    }

    pub fn record_artifact(&self, size_bytes: u64) {
        self.artifact_bytes.observe(size_bytes as f64);
    }

    pub fn record_ingested(&self) {
        self.ingested_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Run `f` against the global metrics when the feature is enabled
#[cfg(feature = "metrics")]
pub(crate) fn with_metrics<F: FnOnce(&CollectorMetrics)>(f: F) {
    if let Some(metrics) = CollectorMetrics::global() {
        f(metrics);
    }
}

/// Install the global tracing subscriber
///
/// # Arguments
/// * `json` - emit one JSON object per event instead of human-readable lines
/// * `verbose` - lower the default filter to `debug` (ignored when `RUST_LOG` is set)
pub fn init_observability(json: bool, verbose: bool) -> Result<(), ConfigError> {
    #[cfg(feature = "metrics")]
    CollectorMetrics::global();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new(DEFAULT_FILTER.replace("=info", "=debug")),
        Err(_) => EnvFilter::new(DEFAULT_FILTER),
    };

    let registry = TracingRegistry::default().with(filter);
    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false);
        set_global_default(registry.with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        set_global_default(registry.with(fmt_layer))
    };

    result.map_err(|e| {
        ConfigError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("cfgvault observability initialized");
    Ok(())
}
