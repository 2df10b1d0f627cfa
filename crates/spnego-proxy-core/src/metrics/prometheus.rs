//! Prometheus metrics for the SPNEGO reverse proxy.
//!
//! Provides counters, histograms, and gauges for monitoring exchanges,
//! negotiation and the credential lifecycle.

use prometheus::{
    CounterVec, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};

use crate::identity::CredentialEvent;

/// Proxy metrics collection.
///
/// Contains all metrics exposed by the proxy for monitoring.
pub struct ProxyMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Finished exchanges by outcome (`accepted` or an error kind).
    pub exchanges_total: CounterVec,

    /// Continuation rounds needed by accepted exchanges.
    pub negotiation_rounds: Histogram,

    /// Exchange latency histogram.
    pub exchange_duration_seconds: Histogram,

    /// Backend failures by kind.
    pub backend_errors: CounterVec,

    /// Credential renewals by result.
    pub credential_renewals: CounterVec,

    /// Current active client connections.
    pub active_client_connections: IntGauge,

    /// SPNs with an established security context.
    pub cached_contexts: IntGauge,
}

impl ProxyMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let exchanges_total = CounterVec::new(
            Opts::new(
                "spnego_proxy_exchanges_total",
                "Total number of proxied exchanges by outcome",
            ),
            &["outcome"],
        )
        .expect("metric creation should succeed");

        let negotiation_rounds = Histogram::with_opts(
            HistogramOpts::new(
                "spnego_proxy_negotiation_rounds",
                "Continuation rounds per accepted exchange",
            )
            .buckets(vec![0.0, 1.0, 2.0, 3.0]),
        )
        .expect("metric creation should succeed");

        let exchange_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "spnego_proxy_exchange_duration_seconds",
                "Exchange latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
        )
        .expect("metric creation should succeed");

        let backend_errors = CounterVec::new(
            Opts::new(
                "spnego_proxy_backend_errors_total",
                "Total number of backend failures by kind",
            ),
            &["kind"],
        )
        .expect("metric creation should succeed");

        let credential_renewals = CounterVec::new(
            Opts::new(
                "spnego_proxy_credential_renewals_total",
                "Total number of credential renewal attempts by result",
            ),
            &["result"],
        )
        .expect("metric creation should succeed");

        let active_client_connections = IntGauge::new(
            "spnego_proxy_active_client_connections",
            "Current number of active client connections",
        )
        .expect("metric creation should succeed");

        let cached_contexts = IntGauge::new(
            "spnego_proxy_cached_contexts",
            "Number of SPNs with an established security context",
        )
        .expect("metric creation should succeed");

        // Register all metrics
        registry
            .register(Box::new(exchanges_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(negotiation_rounds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(exchange_duration_seconds.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(backend_errors.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(credential_renewals.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(active_client_connections.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(cached_contexts.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            exchanges_total,
            negotiation_rounds,
            exchange_duration_seconds,
            backend_errors,
            credential_renewals,
            active_client_connections,
            cached_contexts,
        }
    }

    /// Record an accepted exchange.
    pub fn record_accepted(&self, rounds: u32, duration_seconds: f64) {
        self.exchanges_total.with_label_values(&["accepted"]).inc();
        self.negotiation_rounds.observe(f64::from(rounds));
        self.exchange_duration_seconds.observe(duration_seconds);
    }

    /// Record a failed exchange.
    pub fn record_failed(&self, kind: &str, duration_seconds: f64) {
        self.exchanges_total.with_label_values(&[kind]).inc();
        self.exchange_duration_seconds.observe(duration_seconds);
    }

    /// Record a backend failure.
    pub fn record_backend_error(&self, kind: &str) {
        self.backend_errors.with_label_values(&[kind]).inc();
    }

    /// Record a credential lifecycle event.
    pub fn record_credential_event(&self, event: &CredentialEvent) {
        let result = match event {
            CredentialEvent::Renewed { .. } => "renewed",
            CredentialEvent::RenewalFailed { fatal: true, .. } => "exhausted",
            CredentialEvent::RenewalFailed { .. } => "failed",
        };
        self.credential_renewals.with_label_values(&[result]).inc();
    }

    /// Increment active client connections.
    pub fn inc_client_connections(&self) {
        self.active_client_connections.inc();
    }

    /// Decrement active client connections.
    pub fn dec_client_connections(&self) {
        self.active_client_connections.dec();
    }

    /// Set the number of established contexts.
    pub fn set_cached_contexts(&self, count: usize) {
        self.cached_contexts
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_creation() {
        let metrics = ProxyMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_record_exchanges() {
        let metrics = ProxyMetrics::new();
        metrics.record_accepted(0, 0.002);
        metrics.record_accepted(1, 0.010);
        metrics.record_failed("rejected", 0.004);

        let output = metrics.encode().unwrap();
        assert!(output.contains("spnego_proxy_exchanges_total{outcome=\"accepted\"} 2"));
        assert!(output.contains("spnego_proxy_exchanges_total{outcome=\"rejected\"} 1"));
        assert!(output.contains("spnego_proxy_negotiation_rounds"));
        assert!(output.contains("spnego_proxy_exchange_duration_seconds"));
    }

    #[test]
    fn test_record_backend_error() {
        let metrics = ProxyMetrics::new();
        metrics.record_backend_error("timeout");

        let output = metrics.encode().unwrap();
        assert!(output.contains("spnego_proxy_backend_errors_total{kind=\"timeout\"} 1"));
    }

    #[test]
    fn test_record_credential_events() {
        let metrics = ProxyMetrics::new();
        metrics.record_credential_event(&CredentialEvent::Renewed {
            principal: "HTTP@EXAMPLE.COM".to_string(),
            expires_in: Duration::from_secs(36_000),
        });
        metrics.record_credential_event(&CredentialEvent::RenewalFailed {
            principal: "HTTP@EXAMPLE.COM".to_string(),
            attempt: 5,
            fatal: true,
            message: "kdc unreachable".to_string(),
        });

        let output = metrics.encode().unwrap();
        assert!(output.contains("spnego_proxy_credential_renewals_total{result=\"renewed\"} 1"));
        assert!(output.contains("spnego_proxy_credential_renewals_total{result=\"exhausted\"} 1"));
    }

    #[test]
    fn test_gauges() {
        let metrics = ProxyMetrics::new();

        metrics.inc_client_connections();
        metrics.inc_client_connections();
        metrics.dec_client_connections();
        metrics.set_cached_contexts(3);

        let output = metrics.encode().unwrap();
        assert!(output.contains("spnego_proxy_active_client_connections 1"));
        assert!(output.contains("spnego_proxy_cached_contexts 3"));
    }
}
