//! Metrics collection for the SPNEGO reverse proxy.
//!
//! Provides Prometheus-compatible metrics for monitoring exchange outcomes,
//! negotiation rounds, credential renewals and connection counts.

pub mod prometheus;

pub use self::prometheus::ProxyMetrics;
