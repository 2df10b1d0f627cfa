//! Test utilities for the SPNEGO reverse proxy.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockKerberos`] - A scripted Kerberos library with readable tokens
//! - [`MockBackend`] - A Kerberos-protected HTTP backend that records calls
//! - [`ProxyTestHarness`] - A running proxy wired to both
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use spnego_proxy_core::testing::ProxyTestHarness;
//!
//! #[tokio::test]
//! async fn test_forwarding() {
//!     let harness = ProxyTestHarness::new().await;
//!
//!     let response = harness.get("/status").await;
//!     assert_eq!(response.status, 200);
//!
//!     let calls = harness.backend.calls().await;
//!     assert_eq!(calls.len(), 1);
//! }
//! ```

pub mod harness;
pub mod mock_backend;
pub mod mock_kerberos;

pub use harness::{ProxyTestHarness, TestHarnessBuilder, TestResponse};
pub use mock_backend::{responses, MockBackend, RecordedRequest, ResponseGenerator};
pub use mock_kerberos::{MockKerberos, MockTicket};
