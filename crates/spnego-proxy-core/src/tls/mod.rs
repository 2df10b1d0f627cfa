//! Outbound TLS for `https` targets.
//!
//! Inbound connections are plain HTTP; TLS is only used towards the backend.

pub mod client;

pub use client::build_client_config;
