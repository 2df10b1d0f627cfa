//! Network layer for the SPNEGO reverse proxy.
//!
//! This module provides:
//! - TCP listener for accepting client connections
//! - Connection handler serving HTTP/1.1 and writing the access log

pub mod connection;
pub mod listener;

pub use connection::ConnectionHandler;
pub use listener::ProxyListener;
