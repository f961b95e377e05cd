//! Unified error handling for veilproxy
//!
//! This module provides a centralized error type so that the cache,
//! pipeline, supervisor, and config modules do not need to depend on each
//! other's error types.

use std::fmt;

/// Unified error type for the proxy engine.
#[derive(Debug)]
pub enum ProxyError {
    /// Configuration failed to parse or validate.
    Configuration(String),
    /// Network/IO failure.
    Network(std::io::Error),
    /// TLS setup or certificate minting failure.
    Tls(String),
    /// Upstream request failed after retries were exhausted.
    UpstreamExhausted(String),
    /// Cache read/write failure (always recovered by the caller; kept for
    /// logging at the call site).
    Cache(String),
    /// Extraction rule failed to evaluate.
    Extraction(String),
    /// Template evaluation failed.
    Template(String),
    /// Instance failed to start (bad port, bad credentials, bind failure,
    /// egress probe failure).
    InstanceFatal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            ProxyError::Network(err) => write!(f, "network error: {err}"),
            ProxyError::Tls(msg) => write!(f, "tls error: {msg}"),
            ProxyError::UpstreamExhausted(msg) => write!(f, "upstream exhausted: {msg}"),
            ProxyError::Cache(msg) => write!(f, "cache error: {msg}"),
            ProxyError::Extraction(msg) => write!(f, "extraction error: {msg}"),
            ProxyError::Template(msg) => write!(f, "template error: {msg}"),
            ProxyError::InstanceFatal(msg) => write!(f, "instance error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Network(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Network(err)
    }
}

/// Crate-wide result alias.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Attaches context to any error convertible into `ProxyError`, without
/// pulling in a dedicated error-context crate.
pub trait OrProxyErr<T> {
    fn or_proxy_err<F: FnOnce() -> String>(self, f: F) -> ProxyResult<T>;
}

impl<T, E: fmt::Display> OrProxyErr<T> for std::result::Result<T, E> {
    fn or_proxy_err<F: FnOnce() -> String>(self, f: F) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::Configuration(format!("{}: {e}", f())))
    }
}
