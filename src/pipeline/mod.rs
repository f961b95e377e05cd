//! Proxy Pipeline (C8): the per-flow state machine — intercept, cache
//! lookup, upstream dispatch, admission, forward.
//!
//! This is the component everything else in the crate feeds into: C1
//! (cache), C2 (normalize), C3 (fingerprint), C4 (upstream sessions), C5
//! (eligibility), C6/C7 (extraction/template), and C10 (stats) are all
//! consulted from [`flow::run`]. [`listener`] and [`connect`] supply the
//! HTTP/1 framing and CONNECT/TLS termination an external MITM framework
//! would otherwise provide.

pub mod connect;
pub mod flow;
pub mod http1;
pub mod listener;

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc::UnboundedSender, Mutex};

use crate::cache::{CacheKey, DiskCache};
use crate::config::EngineConfig;
use crate::core::events::{Event, InstanceId};
use crate::stats::Counters;
use crate::tls::CertificateAuthority;
use crate::upstream::SessionPool;

/// Headers retained in cached meta. `content-encoding` is
/// deliberately absent — it is always dropped on admission.
pub const SAFE_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "cache-control",
    "content-language",
    "content-disposition",
    "expires",
    "etag",
    "last-modified",
    "vary",
    "accept-ranges",
    "access-control-allow-origin",
    "access-control-allow-credentials",
    "access-control-allow-headers",
    "access-control-allow-methods",
    "access-control-expose-headers",
    "strict-transport-security",
    "content-security-policy",
    "content-security-policy-report-only",
    "cross-origin-opener-policy",
    "cross-origin-resource-policy",
    "referrer-policy",
    "permissions-policy",
    "x-content-type-options",
    "x-xss-protection",
    "x-frame-options",
    "x-ua-compatible",
    "origin-agent-cluster",
    "accept-ch",
    "link",
    "refresh",
    "critical-ch",
];

/// Hop-by-hop headers never forwarded upstream nor back to the client
/// verbatim; each side manages these itself.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers this proxy invents for its own internal signaling (the
/// `direct`-flow opt-out) that must never reach the origin server, since
/// they expose the MITM implementation to the site being visited.
pub const INTERNAL_CONTROL_HEADERS: &[&str] = &["x-veilproxy-direct"];

pub fn is_safe_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SAFE_HEADERS.contains(&lower.as_str())
}

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

/// True for headers that must be stripped before forwarding a request
/// upstream: hop-by-hop headers plus this crate's own internal control
/// headers.
pub fn is_forwardable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str()) && !INTERNAL_CONTROL_HEADERS.contains(&lower.as_str())
}

/// Everything one running instance's flows need, shared behind `Arc`s.
/// Constructed once by the supervisor (C9) when an instance transitions to
/// `Starting` and handed to every spawned flow task.
#[derive(Clone)]
pub struct InstanceContext {
    pub instance_id: InstanceId,
    pub cache: Arc<DiskCache>,
    pub sessions: Arc<SessionPool>,
    pub config: Arc<ArcSwap<EngineConfig>>,
    pub counters: Arc<Counters>,
    pub in_progress: Arc<Mutex<HashSet<CacheKey>>>,
    pub ca: Arc<CertificateAuthority>,
    pub events: UnboundedSender<Event>,
}

impl InstanceContext {
    pub fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_encoding_is_not_in_the_safe_set() {
        assert!(!is_safe_header("content-encoding"));
        assert!(!is_safe_header("Content-Encoding"));
    }

    #[test]
    fn known_safe_header_matches_case_insensitively() {
        assert!(is_safe_header("Content-Type"));
        assert!(is_safe_header("ETag"));
    }

    #[test]
    fn hop_by_hop_detected_case_insensitively() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn internal_control_header_is_not_forwardable() {
        assert!(!is_forwardable("x-veilproxy-direct"));
        assert!(!is_forwardable("X-Veilproxy-Direct"));
    }

    #[test]
    fn ordinary_header_is_forwardable() {
        assert!(is_forwardable("user-agent"));
    }
}
