//! veilproxy: a local intercepting HTTPS proxy with a content-addressed
//! response cache and browser-TLS impersonation.
//!
//! The crate is organized leaf-first: `cache`/`normalize`/`fingerprint`/
//! `eligibility`/`extract`/`template` are the independent leaf components
//! (C1-C3, C5-C7); `upstream` is the outbound session pool (C4); `pipeline`
//! is the per-flow state machine that ties all of the above together (C8);
//! `supervisor` owns instance lifecycle (C9); `stats` aggregates traffic
//! counters (C10); and `config` is the read-only surface every other module
//! consumes (C11).

pub mod cache;
pub mod config;
pub mod core;
pub mod eligibility;
pub mod extract;
pub mod fingerprint;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod stats;
pub mod supervisor;
pub mod template;
pub mod tls;
pub mod upstream;
