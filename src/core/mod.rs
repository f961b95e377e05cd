//! Core abstractions shared across the engine.
//!
//! A unified error type and a tagged-union event type, both free of any UI
//! or transport dependency so every other module can depend on `core`
//! without depending on each other.

pub mod error;
pub mod events;

pub use error::{OrProxyErr, ProxyError, ProxyResult};
pub use events::{Event, InstanceId};
