//! Tagged-union event type published by instances and consumed by whatever
//! UI or log sink a caller wires up.
//!
//! Duck-typed dicts (`{"status_changed": (...)}`) are the obvious shortcut
//! here but give callers nothing to exhaustively match on. Every fact an
//! instance can report is instead one variant of [`Event`], so a consumer
//! can exhaustively match without guessing at shapes.

use std::fmt;

/// Identifies one running instance managed by [`crate::supervisor::Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        InstanceId(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        InstanceId(value.to_string())
    }
}

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Deleted,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Error => "error",
            InstanceState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// One second's worth of byte counters, as emitted by the stats ticker (C10).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub upload_bytes: u64,
    pub upload_saved_bytes: u64,
    pub download_bytes: u64,
    pub download_saved_bytes: u64,
}

/// Everything an instance can report to the outside world.
///
/// A tagged union in place of duck-typed event dicts.
#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged {
        instance: InstanceId,
        state: InstanceState,
        reason: Option<String>,
    },
    TrafficUpdate {
        instance: InstanceId,
        delta: TrafficDelta,
    },
    LogMessage {
        instance: Option<InstanceId>,
        level: log::Level,
        message: String,
    },
    Notification {
        instance: InstanceId,
        title: String,
        body: String,
    },
    InstanceIp {
        instance: InstanceId,
        ip: String,
    },
}
