//! Stats Aggregator (C10): per-instance upload/download/saved byte
//! counters, ticked once a second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::core::events::{Event, InstanceId, TrafficDelta};

/// Four atomically-updated counters per instance: `upload_bytes`,
/// `upload_saved_bytes`, `download_bytes`, `download_saved_bytes`.
#[derive(Default)]
pub struct Counters {
    upload_bytes: AtomicU64,
    upload_saved_bytes: AtomicU64,
    download_bytes: AtomicU64,
    download_saved_bytes: AtomicU64,
}

impl Counters {
    pub fn credit_upload(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn credit_upload_saved(&self, bytes: u64) {
        self.upload_saved_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn credit_download(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn credit_download_saved(&self, bytes: u64) {
        self.download_saved_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Atomically reads and resets all four counters, returning the delta
    /// since the last tick (or since creation).
    fn take_delta(&self) -> TrafficDelta {
        TrafficDelta {
            upload_bytes: self.upload_bytes.swap(0, Ordering::Relaxed),
            upload_saved_bytes: self.upload_saved_bytes.swap(0, Ordering::Relaxed),
            download_bytes: self.download_bytes.swap(0, Ordering::Relaxed),
            download_saved_bytes: self.download_saved_bytes.swap(0, Ordering::Relaxed),
        }
    }
}

/// Spawns the 1 Hz ticker that emits [`Event::TrafficUpdate`] and resets the
/// deltas. The returned handle is aborted when the instance
/// stops.
pub fn spawn_ticker(instance: InstanceId, counters: Arc<Counters>, events: UnboundedSender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let delta = counters.take_delta();
            let event = Event::TrafficUpdate { instance: instance.clone(), delta };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Accumulates per-instance traffic events into a grand total, displayed as
/// "used(saved)" by whatever UI consumes it.
#[derive(Default, Debug, Clone, Copy)]
pub struct GrandTotal {
    pub upload_used: u64,
    pub upload_saved: u64,
    pub download_used: u64,
    pub download_saved: u64,
}

impl GrandTotal {
    pub fn accumulate(&mut self, delta: &TrafficDelta) {
        self.upload_used += delta.upload_bytes;
        self.upload_saved += delta.upload_saved_bytes;
        self.download_used += delta.download_bytes;
        self.download_saved += delta.download_saved_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_accumulate_and_reset_on_take() {
        let counters = Counters::default();
        counters.credit_upload(10);
        counters.credit_upload(5);
        counters.credit_download_saved(100);

        let delta = counters.take_delta();
        assert_eq!(delta.upload_bytes, 15);
        assert_eq!(delta.download_saved_bytes, 100);
        assert_eq!(delta.download_bytes, 0);

        let second = counters.take_delta();
        assert_eq!(second.upload_bytes, 0);
    }

    #[test]
    fn grand_total_accumulates_across_deltas() {
        let mut total = GrandTotal::default();
        total.accumulate(&TrafficDelta { upload_bytes: 1, upload_saved_bytes: 2, download_bytes: 3, download_saved_bytes: 4 });
        total.accumulate(&TrafficDelta { upload_bytes: 1, upload_saved_bytes: 2, download_bytes: 3, download_saved_bytes: 4 });
        assert_eq!(total.upload_used, 2);
        assert_eq!(total.download_saved, 8);
    }
}
