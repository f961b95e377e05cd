//! Instance Supervisor (C9): lifecycle of proxy listeners.
//!
//! One [`Instance`] per configured [`crate::config::InstanceConfig`],
//! driven through `Starting -> Running -> Stopping -> Stopped` (or
//! `-> Error`, or `Stopped -> Deleted`) by [`Supervisor`]. The listener
//! itself runs as a dedicated Tokio task rather than a forked OS process —
//! the Open Question resolution recorded in DESIGN.md — communicating
//! shutdown via a `tokio::sync::watch` channel and reporting back through
//! the shared [`crate::core::events::Event`] channel, mirroring the
//! teacher's `DashMap`-backed per-instance registries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::{mpsc::UnboundedSender, watch, Mutex};
use tokio::task::JoinHandle;

use crate::cache::DiskCache;
use crate::config::{EngineConfig, InstanceConfig};
use crate::core::events::{Event, InstanceId, InstanceState};
use crate::core::{ProxyError, ProxyResult};
use crate::pipeline::{listener, InstanceContext};
use crate::stats::{self, Counters};
use crate::tls::CertificateAuthority;
use crate::upstream::SessionPool;

const AUTO_PORT_RANGE: std::ops::Range<u16> = 30_000..40_000;
const USER_PORT_RANGE: std::ops::RangeInclusive<u16> = 5_000..=60_000;
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const EGRESS_PROBE_URL: &str = "https://api.ipify.org";

struct RunningInstance {
    config: InstanceConfig,
    state: InstanceState,
    port: Option<u16>,
    shutdown_tx: Option<watch::Sender<bool>>,
    listener_task: Option<JoinHandle<()>>,
    ticker_task: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

/// Owns every running instance for one engine process.
pub struct Supervisor {
    config: Arc<ArcSwap<EngineConfig>>,
    cache: Arc<DiskCache>,
    ca: Arc<CertificateAuthority>,
    events: UnboundedSender<Event>,
    instances: DashMap<InstanceId, RunningInstance>,
}

impl Supervisor {
    pub fn new(config: Arc<ArcSwap<EngineConfig>>, cache: Arc<DiskCache>, ca: Arc<CertificateAuthority>, events: UnboundedSender<Event>) -> Self {
        Supervisor { config, cache, ca, events, instances: DashMap::new() }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn held_ports(&self) -> HashSet<u16> {
        self.instances.iter().filter_map(|entry| entry.value().port).collect()
    }

    /// Picks the listen port for `instance_config`: the user-specified
    /// value if present (already range-validated at config load), else the
    /// first free port in `[30000, 40000)` not already held.
    fn select_port(&self, instance_config: &InstanceConfig) -> ProxyResult<u16> {
        if let Some(port) = instance_config.listen_port {
            if !USER_PORT_RANGE.contains(&port) {
                return Err(ProxyError::InstanceFatal(format!("port {port} outside [5000,60000]")));
            }
            if self.held_ports().contains(&port) {
                return Err(ProxyError::InstanceFatal(format!("port {port} already held by another instance")));
            }
            return Ok(port);
        }

        let held = self.held_ports();
        AUTO_PORT_RANGE
            .into_iter()
            .find(|p| !held.contains(p))
            .ok_or_else(|| ProxyError::InstanceFatal("no free port in [30000,40000)".to_string()))
    }

    /// Starts one instance: `Starting -> Running` on success, `Starting ->
    /// Error` (instance retained, inspectable, not listening) on failure.
    pub async fn start_instance(&self, instance_config: InstanceConfig) -> ProxyResult<()> {
        let id = InstanceId(instance_config.id.clone());
        self.emit(Event::StatusChanged { instance: id.clone(), state: InstanceState::Starting, reason: None });

        let port = match self.select_port(&instance_config) {
            Ok(p) => p,
            Err(e) => {
                self.mark_error(&id, instance_config, None, &e.to_string());
                return Err(e);
            }
        };

        let sessions = Arc::new(SessionPool::new(instance_config.upstream.clone()));

        let egress_ip = match probe_egress_ip(&sessions).await {
            Ok(ip) => ip,
            Err(e) => {
                self.mark_error(&id, instance_config, Some(port), &e.to_string());
                return Err(e);
            }
        };
        self.emit(Event::InstanceIp { instance: id.clone(), ip: egress_ip });

        let counters = Arc::new(Counters::default());
        let ctx = InstanceContext {
            instance_id: id.clone(),
            cache: self.cache.clone(),
            sessions,
            config: self.config.clone(),
            counters: counters.clone(),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            ca: self.ca.clone(),
            events: self.events.clone(),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listen_host = instance_config.listen_host.clone();
        let listener_ctx = ctx.clone();
        let listener_id = id.clone();
        let events_for_listener = self.events.clone();
        let listener_task = tokio::spawn(async move {
            if let Err(e) = listener::run(listener_ctx, &listen_host, port, shutdown_rx).await {
                error!("instance {listener_id} listener crashed: {e}");
                let _ = events_for_listener.send(Event::StatusChanged {
                    instance: listener_id,
                    state: InstanceState::Error,
                    reason: Some(e.to_string()),
                });
            }
        });

        let ticker_task = stats::spawn_ticker(id.clone(), counters.clone(), self.events.clone());

        self.instances.insert(
            id.clone(),
            RunningInstance {
                config: instance_config,
                state: InstanceState::Running,
                port: Some(port),
                shutdown_tx: Some(shutdown_tx),
                listener_task: Some(listener_task),
                ticker_task: Some(ticker_task),
                counters,
            },
        );

        info!("instance {id} running on port {port}");
        self.emit(Event::StatusChanged { instance: id, state: InstanceState::Running, reason: None });
        Ok(())
    }

    fn mark_error(&self, id: &InstanceId, config: InstanceConfig, port: Option<u16>, reason: &str) {
        warn!("instance {id} failed to start: {reason}");
        self.instances.insert(
            id.clone(),
            RunningInstance {
                config,
                state: InstanceState::Error,
                port,
                shutdown_tx: None,
                listener_task: None,
                ticker_task: None,
                counters: Arc::new(Counters::default()),
            },
        );
        self.emit(Event::StatusChanged { instance: id.clone(), state: InstanceState::Error, reason: Some(reason.to_string()) });
    }

    /// Stops an instance: `Running -> Stopping -> Stopped`. Posts the
    /// shutdown signal, waits up to 1s, then aborts if still running.
    pub async fn stop_instance(&self, id: &InstanceId) -> ProxyResult<()> {
        self.emit(Event::StatusChanged { instance: id.clone(), state: InstanceState::Stopping, reason: None });

        let (shutdown_tx, listener_task, ticker_task, port) = {
            let Some(mut entry) = self.instances.get_mut(id) else {
                return Err(ProxyError::InstanceFatal(format!("unknown instance {id}")));
            };
            entry.state = InstanceState::Stopping;
            (entry.shutdown_tx.take(), entry.listener_task.take(), entry.ticker_task.take(), entry.port)
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = ticker_task {
            task.abort();
        }
        if let Some(task) = listener_task {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, task).await.is_err() {
                warn!("instance {id} listener did not stop within {STOP_JOIN_TIMEOUT:?}, force-terminating");
            }
        }

        if let Some(port) = port {
            reclaim_port_if_held(port).await;
        }

        if let Some(mut entry) = self.instances.get_mut(id) {
            entry.state = InstanceState::Stopped;
        }
        self.emit(Event::StatusChanged { instance: id.clone(), state: InstanceState::Stopped, reason: None });
        Ok(())
    }

    /// Deletes a stopped instance, releasing its resources and removing it
    /// from the registry.
    pub async fn delete_instance(&self, id: &InstanceId) -> ProxyResult<()> {
        let is_running = self.instances.get(id).map(|e| e.state == InstanceState::Running).unwrap_or(false);
        if is_running {
            self.stop_instance(id).await?;
        }
        self.instances.remove(id);
        self.emit(Event::StatusChanged { instance: id.clone(), state: InstanceState::Deleted, reason: None });
        Ok(())
    }

    pub fn state_of(&self, id: &InstanceId) -> Option<InstanceState> {
        self.instances.get(id).map(|e| e.state)
    }

    pub fn counters_of(&self, id: &InstanceId) -> Option<Arc<Counters>> {
        self.instances.get(id).map(|e| e.counters.clone())
    }

    /// IDs of every instance currently known to the supervisor, running or not.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops every running instance; used on process shutdown.
    pub async fn stop_all(&self) {
        for id in self.instance_ids() {
            if self.state_of(&id) == Some(InstanceState::Running) {
                if let Err(e) = self.stop_instance(&id).await {
                    warn!("instance {id} failed to stop cleanly: {e}");
                }
            }
        }
    }
}

/// This crate runs instances as in-process Tokio tasks rather than OS
/// processes, so "zombie port" reclamation degrades to
/// confirming the port is actually free after shutdown; a still-held port
/// means some other process on the host bound it independently, which is
/// logged rather than force-killed (no PID ownership to act on from here).
async fn reclaim_port_if_held(port: u16) {
    match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
        Ok(_) => {}
        Err(e) => warn!("port {port} still held after instance stop: {e}"),
    }
}

/// Out-of-band egress-IP probe through the instance's upstream proxy,
/// single attempt, certificate verification off.
async fn probe_egress_ip(sessions: &SessionPool) -> ProxyResult<String> {
    let session = sessions.checkout(crate::fingerprint::DEFAULT_PROFILE).await?;
    let response = session
        .client(false)
        .get(EGRESS_PROBE_URL)
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| ProxyError::InstanceFatal(format!("egress probe failed: {e}")))?;
    let ip = response
        .text()
        .await
        .map_err(|e| ProxyError::InstanceFatal(format!("egress probe body read failed: {e}")))?;
    Ok(ip.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamCredentials;

    fn instance_config(id: &str, port: Option<u16>) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: port,
            upstream: UpstreamCredentials::default(),
        }
    }

    async fn supervisor() -> Supervisor {
        let config = Arc::new(ArcSwap::from_pointee(EngineConfig::default()));
        let cache = Arc::new(DiskCache::new(std::env::temp_dir().join("veilproxy-test-cache")));
        let ca_dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::load_or_generate(ca_dir.path()).await.unwrap());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Supervisor::new(config, cache, ca, tx)
    }

    #[tokio::test]
    async fn user_specified_port_out_of_range_is_rejected() {
        let sup = supervisor().await;
        let result = sup.select_port(&instance_config("a", Some(80)));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn auto_selected_port_is_within_expected_range() {
        let sup = supervisor().await;
        let port = sup.select_port(&instance_config("a", None)).unwrap();
        assert!(AUTO_PORT_RANGE.contains(&port));
    }

    #[tokio::test]
    async fn duplicate_user_port_across_instances_is_rejected() {
        let sup = supervisor().await;
        sup.instances.insert(
            InstanceId::from("existing"),
            RunningInstance {
                config: instance_config("existing", Some(5001)),
                state: InstanceState::Running,
                port: Some(5001),
                shutdown_tx: None,
                listener_task: None,
                ticker_task: None,
                counters: Arc::new(Counters::default()),
            },
        );
        let result = sup.select_port(&instance_config("new", Some(5001)));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stopping_unknown_instance_errors() {
        let sup = supervisor().await;
        let result = sup.stop_instance(&InstanceId::from("missing")).await;
        assert!(result.is_err());
    }
}
