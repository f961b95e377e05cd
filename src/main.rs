//! Standalone engine binary: loads `EngineConfig` from a YAML file, starts
//! every configured instance under the supervisor (C9), and runs until
//! interrupted. A desktop UI, persistent k/v store, and any other outer
//! collaborator are out of scope for this binary — events published by the
//! supervisor are simply logged here.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{error, info, warn};

use veilproxy::cache::DiskCache;
use veilproxy::config::EngineConfig;
use veilproxy::core::events::Event;
use veilproxy::supervisor::Supervisor;
use veilproxy::tls::CertificateAuthority;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());

    let config = match EngineConfig::load_from_yaml(&config_path) {
        Ok(c) => c,
        Err(e) => {
            // `log` is not yet initialized (it depends on `config.log`), so
            // a startup-time config failure goes straight to stderr.
            eprintln!("failed to load configuration from {config_path}: {e}");
            std::process::exit(1);
        }
    };

    veilproxy::logging::init(&config.log);
    info!("loaded configuration from {config_path}");

    let cache = Arc::new(DiskCache::new(&config.cache.cache_dir));

    let ca = match CertificateAuthority::load_or_generate(&config.tls.certs_dir).await {
        Ok(ca) => Arc::new(ca),
        Err(e) => {
            error!("failed to load or generate root CA: {e}");
            std::process::exit(1);
        }
    };

    let instances = config.instances.clone();
    let config = Arc::new(ArcSwap::from_pointee(config));

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(event);
        }
    });

    let supervisor = Arc::new(Supervisor::new(config, cache.clone(), ca, events_tx));

    for instance_config in instances {
        let id = instance_config.id.clone();
        if let Err(e) = supervisor.start_instance(instance_config).await {
            warn!("instance {id} failed to start: {e}");
        }
    }

    let sweep_cache = cache.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let removed = sweep_cache.sweep_expired().await;
            if removed > 0 {
                info!("cache sweep removed {removed} expired entries");
            }
        }
    });

    info!("veilproxy running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }

    info!("shutdown requested, stopping instances");
    supervisor.stop_all().await;
}

fn log_event(event: Event) {
    match event {
        Event::StatusChanged { instance, state, reason } => match reason {
            Some(reason) => warn!("instance {instance} -> {state} ({reason})"),
            None => info!("instance {instance} -> {state}"),
        },
        Event::TrafficUpdate { instance, delta } => {
            if delta.upload_bytes > 0 || delta.download_bytes > 0 {
                log::debug!(
                    "instance {instance} traffic: up {}({}) down {}({})",
                    delta.upload_bytes,
                    delta.upload_saved_bytes,
                    delta.download_bytes,
                    delta.download_saved_bytes
                );
            }
        }
        Event::LogMessage { instance, level, message } => match instance {
            Some(instance) => log::log!(level, "[{instance}] {message}"),
            None => log::log!(level, "{message}"),
        },
        Event::Notification { instance, title, body } => {
            info!("notification from {instance}: {title}: {body}");
        }
        Event::InstanceIp { instance, ip } => {
            info!("instance {instance} egress ip: {ip}");
        }
    }
}
