//! Process wiring: bus, cache, locator, session, health, shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;

use crate::bridge::StatusBridge;
use crate::cache::DiscoveryCache;
use crate::cast::CastConnector;
use crate::config::BridgeConfig;
use crate::discovery::MdnsDiscoverer;
use crate::health::spawn_health_server;
use crate::locator::{DeviceLocator, PromptSelector};
use crate::mqtt::MqttBus;
use crate::publisher::EventPublisher;
use crate::session::{REFRESH_INTERVAL, SessionManager};

const MQTT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(50);

pub fn run(config: BridgeConfig) -> Result<()> {
    let bus = Arc::new(MqttBus::connect(&config.mqtt).context("connect to mqtt broker")?);

    let cache = lookup_cache(config.use_cache, config.cache_path.as_deref())?;
    let mut locator = DeviceLocator::new(cache.clone(), MdnsDiscoverer, PromptSelector::stdio());
    let endpoint = locator
        .resolve(&config.locator)
        .context("locate cast device")?;

    let publisher = EventPublisher::new(
        bus.clone(),
        config.topic.clone(),
        config.mqtt.qos,
        config.mqtt.retain,
    );
    let listener = StatusBridge::new(publisher).into_listener();

    let invalidation = invalidation_cache(cache.as_ref(), config.cache_path.as_deref());
    let manager = SessionManager::new(CastConnector::default(), invalidation);
    let session = Arc::new(
        manager
            .start(endpoint, listener)
            .context("start device session")?,
    );
    tracing::info!(
        device = %session.endpoint().label(),
        topic = %config.topic,
        "bridge running"
    );

    spawn_health_server(config.health_bind, session.clone());

    let (shutdown_tx, shutdown_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("install signal handler")?;

    manager.run_until(&session, &shutdown_rx, REFRESH_INTERVAL);

    tracing::info!("shutting down");
    manager.shutdown(&session);
    bus.disconnect(MQTT_DISCONNECT_TIMEOUT);
    Ok(())
}

fn lookup_cache(use_cache: bool, path: Option<&Path>) -> Result<Option<DiscoveryCache>> {
    match path.filter(|_| use_cache) {
        Some(path) => {
            let cache = DiscoveryCache::open(path)?;
            tracing::info!(path = %path.display(), "discovery cache enabled");
            Ok(Some(cache))
        }
        None => Ok(None),
    }
}

/// Entries left by an earlier cached run are blanked on connect failure even
/// when caching is off for this run.
fn invalidation_cache(
    lookup: Option<&DiscoveryCache>,
    path: Option<&Path>,
) -> Option<DiscoveryCache> {
    if let Some(cache) = lookup {
        return Some(cache.clone());
    }
    match DiscoveryCache::open_existing(path?) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!(error = %e, "discovery cache unavailable for invalidation");
            None
        }
    }
}
