//! mDNS discovery of Cast devices.
//!
//! Browses `_googlecast._tcp.local.` on a background thread and streams each
//! resolved device once until the timeout elapses or the consumer hangs up.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent};

use crate::device::DiscoveredDevice;

const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("unable to find interface {0:?}")]
    InterfaceNotFound(String),
    #[error("mdns: {0}")]
    Mdns(String),
}

/// Source of candidate devices.
pub trait Discoverer {
    /// Start discovery; the returned stream closes once `timeout` has elapsed.
    fn discover(
        &self,
        iface: Option<&str>,
        timeout: Duration,
    ) -> Result<Receiver<DiscoveredDevice>, DiscoveryError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MdnsDiscoverer;

impl Discoverer for MdnsDiscoverer {
    fn discover(
        &self,
        iface: Option<&str>,
        timeout: Duration,
    ) -> Result<Receiver<DiscoveredDevice>, DiscoveryError> {
        if let Some(name) = iface {
            ensure_interface_exists(name)?;
        }
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        if let Some(name) = iface {
            daemon
                .disable_interface(IfKind::All)
                .and_then(|_| daemon.enable_interface(IfKind::Name(name.to_string())))
                .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        }
        let events = daemon
            .browse(CAST_SERVICE_TYPE)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        tracing::debug!(service = CAST_SERVICE_TYPE, iface = ?iface, "mdns: browsing");

        let (tx, rx) = crossbeam_channel::unbounded();
        std::thread::spawn(move || {
            browse_until(&events, &tx, Instant::now() + timeout);
            let _ = daemon.stop_browse(CAST_SERVICE_TYPE);
            if let Ok(status) = daemon.shutdown() {
                let _ = status.recv_timeout(Duration::from_secs(1));
            }
        });
        Ok(rx)
    }
}

fn browse_until(
    events: &mdns_sd::Receiver<ServiceEvent>,
    tx: &Sender<DiscoveredDevice>,
    deadline: Instant,
) {
    let mut seen = HashSet::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        let Ok(event) = events.recv_timeout(remaining) else {
            return;
        };
        let ServiceEvent::ServiceResolved(info) = event else {
            continue;
        };
        let fullname = info.get_fullname().to_string();
        if seen.contains(&fullname) {
            continue;
        }
        let Some(ip) = info.get_addresses().iter().find_map(|ip| match ip {
            mdns_sd::ScopedIp::V4(v4) => Some(*v4.addr()),
            _ => None,
        }) else {
            tracing::warn!(fullname = %fullname, "mdns: resolved without IPv4");
            continue;
        };
        let txt = |key: &str| {
            info.get_property(key)
                .map(|p| p.val_str().to_string())
                .unwrap_or_default()
        };
        let device = DiscoveredDevice {
            uuid: txt("id"),
            device_name: txt("fn"),
            device: txt("md"),
            address: ip.to_string(),
            port: info.get_port(),
        };
        tracing::debug!(
            uuid = %device.uuid,
            device_name = %device.device_name,
            address = %device.address,
            port = device.port,
            "mdns: cast device resolved"
        );
        seen.insert(fullname);
        if tx.send(device).is_err() {
            return;
        }
    }
}

fn ensure_interface_exists(name: &str) -> Result<(), DiscoveryError> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| DiscoveryError::Mdns(format!("list interfaces: {e}")))?;
    if interfaces.iter().any(|(iface, _)| iface == name) {
        Ok(())
    } else {
        Err(DiscoveryError::InterfaceNotFound(name.to_string()))
    }
}
