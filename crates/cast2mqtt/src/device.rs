//! Resolved device addressing shared by the locator and the session manager.

use std::fmt;

pub use cast_channel::DEFAULT_PORT as DEFAULT_CAST_PORT;

/// Where a [`DeviceEndpoint`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOrigin {
    ExplicitConfig,
    CacheHit,
    Discovered,
}

impl fmt::Display for EndpointOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EndpointOrigin::ExplicitConfig => "explicit-config",
            EndpointOrigin::CacheHit => "cache-hit",
            EndpointOrigin::Discovered => "discovered",
        };
        f.write_str(label)
    }
}

/// Network address of the target device, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub address: String,
    pub port: u16,
    pub origin: EndpointOrigin,
}

impl DeviceEndpoint {
    pub fn explicit(address: impl Into<String>, port: u16) -> Self {
        Self {
            uuid: None,
            name: None,
            address: address.into(),
            port,
            origin: EndpointOrigin::ExplicitConfig,
        }
    }

    /// Identifiers usable as cache keys (blank values skipped).
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        [self.uuid.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|id| !id.trim().is_empty())
    }

    /// Short label for logs: the name when known, else `host:port`.
    pub fn label(&self) -> String {
        match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("{}:{}", self.address, self.port),
        }
    }
}

/// One device answering discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub uuid: String,
    pub device_name: String,
    /// Device model, e.g. "Chromecast Audio".
    pub device: String,
    pub address: String,
    pub port: u16,
}

impl DiscoveredDevice {
    pub fn into_endpoint(self) -> DeviceEndpoint {
        DeviceEndpoint {
            uuid: Some(self.uuid).filter(|s| !s.is_empty()),
            name: Some(self.device_name).filter(|s| !s.is_empty()),
            address: self.address,
            port: self.port,
            origin: EndpointOrigin::Discovered,
        }
    }
}
