use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::device::DiscoveredDevice;
use crate::publisher::Qos;

pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLIENT_ID: &str = "cast2mqtt";
pub const DEFAULT_BROKER: &str = "tcp://127.0.0.1:1883";
pub const DEFAULT_HEALTH_BIND: &str = "0.0.0.0:8080";

const MQTT_PORT: u16 = 1883;
const MQTTS_PORT: u16 = 8883;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("invalid device port {0}")]
    InvalidPort(u16),
    #[error("{0}")]
    InvalidQos(String),
    #[error("invalid broker uri {uri:?}: {reason}")]
    BrokerUri { uri: String, reason: String },
    #[error("mqtt tls needs cafile, certfile and keyfile together")]
    PartialTls,
    #[error("no user cache directory; pass --cache-path")]
    NoCacheDir,
    #[error("unable to read {path}: {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the device endpoint gets resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatorConfig {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub device_name: Option<String>,
    pub device_uuid: Option<String>,
    pub device_type: Option<String>,
    pub iface: Option<String>,
    pub dns_timeout: Duration,
    pub use_first_device: bool,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: None,
            device_name: None,
            device_uuid: None,
            device_type: None,
            iface: None,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            use_first_device: true,
        }
    }
}

impl LocatorConfig {
    /// True when any configured filter equals the entry's field.
    pub fn matches(&self, entry: &DiscoveredDevice) -> bool {
        let hit = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .is_some_and(|w| !w.is_empty() && w == actual)
        };
        hit(&self.device_uuid, &entry.uuid)
            || hit(&self.device_name, &entry.device_name)
            || hit(&self.device_type, &entry.device)
    }
}

/// Parsed `scheme://host[:port]` broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let bad = |reason: &str| ConfigError::BrokerUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(uri).map_err(|e| bad(&e.to_string()))?;
        let (tls, default_port) = match url.scheme() {
            "tcp" | "mqtt" => (false, MQTT_PORT),
            "ssl" | "tls" | "mqtts" => (true, MQTTS_PORT),
            _ => return Err(bad("unsupported scheme")),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| bad("missing host"))?;
        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(default_port),
            tls,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsFiles {
    /// All three files or none; anything in between is rejected.
    pub fn from_parts(
        ca: Option<PathBuf>,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    ) -> Result<Option<Self>, ConfigError> {
        match (ca, cert, key) {
            (Some(ca), Some(cert), Some(key)) => Ok(Some(Self { ca, cert, key })),
            (None, None, None) => Ok(None),
            _ => Err(ConfigError::PartialTls),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: Qos,
    pub retain: bool,
    pub clean_session: bool,
    pub tls_files: Option<TlsFiles>,
}

impl MqttConfig {
    pub fn uses_tls(&self) -> bool {
        self.broker.tls || self.tls_files.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub topic: String,
    pub locator: LocatorConfig,
    pub mqtt: MqttConfig,
    /// Look devices up in the cache and record fresh discoveries.
    pub use_cache: bool,
    /// Cache location; still used for invalidation when `use_cache` is off.
    pub cache_path: Option<PathBuf>,
    pub health_bind: SocketAddr,
}
