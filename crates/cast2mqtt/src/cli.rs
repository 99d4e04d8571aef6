use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::cache::default_cache_path;
use crate::config::{
    BridgeConfig, BrokerAddress, ConfigError, DEFAULT_BROKER, DEFAULT_CLIENT_ID,
    DEFAULT_HEALTH_BIND, LocatorConfig, MqttConfig, TlsFiles,
};
use crate::publisher::Qos;

pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CAST2MQTT_GIT_REV"),
    ", ",
    env!("CAST2MQTT_BUILD_DATE"),
    ")"
);

/// Publish Chromecast volume and mute state to MQTT.
#[derive(Parser, Debug)]
#[command(name = "cast2mqtt", version = VERSION)]
pub struct Args {
    /// Base topic; events go to <topic>/volume and <topic>/mute
    #[arg(long, env = "CAST2MQTT_TOPIC")]
    pub topic: String,

    /// Device address; skips discovery when set
    #[arg(long, env = "CHROMECAST_ADDR")]
    pub chromecast_addr: Option<String>,

    /// Device port (8009 when omitted)
    #[arg(long, env = "CHROMECAST_PORT")]
    pub chromecast_port: Option<u16>,

    /// Friendly name to select during discovery
    #[arg(long, env = "CHROMECAST_NAME")]
    pub device_name: Option<String>,

    /// Device uuid to select during discovery
    #[arg(long, env = "CHROMECAST_UUID")]
    pub device_uuid: Option<String>,

    /// Device model to select during discovery, e.g. "Chromecast Audio"
    #[arg(long, env = "CHROMECAST_DEVICE")]
    pub device: Option<String>,

    /// Network interface to browse on
    #[arg(long, env = "CHROMECAST_IFACE")]
    pub iface: Option<String>,

    /// Discovery timeout in seconds
    #[arg(long, env = "CHROMECAST_DNS_TIMEOUT", default_value_t = 10)]
    pub dns_timeout: u64,

    /// Take the first device that answers discovery
    #[arg(long, env = "CHROMECAST_FIRST_DEVICE", default_value_t = true, action = ArgAction::Set)]
    pub first_device: bool,

    /// Remember discovered devices between runs
    #[arg(long, env = "CAST2MQTT_CACHE")]
    pub cache: bool,

    /// Discovery cache database
    #[arg(long, env = "CAST2MQTT_CACHE_PATH")]
    pub cache_path: Option<PathBuf>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(long, env = "CAST2MQTT_DEBUG")]
    pub debug: bool,

    /// Health endpoint bind address
    #[arg(long, env = "CAST2MQTT_HEALTH_BIND", default_value = DEFAULT_HEALTH_BIND)]
    pub health_bind: SocketAddr,

    /// Broker uri, tcp:// or ssl://
    #[arg(long, env = "MQTT_BROKER", default_value = DEFAULT_BROKER)]
    pub mqtt_broker: String,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    pub mqtt_client_id: String,

    /// 0, 1 or 2
    #[arg(long, env = "MQTT_QOS", default_value_t = 0)]
    pub mqtt_qos: u8,

    #[arg(long, env = "MQTT_RETAIN")]
    pub mqtt_retain: bool,

    #[arg(long, env = "MQTT_CLEAN")]
    pub mqtt_clean: bool,

    /// CA certificate (PEM); needs certfile and keyfile too
    #[arg(long, env = "MQTT_CAFILE")]
    pub mqtt_cafile: Option<PathBuf>,

    #[arg(long, env = "MQTT_CERTFILE")]
    pub mqtt_certfile: Option<PathBuf>,

    #[arg(long, env = "MQTT_KEYFILE")]
    pub mqtt_keyfile: Option<PathBuf>,
}

impl Args {
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let topic = self.topic.trim().trim_end_matches('/').to_string();
        if topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if let Some(0) = self.chromecast_port {
            return Err(ConfigError::InvalidPort(0));
        }
        let qos = Qos::try_from(self.mqtt_qos).map_err(ConfigError::InvalidQos)?;
        let broker = BrokerAddress::parse(&self.mqtt_broker)?;
        let tls_files = TlsFiles::from_parts(self.mqtt_cafile, self.mqtt_certfile, self.mqtt_keyfile)?;
        let cache_path = self.cache_path.or_else(default_cache_path);
        if self.cache && cache_path.is_none() {
            return Err(ConfigError::NoCacheDir);
        }
        let client_id = match self.mqtt_client_id.trim() {
            "" => DEFAULT_CLIENT_ID.to_string(),
            id => id.to_string(),
        };

        Ok(BridgeConfig {
            topic,
            locator: LocatorConfig {
                address: non_blank(self.chromecast_addr),
                port: self.chromecast_port,
                device_name: non_blank(self.device_name),
                device_uuid: non_blank(self.device_uuid),
                device_type: non_blank(self.device),
                iface: non_blank(self.iface),
                dns_timeout: Duration::from_secs(self.dns_timeout),
                use_first_device: self.first_device,
            },
            mqtt: MqttConfig {
                broker,
                client_id,
                username: non_blank(self.mqtt_username),
                password: self.mqtt_password,
                qos,
                retain: self.mqtt_retain,
                clean_session: self.mqtt_clean,
                tls_files,
            },
            use_cache: self.cache,
            cache_path,
            health_bind: self.health_bind,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
