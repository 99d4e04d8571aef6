//! Event publisher: maps receiver volume onto bus topics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::translator::VolumeState;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("qos must be 0, 1 or 2 (got {other})")),
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        };
        write!(f, "{level}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("publish rejected by client: {0}")]
    Client(String),
    #[error("no broker acknowledgment within {0:?}")]
    Timeout(Duration),
    #[error("bus connection closed")]
    Disconnected,
}

/// Messaging-bus publish seam.
pub trait BusClient: Send + Sync {
    /// Publish and block until the broker acknowledged at the requested QoS.
    fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: &[u8])
    -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFact {
    pub topic: String,
    pub value: String,
    pub qos: Qos,
    pub retain: bool,
}

pub struct EventPublisher {
    bus: Arc<dyn BusClient>,
    topic: String,
    qos: Qos,
    retain: bool,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn BusClient>, topic: impl Into<String>, qos: Qos, retain: bool) -> Self {
        Self {
            bus,
            topic: topic.into(),
            qos,
            retain,
        }
    }

    /// Facts for one RECEIVER_STATUS, in publish order: volume, then mute.
    pub fn facts(&self, volume: &VolumeState) -> [PublishedFact; 2] {
        let mute = if volume.muted { "ON" } else { "OFF" };
        [
            self.fact("volume", volume.percent().to_string()),
            self.fact("mute", mute.to_string()),
        ]
    }

    fn fact(&self, suffix: &str, value: String) -> PublishedFact {
        PublishedFact {
            topic: format!("{}/{suffix}", self.topic),
            value,
            qos: self.qos,
            retain: self.retain,
        }
    }

    pub fn publish(&self, fact: &PublishedFact) -> Result<(), PublishError> {
        self.bus
            .publish(&fact.topic, fact.qos, fact.retain, fact.value.as_bytes())
    }

    /// Publish volume then mute; failures are logged and do not stop the second publish.
    pub fn publish_volume(&self, volume: &VolumeState) -> usize {
        let mut published = 0;
        for fact in self.facts(volume) {
            tracing::info!(topic = %fact.topic, value = %fact.value, "publish receiver event");
            match self.publish(&fact) {
                Ok(()) => published += 1,
                Err(e) => {
                    tracing::error!(topic = %fact.topic, error = %e, "unable to publish event");
                }
            }
        }
        published
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every publish; topics listed in `fail_topics` are rejected.
    #[derive(Default)]
    pub(crate) struct RecordingBus {
        pub(crate) published: Mutex<Vec<PublishedFact>>,
        pub(crate) fail_topics: Vec<String>,
    }

    impl BusClient for RecordingBus {
        fn publish(
            &self,
            topic: &str,
            qos: Qos,
            retain: bool,
            payload: &[u8],
        ) -> Result<(), PublishError> {
            if self.fail_topics.iter().any(|t| t == topic) {
                return Err(PublishError::Client("rejected".to_string()));
            }
            self.published.lock().unwrap().push(PublishedFact {
                topic: topic.to_string(),
                value: String::from_utf8_lossy(payload).to_string(),
                qos,
                retain,
            });
            Ok(())
        }
    }
}
