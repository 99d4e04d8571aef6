//! Glue between the device session and the publisher.

use crate::publisher::EventPublisher;
use crate::session::MessageListener;
use crate::translator::{RawStatusMessage, StatusEvent, translate};

pub struct StatusBridge {
    publisher: EventPublisher,
}

impl StatusBridge {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }

    /// Translate one raw message and publish what it carries. Never fails.
    pub fn handle(&self, raw: &RawStatusMessage) {
        if let Some(StatusEvent::ReceiverStatus(volume)) = translate(raw) {
            self.publisher.publish_volume(&volume);
        }
    }

    pub fn into_listener(self) -> MessageListener {
        Box::new(move |raw| self.handle(&raw))
    }
}
