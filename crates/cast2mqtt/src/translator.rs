//! Status translator: raw device messages in, typed status events out.
//!
//! Decode failures are logged and absorbed here; nothing is ever returned to
//! the session as an error.

use serde::Deserialize;
use serde_json::Value;

/// Payload encoding of an inbound device frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
}

/// One inbound device event, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatusMessage {
    pub namespace: String,
    pub payload_type: PayloadKind,
    /// UTF-8 payload; empty for binary frames.
    pub payload: String,
}

impl RawStatusMessage {
    pub fn text(namespace: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            payload_type: PayloadKind::Text,
            payload: payload.into(),
        }
    }
}

/// Receiver volume as reported in RECEIVER_STATUS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeState {
    /// 0.0 ..= 1.0
    pub level: f64,
    pub muted: bool,
}

impl VolumeState {
    /// `round(level * 100)` clamped to 0..=100.
    pub fn percent(&self) -> u8 {
        let pct = (self.level * 100.0).round().clamp(0.0, 100.0);
        pct as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    MediaStatus,
    ReceiverStatus(VolumeState),
    /// Any other `type`, or a payload that is not JSON at all.
    Unmanaged,
}

#[derive(Deserialize)]
struct ReceiverStatusResponse {
    status: ReceiverStatusBody,
}

#[derive(Deserialize)]
struct ReceiverStatusBody {
    volume: VolumeBody,
}

#[derive(Deserialize)]
struct VolumeBody {
    level: f64,
    muted: bool,
}

/// Classify a raw message.
///
/// Returns `None` for frames that carry nothing to classify (binary payloads)
/// and for RECEIVER_STATUS payloads that do not match the schema.
pub fn translate(raw: &RawStatusMessage) -> Option<StatusEvent> {
    if raw.payload_type != PayloadKind::Text {
        return None;
    }
    tracing::debug!(namespace = %raw.namespace, raw_msg = %raw.payload, "new msg");

    let value: Value = match serde_json::from_str(&raw.payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::info!(payload = %raw.payload, error = %e, "unmanaged event");
            return Some(StatusEvent::Unmanaged);
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("MEDIA_STATUS") => {
            tracing::debug!(payload = %raw.payload, "new media status event");
            Some(StatusEvent::MediaStatus)
        }
        Some("RECEIVER_STATUS") => decode_receiver_status(&raw.payload),
        _ => {
            tracing::info!(payload = %raw.payload, "unmanaged event");
            Some(StatusEvent::Unmanaged)
        }
    }
}

fn decode_receiver_status(payload: &str) -> Option<StatusEvent> {
    tracing::debug!(kind = "RECEIVER_STATUS", payload = %payload, "new payload");
    match serde_json::from_str::<ReceiverStatusResponse>(payload) {
        Ok(resp) => Some(StatusEvent::ReceiverStatus(VolumeState {
            level: resp.status.volume.level,
            muted: resp.status.volume.muted,
        })),
        Err(e) => {
            tracing::error!(kind = "RECEIVER_STATUS", error = %e, "unable to decode receiver status");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    const NS: &str = "urn:x-cast:com.google.cast.receiver";

    fn receiver_status(level: f64, muted: bool) -> RawStatusMessage {
        RawStatusMessage::text(
            NS,
            format!(
                r#"{{"requestId":0,"type":"RECEIVER_STATUS","status":{{"applications":[],"volume":{{"controlType":"attenuation","level":{level},"muted":{muted},"stepInterval":0.05}}}}}}"#
            ),
        )
    }

    #[test]
    fn receiver_status_extracts_volume_and_mute() {
        let event = translate(&receiver_status(0.42, true)).expect("event");
        assert_eq!(
            event,
            StatusEvent::ReceiverStatus(VolumeState {
                level: 0.42,
                muted: true
            })
        );
    }

    #[test]
    fn media_status_is_classified_without_fields() {
        let raw = RawStatusMessage::text(
            "urn:x-cast:com.google.cast.media",
            r#"{"type":"MEDIA_STATUS","status":[{"playerState":"PLAYING"}]}"#,
        );
        assert_eq!(translate(&raw), Some(StatusEvent::MediaStatus));
    }

    #[test]
    fn binary_payloads_are_dropped() {
        let raw = RawStatusMessage {
            namespace: NS.to_string(),
            payload_type: PayloadKind::Binary,
            payload: String::new(),
        };
        assert_eq!(translate(&raw), None);
    }

    #[test]
    fn missing_or_unknown_type_is_unmanaged() {
        for payload in [r#"{"status":{}}"#, r#"{"type":"CLOSE"}"#, r#"{"type":42}"#] {
            assert_eq!(
                translate(&RawStatusMessage::text(NS, payload)),
                Some(StatusEvent::Unmanaged),
                "{payload}"
            );
        }
    }

    #[test]
    fn invalid_json_is_unmanaged() {
        let raw = RawStatusMessage::text(NS, "{not json");
        assert_eq!(translate(&raw), Some(StatusEvent::Unmanaged));
    }

    #[test]
    fn malformed_receiver_status_yields_nothing() {
        for payload in [
            r#"{"type":"RECEIVER_STATUS"}"#,
            r#"{"type":"RECEIVER_STATUS","status":{"volume":{"level":"loud","muted":false}}}"#,
            r#"{"type":"RECEIVER_STATUS","status":{"volume":{"level":0.5}}}"#,
        ] {
            assert_eq!(translate(&RawStatusMessage::text(NS, payload)), None, "{payload}");
        }
    }

    #[test]
    fn percent_rounds_and_stays_in_range() {
        let pct = |level| VolumeState { level, muted: false }.percent();
        assert_eq!(pct(0.0), 0);
        assert_eq!(pct(0.5), 50);
        assert_eq!(pct(0.286), 29);
        assert_eq!(pct(0.994), 99);
        assert_eq!(pct(0.996), 100);
        assert_eq!(pct(1.0), 100);
        assert_eq!(pct(1.2), 100);
        assert_eq!(pct(-0.1), 0);
        for step in 0..=1000 {
            let level = f64::from(step) / 1000.0;
            assert!(pct(level) <= 100);
        }
    }

    #[derive(Clone, Default)]
    struct LogSink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn invalid_json_logs_one_info_line() {
        let sink = LogSink::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .without_time()
            .with_writer(move || writer.clone())
            .finish();

        let event = tracing::subscriber::with_default(subscriber, || {
            translate(&RawStatusMessage::text(NS, "{not json"))
        });
        assert_eq!(event, Some(StatusEvent::Unmanaged));

        let output = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 1, "{output}");
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("{not json"));
    }
}
