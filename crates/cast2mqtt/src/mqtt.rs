//! MQTT bus client over `rumqttc` (MQTT 3.1.1, blocking client).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use rumqttc::{
    Client, Connection, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, Transport,
};

use crate::config::{ConfigError, MqttConfig};
use crate::publisher::{BusClient, PublishError, Qos};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Timed-out packet ids remembered so their late acks and retransmits are skipped.
const ABANDONED_LIMIT: usize = 16;

/// Event-loop progress for outgoing publishes, keyed by packet id (0 for QoS 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
    /// Packet handed to the socket.
    Written(u16),
    PubAck(u16),
    PubComp(u16),
}

impl Ack {
    /// Whether this ack completes the written publish `pkid` at `qos`.
    fn completes(self, qos: Qos, pkid: u16) -> bool {
        match (qos, self) {
            (Qos::AtLeastOnce, Ack::PubAck(p)) | (Qos::ExactlyOnce, Ack::PubComp(p)) => p == pkid,
            _ => false,
        }
    }
}

/// Client plus the bookkeeping that ties event-loop acks to the publish waiting on them.
struct Outbox {
    client: Client,
    /// Publishes that timed out before their packet was written.
    unclaimed_writes: usize,
    abandoned: VecDeque<u16>,
}

impl Outbox {
    fn abandon(&mut self, pkid: u16) {
        if self.abandoned.len() == ABANDONED_LIMIT {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(pkid);
    }

    fn settle(&mut self, pkid: u16) {
        self.abandoned.retain(|p| *p != pkid);
    }
}

pub struct MqttBus {
    outbox: Mutex<Outbox>,
    acks: Receiver<Ack>,
    ack_timeout: Duration,
    closing: Arc<AtomicBool>,
    done: Receiver<()>,
    broker: String,
}

impl MqttBus {
    /// Connect and wait for the broker's CONNACK.
    pub fn connect(config: &MqttConfig) -> Result<Self> {
        let broker = format!("{}:{}", config.broker.host, config.broker.port);
        let options = mqtt_options(config)?;
        let (client, connection) = Client::new(options, 10);

        let (connected_tx, connected_rx) = bounded(1);
        let (ack_tx, ack_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let closing = Arc::new(AtomicBool::new(false));
        let loop_closing = closing.clone();
        let loop_broker = broker.clone();
        std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || {
                drive_connection(connection, connected_tx, ack_tx, loop_closing, &loop_broker);
                let _ = done_tx.send(());
            })
            .context("spawn mqtt event thread")?;

        match connected_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                closing.store(true, Ordering::SeqCst);
                return Err(anyhow!("mqtt connect to {broker} failed: {reason}"));
            }
            Err(_) => {
                closing.store(true, Ordering::SeqCst);
                let _ = client.disconnect();
                return Err(anyhow!("mqtt connect to {broker} timed out after {CONNECT_TIMEOUT:?}"));
            }
        }
        tracing::info!(broker = %broker, tls = config.uses_tls(), "connected to mqtt broker");

        Ok(Self {
            outbox: Mutex::new(Outbox {
                client,
                unclaimed_writes: 0,
                abandoned: VecDeque::new(),
            }),
            acks: ack_rx,
            ack_timeout: ACK_TIMEOUT,
            closing,
            done: done_rx,
            broker,
        })
    }

    /// Send DISCONNECT and give the event thread up to `timeout` to finish.
    pub fn disconnect(&self, timeout: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        if let Ok(outbox) = self.outbox.lock() {
            if let Err(e) = outbox.client.disconnect() {
                tracing::warn!(broker = %self.broker, error = %e, "mqtt disconnect failed");
            }
        }
        if self.done.recv_timeout(timeout).is_err() {
            tracing::debug!(broker = %self.broker, "mqtt event thread still running at exit");
        }
    }
}

impl BusClient for MqttBus {
    fn publish(
        &self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        let mut outbox = self.outbox.lock().map_err(|_| PublishError::Disconnected)?;
        outbox
            .client
            .publish(topic, to_rumqttc(qos), retain, payload.to_vec())
            .map_err(|e| PublishError::Client(e.to_string()))?;

        let deadline = Instant::now() + self.ack_timeout;
        // Requests are written in order, so the first unclaimed write is ours.
        let pkid = loop {
            match self.next_ack(deadline) {
                Ok(Ack::Written(pkid)) if pkid != 0 && outbox.abandoned.contains(&pkid) => {}
                Ok(Ack::Written(_)) if outbox.unclaimed_writes > 0 => outbox.unclaimed_writes -= 1,
                Ok(Ack::Written(pkid)) => break pkid,
                Ok(Ack::PubAck(pkid) | Ack::PubComp(pkid)) => outbox.settle(pkid),
                Err(e) => {
                    if matches!(e, PublishError::Timeout(_)) {
                        outbox.unclaimed_writes += 1;
                    }
                    return Err(e);
                }
            }
        };
        if qos == Qos::AtMostOnce {
            return Ok(());
        }

        loop {
            match self.next_ack(deadline) {
                Ok(ack) if ack.completes(qos, pkid) => return Ok(()),
                Ok(Ack::PubAck(other) | Ack::PubComp(other)) => outbox.settle(other),
                Ok(Ack::Written(_)) => {}
                Err(e) => {
                    outbox.abandon(pkid);
                    return Err(e);
                }
            }
        }
    }
}

impl MqttBus {
    fn next_ack(&self, deadline: Instant) -> Result<Ack, PublishError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.acks.recv_timeout(remaining) {
            Ok(ack) => Ok(ack),
            Err(RecvTimeoutError::Timeout) => Err(PublishError::Timeout(self.ack_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PublishError::Disconnected),
        }
    }
}

fn drive_connection(
    mut connection: Connection,
    connected: Sender<Result<(), String>>,
    acks: Sender<Ack>,
    closing: Arc<AtomicBool>,
    broker: &str,
) {
    let mut ever_connected = false;
    for event in connection.iter() {
        if closing.load(Ordering::SeqCst) && event.is_err() {
            break;
        }
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    if ever_connected {
                        tracing::info!(broker = %broker, "mqtt reconnected");
                    }
                    ever_connected = true;
                    let _ = connected.try_send(Ok(()));
                } else if !ever_connected {
                    let _ = connected.try_send(Err(format!("{:?}", ack.code)));
                    break;
                } else {
                    tracing::error!(broker = %broker, code = ?ack.code, "mqtt broker refused reconnect");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = acks.send(Ack::PubAck(ack.pkid));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let _ = acks.send(Ack::PubComp(comp.pkid));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = acks.send(Ack::Written(pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if !ever_connected {
                    let _ = connected.try_send(Err(e.to_string()));
                    break;
                }
                tracing::error!(broker = %broker, error = %e, "mqtt connection error");
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
    tracing::debug!(broker = %broker, "mqtt event loop finished");
}

fn to_rumqttc(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, ConfigError> {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker.host.clone(),
        config.broker.port,
    );
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(config.clean_session);
    if let Some(user) = config.username.as_deref().filter(|u| !u.is_empty()) {
        options.set_credentials(user, config.password.clone().unwrap_or_default());
    }
    if let Some(transport) = build_transport(config)? {
        options.set_transport(transport);
    }
    Ok(options)
}

fn build_transport(config: &MqttConfig) -> Result<Option<Transport>, ConfigError> {
    if let Some(files) = &config.tls_files {
        let ca = read_file(&files.ca)?;
        let cert = read_file(&files.cert)?;
        let key = read_file(&files.key)?;
        return Ok(Some(Transport::tls(ca, Some((cert, key)), None)));
    }
    if config.broker.tls {
        return Ok(Some(Transport::tls_with_default_config()));
    }
    Ok(None)
}

fn read_file(path: &std::path::Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::UnreadableFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::path::PathBuf;

    use super::*;
    use crate::config::{BrokerAddress, TlsFiles};

    fn config() -> MqttConfig {
        MqttConfig {
            broker: BrokerAddress::parse("tcp://broker.local").unwrap(),
            client_id: "cast2mqtt".to_string(),
            username: None,
            password: None,
            qos: Qos::AtMostOnce,
            retain: false,
            clean_session: true,
            tls_files: None,
        }
    }

    #[test]
    fn options_follow_config() {
        let options = mqtt_options(&config()).expect("options");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.client_id(), "cast2mqtt");
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(options.clean_session());
    }

    #[test]
    fn unreadable_tls_files_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = |name: &str| -> PathBuf { dir.path().join(name) };
        let config = MqttConfig {
            tls_files: Some(TlsFiles {
                ca: missing("ca.pem"),
                cert: missing("client.pem"),
                key: missing("client.key"),
            }),
            ..config()
        };
        assert!(matches!(
            mqtt_options(&config),
            Err(ConfigError::UnreadableFile { .. })
        ));
    }

    #[test]
    fn tls_files_enable_tls_transport() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for name in ["ca.pem", "client.pem", "client.key"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"-----BEGIN-----").unwrap();
            paths.push(path);
        }
        let config = MqttConfig {
            tls_files: Some(TlsFiles {
                ca: paths[0].clone(),
                cert: paths[1].clone(),
                key: paths[2].clone(),
            }),
            ..config()
        };
        let transport = build_transport(&config).expect("transport");
        assert!(matches!(transport, Some(Transport::Tls(_))));
        assert!(build_transport(&self::config()).unwrap().is_none());
    }

    #[test]
    fn acks_complete_only_their_own_packet() {
        assert!(Ack::PubAck(3).completes(Qos::AtLeastOnce, 3));
        assert!(!Ack::PubAck(1).completes(Qos::AtLeastOnce, 3));
        assert!(!Ack::PubAck(3).completes(Qos::ExactlyOnce, 3));
        assert!(Ack::PubComp(3).completes(Qos::ExactlyOnce, 3));
        assert!(!Ack::Written(3).completes(Qos::AtLeastOnce, 3));
    }

    /// Minimal MQTT 3.1.1 broker: accepts one client, answers pings, and for
    /// each PUBLISH acks whatever packet id `reply` picks from the ids seen so far.
    fn fake_broker(reply: fn(&[u16]) -> Option<u16>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            while let Some((header, body)) = read_packet(&mut stream) {
                match header >> 4 {
                    1 => stream.write_all(&[0x20, 0x02, 0x00, 0x00]).unwrap(),
                    3 => {
                        let qos = (header >> 1) & 0x03;
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        if qos == 0 {
                            continue;
                        }
                        let at = 2 + topic_len;
                        seen.push(u16::from_be_bytes([body[at], body[at + 1]]));
                        if let Some(pkid) = reply(&seen) {
                            let [hi, lo] = pkid.to_be_bytes();
                            stream.write_all(&[0x40, 0x02, hi, lo]).unwrap();
                        }
                    }
                    12 => stream.write_all(&[0xD0, 0x00]).unwrap(),
                    14 => break,
                    _ => {}
                }
            }
        });
        port
    }

    fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).ok()?;
        let header = byte[0];
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            stream.read_exact(&mut byte).ok()?;
            len |= ((byte[0] & 0x7F) as usize) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).ok()?;
        Some((header, body))
    }

    fn bus_for(port: u16) -> MqttBus {
        let config = MqttConfig {
            broker: BrokerAddress::parse(&format!("tcp://127.0.0.1:{port}")).unwrap(),
            ..config()
        };
        let mut bus = MqttBus::connect(&config).expect("connect to fake broker");
        bus.ack_timeout = Duration::from_millis(300);
        bus
    }

    #[test]
    fn publish_waits_for_ack_of_its_own_packet() {
        // Nothing for the first publish; the second one only sees the first one's PUBACK.
        let port = fake_broker(|seen| (seen.len() == 2).then(|| seen[0]));
        let bus = bus_for(port);

        let first = bus.publish("cast/volume", Qos::AtLeastOnce, false, b"40");
        assert!(matches!(first, Err(PublishError::Timeout(_))));
        let second = bus.publish("cast/muted", Qos::AtLeastOnce, false, b"false");
        assert!(matches!(second, Err(PublishError::Timeout(_))));
        bus.disconnect(Duration::from_millis(200));
    }

    #[test]
    fn acked_publishes_succeed() {
        let port = fake_broker(|seen| seen.last().copied());
        let bus = bus_for(port);

        assert!(bus.publish("cast/volume", Qos::AtLeastOnce, false, b"40").is_ok());
        assert!(bus.publish("cast/muted", Qos::AtLeastOnce, false, b"false").is_ok());
        assert!(bus.publish("cast/volume", Qos::AtMostOnce, false, b"41").is_ok());
        bus.disconnect(Duration::from_millis(200));
    }

    #[test]
    fn connect_to_unreachable_broker_fails() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = MqttConfig {
            broker: BrokerAddress::parse(&format!("tcp://127.0.0.1:{port}")).unwrap(),
            ..config()
        };
        assert!(MqttBus::connect(&config).is_err());
    }
}
