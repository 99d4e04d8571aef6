//! Cast V2 connector: TLS channel to the device plus a worker thread that
//! keeps the heartbeat going and hands every status frame to the listener.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cast_channel::{
    CastMessage, FrameReader, NAMESPACE_CONNECTION, NAMESPACE_HEARTBEAT, NAMESPACE_RECEIVER,
    PayloadType, RECEIVER_ID,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, unbounded};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, SignatureScheme, StreamOwned};
use serde_json::{Value, json};

use crate::device::DeviceEndpoint;
use crate::session::{
    CloseMode, Connector, DeviceLink, LinkHandle, MessageListener, Ownership, SessionError,
};
use crate::translator::{PayloadKind, RawStatusMessage};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Silence after which the device is considered gone; it answers every PING.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

pub struct CastConnector {
    connect_timeout: Duration,
}

impl Default for CastConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Connector for CastConnector {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        listener: MessageListener,
    ) -> Result<LinkHandle, SessionError> {
        let connect_err = |reason: String| SessionError::Connect {
            address: format!("{}:{}", endpoint.address, endpoint.port),
            reason,
        };
        let addr = resolve_device_addr(&endpoint.address, endpoint.port)
            .map_err(|e| connect_err(e.to_string()))?;
        let server_name = server_name_for(&endpoint.address)?;
        let mut conn = CastConnection::connect(addr, server_name, self.connect_timeout)
            .map_err(|e| connect_err(e.to_string()))?;

        // The first write drives the TLS handshake.
        conn.send_json(RECEIVER_ID, NAMESPACE_CONNECTION, &json!({ "type": "CONNECT" }))
            .map_err(|e| connect_err(e.to_string()))?;
        let mut worker = Worker::new(conn, endpoint.label(), REQUEST_TIMEOUT);
        // Initial status so the current volume is known right away.
        worker.request_status()?;

        let link = CastLink::spawn(worker, listener)?;
        tracing::info!(device = %endpoint.label(), "cast: connected");
        Ok(LinkHandle {
            link: Box::new(link),
            // Status bridging never launches an application on the device.
            ownership: Ownership::Attached,
        })
    }
}

enum LinkCommand {
    Refresh(Sender<Result<(), SessionError>>),
    Close { mode: CloseMode, done: Sender<()> },
}

struct CastLink {
    cmd_tx: Sender<LinkCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl CastLink {
    fn spawn<S>(worker: Worker<S>, listener: MessageListener) -> std::io::Result<Self>
    where
        S: Read + Write + Send + 'static,
    {
        let request_timeout = worker.request_timeout;
        let (cmd_tx, cmd_rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("cast-session".to_string())
            .spawn(move || worker.run(cmd_rx, listener))?;
        Ok(Self {
            cmd_tx,
            worker: Mutex::new(Some(handle)),
            request_timeout,
        })
    }
}

impl DeviceLink for CastLink {
    /// Succeeds once the device answered the status request.
    fn refresh(&self) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.cmd_tx
            .send(LinkCommand::Refresh(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        // The worker enforces the request timeout; this only guards against a stuck worker.
        match reply_rx.recv_timeout(self.request_timeout + Duration::from_secs(1)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Timeout(self.request_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    fn close(&self, mode: CloseMode) {
        let (done_tx, done_rx) = bounded(1);
        if self.cmd_tx.send(LinkCommand::Close { mode, done: done_tx }).is_err() {
            return;
        }
        if done_rx.recv_timeout(self.request_timeout).is_err() {
            tracing::warn!("cast: worker did not acknowledge close");
            return;
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

struct PendingRefresh {
    request_id: i64,
    reply: Sender<Result<(), SessionError>>,
    deadline: Instant,
}

struct Worker<S> {
    conn: CastConnection<S>,
    device: String,
    request_id: i64,
    request_timeout: Duration,
    pending: Vec<PendingRefresh>,
    app_session: Option<String>,
    closed: bool,
}

impl<S: Read + Write> Worker<S> {
    fn new(conn: CastConnection<S>, device: String, request_timeout: Duration) -> Self {
        Self {
            conn,
            device,
            request_id: 1,
            request_timeout,
            pending: Vec::new(),
            app_session: None,
            closed: false,
        }
    }

    fn run(mut self, cmd_rx: Receiver<LinkCommand>, mut listener: MessageListener) {
        let mut last_ping = Instant::now();
        let mut last_heard = Instant::now();
        loop {
            match cmd_rx.try_recv() {
                Ok(LinkCommand::Refresh(reply)) => self.begin_refresh(reply),
                Ok(LinkCommand::Close { mode, done }) => {
                    self.close(mode);
                    let _ = done.send(());
                    break;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.close(CloseMode::Detach);
                    break;
                }
            }

            if last_ping.elapsed() >= HEARTBEAT_INTERVAL {
                let _ = self
                    .conn
                    .send_json(RECEIVER_ID, NAMESPACE_HEARTBEAT, &json!({ "type": "PING" }));
                last_ping = Instant::now();
            }

            match self.conn.read_message() {
                Ok(Some(msg)) => {
                    last_heard = Instant::now();
                    if let Some(raw) = self.handle_message(msg) {
                        listener(raw);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(device = %self.device, error = %err, "cast: connection lost");
                    break;
                }
            }
            self.expire_refreshes();

            if self.closed {
                tracing::warn!(device = %self.device, "cast: device closed the connection");
                break;
            }
            if last_heard.elapsed() >= HEARTBEAT_TIMEOUT {
                tracing::warn!(device = %self.device, "cast: device stopped answering heartbeats");
                break;
            }
        }
        tracing::info!(device = %self.device, "cast worker stopped");
    }

    fn next_request_id(&mut self) -> i64 {
        let current = self.request_id;
        self.request_id = self.request_id.saturating_add(1);
        current
    }

    /// Send a receiver GET_STATUS and return its request id.
    fn request_status(&mut self) -> Result<i64, SessionError> {
        let request_id = self.next_request_id();
        self.conn.send_json(
            RECEIVER_ID,
            NAMESPACE_RECEIVER,
            &json!({ "type": "GET_STATUS", "requestId": request_id }),
        )?;
        Ok(request_id)
    }

    fn begin_refresh(&mut self, reply: Sender<Result<(), SessionError>>) {
        match self.request_status() {
            Ok(request_id) => self.pending.push(PendingRefresh {
                request_id,
                reply,
                deadline: Instant::now() + self.request_timeout,
            }),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn expire_refreshes(&mut self) {
        let now = Instant::now();
        let timeout = self.request_timeout;
        self.pending.retain(|p| {
            if p.deadline > now {
                return true;
            }
            let _ = p.reply.send(Err(SessionError::Timeout(timeout)));
            false
        });
    }

    fn answer_refresh(&mut self, request_id: i64) {
        if let Some(idx) = self.pending.iter().position(|p| p.request_id == request_id) {
            let done = self.pending.swap_remove(idx);
            let _ = done.reply.send(Ok(()));
        }
    }

    fn close(&mut self, mode: CloseMode) {
        if mode == CloseMode::StopApp {
            if let Some(session_id) = self.app_session.clone() {
                let request_id = self.next_request_id();
                let _ = self.conn.send_json(
                    RECEIVER_ID,
                    NAMESPACE_RECEIVER,
                    &json!({ "type": "STOP", "requestId": request_id, "sessionId": session_id }),
                );
            }
        }
        let _ = self
            .conn
            .send_json(RECEIVER_ID, NAMESPACE_CONNECTION, &json!({ "type": "CLOSE" }));
    }

    /// Channel housekeeping happens here; everything else goes to the listener.
    fn handle_message(&mut self, msg: CastMessage) -> Option<RawStatusMessage> {
        let raw = raw_message(&msg);
        tracing::debug!(
            device = %self.device,
            namespace = %raw.namespace,
            payload = %raw.payload,
            "cast: message"
        );
        let msg_type = msg.json_type().unwrap_or_default();
        match msg.namespace.as_str() {
            NAMESPACE_HEARTBEAT => {
                if msg_type == "PING" {
                    let _ = self.conn.send_json(
                        &msg.source_id,
                        NAMESPACE_HEARTBEAT,
                        &json!({ "type": "PONG" }),
                    );
                }
                None
            }
            NAMESPACE_CONNECTION => {
                if msg_type == "CLOSE" {
                    self.closed = true;
                }
                None
            }
            NAMESPACE_RECEIVER => {
                if let Ok(value) = serde_json::from_str::<Value>(&raw.payload) {
                    if msg_type == "RECEIVER_STATUS" {
                        self.app_session = app_session_id(&value);
                    }
                    if let Some(request_id) = value.get("requestId").and_then(Value::as_i64) {
                        self.answer_refresh(request_id);
                    }
                }
                Some(raw)
            }
            _ => Some(raw),
        }
    }
}

fn raw_message(msg: &CastMessage) -> RawStatusMessage {
    match msg.kind() {
        PayloadType::String => RawStatusMessage {
            namespace: msg.namespace.clone(),
            payload_type: PayloadKind::Text,
            payload: msg.payload_utf8.clone().unwrap_or_default(),
        },
        PayloadType::Binary => RawStatusMessage {
            namespace: msg.namespace.clone(),
            payload_type: PayloadKind::Binary,
            payload: String::new(),
        },
    }
}

/// Session id of the first application running on the receiver.
fn app_session_id(payload: &Value) -> Option<String> {
    let apps = payload.get("status")?.get("applications")?.as_array()?;
    apps.first()?
        .get("sessionId")?
        .as_str()
        .map(str::to_string)
}

struct CastConnection<S> {
    stream: S,
    frames: FrameReader,
}

impl CastConnection<TlsStream> {
    fn connect(
        addr: SocketAddr,
        server_name: ServerName<'static>,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let root_store = rustls::RootCertStore::empty();
        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        // Cast devices present self-signed certificates.
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(std::io::Error::other)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(Duration::from_millis(200)))?;
        stream.set_write_timeout(Some(Duration::from_secs(2)))?;
        Ok(Self::new(StreamOwned::new(conn, stream)))
    }
}

impl<S: Read + Write> CastConnection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream,
            frames: FrameReader::new(),
        }
    }

    fn send_json(
        &mut self,
        destination_id: &str,
        namespace: &str,
        payload: &Value,
    ) -> std::io::Result<()> {
        let msg = CastMessage::json(destination_id, namespace, payload);
        cast_channel::write_frame(&mut self.stream, &msg)
    }

    /// Next complete frame; `None` when the read timed out first.
    fn read_message(&mut self) -> std::io::Result<Option<CastMessage>> {
        self.frames.poll(&mut self.stream)
    }
}

fn resolve_device_addr(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))
}

fn server_name_for(host: &str) -> Result<ServerName<'static>, SessionError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| SessionError::Tls(format!("invalid server name {host:?}: {e}")))
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
