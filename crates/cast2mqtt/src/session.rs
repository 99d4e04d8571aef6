//! Device session lifecycle: start, periodic refresh, shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, select, tick};

use crate::cache::DiscoveryCache;
use crate::device::DeviceEndpoint;
use crate::translator::RawStatusMessage;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Called once per message received from the device, on the session's worker thread.
pub type MessageListener = Box<dyn FnMut(RawStatusMessage) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("tls: {0}")]
    Tls(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session closed")]
    Closed,
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
}

/// How a link is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Ask the device to stop the running application, then disconnect.
    StopApp,
    /// Disconnect only; whatever runs on the device keeps running.
    Detach,
}

/// Live channel to a device.
pub trait DeviceLink: Send + Sync {
    /// Ask the device to resend its status.
    fn refresh(&self) -> Result<(), SessionError>;
    fn close(&self, mode: CloseMode);
}

/// Whether this process launched the device application or joined one already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Attached,
    Owned,
}

pub struct LinkHandle {
    pub link: Box<dyn DeviceLink>,
    pub ownership: Ownership,
}

pub trait Connector {
    fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        listener: MessageListener,
    ) -> Result<LinkHandle, SessionError>;
}

pub struct Session {
    endpoint: DeviceEndpoint,
    link: Box<dyn DeviceLink>,
    ownership: Ownership,
    stopped: AtomicBool,
}

impl Session {
    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn refresh(&self) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.link.refresh()
    }

    /// Stop the device application. Only the first call has an effect.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.link.close(CloseMode::StopApp);
        }
    }

    /// Drop the connection without touching the device application.
    pub fn detach(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.link.close(CloseMode::Detach);
        }
    }
}

pub struct SessionManager<C> {
    connector: C,
    cache: Option<DiscoveryCache>,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C, cache: Option<DiscoveryCache>) -> Self {
        Self { connector, cache }
    }

    /// Open the session; on failure the endpoint's cache entries are invalidated.
    pub fn start(
        &self,
        endpoint: DeviceEndpoint,
        listener: MessageListener,
    ) -> Result<Session, SessionError> {
        tracing::info!(
            device = %endpoint.label(),
            address = %endpoint.address,
            port = endpoint.port,
            origin = %endpoint.origin,
            "connecting to device"
        );
        match self.connector.connect(&endpoint, listener) {
            Ok(handle) => Ok(Session {
                endpoint,
                link: handle.link,
                ownership: handle.ownership,
                stopped: AtomicBool::new(false),
            }),
            Err(err) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.invalidate(&endpoint) {
                        tracing::warn!(device = %endpoint.label(), error = %e, "unable to invalidate cache");
                    }
                }
                Err(err)
            }
        }
    }

    pub fn refresh(&self, session: &Session) -> Result<(), SessionError> {
        session.refresh()
    }

    /// Refresh every `interval` until `shutdown` fires or disconnects.
    pub fn run_until(&self, session: &Session, shutdown: &Receiver<()>, interval: Duration) {
        let ticker = tick(interval);
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {
                    tracing::debug!(device = %session.endpoint.label(), "periodic refresh");
                    if let Err(e) = self.refresh(session) {
                        tracing::error!(device = %session.endpoint.label(), error = %e, "refresh failed");
                    }
                }
            }
        }
    }

    pub fn shutdown(&self, session: &Session) {
        match session.ownership {
            Ownership::Owned => {
                tracing::info!(device = %session.endpoint.label(), "stopping device application");
                session.stop();
            }
            Ownership::Attached => session.detach(),
        }
    }
}
