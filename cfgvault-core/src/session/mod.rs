/*!
Management sessions to network devices.

Sessions are blocking; adapters run them on the blocking thread pool. A
[`SessionGuard`] closes its session on every exit path.
*/

pub mod driver;
pub mod ssh;
pub mod telnet;

use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceDescriptor;
use crate::error::{CaptureError, ConnectFailure};
use crate::vendor::Transport;

pub use driver::{PromptDriver, PromptSession};
pub use ssh::SshConnector;
pub use telnet::TelnetConnector;

/// Where and how to log in
#[derive(Clone)]
pub struct ConnectTarget {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub device_type: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl ConnectTarget {
    pub fn for_device(
        device: &DeviceDescriptor,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            address: device.address.clone(),
            port: device.effective_port(),
            username: device.credentials.username.clone(),
            password: device.credentials.password.clone(),
            device_type: device
                .vendor
                .profile()
                .device_type_for(device.transport),
            connect_timeout,
            command_timeout,
        }
    }

    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Login name sent to the device.
    ///
    /// RouterOS reads terminal options from a `+` suffix: no colours, no
    /// terminal detection, dumb mode.
    pub fn login_name(&self) -> String {
        if self.device_type.starts_with("mikrotik") && !self.username.contains('+') {
            format!("{}+cte", self.username)
        } else {
            self.username.clone()
        }
    }

    fn socket_addrs(&self) -> Result<Vec<SocketAddr>, CaptureError> {
        let host = self.address.trim_start_matches('[').trim_end_matches(']');
        (host, self.port)
            .to_socket_addrs()
            .map(Iterator::collect)
            .map_err(|e| {
                CaptureError::connect(ConnectFailure::Unreachable, self.endpoint(), e.to_string())
            })
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("endpoint", &self.endpoint())
            .field("username", &self.username)
            .field("device_type", &self.device_type)
            .finish_non_exhaustive()
    }
}

/// Open a TCP connection within the target's connect timeout
pub(crate) fn connect_tcp(target: &ConnectTarget) -> Result<TcpStream, CaptureError> {
    let mut last_error = None;
    for addr in target.socket_addrs()? {
        match TcpStream::connect_timeout(&addr, target.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) if matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock) => {
            CaptureError::connect(
                ConnectFailure::Timeout,
                target.endpoint(),
                format!("no answer within {} seconds", target.connect_timeout.as_secs()),
            )
        }
        Some(e) => CaptureError::connect(ConnectFailure::Unreachable, target.endpoint(), e.to_string()),
        None => CaptureError::connect(
            ConnectFailure::Unreachable,
            target.endpoint(),
            "address did not resolve",
        ),
    })
}

/// An interactive CLI session
pub trait CliSession: Send {
    /// Enter privileged mode
    fn elevate(&mut self, secret: &str) -> Result<(), CaptureError>;

    /// Run one command and return its output
    fn run(&mut self, command: &str, timeout: Duration) -> Result<String, CaptureError>;

    /// Send a command that starts work on the device; returns whatever output
    /// arrived within `grace` without waiting for the work to finish.
    fn trigger(&mut self, command: &str, grace: Duration) -> Result<String, CaptureError>;

    /// Close the session. Calling it again is a no-op.
    fn close(&mut self);
}

/// Opens sessions for one transport
pub trait SessionConnector: Send + Sync {
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn CliSession>, CaptureError>;
}

/// Connector per transport
#[derive(Clone)]
pub struct Connectors {
    ssh: Arc<dyn SessionConnector>,
    telnet: Arc<dyn SessionConnector>,
}

impl Connectors {
    pub fn new(ssh: Arc<dyn SessionConnector>, telnet: Arc<dyn SessionConnector>) -> Self {
        Self { ssh, telnet }
    }

    /// Real SSH and Telnet connectors
    pub fn native() -> Self {
        Self::new(Arc::new(SshConnector::default()), Arc::new(TelnetConnector::default()))
    }

    pub fn for_transport(&self, transport: Transport) -> Arc<dyn SessionConnector> {
        match transport {
            Transport::Ssh => Arc::clone(&self.ssh),
            Transport::Telnet => Arc::clone(&self.telnet),
        }
    }
}

impl fmt::Debug for Connectors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connectors").finish_non_exhaustive()
    }
}

/// Owns a session and closes it when dropped
pub struct SessionGuard {
    session: Box<dyn CliSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn CliSession>) -> Self {
        Self { session }
    }

    /// Close now instead of at end of scope
    pub fn finish(self) {
        drop(self);
    }
}

impl Deref for SessionGuard {
    type Target = dyn CliSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}
