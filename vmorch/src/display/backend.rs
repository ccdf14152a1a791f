//! Display Backend boundary.
//!
//! A backend's `connect` blocks the calling thread for as long as the
//! network takes. It must check the [`CancelFlag`] at its own safe points;
//! nothing on our side can interrupt it.

use std::fmt;
use std::io::Read;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum BackendKind {
    #[serde(rename = "RDP", alias = "rdp")]
    #[strum(serialize = "RDP")]
    Rdp,
    #[serde(rename = "VNC", alias = "vnc")]
    #[strum(serialize = "VNC")]
    Vnc,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayTarget {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl DisplayTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }
}

impl fmt::Debug for DisplayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Cooperative cancellation flag shared with one connect attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection cancelled")]
    Cancelled,

    #[error("{0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An established connection. Dropping it releases its resources.
pub trait DisplayConnection: Send {
    fn disconnect(self: Box<Self>) -> Result<(), BackendError>;
}

pub trait DisplayBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn connect(
        &self,
        target: &DisplayTarget,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn DisplayConnection>, BackendError>;
}

/// Reachability-level backend: establishes the TCP connection and, for VNC,
/// reads the RFB version banner. Actual protocol handling stays with the
/// viewer that takes over the session.
pub struct TcpDisplayBackend {
    kind: BackendKind,
    connect_timeout: Duration,
}

impl TcpDisplayBackend {
    pub fn new(kind: BackendKind, connect_timeout: Duration) -> Self {
        Self {
            kind,
            connect_timeout,
        }
    }
}

struct TcpConnection {
    stream: TcpStream,
}

impl DisplayConnection for TcpConnection {
    fn disconnect(self: Box<Self>) -> Result<(), BackendError> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl DisplayBackend for TcpDisplayBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connect(
        &self,
        target: &DisplayTarget,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn DisplayConnection>, BackendError> {
        let addrs: Vec<_> = (target.host.as_str(), target.port).to_socket_addrs()?.collect();
        let mut last_error = None;

        for addr in addrs {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            debug!("{} backend connecting to {}", self.kind, addr);
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    if cancel.is_cancelled() {
                        return Err(BackendError::Cancelled);
                    }
                    if self.kind == BackendKind::Vnc {
                        read_rfb_banner(&stream, self.connect_timeout)?;
                        if cancel.is_cancelled() {
                            return Err(BackendError::Cancelled);
                        }
                    }
                    return Ok(Box::new(TcpConnection { stream }));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => BackendError::Connect(format!(
                "failed to connect to {}:{}: {}",
                target.host, target.port, e
            )),
            None => BackendError::Connect(format!(
                "{}:{} did not resolve to any address",
                target.host, target.port
            )),
        })
    }
}

fn read_rfb_banner(stream: &TcpStream, timeout: Duration) -> Result<(), BackendError> {
    stream.set_read_timeout(Some(timeout))?;
    let mut banner = [0u8; 12];
    (&*stream).read_exact(&mut banner)?;
    if !banner.starts_with(b"RFB ") {
        return Err(BackendError::Connect(format!(
            "unexpected VNC banner {:?}",
            String::from_utf8_lossy(&banner)
        )));
    }
    debug!(
        "VNC server speaks {}",
        String::from_utf8_lossy(&banner).trim_end()
    );
    Ok(())
}
