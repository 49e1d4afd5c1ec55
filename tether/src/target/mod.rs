//! Connections to the device under test.
//!
//! A [`Connector`] knows how to reach a target; the [`ConnCache`] owns the
//! single live [`TargetConn`] produced by it and replaces it when it stops
//! answering pings.

pub mod cache;
pub mod services;
#[cfg(unix)]
pub mod ssh;

pub use cache::ConnCache;
pub use services::{AncillaryServices, ServiceOptions};
#[cfg(unix)]
pub use ssh::{SshConnector, SshOptions};

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_common::process::ChildProcess;
use tether_common::{ContextError, PipeConn, RunContext};
use thiserror::Error;

/// Upper bound for a single liveness probe.
pub const SSH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the kernel exposes the current boot session id.
pub const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid target '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    #[error("failed to connect to {target} after {attempts} attempt(s): {reason}")]
    Connect {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("ping timed out after {0:?}")]
    PingTimeout(Duration),

    #[error("remote command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("failed to read boot id: {0}")]
    BootId(String),

    #[error("port forward failed: {0}")]
    Forward(String),

    #[error("ancillary service failed: {0}")]
    Service(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `[user@]host[:port]`; IPv6 hosts are written in brackets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for TargetSpec {
    type Err = TargetError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TargetError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (user, rest) = match spec.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid("empty user")),
            None => (None, spec),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '['"))?;
            let port = match tail {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| invalid("expected ':' after ']'"))?,
                ),
            };
            (host, port)
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port
            .map(|p| p.parse::<u16>().map_err(|_| invalid("port is not a number in 0..=65535")))
            .transpose()?;

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// A live connection to the device.
#[async_trait]
pub trait TargetConn: Send + Sync + fmt::Debug {
    fn target(&self) -> &TargetSpec;

    /// Cheap liveness probe bounded by `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<(), TargetError>;

    /// Run `argv` on the device and return its stdout. A non-zero exit is
    /// an error.
    async fn run(&self, argv: &[&str]) -> Result<Vec<u8>, TargetError>;

    async fn boot_id(&self) -> Result<String, TargetError> {
        let out = self.run(&["cat", BOOT_ID_PATH]).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Start a bundle on the device with its stdin/stdout as the returned
    /// connection. The process handle kills the bundle (or its whole
    /// session with `kill_session`).
    async fn start_bundle(
        &self,
        argv: &[String],
        kill_session: bool,
    ) -> Result<(PipeConn, Box<dyn ChildProcess>), TargetError>;

    /// Make `127.0.0.1:remote_port` on the device reach `local`.
    async fn forward_remote(&self, remote_port: u16, local: SocketAddr) -> Result<(), TargetError>;

    async fn cancel_forward(&self, remote_port: u16, local: SocketAddr) -> Result<(), TargetError>;

    async fn close(&self) -> Result<(), TargetError>;
}

/// Produces fresh target connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, ctx: &RunContext) -> Result<Arc<dyn TargetConn>, TargetError>;
}
