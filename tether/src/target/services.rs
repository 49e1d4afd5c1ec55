//! Helper services that live as long as one target connection.
//!
//! At most one is active: a reverse forward to a TLW server, or an
//! ephemeral static-file devserver on this host reverse-forwarded to the
//! device.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use tether_common::rpc::file_transfer::safe_join;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TargetConn, TargetError};
use crate::config::{AncillaryKind, ServiceSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    pub kind: AncillaryKind,
    /// Port the device uses to reach the service.
    pub device_port: u16,
}

impl From<&ServiceSettings> for ServiceOptions {
    fn from(settings: &ServiceSettings) -> Self {
        Self {
            kind: settings.ancillary(),
            device_port: settings.device_port,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            kind: AncillaryKind::None,
            device_port: 28080,
        }
    }
}

/// Services started for one connection.
#[derive(Debug, Default)]
pub struct AncillaryServices {
    forward: Option<(u16, SocketAddr)>,
    devserver: Option<EphemeralDevserver>,
}

impl AncillaryServices {
    pub async fn start(options: &ServiceOptions, conn: &dyn TargetConn) -> Result<Self, TargetError> {
        let (local, devserver) = match &options.kind {
            AncillaryKind::None => return Ok(Self::default()),
            AncillaryKind::Tlw(addr) => {
                let local = tokio::net::lookup_host(addr.as_str())
                    .await?
                    .next()
                    .ok_or_else(|| TargetError::Service(format!("TLW address {addr} did not resolve")))?;
                (local, None)
            }
            AncillaryKind::EphemeralDevserver(dirs) => {
                let server = EphemeralDevserver::start(dirs.clone()).await?;
                (server.addr(), Some(server))
            }
        };

        if let Err(e) = conn.forward_remote(options.device_port, local).await {
            if let Some(server) = devserver {
                server.stop().await;
            }
            return Err(e);
        }
        info!(
            "Device port {} now reaches {} on this host",
            options.device_port, local
        );
        Ok(Self {
            forward: Some((options.device_port, local)),
            devserver,
        })
    }

    /// Address the device should use, if any service is active.
    pub fn device_url(&self) -> Option<String> {
        self.forward
            .map(|(port, _)| format!("http://127.0.0.1:{port}"))
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_none() && self.devserver.is_none()
    }

    /// Release everything. Failures are logged; the connection may already
    /// be gone.
    pub async fn stop(self, conn: Option<&dyn TargetConn>) {
        if let (Some((port, local)), Some(conn)) = (self.forward, conn) {
            if let Err(e) = conn.cancel_forward(port, local).await {
                debug!("Failed to cancel forward of port {}: {}", port, e);
            }
        }
        if let Some(server) = self.devserver {
            server.stop().await;
        }
    }
}

/// Static file server over the devserver cache directories.
#[derive(Debug)]
pub struct EphemeralDevserver {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl EphemeralDevserver {
    pub async fn start(cache_dirs: Vec<PathBuf>) -> Result<Self, TargetError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let app = Router::new()
            .route("/static/{*path}", get(serve_static))
            .with_state(Arc::new(cache_dirs));
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                warn!("Ephemeral devserver failed: {}", e);
            }
        });
        info!("Ephemeral devserver listening on {}", addr);
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("Ephemeral devserver task failed: {}", e);
        }
    }
}

async fn serve_static(
    State(dirs): State<Arc<Vec<PathBuf>>>,
    UrlPath(path): UrlPath<String>,
) -> Result<Vec<u8>, StatusCode> {
    for dir in dirs.iter() {
        let file = safe_join(dir, &path).map_err(|_| StatusCode::BAD_REQUEST)?;
        match tokio::fs::read(&file).await {
            Ok(data) => return Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Failed to read {}: {}", file.display(), e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }
    Err(StatusCode::NOT_FOUND)
}
