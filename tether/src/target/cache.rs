//! The one live connection to the device.
//!
//! [`ConnCache::ensure_conn`] returns the current connection if it still
//! answers a ping, and otherwise replaces it. Replacement is serialized:
//! concurrent callers wait for the first one and then reuse its result.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tether_common::RunContext;
use tracing::{debug, info, warn};

use super::services::{AncillaryServices, ServiceOptions};
use super::{Connector, SSH_PING_TIMEOUT, TargetConn, TargetError};

pub struct ConnCache {
    connector: Arc<dyn Connector>,
    services: ServiceOptions,
    ping_timeout: Duration,
    current: Mutex<Option<Arc<dyn TargetConn>>>,
    /// Held while a connection is being replaced; owns the services bound
    /// to the current connection.
    replace: tokio::sync::Mutex<Option<AncillaryServices>>,
    initial_boot_id: OnceLock<String>,
}

impl std::fmt::Debug for ConnCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnCache")
            .field("connected", &self.conn().is_some())
            .field("initial_boot_id", &self.initial_boot_id.get())
            .finish_non_exhaustive()
    }
}

impl ConnCache {
    pub fn new(connector: Arc<dyn Connector>, services: ServiceOptions) -> Self {
        Self {
            connector,
            services,
            ping_timeout: SSH_PING_TIMEOUT,
            current: Mutex::new(None),
            replace: tokio::sync::Mutex::new(None),
            initial_boot_id: OnceLock::new(),
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Current connection, without checking that it is alive.
    pub fn conn(&self) -> Option<Arc<dyn TargetConn>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Boot id recorded by the first successful connection.
    pub fn initial_boot_id(&self) -> Option<&str> {
        self.initial_boot_id.get().map(String::as_str)
    }

    fn set_current(&self, conn: Option<Arc<dyn TargetConn>>) -> Option<Arc<dyn TargetConn>> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, conn)
    }

    async fn is_alive(&self, ctx: &RunContext, conn: &Arc<dyn TargetConn>) -> Result<bool, TargetError> {
        match ctx.run(conn.ping(self.ping_timeout)).await? {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Connection to {} is unhealthy: {}", conn.target(), e);
                Ok(false)
            }
        }
    }

    /// Return a live connection, reconnecting if needed.
    pub async fn ensure_conn(&self, ctx: &RunContext) -> Result<Arc<dyn TargetConn>, TargetError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        if let Some(conn) = self.conn()
            && self.is_alive(ctx, &conn).await?
        {
            return Ok(conn);
        }

        let mut services = ctx.run(self.replace.lock()).await?;
        // Another caller may have reconnected while we waited.
        if let Some(conn) = self.conn()
            && self.is_alive(ctx, &conn).await?
        {
            return Ok(conn);
        }

        self.teardown(&mut services).await;

        let conn = self.connector.connect(ctx).await?;
        if self.initial_boot_id.get().is_none() {
            let boot_id = match ctx.run(conn.boot_id()).await {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    close_quietly(conn.as_ref()).await;
                    return Err(TargetError::BootId(e.to_string()));
                }
                Err(e) => {
                    close_quietly(conn.as_ref()).await;
                    return Err(e.into());
                }
            };
            info!("Initial boot id of {} is {}", conn.target(), boot_id);
            let _ = self.initial_boot_id.set(boot_id);
        }

        match AncillaryServices::start(&self.services, conn.as_ref()).await {
            Ok(started) => *services = Some(started),
            Err(e) => {
                close_quietly(conn.as_ref()).await;
                return Err(e);
            }
        }
        self.set_current(Some(conn.clone()));
        Ok(conn)
    }

    async fn teardown(&self, services: &mut Option<AncillaryServices>) {
        let old = self.set_current(None);
        if let Some(started) = services.take() {
            started.stop(old.as_deref()).await;
        }
        if let Some(old) = old {
            debug!("Closing stale connection to {}", old.target());
            close_quietly(old.as_ref()).await;
        }
    }

    /// Close the connection and its services. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut services = self.replace.lock().await;
        self.teardown(&mut services).await;
    }
}

async fn close_quietly(conn: &dyn TargetConn) {
    if let Err(e) = conn.close().await {
        debug!("Closing connection to {} failed: {}", conn.target(), e);
    }
}
