//! Server-to-client log relay.
//!
//! Handlers log through a [`RemoteLogger`]; entries get increasing sequence
//! numbers and queue in the [`LogHub`] until the client's `Logging.ReadLogs`
//! stream picks them up. Logging never blocks and never drops entries.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::Status;
use super::service::{ServerCall, Service, ServiceId};
use crate::protocol::{LogEntry, ReadLogsResponse};

#[derive(Debug, Default)]
struct HubState {
    last_seq: u64,
    queue: VecDeque<LogEntry>,
    subscribed: bool,
}

#[derive(Debug, Default)]
pub struct LogHub {
    state: Mutex<HubState>,
    notify: Notify,
}

impl LogHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a message and return its sequence number.
    pub fn log(&self, msg: impl Into<String>) -> u64 {
        let msg = msg.into();
        let seq = {
            let mut state = self.lock();
            state.last_seq += 1;
            let seq = state.last_seq;
            state.queue.push_back(LogEntry { seq, msg });
            seq
        };
        self.notify.notify_one();
        seq
    }

    /// Sequence number of the most recent entry, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.lock().last_seq
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    async fn next(&self) -> LogEntry {
        loop {
            if let Some(entry) = self.lock().queue.pop_front() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    fn drain(&self) -> Vec<LogEntry> {
        self.lock().queue.drain(..).collect()
    }

    fn subscribe(&self) -> Result<(), Status> {
        let mut state = self.lock();
        if state.subscribed {
            return Err(Status::new(
                super::Code::AlreadyExists,
                "log stream already subscribed",
            ));
        }
        state.subscribed = true;
        Ok(())
    }

    fn unsubscribe(&self) {
        self.lock().subscribed = false;
    }
}

/// Handle given to call handlers for emitting remote logs.
#[derive(Debug, Clone)]
pub struct RemoteLogger {
    hub: Arc<LogHub>,
}

impl RemoteLogger {
    pub fn new(hub: Arc<LogHub>) -> Self {
        Self { hub }
    }

    pub fn log(&self, msg: impl Into<String>) -> u64 {
        self.hub.log(msg)
    }
}

/// `Logging.ReadLogs`: one long-lived stream per connection.
pub(crate) struct LoggingService {
    hub: Arc<LogHub>,
}

impl LoggingService {
    pub(crate) fn new(hub: Arc<LogHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Service for LoggingService {
    fn id(&self) -> ServiceId {
        ServiceId::Logging
    }

    async fn handle(&self, mut call: ServerCall) -> Result<(), Status> {
        if call.method != "ReadLogs" {
            return Err(Status::unimplemented(format!(
                "unknown method Logging.{}",
                call.method
            )));
        }
        self.hub.subscribe()?;
        let result = async {
            call.stream.send(&ReadLogsResponse::default()).await?;
            loop {
                tokio::select! {
                    entry = self.hub.next() => {
                        call.stream.send(&ReadLogsResponse { entry: Some(entry) }).await?;
                    }
                    msg = call.stream.recv::<serde_json::Value>() => {
                        if msg?.is_none() {
                            break;
                        }
                    }
                }
            }
            let rest = self.hub.drain();
            debug!(count = rest.len(), "Flushing queued logs before closing relay");
            for entry in rest {
                call.stream.send(&ReadLogsResponse { entry: Some(entry) }).await?;
            }
            Ok(())
        }
        .await;
        self.hub.unsubscribe();
        result
    }
}
