//! RPC server side.
//!
//! A [`Server`] answers the handshake, registers its services, then reads
//! frames until the client goes away or a termination signal arrives. Each
//! call runs in its own tracked task; the server does not return while any
//! handler is still running.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::auth::{authorize, declared_deps};
use super::file_transfer::{FileTransferService, OutDirRegistry};
use super::logging::{LogHub, LoggingService, RemoteLogger};
use super::metadata::{self, Metadata};
use super::service::{
    CallStream, Inbound, ServerCall, Service, ServiceId, UserService, UserServiceAdapter,
};
use super::{Code, FRAME_QUEUE_DEPTH, RpcError, Status, spawn_writer};
use crate::framing::{receive_message, send_message};
use crate::protocol::{Frame, HandshakeRequest, HandshakeResponse, ListServicesResponse};
use crate::timing::TimingLog;
use crate::vconn::PipeListener;

/// Decides whether a handshake is acceptable; `Err` carries the reason sent
/// back to the client.
pub type HandshakeCheck = Box<dyn Fn(&HandshakeRequest) -> Result<(), String> + Send + Sync>;

/// Per-call state handed to handlers.
#[derive(Debug, Clone)]
pub struct CallScope {
    /// Variables from the handshake's init params.
    pub vars: Arc<BTreeMap<String, String>>,
    /// Fresh output directory; user-service calls only.
    pub out_dir: Option<PathBuf>,
    /// Timing log returned in the `tether-timing` trailer; user-service calls only.
    pub timing: Option<TimingLog>,
    pub logger: RemoteLogger,
    /// `None` when the caller did not send a software dependency list.
    pub software_deps: Option<Vec<String>>,
    pub labels: Vec<String>,
}

impl CallScope {
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn log(&self, msg: impl Into<String>) -> u64 {
        self.logger.log(msg)
    }
}

struct ActiveCall {
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
}

type CallTable = Arc<Mutex<HashMap<u64, ActiveCall>>>;

fn lock_calls(calls: &CallTable) -> std::sync::MutexGuard<'_, HashMap<u64, ActiveCall>> {
    calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Server {
    services: Vec<Arc<dyn Service>>,
    user_services: Vec<Arc<dyn UserService>>,
    check: Option<HandshakeCheck>,
    out_dir_base: PathBuf,
    hub: Arc<LogHub>,
    registry: Arc<OutDirRegistry>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            user_services: Vec::new(),
            check: None,
            out_dir_base: std::env::temp_dir(),
            hub: LogHub::new(),
            registry: OutDirRegistry::new(),
        }
    }
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service that is always exposed and never authorized
    /// (the bundle protocol).
    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Register a user service, exposed only to clients that ask for user
    /// services in the handshake.
    pub fn with_user_service(mut self, service: Arc<dyn UserService>) -> Self {
        self.user_services.push(service);
        self
    }

    pub fn with_handshake_check(mut self, check: HandshakeCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Directory under which per-call output directories are created.
    pub fn with_out_dir_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.out_dir_base = base.into();
        self
    }

    /// Logger whose entries reach the client through the log relay.
    pub fn logger(&self) -> RemoteLogger {
        RemoteLogger::new(self.hub.clone())
    }

    /// Directories registered here may be pulled with
    /// `FileTransfer.PullDirectory`.
    pub fn out_dir_registry(&self) -> Arc<OutDirRegistry> {
        self.registry.clone()
    }

    /// Accept the listener's single connection and serve it.
    pub async fn serve_listener<S>(self, listener: &PipeListener, shutdown: S) -> Result<(), RpcError>
    where
        S: Future<Output = String> + Send,
    {
        let conn = listener.accept()?;
        let result = self.serve(conn, shutdown).await;
        listener.close();
        result
    }

    /// Serve one connection.
    ///
    /// Returns `Ok` when the client closes the stream. If `shutdown`
    /// resolves first, in-flight calls are cancelled and awaited and the
    /// signal name is returned as [`RpcError::Terminated`].
    pub async fn serve<C, S>(self, conn: C, shutdown: S) -> Result<(), RpcError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: Future<Output = String> + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(conn);

        let request: HandshakeRequest = receive_message(&mut reader).await?;
        if let Some(check) = &self.check {
            if let Err(reason) = check(&request) {
                warn!("Rejecting handshake: {}", reason);
                send_message(&mut writer, &HandshakeResponse::failed(reason.clone())).await?;
                return Err(RpcError::Handshake(reason));
            }
        }
        send_message(&mut writer, &HandshakeResponse::ok()).await?;

        let dispatcher = Arc::new(self.into_dispatcher(request));
        info!(services = ?dispatcher.service_names(), "Serving RPC connection");

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let writer_task = spawn_writer(writer, frame_rx, CancellationToken::new(), |id, e| {
            Frame::Response {
                id,
                status: Status::internal(format!("response could not be sent: {e}")),
                trailers: Metadata::new(),
            }
        });
        let calls: CallTable = Arc::new(Mutex::new(HashMap::new()));
        let tracker = TaskTracker::new();

        let mut signal = None;
        let mut read_error = None;
        tokio::pin!(shutdown);
        loop {
            let frame = tokio::select! {
                biased;
                sig = &mut shutdown => {
                    info!("Received {}, shutting down", sig);
                    signal = Some(sig);
                    break;
                }
                frame = receive_message::<_, Frame>(&mut reader) => frame,
            };
            match frame {
                Ok(Frame::Request {
                    id,
                    service,
                    method,
                    metadata,
                }) => {
                    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                    let cancel = CancellationToken::new();
                    lock_calls(&calls).insert(
                        id,
                        ActiveCall {
                            inbound: inbound_tx,
                            cancel: cancel.clone(),
                        },
                    );
                    let dispatcher = dispatcher.clone();
                    let calls = calls.clone();
                    let frame_tx = frame_tx.clone();
                    tracker.spawn(async move {
                        let stream = CallStream::new(id, inbound_rx, frame_tx.clone());
                        let (status, trailers) = dispatcher
                            .run_call(&service, method, metadata, stream, cancel)
                            .await;
                        lock_calls(&calls).remove(&id);
                        let _ = frame_tx
                            .send(Frame::Response {
                                id,
                                status,
                                trailers,
                            })
                            .await;
                    });
                }
                Ok(Frame::Message { id, payload }) => {
                    if let Some(call) = lock_calls(&calls).get(&id) {
                        let _ = call.inbound.send(Inbound::Message(payload));
                    }
                }
                Ok(Frame::HalfClose { id }) => {
                    if let Some(call) = lock_calls(&calls).get(&id) {
                        let _ = call.inbound.send(Inbound::HalfClose);
                    }
                }
                Ok(Frame::Cancel { id }) => {
                    if let Some(call) = lock_calls(&calls).get(&id) {
                        debug!(id, "Client cancelled call");
                        call.cancel.cancel();
                    }
                }
                Ok(Frame::Response { id, .. }) => {
                    warn!(id, "Ignoring response frame sent by client");
                }
                Err(e) if e.is_eof() => {
                    debug!("Client closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read frame: {}", e);
                    read_error = Some(e);
                    break;
                }
            }
        }

        // Nobody is left to receive responses; stop handlers and wait for
        // their cleanup.
        for call in lock_calls(&calls).values() {
            call.cancel.cancel();
        }
        tracker.close();
        tracker.wait().await;
        drop(frame_tx);
        match writer_task.await {
            Ok(Err(e)) => debug!("Writer finished with error: {}", e),
            Err(e) => warn!("Writer task failed: {}", e),
            Ok(Ok(())) => {}
        }

        if let Some(sig) = signal {
            return Err(RpcError::Terminated(sig));
        }
        if let Some(e) = read_error {
            return Err(e.into());
        }
        Ok(())
    }

    fn into_dispatcher(self, request: HandshakeRequest) -> Dispatcher {
        let registry = self.registry;
        let mut services: HashMap<ServiceId, Arc<dyn Service>> = HashMap::new();
        services.insert(
            ServiceId::Logging,
            Arc::new(LoggingService::new(self.hub.clone())),
        );
        services.insert(
            ServiceId::FileTransfer,
            Arc::new(FileTransferService::new(registry.clone())),
        );
        for service in self.services {
            services.insert(service.id(), service);
        }
        if request.need_user_services {
            for service in self.user_services {
                let adapter = UserServiceAdapter(service);
                services.insert(adapter.id(), Arc::new(adapter));
            }
        }
        let mut names: Vec<String> = services
            .keys()
            .map(|id| id.full_name().to_string())
            .collect();
        names.push(ServiceId::Reflection.full_name().to_string());
        names.sort();
        services.insert(ServiceId::Reflection, Arc::new(ReflectionService { names }));

        Dispatcher {
            services,
            registry,
            hub: self.hub,
            vars: Arc::new(request.init_params.map(|p| p.vars).unwrap_or_default()),
            out_dir_base: self.out_dir_base,
        }
    }
}

struct Dispatcher {
    services: HashMap<ServiceId, Arc<dyn Service>>,
    registry: Arc<OutDirRegistry>,
    hub: Arc<LogHub>,
    vars: Arc<BTreeMap<String, String>>,
    out_dir_base: PathBuf,
}

impl Dispatcher {
    fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(ServiceId::full_name).collect();
        names.sort_unstable();
        names
    }

    fn create_out_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let dir = tempfile::Builder::new()
            .prefix("tether-outdir-")
            .tempdir_in(&self.out_dir_base)?;
        // Tests may drop privileges; anyone must be able to write here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o1777))?;
        }
        Ok(dir)
    }

    async fn run_call(
        &self,
        service_name: &str,
        method: String,
        metadata: Metadata,
        stream: CallStream,
        cancel: CancellationToken,
    ) -> (Status, Metadata) {
        let id = ServiceId::parse(service_name);
        let mut trailers = Metadata::new();
        let Some(service) = self.services.get(&id).cloned() else {
            return (
                Status::unimplemented(format!("unknown service {service_name}")),
                trailers,
            );
        };

        let is_user = id.is_user();
        if is_user {
            if let Err(status) = authorize(&id, declared_deps(&metadata).as_ref()) {
                warn!("Rejected call to {}.{}: {}", id, method, status.message);
                return (status, trailers);
            }
        }

        let out_dir = if is_user {
            match self.create_out_dir() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    return (
                        Status::internal(format!("failed to create output directory: {e}")),
                        trailers,
                    );
                }
            }
        } else {
            None
        };
        let timing = is_user.then(TimingLog::new);

        let scope = CallScope {
            vars: self.vars.clone(),
            out_dir: out_dir.as_ref().map(|d| d.path().to_path_buf()),
            timing: timing.clone(),
            logger: RemoteLogger::new(self.hub.clone()),
            software_deps: metadata
                .contains_key(metadata::HAS_SOFTWARE_DEPS)
                .then(|| metadata.get(metadata::SOFTWARE_DEPS).unwrap_or_default().to_vec()),
            labels: metadata.get(metadata::LABELS).unwrap_or_default().to_vec(),
        };
        debug!(service = %id, method = %method, "Handling call");
        let call = ServerCall {
            method,
            metadata,
            stream,
            scope,
            cancel: cancel.clone(),
        };

        let status = tokio::select! {
            result = service.handle(call) => result.err().unwrap_or_else(Status::ok),
            _ = cancel.cancelled() => Status::cancelled("call cancelled"),
        };

        if let Some(timing) = timing {
            match timing.to_json() {
                Ok(json) => trailers.insert_one(metadata::TIMING, json),
                Err(e) => warn!("Failed to encode timing log: {}", e),
            }
        }
        if let Some(dir) = out_dir {
            if status.code != Code::Cancelled && has_entries(dir.path()).await {
                let path = dir.keep();
                trailers.insert_one(metadata::OUTDIR, path.to_string_lossy());
                self.registry.register(path);
            }
        }
        if id != ServiceId::Logging {
            trailers.insert_one(metadata::LAST_LOG_SEQ, self.hub.last_seq().to_string());
        }
        (status, trailers)
    }
}

async fn has_entries(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// `Reflection.ListServices`.
struct ReflectionService {
    names: Vec<String>,
}

#[async_trait]
impl Service for ReflectionService {
    fn id(&self) -> ServiceId {
        ServiceId::Reflection
    }

    async fn handle(&self, call: ServerCall) -> Result<(), Status> {
        if call.method != "ListServices" {
            return Err(Status::unimplemented(format!(
                "unknown method Reflection.{}",
                call.method
            )));
        }
        call.stream
            .send(&ListServicesResponse {
                services: self.names.clone(),
            })
            .await
    }
}
