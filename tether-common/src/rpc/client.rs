//! RPC client side.
//!
//! [`RpcClient::dial`] performs the handshake over an already-open
//! connection, subscribes to the server's log relay, and then multiplexes
//! calls over the stream. Trailers of every call are processed in a fixed
//! order: timing import, output directory pull, log sequence wait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::file_transfer::extract_entry;
use super::metadata::{self, Metadata};
use super::service::{ServiceId, ServiceName};
use super::{FRAME_QUEUE_DEPTH, RpcError, Status, spawn_writer};
use crate::context::RunContext;
use crate::framing::{FramingError, receive_message, send_message};
use crate::process::{ChildProcess, LocalProcess};
use crate::protocol::{
    ArchiveEntry, Frame, HandshakeRequest, HandshakeResponse, PullDirectoryRequest,
    ReadLogsResponse,
};
use crate::timing::{Stage, TimingLog};
use crate::vconn::PipeConn;

/// How long `close` waits for queued remote logs before giving up on them.
pub const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives log lines relayed from the server.
pub trait LogSink: Send + Sync {
    fn log(&self, msg: &str);
}

/// Forwards remote logs into this process's tracing output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, msg: &str) {
        info!(target: "tether::remote", "{}", msg);
    }
}

/// Per-call settings on the client side.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub run: RunContext,
    /// Sent as `tether-servicedeps`; `None` sends no list at all.
    pub service_deps: Option<Vec<ServiceName>>,
    pub software_deps: Option<Vec<String>>,
    pub labels: Vec<String>,
    /// Where a returned output directory is pulled to. Without one, the
    /// server is told to discard it.
    pub out_dir: Option<PathBuf>,
    /// Receives the server's timing log.
    pub timing: Option<TimingLog>,
}

impl CallContext {
    pub fn new(run: RunContext) -> Self {
        Self {
            run,
            ..Self::default()
        }
    }

    pub fn with_service_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceName>,
    {
        self.service_deps = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_software_deps(mut self, deps: Vec<String>) -> Self {
        self.software_deps = Some(deps);
        self
    }

    pub fn with_out_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(dir.into());
        self
    }

    pub fn with_timing(mut self, timing: TimingLog) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn outgoing_metadata(&self) -> Metadata {
        let mut md = Metadata::new();
        if let Some(deps) = &self.service_deps {
            md.insert(
                metadata::SERVICE_DEPS,
                deps.iter().map(|d| d.as_str().to_string()).collect(),
            );
        }
        if let Some(deps) = &self.software_deps {
            md.insert(metadata::SOFTWARE_DEPS, deps.clone());
            md.insert_one(metadata::HAS_SOFTWARE_DEPS, "1");
        }
        if !self.labels.is_empty() {
            md.insert(metadata::LABELS, self.labels.clone());
        }
        md
    }
}

// ============================================================================
// Call plumbing
// ============================================================================

#[derive(Debug)]
enum ClientInbound {
    Message(Value),
    End { status: Status, trailers: Metadata },
}

struct Shared {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, mpsc::UnboundedSender<ClientInbound>>>,
    closed: AtomicBool,
    frames: mpsc::Sender<Frame>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<ClientInbound>>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark the connection dead and finish every pending call.
    fn fail_all(&self) {
        let pending: Vec<_> = {
            let mut calls = self.lock();
            self.closed.store(true, Ordering::Release);
            calls.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(ClientInbound::End {
                status: Status::connection_closed(),
                trailers: Metadata::new(),
            });
        }
    }
}

/// Client side of one call.
pub struct ClientCall {
    id: u64,
    rx: mpsc::UnboundedReceiver<ClientInbound>,
    shared: Arc<Shared>,
    trailers: Option<Metadata>,
    status: Option<Status>,
}

impl std::fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("id", &self.id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl ClientCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), Status> {
        let payload = serde_json::to_value(message)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))?;
        self.shared
            .frames
            .send(Frame::Message {
                id: self.id,
                payload,
            })
            .await
            .map_err(|_| Status::connection_closed())
    }

    /// Tell the server no more messages follow.
    pub async fn close_send(&self) -> Result<(), Status> {
        self.shared
            .frames
            .send(Frame::HalfClose { id: self.id })
            .await
            .map_err(|_| Status::connection_closed())
    }

    /// Next server message; `Ok(None)` once the call finished successfully.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Status> {
        if let Some(status) = &self.status {
            return if status.is_ok() {
                Ok(None)
            } else {
                Err(status.clone())
            };
        }
        match self.rx.recv().await {
            Some(ClientInbound::Message(value)) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Status::internal(format!("malformed response: {e}"))),
            Some(ClientInbound::End { status, trailers }) => {
                self.trailers = Some(trailers);
                self.status = Some(status.clone());
                if status.is_ok() { Ok(None) } else { Err(status) }
            }
            None => {
                let status = Status::connection_closed();
                self.status = Some(status.clone());
                Err(status)
            }
        }
    }

    /// Trailers, available once the call has finished.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.trailers.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.shared.lock().remove(&self.id);
            let _ = self.shared.frames.try_send(Frame::Cancel { id: self.id });
        }
    }
}

// ============================================================================
// Client
// ============================================================================

struct LogRelay {
    call_id: u64,
    task: JoinHandle<()>,
    last_seq: watch::Receiver<u64>,
}

/// Options for [`RpcClient::dial`].
pub struct DialOptions {
    pub sink: Arc<dyn LogSink>,
    /// Process on the other end of the connection, terminated on close.
    pub process: Option<Box<dyn ChildProcess>>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            sink: Arc::new(TracingLogSink),
            process: None,
        }
    }
}

pub struct RpcClient {
    shared: Arc<Shared>,
    stop_writer: CancellationToken,
    writer_task: Option<JoinHandle<Result<(), FramingError>>>,
    reader_task: Option<JoinHandle<()>>,
    relay: Option<LogRelay>,
    process: Mutex<Option<Box<dyn ChildProcess>>>,
    peer: String,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Handshake over `conn` and start serving calls.
    ///
    /// If the server rejects the handshake, or `ctx` expires first, the
    /// peer process (if any) is terminated before the error is returned.
    pub async fn dial(
        conn: PipeConn,
        request: &HandshakeRequest,
        options: DialOptions,
        ctx: &RunContext,
    ) -> Result<Self, RpcError> {
        let peer = conn.peer().to_string();
        let DialOptions { sink, mut process } = options;
        let (mut reader, mut writer) = tokio::io::split(conn);

        let handshake = ctx
            .run(async {
                send_message(&mut writer, request).await?;
                receive_message::<_, HandshakeResponse>(&mut reader).await
            })
            .await;
        let failure = match handshake {
            Ok(Ok(response)) => response.error.map(|e| RpcError::Handshake(e.reason)),
            Ok(Err(e)) => Some(e.into()),
            Err(e) => Some(e.into()),
        };
        if let Some(err) = failure {
            warn!("Handshake with {} failed: {}", peer, err);
            if let Some(mut process) = process.take() {
                if let Err(e) = process.terminate().await {
                    warn!("Failed to terminate {}: {}", peer, e);
                }
            }
            return Err(err);
        }

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let stop_writer = CancellationToken::new();
        let writer_task = spawn_writer(writer, frame_rx, stop_writer.clone(), |id, _| {
            Frame::Cancel { id }
        });
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            frames: frame_tx,
        });
        let reader_task = tokio::spawn(read_loop(reader, shared.clone()));

        let mut client = Self {
            shared,
            stop_writer,
            writer_task: Some(writer_task),
            reader_task: Some(reader_task),
            relay: None,
            process: Mutex::new(process),
            peer,
        };
        match client.start_log_relay(sink, ctx).await {
            Ok(relay) => client.relay = Some(relay),
            Err(e) => {
                if let Err(close_err) = client.shutdown().await {
                    debug!("Cleanup after failed dial: {}", close_err);
                }
                return Err(e);
            }
        }
        debug!("Connected to {}", client.peer);
        Ok(client)
    }

    /// Spawn `command` and dial it over its stdin/stdout.
    ///
    /// With `kill_session`, the child leads a new process group and the
    /// whole group is killed when the client closes.
    pub async fn dial_exec(
        mut command: tokio::process::Command,
        request: &HandshakeRequest,
        kill_session: bool,
        sink: Arc<dyn LogSink>,
        ctx: &RunContext,
    ) -> Result<Self, RpcError> {
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        if kill_session {
            command.process_group(0);
        }
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        let mut child = command.spawn().map_err(|source| RpcError::Spawn {
            program: program.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RpcError::Spawn {
                program,
                source: std::io::Error::other("child has no stdio pipes"),
            });
        };
        let conn = PipeConn::new(stdout, stdin).with_peer(program);
        let process: Box<dyn ChildProcess> = Box::new(LocalProcess::new(child, kill_session));
        Self::dial(
            conn,
            request,
            DialOptions {
                sink,
                process: Some(process),
            },
            ctx,
        )
        .await
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    async fn start_call(
        &self,
        service: &ServiceId,
        method: &str,
        metadata: Metadata,
    ) -> Result<ClientCall, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut calls = self.shared.lock();
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(Status::connection_closed().into());
            }
            calls.insert(id, tx);
        }
        let call = ClientCall {
            id,
            rx,
            shared: self.shared.clone(),
            trailers: None,
            status: None,
        };
        self.shared
            .frames
            .send(Frame::Request {
                id,
                service: service.full_name().to_string(),
                method: method.to_string(),
                metadata,
            })
            .await
            .map_err(|_| Status::connection_closed())?;
        Ok(call)
    }

    /// Open a streaming call. The caller drives the stream and should pass
    /// its trailers to [`RpcClient::process_trailers`] once it finishes.
    pub async fn open_stream(
        &self,
        ctx: &CallContext,
        service: &ServiceId,
        method: &str,
    ) -> Result<ClientCall, RpcError> {
        self.start_call(service, method, ctx.outgoing_metadata()).await
    }

    /// Unary call with full trailer processing.
    pub async fn call<Req, Resp>(
        &self,
        ctx: &CallContext,
        service: &ServiceId,
        method: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let mut call = self.open_stream(ctx, service, method).await?;
        let result: Result<Resp, RpcError> = async {
            call.send(request).await?;
            call.close_send().await?;
            let response = ctx
                .run
                .run(call.recv::<Resp>())
                .await??
                .ok_or_else(|| Status::internal("call finished without a response"))?;
            while ctx.run.run(call.recv::<Value>()).await??.is_some() {}
            Ok(response)
        }
        .await;

        let trailer_result = match call.trailers().cloned() {
            Some(trailers) => self.process_trailers(ctx, &trailers).await,
            None => Ok(()),
        };
        let response = result?;
        trailer_result?;
        Ok(response)
    }

    /// Handle a finished call's trailers. Every step runs even if an earlier
    /// one failed; the first error is returned.
    pub async fn process_trailers(
        &self,
        ctx: &CallContext,
        trailers: &Metadata,
    ) -> Result<(), RpcError> {
        let mut first_err: Option<RpcError> = None;

        if let Some(json) = trailers.first(metadata::TIMING) {
            if let Err(e) = import_timing(ctx.timing.as_ref(), json) {
                first_err.get_or_insert(e);
            }
        }

        if let Some(dir) = trailers.first(metadata::OUTDIR) {
            let result = match &ctx.out_dir {
                Some(dst) => self.pull_directory(&ctx.run, dir, dst).await,
                None => self.discard_directory(&ctx.run, dir).await,
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }

        if let Some(seq) = trailers.first(metadata::LAST_LOG_SEQ) {
            let result = match seq.parse::<u64>() {
                Ok(seq) => self.wait_log_seq(&ctx.run, seq).await,
                Err(e) => Err(RpcError::Trailer {
                    key: metadata::LAST_LOG_SEQ,
                    reason: e.to_string(),
                }),
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Copy the server directory `src` into `dst`; the server deletes it.
    pub async fn pull_directory(&self, run: &RunContext, src: &str, dst: &Path) -> Result<(), RpcError> {
        let mut call = self
            .start_call(&ServiceId::FileTransfer, "PullDirectory", Metadata::new())
            .await?;
        call.send(&PullDirectoryRequest {
            path: src.to_string(),
            discard: false,
        })
        .await?;
        call.close_send().await?;
        tokio::fs::create_dir_all(dst).await?;
        run.run(async {
            while let Some(entry) = call.recv::<ArchiveEntry>().await? {
                extract_entry(dst, &entry).await?;
            }
            Ok::<(), RpcError>(())
        })
        .await??;
        debug!("Pulled {} into {}", src, dst.display());
        Ok(())
    }

    /// Ask the server to delete `src` without sending it.
    pub async fn discard_directory(&self, run: &RunContext, src: &str) -> Result<(), RpcError> {
        let mut call = self
            .start_call(&ServiceId::FileTransfer, "PullDirectory", Metadata::new())
            .await?;
        call.send(&PullDirectoryRequest {
            path: src.to_string(),
            discard: true,
        })
        .await?;
        call.close_send().await?;
        run.run(async {
            while call.recv::<Value>().await?.is_some() {}
            Ok::<(), Status>(())
        })
        .await??;
        Ok(())
    }

    /// Wait until the log relay has delivered entry `seq`.
    pub async fn wait_log_seq(&self, run: &RunContext, seq: u64) -> Result<(), RpcError> {
        let Some(relay) = &self.relay else {
            return Ok(());
        };
        let mut rx = relay.last_seq.clone();
        let reached = run.run(rx.wait_for(|last| *last >= seq)).await?.is_ok();
        if reached {
            Ok(())
        } else {
            Err(RpcError::LogRelay(seq))
        }
    }

    async fn start_log_relay(
        &self,
        sink: Arc<dyn LogSink>,
        ctx: &RunContext,
    ) -> Result<LogRelay, RpcError> {
        let mut call = self
            .start_call(&ServiceId::Logging, "ReadLogs", Metadata::new())
            .await?;
        let first = ctx.run(call.recv::<ReadLogsResponse>()).await??;
        if first.is_none() {
            return Err(Status::internal("log stream ended before subscribing").into());
        }

        let call_id = call.id();
        let (seq_tx, seq_rx) = watch::channel(0u64);
        let task = tokio::spawn(async move {
            loop {
                match call.recv::<ReadLogsResponse>().await {
                    Ok(Some(ReadLogsResponse { entry: Some(entry) })) => {
                        sink.log(&entry.msg);
                        seq_tx.send_if_modified(|last| {
                            if entry.seq > *last {
                                *last = entry.seq;
                                true
                            } else {
                                false
                            }
                        });
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(status) => {
                        debug!("Log relay ended: {}", status);
                        break;
                    }
                }
            }
        });
        Ok(LogRelay {
            call_id,
            task,
            last_seq: seq_rx,
        })
    }

    /// Drain the log relay, fail pending calls, close the stream, then
    /// terminate the peer process.
    pub async fn close(mut self) -> Result<(), RpcError> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<(), RpcError> {
        if let Some(relay) = self.relay.take() {
            let _ = self
                .shared
                .frames
                .send(Frame::HalfClose { id: relay.call_id })
                .await;
            let mut task = relay.task;
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Log relay from {} did not drain in time", self.peer);
                task.abort();
            }
        }

        self.shared.fail_all();
        self.stop_writer.cancel();
        if let Some(writer) = self.writer_task.take() {
            match writer.await {
                Ok(Err(e)) => debug!("Writer to {} finished with error: {}", self.peer, e),
                Err(e) => debug!("Writer to {} failed: {}", self.peer, e),
                Ok(Ok(())) => {}
            }
        }

        let process = self
            .process
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let mut result = Ok(());
        if let Some(mut process) = process {
            if let Err(e) = process.terminate().await {
                result = Err(RpcError::Terminate(e));
            }
        }
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
        debug!("Closed connection to {}", self.peer);
        result
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop_writer.cancel();
        if let Some(relay) = self.relay.take() {
            relay.task.abort();
        }
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
    }
}

fn import_timing(timing: Option<&TimingLog>, json: &str) -> Result<(), RpcError> {
    let stages: Vec<Stage> = serde_json::from_str(json).map_err(|e| RpcError::Trailer {
        key: metadata::TIMING,
        reason: e.to_string(),
    })?;
    if let Some(timing) = timing {
        timing.import(stages);
    }
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Shared>) {
    loop {
        match receive_message::<_, Frame>(&mut reader).await {
            Ok(Frame::Message { id, payload }) => {
                if let Some(tx) = shared.lock().get(&id) {
                    let _ = tx.send(ClientInbound::Message(payload));
                }
            }
            Ok(Frame::Response {
                id,
                status,
                trailers,
            }) => {
                if let Some(tx) = shared.lock().remove(&id) {
                    let _ = tx.send(ClientInbound::End { status, trailers });
                }
            }
            Ok(other) => debug!(id = other.id(), "Ignoring unexpected frame from server"),
            Err(e) if e.is_eof() => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Failed to read frame: {}", e);
                break;
            }
        }
    }
    shared.fail_all();
}
