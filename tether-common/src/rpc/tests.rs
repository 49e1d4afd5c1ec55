//! Client and server exercised together over in-memory pipes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::duplex;
use tokio::task::JoinHandle;

use super::*;
use crate::context::{ContextError, RunContext};
use crate::framing::{MAX_MESSAGE_SIZE, receive_message, send_message};
use crate::protocol::{
    BundleInitParams, Frame, HandshakeRequest, HandshakeResponse, ListServicesResponse,
    ReadLogsResponse,
};
use crate::timing::TimingLog;
use crate::vconn::PipeConn;

const ECHO: &str = "tether.example.Echo";

struct Echo;

#[async_trait]
impl UserService for Echo {
    fn name(&self) -> ServiceName {
        ServiceName::new(ECHO)
    }

    async fn call(&self, method: &str, request: Value, scope: &CallScope) -> Result<Value, Status> {
        match method {
            "Echo" => {
                scope.log(format!("echo {request}"));
                Ok(request)
            }
            "Var" => Ok(json!(scope.var(request.as_str().unwrap_or_default()))),
            "WriteFile" => {
                let dir = scope
                    .out_dir
                    .as_ref()
                    .ok_or_else(|| Status::internal("no output directory"))?;
                std::fs::write(dir.join("note.txt"), b"written")
                    .map_err(|e| Status::internal(e.to_string()))?;
                scope.log("wrote note.txt");
                Ok(json!(dir.display().to_string()))
            }
            "WriteBig" => {
                let dir = scope
                    .out_dir
                    .as_ref()
                    .ok_or_else(|| Status::internal("no output directory"))?;
                std::fs::write(dir.join("big.bin"), big_contents())
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(Value::Null)
            }
            "Oversized" => Ok(json!("x".repeat(MAX_MESSAGE_SIZE))),
            "WriteThenHang" => {
                let dir = scope
                    .out_dir
                    .as_ref()
                    .ok_or_else(|| Status::internal("no output directory"))?;
                std::fs::write(dir.join("partial.txt"), b"partial")
                    .map_err(|e| Status::internal(e.to_string()))?;
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            "OutDir" => Ok(json!(
                scope.out_dir.as_ref().map(|d| d.display().to_string())
            )),
            "Timed" => {
                let timing = scope
                    .timing
                    .as_ref()
                    .ok_or_else(|| Status::internal("no timing log"))?;
                timing.start("work").end();
                Ok(Value::Null)
            }
            "Burst" => {
                let tag = request["tag"].as_str().unwrap_or_default().to_string();
                for i in 0..request["count"].as_u64().unwrap_or_default() {
                    scope.log(format!("{tag} {i}"));
                    if i % 2 == 1 {
                        tokio::task::yield_now().await;
                    }
                }
                Ok(Value::Null)
            }
            "Hang" => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            other => Err(Status::unimplemented(other.to_string())),
        }
    }
}

/// One byte past the frame limit, with a pattern that catches misordered chunks.
fn big_contents() -> Vec<u8> {
    (0..MAX_MESSAGE_SIZE + 1).map(|i| (i % 251) as u8).collect()
}

#[derive(Default)]
struct CollectSink(Mutex<Vec<String>>);

impl LogSink for CollectSink {
    fn log(&self, msg: &str) {
        self.0.lock().unwrap().push(msg.to_string());
    }
}

impl CollectSink {
    fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

fn user_request() -> HandshakeRequest {
    HandshakeRequest {
        need_user_services: true,
        ..HandshakeRequest::default()
    }
}

fn pipes() -> (PipeConn, PipeConn) {
    let (client_read, server_write) = duplex(64 * 1024);
    let (server_read, client_write) = duplex(64 * 1024);
    (
        PipeConn::new(client_read, client_write),
        PipeConn::new(server_read, server_write),
    )
}

async fn connect(
    server: Server,
    request: HandshakeRequest,
) -> (RpcClient, JoinHandle<Result<(), RpcError>>, Arc<CollectSink>) {
    crate::testing::init_test_logging();
    let (client_conn, server_conn) = pipes();
    let server_task = tokio::spawn(server.serve(server_conn, std::future::pending::<String>()));
    let sink = Arc::new(CollectSink::default());
    let client = RpcClient::dial(
        client_conn,
        &request,
        DialOptions {
            sink: sink.clone(),
            process: None,
        },
        &RunContext::new(),
    )
    .await
    .unwrap();
    (client, server_task, sink)
}

fn echo_server() -> Server {
    Server::new().with_user_service(Arc::new(Echo))
}

fn echo_ctx() -> CallContext {
    CallContext::default().with_service_deps([ECHO])
}

fn echo_id() -> ServiceId {
    ServiceId::User(ServiceName::new(ECHO))
}

// ── Handshake ──

#[tokio::test]
async fn test_handshake_rejection_reported_to_client() {
    let server = Server::new().with_handshake_check(Box::new(|_| Err("no bundles match".into())));
    let (client_conn, server_conn) = pipes();
    let server_task = tokio::spawn(server.serve(server_conn, std::future::pending::<String>()));

    let err = RpcClient::dial(
        client_conn,
        &HandshakeRequest::default(),
        DialOptions::default(),
        &RunContext::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(&err, RpcError::Handshake(reason) if reason == "no bundles match"));
    assert!(matches!(
        server_task.await.unwrap(),
        Err(RpcError::Handshake(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_dial_exec_failure_terminates_process() {
    // `cat` echoes the handshake back, which parses as success, but never
    // answers the log subscription.
    let ctx = RunContext::new().with_timeout(Duration::from_millis(500));
    let err = RpcClient::dial_exec(
        tokio::process::Command::new("cat"),
        &HandshakeRequest::default(),
        true,
        Arc::new(TracingLogSink),
        &ctx,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Context(ContextError::DeadlineExceeded)
    ));
}

#[tokio::test]
async fn test_reflection_lists_registered_services() {
    let (client, _server, _sink) = connect(echo_server(), user_request()).await;
    let response: ListServicesResponse = client
        .call(
            &CallContext::default(),
            &ServiceId::Reflection,
            "ListServices",
            &Value::Null,
        )
        .await
        .unwrap();
    for name in [
        "tether.core.Reflection",
        "tether.core.Logging",
        "tether.core.FileTransfer",
        ECHO,
    ] {
        assert!(response.services.iter().any(|s| s == name), "{name}");
    }
    client.close().await.unwrap();
}

// ── Authorization ──

#[tokio::test]
async fn test_user_services_hidden_without_handshake_flag() {
    let (client, _server, _sink) = connect(echo_server(), HandshakeRequest::default()).await;
    let err = client
        .call::<_, Value>(&echo_ctx(), &echo_id(), "Echo", &json!("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Status(s) if s.code == Code::Unimplemented));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_declared_dependency_allows_call() {
    let (client, _server, _sink) = connect(echo_server(), user_request()).await;
    let reply: Value = client
        .call(&echo_ctx(), &echo_id(), "Echo", &json!("hi"))
        .await
        .unwrap();
    assert_eq!(reply, json!("hi"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_undeclared_dependency_rejected() {
    let (client, _server, _sink) = connect(echo_server(), user_request()).await;

    let other = CallContext::default().with_service_deps(["tether.example.Other"]);
    let err = client
        .call::<_, Value>(&other, &echo_id(), "Echo", &json!("hi"))
        .await
        .unwrap_err();
    assert!(matches!(&err, RpcError::Status(s) if s.code == Code::FailedPrecondition));

    let missing = CallContext::default();
    let err = client
        .call::<_, Value>(&missing, &echo_id(), "Echo", &json!("hi"))
        .await
        .unwrap_err();
    assert!(matches!(&err, RpcError::Status(s) if s.code == Code::FailedPrecondition));
    client.close().await.unwrap();
}

// ── Trailers ──

#[tokio::test]
async fn test_logs_arrive_before_call_returns() {
    let (client, _server, sink) = connect(echo_server(), user_request()).await;
    for i in 0..20 {
        let _: Value = client
            .call(&echo_ctx(), &echo_id(), "Echo", &json!(i))
            .await
            .unwrap();
        let lines = sink.lines();
        assert_eq!(lines.last().map(String::as_str), Some(format!("echo {i}").as_str()));
    }
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_log_bursts_keep_order() {
    let (client, _server, sink) = connect(echo_server(), user_request()).await;
    let (ctx, id) = (echo_ctx(), echo_id());
    let burst = |tag: &'static str| {
        let (client, ctx, id) = (&client, &ctx, &id);
        async move {
            client
                .call::<_, Value>(ctx, id, "Burst", &json!({"tag": tag, "count": 250}))
                .await
        }
    };
    let (a, b, c, d) = tokio::join!(burst("a"), burst("b"), burst("c"), burst("d"));
    for result in [a, b, c, d] {
        result.unwrap();
    }

    let lines = sink.lines();
    assert_eq!(lines.len(), 1000);
    for tag in ["a", "b", "c", "d"] {
        let seen: Vec<String> = lines
            .iter()
            .filter(|l| l.starts_with(&format!("{tag} ")))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..250).map(|i| format!("{tag} {i}")).collect();
        assert_eq!(seen, expected);
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_vars_reach_user_service() {
    let request = HandshakeRequest {
        need_user_services: true,
        bundle_glob: None,
        init_params: Some(BundleInitParams {
            vars: BTreeMap::from([("greeting".to_string(), "hello".to_string())]),
        }),
    };
    let (client, _server, _sink) = connect(echo_server(), request).await;
    let value: Value = client
        .call(&echo_ctx(), &echo_id(), "Var", &json!("greeting"))
        .await
        .unwrap();
    assert_eq!(value, json!("hello"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_out_dir_pulled_then_removed_on_server() {
    let base = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let server = echo_server().with_out_dir_base(base.path());
    let (client, _server, _sink) = connect(server, user_request()).await;

    let ctx = echo_ctx().with_out_dir(dst.path().join("pulled"));
    let server_path: String = client
        .call(&ctx, &echo_id(), "WriteFile", &Value::Null)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(dst.path().join("pulled/note.txt")).unwrap(),
        b"written"
    );
    assert!(!std::path::Path::new(&server_path).exists());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_out_dir_discarded_without_destination() {
    let base = tempfile::tempdir().unwrap();
    let server = echo_server().with_out_dir_base(base.path());
    let (client, _server, _sink) = connect(server, user_request()).await;

    let server_path: String = client
        .call(&echo_ctx(), &echo_id(), "WriteFile", &Value::Null)
        .await
        .unwrap();
    assert!(!std::path::Path::new(&server_path).exists());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_out_dir_deleted_and_not_reported() {
    let base = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let server = echo_server().with_out_dir_base(base.path());
    let (client, _server, _sink) = connect(server, user_request()).await;

    let ctx = echo_ctx().with_out_dir(dst.path().join("never"));
    let server_path: Option<String> = client
        .call(&ctx, &echo_id(), "OutDir", &Value::Null)
        .await
        .unwrap();
    let server_path = server_path.unwrap();
    assert!(!std::path::Path::new(&server_path).exists());
    assert!(!dst.path().join("never").exists());
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_larger_than_frame_limit_is_pulled() {
    let base = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let server = echo_server().with_out_dir_base(base.path());
    let (client, _server, _sink) = connect(server, user_request()).await;

    let ctx = CallContext {
        run: RunContext::new().with_timeout(Duration::from_secs(120)),
        ..echo_ctx().with_out_dir(dst.path().join("pulled"))
    };
    let _: Value = client
        .call(&ctx, &echo_id(), "WriteBig", &Value::Null)
        .await
        .unwrap();
    let pulled = std::fs::read(dst.path().join("pulled/big.bin")).unwrap();
    assert_eq!(pulled.len(), MAX_MESSAGE_SIZE + 1);
    assert!(pulled == big_contents());

    let echoed: Value = client
        .call(&echo_ctx(), &echo_id(), "Echo", &json!("still here"))
        .await
        .unwrap();
    assert_eq!(echoed, json!("still here"));
    client.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_response_fails_only_its_call() {
    let (client, _server, _sink) = connect(echo_server(), user_request()).await;
    let ctx = CallContext {
        run: RunContext::new().with_timeout(Duration::from_secs(60)),
        ..echo_ctx()
    };
    let err = client
        .call::<_, Value>(&ctx, &echo_id(), "Oversized", &Value::Null)
        .await
        .unwrap_err();
    match err {
        RpcError::Status(status) => {
            assert_eq!(status.code, Code::Internal);
            assert!(status.message.contains("exceeds"), "{}", status.message);
        }
        other => panic!("unexpected error {other}"),
    }

    let echoed: Value = client
        .call(&ctx, &echo_id(), "Echo", &json!(7))
        .await
        .unwrap();
    assert_eq!(echoed, json!(7));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_trailer_steps_all_run_and_first_error_wins() {
    let base = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let server = echo_server().with_out_dir_base(base.path());
    let (client, _server, sink) = connect(server, user_request()).await;

    let mut call = client
        .open_stream(&echo_ctx(), &echo_id(), "WriteFile")
        .await
        .unwrap();
    call.send(&Value::Null).await.unwrap();
    call.close_send().await.unwrap();
    while call.recv::<Value>().await.unwrap().is_some() {}
    let mut trailers = call.trailers().cloned().unwrap();
    assert!(trailers.first(metadata::OUTDIR).is_some());
    trailers.insert_one(metadata::TIMING, "not json");

    let ctx = echo_ctx()
        .with_out_dir(dst.path().join("pulled"))
        .with_timing(TimingLog::new());
    let err = client.process_trailers(&ctx, &trailers).await.unwrap_err();

    assert!(
        matches!(err, RpcError::Trailer { key, .. } if key == metadata::TIMING),
        "{err}"
    );
    assert_eq!(
        std::fs::read(dst.path().join("pulled/note.txt")).unwrap(),
        b"written"
    );
    assert!(sink.lines().contains(&"wrote note.txt".to_string()));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_call_removes_its_out_dir() {
    let base = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let server = echo_server().with_out_dir_base(base.path());
    let registry = server.out_dir_registry();
    let (client, _server, _sink) = connect(server, user_request()).await;

    let ctx = CallContext {
        run: RunContext::new().with_timeout(Duration::from_millis(200)),
        ..echo_ctx().with_out_dir(dst.path().join("pulled"))
    };
    let err = client
        .call::<_, Value>(&ctx, &echo_id(), "WriteThenHang", &Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Context(ContextError::DeadlineExceeded)
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while std::fs::read_dir(base.path()).unwrap().next().is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "server kept the out dir of a cancelled call"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registry.is_empty());
    assert!(!dst.path().join("pulled").exists());
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_timing_trailer_imported_under_open_stage() {
    let (client, _server, _sink) = connect(echo_server(), user_request()).await;
    let timing = TimingLog::new();
    let ctx = echo_ctx().with_timing(timing.clone());
    {
        let _stage = timing.start("call");
        let _: Value = client
            .call(&ctx, &echo_id(), "Timed", &Value::Null)
            .await
            .unwrap();
    }
    let stages = timing.stages();
    assert_eq!(stages[0].name, "call");
    assert_eq!(stages[0].children[0].name, "work");
    client.close().await.unwrap();
}

// ── Lifecycle ──

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let (client, server, _sink) = connect(echo_server(), user_request()).await;
    let mut call = client
        .open_stream(&echo_ctx(), &echo_id(), "Hang")
        .await
        .unwrap();
    call.send(&Value::Null).await.unwrap();
    call.close_send().await.unwrap();

    client.close().await.unwrap();
    let err = call.recv::<Value>().await.unwrap_err();
    assert!(err.is_connection_closed(), "{err}");
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_connection_loss_fails_pending_calls() {
    let (client_conn, mut peer) = pipes();
    // A bare peer that accepts the handshake and log subscription, reads one
    // more request, then hangs up.
    let fake = tokio::spawn(async move {
        let _: HandshakeRequest = receive_message(&mut peer).await.unwrap();
        send_message(&mut peer, &HandshakeResponse::ok()).await.unwrap();
        let Frame::Request { id, .. } = receive_message(&mut peer).await.unwrap() else {
            panic!("expected the log subscription");
        };
        let payload = serde_json::to_value(ReadLogsResponse::default()).unwrap();
        send_message(&mut peer, &Frame::Message { id, payload })
            .await
            .unwrap();
        let _: Frame = receive_message(&mut peer).await.unwrap();
    });

    let client = RpcClient::dial(
        client_conn,
        &user_request(),
        DialOptions::default(),
        &RunContext::new(),
    )
    .await
    .unwrap();
    let mut call = client
        .open_stream(&echo_ctx(), &echo_id(), "Hang")
        .await
        .unwrap();
    fake.await.unwrap();

    let err = call.recv::<Value>().await.unwrap_err();
    assert!(err.is_connection_closed(), "{err}");
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_call_respects_context_deadline() {
    let (client, _server, _sink) = connect(echo_server(), user_request()).await;
    let ctx = CallContext {
        run: RunContext::new().with_timeout(Duration::from_millis(100)),
        ..echo_ctx()
    };
    let err = client
        .call::<_, Value>(&ctx, &echo_id(), "Hang", &Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Context(ContextError::DeadlineExceeded)
    ));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_server_reports_termination_signal() {
    let (client_conn, server_conn) = pipes();
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(echo_server().serve(server_conn, async move {
        let _ = signal_rx.await;
        "SIGTERM".to_string()
    }));
    let client = RpcClient::dial(
        client_conn,
        &user_request(),
        DialOptions::default(),
        &RunContext::new(),
    )
    .await
    .unwrap();

    signal_tx.send(()).unwrap();
    let result = server_task.await.unwrap();
    assert!(matches!(result, Err(RpcError::Terminated(sig)) if sig == "SIGTERM"));
    let _ = client.close().await;
}
