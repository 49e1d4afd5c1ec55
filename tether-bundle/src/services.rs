//! Bundle protocol services and server assembly.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tether_common::protocol::{
    FixtureRequest, FixtureResponse, ListEntitiesResponse, RunEvent, RunTestsRequest,
};
use tether_common::rpc::{
    CallStream, OutDirRegistry, Server, ServerCall, Service, ServiceId, Status,
};
use tether_common::StartFixtureState;
use tracing::{debug, info};

use crate::registry::Registry;
use crate::runner::{EventSink, Executor};

/// Forwards run events as `RunTests` responses.
struct TestEvents<'a>(&'a CallStream);

#[async_trait]
impl EventSink for TestEvents<'_> {
    async fn emit(&self, event: RunEvent) -> Result<(), Status> {
        self.0.send(&event).await
    }
}

/// Wraps run events into `RunFixture` responses.
struct FixtureEvents<'a>(&'a CallStream);

#[async_trait]
impl EventSink for FixtureEvents<'_> {
    async fn emit(&self, event: RunEvent) -> Result<(), Status> {
        self.0.send(&FixtureResponse::Event { event }).await
    }
}

pub struct TestService {
    registry: Arc<Registry>,
    out_dirs: Arc<OutDirRegistry>,
}

impl TestService {
    pub fn new(registry: Arc<Registry>, out_dirs: Arc<OutDirRegistry>) -> Self {
        Self { registry, out_dirs }
    }
}

#[async_trait]
impl Service for TestService {
    fn id(&self) -> ServiceId {
        ServiceId::TestService
    }

    async fn handle(&self, mut call: ServerCall) -> Result<(), Status> {
        match call.method.as_str() {
            "ListEntities" => {
                call.stream
                    .send(&ListEntitiesResponse {
                        entities: self.registry.entities(),
                    })
                    .await
            }
            "RunTests" => {
                let request: RunTestsRequest = call.stream.recv_one().await?;
                info!("Running {} requested test(s)", request.tests.len());
                let sink = TestEvents(&call.stream);
                Executor::new(&self.registry, &self.out_dirs, &request.config)
                    .run_tests(&sink, &request.tests, &request.config, &call.cancel)
                    .await
            }
            other => Err(Status::unimplemented(format!("TestService has no method {other}"))),
        }
    }
}

pub struct FixtureService {
    registry: Arc<Registry>,
    out_dirs: Arc<OutDirRegistry>,
}

impl FixtureService {
    pub fn new(registry: Arc<Registry>, out_dirs: Arc<OutDirRegistry>) -> Self {
        Self { registry, out_dirs }
    }
}

#[async_trait]
impl Service for FixtureService {
    fn id(&self) -> ServiceId {
        ServiceId::FixtureService
    }

    async fn handle(&self, mut call: ServerCall) -> Result<(), Status> {
        if call.method != "RunFixture" {
            return Err(Status::unimplemented(format!(
                "FixtureService has no method {}",
                call.method
            )));
        }
        let Some(FixtureRequest::Push { name, config }) = call.stream.recv().await? else {
            return Err(Status::invalid_argument("RunFixture must start with Push"));
        };
        let Some(def) = self.registry.fixture(&name) else {
            return Err(Status::not_found(format!("no fixture {name}")));
        };
        let (mut chain, _) = self.registry.fixture_chain(&def.info.fixture);
        chain.push(name.clone());

        let mut executor = Executor::new(&self.registry, &self.out_dirs, &config);
        executor
            .sync_fixtures(&FixtureEvents(&call.stream), &chain)
            .await?;
        let state = StartFixtureState {
            name: name.clone(),
            setup_errors: executor.setup_errors(),
        };
        let failed = state.setup_errors.len();
        call.stream.send(&FixtureResponse::PushDone { state }).await?;
        debug!("Remote fixture {} is up", name);

        match call.stream.recv::<FixtureRequest>().await? {
            Some(FixtureRequest::Pop) | None => {}
            Some(FixtureRequest::Push { name: other, .. }) => {
                executor.teardown_all(&FixtureEvents(&call.stream)).await?;
                return Err(Status::failed_precondition(format!(
                    "fixture {name} is already pushed; cannot push {other}"
                )));
            }
        }
        executor.teardown_all(&FixtureEvents(&call.stream)).await?;
        call.stream.send(&FixtureResponse::PopDone).await?;
        info!("Remote fixture {} torn down ({} set-up error(s))", name, failed);
        Ok(())
    }
}

/// Every server a bundle role exposes: the bundle protocol plus the
/// registry's user services. Output directories land under `out_base`
/// unless a request names its own.
pub fn build_server(registry: Arc<Registry>, out_base: PathBuf) -> Server {
    let server = Server::new().with_out_dir_base(out_base);
    let out_dirs = server.out_dir_registry();
    let mut server = server
        .with_service(Arc::new(TestService::new(registry.clone(), out_dirs.clone())))
        .with_service(Arc::new(FixtureService::new(registry.clone(), out_dirs)));
    for service in registry.user_services() {
        server = server.with_user_service(service.clone());
    }
    server
}
