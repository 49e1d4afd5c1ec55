//! Running tests and remote fixtures in a bundle over RPC.
//!
//! Each attempt launches a fresh bundle process, streams `RunTests` events
//! into a [`Processor`], pulls the output directories the bundle reported,
//! and closes the client. Remote fixtures get their own bundle process and
//! their own processor for the lifetime of the fixture.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tether_common::protocol::{
    BundleInitParams, FixtureRequest, FixtureResponse, HandshakeRequest, ListEntitiesResponse,
    RunConfig, RunEvent, RunTestsRequest,
};
use tether_common::rpc::{
    CallContext, ClientCall, DialOptions, RpcClient, RpcError, ServiceId, TracingLogSink,
};
use tether_common::{EntityInfo, ResolvedEntity, RunContext, StartFixtureState, TestResult, TimingLog};
use tracing::{debug, info, warn};

use super::fixture::{FixtureHandle, FixtureStarter};
use super::retry::AttemptRunner;
use super::{DriverError, PartialRun};
use crate::diagnose::Diagnose;
use crate::processor::Processor;
use crate::target::ConnCache;

/// Starts a bundle process and dials it.
#[async_trait]
pub trait BundleLauncher: Send + Sync {
    async fn launch(
        &self,
        ctx: &RunContext,
        handshake: &HandshakeRequest,
    ) -> Result<RpcClient, DriverError>;
}

/// Launches the device-side bundle through the cached target connection.
pub struct DeviceLauncher {
    cache: Arc<ConnCache>,
    argv: Vec<String>,
    kill_session: bool,
}

impl DeviceLauncher {
    pub fn new(cache: Arc<ConnCache>, argv: Vec<String>, kill_session: bool) -> Self {
        Self {
            cache,
            argv,
            kill_session,
        }
    }
}

#[async_trait]
impl BundleLauncher for DeviceLauncher {
    async fn launch(
        &self,
        ctx: &RunContext,
        handshake: &HandshakeRequest,
    ) -> Result<RpcClient, DriverError> {
        let conn = self.cache.ensure_conn(ctx).await?;
        let (pipe, process) = conn.start_bundle(&self.argv, self.kill_session).await?;
        let client = RpcClient::dial(
            pipe,
            handshake,
            DialOptions {
                sink: Arc::new(TracingLogSink),
                process: Some(process),
            },
            ctx,
        )
        .await?;
        Ok(client)
    }
}

/// Launches the host-side bundle as a local child process.
pub struct HostLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl HostLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl BundleLauncher for HostLauncher {
    async fn launch(
        &self,
        ctx: &RunContext,
        handshake: &HandshakeRequest,
    ) -> Result<RpcClient, DriverError> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        let client =
            RpcClient::dial_exec(command, handshake, true, Arc::new(TracingLogSink), ctx).await?;
        Ok(client)
    }
}

/// Settings shared by every call into one bundle.
#[derive(Debug, Clone, Default)]
pub struct BundleSettings {
    /// Directory on the bundle's machine for per-entity output.
    pub out_dir: String,
    pub vars: BTreeMap<String, String>,
    pub features: Vec<String>,
    /// Host directory receiving results and pulled outputs.
    pub results_dir: PathBuf,
}

pub struct BundleRunner {
    name: String,
    launcher: Arc<dyn BundleLauncher>,
    settings: BundleSettings,
    diagnoser: Option<Arc<dyn Diagnose>>,
    timing: Option<TimingLog>,
}

impl BundleRunner {
    pub fn new(
        name: impl Into<String>,
        launcher: Arc<dyn BundleLauncher>,
        settings: BundleSettings,
    ) -> Self {
        Self {
            name: name.into(),
            launcher,
            settings,
            diagnoser: None,
            timing: None,
        }
    }

    pub fn with_diagnoser(mut self, diagnoser: Arc<dyn Diagnose>) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    pub fn with_timing(mut self, timing: TimingLog) -> Self {
        self.timing = Some(timing);
        self
    }

    fn handshake(&self) -> HandshakeRequest {
        HandshakeRequest {
            need_user_services: true,
            bundle_glob: None,
            init_params: Some(BundleInitParams {
                vars: self.settings.vars.clone(),
            }),
        }
    }

    fn run_config(&self, start_fixture: Option<&StartFixtureState>) -> RunConfig {
        RunConfig {
            out_dir: self.settings.out_dir.clone(),
            vars: self.settings.vars.clone(),
            features: self.settings.features.clone(),
            start_fixture: start_fixture.cloned(),
        }
    }

    fn processor(&self) -> Processor {
        let mut processor = Processor::new(&self.settings.results_dir);
        if let Some(diagnoser) = &self.diagnoser {
            processor = processor.with_diagnoser(diagnoser.clone());
        }
        if let Some(timing) = &self.timing {
            processor = processor.with_timing(timing.clone());
        }
        processor
    }

    /// Every test and fixture the bundle offers.
    pub async fn list_entities(&self, ctx: &RunContext) -> Result<Vec<EntityInfo>, DriverError> {
        let client = self.launcher.launch(ctx, &self.handshake()).await?;
        let response = client
            .call::<_, ListEntitiesResponse>(
                &CallContext::new(ctx.clone()),
                &ServiceId::TestService,
                "ListEntities",
                &(),
            )
            .await;
        close_client(client, &self.name).await;
        let entities = response?.entities;
        debug!("{} bundle offers {} entities", self.name, entities.len());
        Ok(entities)
    }

    async fn stream_tests(
        &self,
        client: &RpcClient,
        call_ctx: &CallContext,
        processor: &mut Processor,
        tests: &[ResolvedEntity],
        start_fixture: Option<&StartFixtureState>,
    ) -> Result<(), DriverError> {
        let mut call = client
            .open_stream(call_ctx, &ServiceId::TestService, "RunTests")
            .await?;
        let request = RunTestsRequest {
            tests: tests.iter().map(|t| t.name().to_string()).collect(),
            config: self.run_config(start_fixture),
        };
        call.send(&request).await.map_err(RpcError::from)?;
        call.close_send().await.map_err(RpcError::from)?;

        while let Some(event) = recv_event(&call_ctx.run, &mut call).await? {
            processor.handle(event).await;
        }
        finish_call(client, call_ctx, &call).await;
        Ok(())
    }
}

#[async_trait]
impl AttemptRunner for BundleRunner {
    async fn run_once(
        &self,
        ctx: &RunContext,
        tests: &[ResolvedEntity],
        start_fixture: Option<&StartFixtureState>,
    ) -> Result<Vec<TestResult>, PartialRun> {
        let client = self
            .launcher
            .launch(ctx, &self.handshake())
            .await
            .map_err(|e| PartialRun::new(Vec::new(), e))?;
        info!("Running {} test(s) in the {} bundle", tests.len(), self.name);

        let call_ctx = CallContext::new(ctx.clone());
        let mut processor = self.processor();
        let outcome = self
            .stream_tests(&client, &call_ctx, &mut processor, tests, start_fixture)
            .await;
        let interrupted = outcome.as_ref().err().map(ToString::to_string);
        if let Some(reason) = &interrupted {
            warn!("{} bundle run interrupted: {}", self.name, reason);
        }

        pull_outputs(&client, ctx, &mut processor).await;
        close_client(client, &self.name).await;
        let results = processor.finish(ctx, interrupted.as_deref()).await;

        match outcome {
            Err(e @ DriverError::Context(_)) => Err(PartialRun::new(results, e)),
            _ => Ok(results),
        }
    }
}

#[async_trait]
impl FixtureStarter for BundleRunner {
    async fn start(
        &self,
        ctx: &RunContext,
        name: &str,
    ) -> Result<Box<dyn FixtureHandle>, DriverError> {
        let client = self.launcher.launch(ctx, &self.handshake()).await?;
        let call_ctx = CallContext::new(ctx.clone());
        let mut processor = self.processor();

        let pushed: Result<(ClientCall, StartFixtureState), DriverError> = async {
            let mut call = client
                .open_stream(&call_ctx, &ServiceId::FixtureService, "RunFixture")
                .await?;
            call.send(&FixtureRequest::Push {
                name: name.to_string(),
                config: self.run_config(None),
            })
            .await
            .map_err(RpcError::from)?;
            loop {
                match recv_fixture(ctx, &mut call).await? {
                    Some(FixtureResponse::Event { event }) => processor.handle(event).await,
                    Some(FixtureResponse::PushDone { state }) => return Ok((call, state)),
                    Some(FixtureResponse::PopDone) | None => {
                        return Err(DriverError::Fixture {
                            name: name.to_string(),
                            reason: "fixture stream ended before set-up finished".into(),
                        });
                    }
                }
            }
        }
        .await;

        match pushed {
            Ok((call, state)) => {
                if !state.setup_errors.is_empty() {
                    warn!(
                        "Remote fixture {} reported {} set-up error(s)",
                        name,
                        state.setup_errors.len()
                    );
                }
                Ok(Box::new(RemoteFixture {
                    bundle: self.name.clone(),
                    client,
                    call_ctx,
                    call,
                    processor,
                    state,
                }))
            }
            Err(e) => {
                pull_outputs(&client, ctx, &mut processor).await;
                close_client(client, &self.name).await;
                processor.finish(ctx, Some(&e.to_string())).await;
                Err(e)
            }
        }
    }
}

/// A remote fixture that has been set up and waits for `Pop`.
pub struct RemoteFixture {
    bundle: String,
    client: RpcClient,
    call_ctx: CallContext,
    call: ClientCall,
    processor: Processor,
    state: StartFixtureState,
}

impl RemoteFixture {
    async fn pop(&mut self, ctx: &RunContext) -> Result<(), DriverError> {
        self.call
            .send(&FixtureRequest::Pop)
            .await
            .map_err(RpcError::from)?;
        self.call.close_send().await.map_err(RpcError::from)?;
        while let Some(response) = recv_fixture(ctx, &mut self.call).await? {
            match response {
                FixtureResponse::Event { event } => self.processor.handle(event).await,
                FixtureResponse::PopDone => debug!("Remote fixture {} torn down", self.state.name),
                FixtureResponse::PushDone { .. } => {
                    warn!("Unexpected PushDone while tearing down {}", self.state.name)
                }
            }
        }
        finish_call(&self.client, &self.call_ctx, &self.call).await;
        Ok(())
    }
}

#[async_trait]
impl FixtureHandle for RemoteFixture {
    fn state(&self) -> &StartFixtureState {
        &self.state
    }

    async fn stop(mut self: Box<Self>, ctx: &RunContext) -> Result<(), DriverError> {
        let popped = self.pop(ctx).await;
        let Self {
            bundle,
            client,
            mut processor,
            state,
            ..
        } = *self;
        pull_outputs(&client, ctx, &mut processor).await;
        close_client(client, &bundle).await;
        let interrupted = popped.as_ref().err().map(ToString::to_string);
        processor.finish(ctx, interrupted.as_deref()).await;
        popped.map_err(|e| DriverError::Fixture {
            name: state.name,
            reason: e.to_string(),
        })
    }
}

async fn recv_event(
    ctx: &RunContext,
    call: &mut ClientCall,
) -> Result<Option<RunEvent>, DriverError> {
    let event = ctx.run(call.recv::<RunEvent>()).await?.map_err(RpcError::from)?;
    Ok(event)
}

async fn recv_fixture(
    ctx: &RunContext,
    call: &mut ClientCall,
) -> Result<Option<FixtureResponse>, DriverError> {
    let response = ctx
        .run(call.recv::<FixtureResponse>())
        .await?
        .map_err(RpcError::from)?;
    Ok(response)
}

async fn finish_call(client: &RpcClient, call_ctx: &CallContext, call: &ClientCall) {
    if let Some(trailers) = call.trailers().cloned()
        && let Err(e) = client.process_trailers(call_ctx, &trailers).await
    {
        warn!("Failed to process trailers from {}: {}", client.peer(), e);
    }
}

async fn pull_outputs(client: &RpcClient, ctx: &RunContext, processor: &mut Processor) {
    for pull in processor.take_pulls() {
        if let Err(e) = client.pull_directory(ctx, &pull.remote_dir, &pull.dst).await {
            warn!("Failed to pull output of {}: {}", pull.name, e);
        }
    }
}

async fn close_client(client: RpcClient, bundle: &str) {
    if let Err(e) = client.close().await {
        warn!("Failed to close the {} bundle: {}", bundle, e);
    }
}
