//! Test-run orchestration.
//!
//! The [`Driver`] splits the requested tests by where they execute,
//! runs device-side tests grouped by the remote fixture they start from,
//! then runs host-side tests, all through [`retry::run_with_retries`].
//! Every fallible path returns the results gathered so far in a
//! [`PartialRun`].

pub mod bundle;
pub mod failfast;
pub mod fixture;
pub mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tether_common::rpc::RpcError;
use tether_common::rpc::auth::is_undeclared_service;
use tether_common::types::{HOPS_DEVICE, HOPS_HOST};
use tether_common::{
    ContextError, EntityInfo, EntityKind, ErrorCode, ResolvedEntity, RunContext, TestResult,
};
use thiserror::Error;
use tracing::info;

use crate::target::TargetError;
use failfast::FailureCounter;
use fixture::{FixtureStarter, group_by_start_fixture, run_fixture_groups};
use retry::{AttemptRunner, run_with_retries};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("too many test failures ({count}, limit {threshold})")]
    TooManyFailures { count: u32, threshold: u32 },

    #[error("no test ran in the last attempt")]
    NoProgress,

    #[error("remote fixture {name} failed: {reason}")]
    Fixture { name: String, reason: String },

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl DriverError {
    /// Catalog entry used when the CLI explains a fatal outcome.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TooManyFailures { .. } => ErrorCode::RunTooManyFailures,
            Self::NoProgress => ErrorCode::RunNoProgress,
            Self::Fixture { .. } => ErrorCode::RunFixtureFailed,
            Self::Context(_) => ErrorCode::RunCanceled,
            Self::Target(TargetError::Connect { .. }) => ErrorCode::TargetConnectFailed,
            Self::Target(TargetError::PingTimeout(_)) => ErrorCode::TargetPingTimeout,
            Self::Target(TargetError::Forward(_)) => ErrorCode::TargetForwardFailed,
            Self::Target(TargetError::BootId(_)) => ErrorCode::TargetBootIdUnavailable,
            Self::Target(TargetError::Context(_)) => ErrorCode::RunCanceled,
            Self::Target(_) => ErrorCode::TargetLost,
            Self::Rpc(RpcError::Handshake(_)) => ErrorCode::TransportHandshakeRejected,
            Self::Rpc(RpcError::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                ErrorCode::ConfigBundleNotFound
            }
            Self::Rpc(RpcError::Spawn { .. }) => ErrorCode::TransportSpawnFailed,
            Self::Rpc(RpcError::Status(status)) if is_undeclared_service(status) => {
                ErrorCode::TransportUndeclaredService
            }
            Self::Rpc(RpcError::Framing(_)) => ErrorCode::TransportFramingError,
            Self::Rpc(RpcError::Context(_)) => ErrorCode::RunCanceled,
            Self::Rpc(_) => ErrorCode::TransportConnectionClosed,
        }
    }
}

/// A fatal error together with the results collected before it.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PartialRun {
    pub results: Vec<TestResult>,
    #[source]
    pub source: DriverError,
}

impl PartialRun {
    pub fn new(results: Vec<TestResult>, source: DriverError) -> Self {
        Self { results, source }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Extra attempts per failing test.
    pub max_retries: u32,
    /// Zero means unlimited.
    pub max_test_failures: u32,
    /// Only tests of this bundle may start from a remote fixture.
    pub primary_bundle: String,
}

pub struct Driver {
    config: DriverConfig,
    local: Arc<dyn AttemptRunner>,
    remote: Arc<dyn AttemptRunner>,
    fixtures: Arc<dyn FixtureStarter>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        local: Arc<dyn AttemptRunner>,
        remote: Arc<dyn AttemptRunner>,
        fixtures: Arc<dyn FixtureStarter>,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            fixtures,
        }
    }

    /// Run `tests`; device-side results come first.
    pub async fn run(
        &self,
        ctx: &RunContext,
        tests: Vec<ResolvedEntity>,
    ) -> Result<Vec<TestResult>, PartialRun> {
        let (local, remote): (Vec<_>, Vec<_>) =
            tests.into_iter().partition(ResolvedEntity::runs_on_device);
        info!(
            "Running {} device-side and {} host-side test(s)",
            local.len(),
            remote.len()
        );
        let mut failures = FailureCounter::new(self.config.max_test_failures);
        let mut results = Vec::new();

        if !local.is_empty() {
            let (rejected, groups) = group_by_start_fixture(local, &self.config.primary_bundle);
            for result in &rejected {
                if result.failed() {
                    failures.record();
                }
            }
            results.extend(rejected);
            if let Err(e) = failures.check() {
                return Err(PartialRun::new(results, e));
            }
            match run_fixture_groups(
                ctx,
                self.local.as_ref(),
                self.fixtures.as_ref(),
                groups,
                self.config.max_retries,
                &mut failures,
            )
            .await
            {
                Ok(local_results) => results.extend(local_results),
                Err(partial) => {
                    results.extend(partial.results);
                    return Err(PartialRun::new(results, partial.source));
                }
            }
        }

        if !remote.is_empty() {
            match run_with_retries(
                ctx,
                self.remote.as_ref(),
                &remote,
                None,
                self.config.max_retries,
                &mut failures,
            )
            .await
            {
                Ok(remote_results) => results.extend(remote_results),
                Err(partial) => {
                    results.extend(partial.results);
                    return Err(PartialRun::new(results, partial.source));
                }
            }
        }
        Ok(results)
    }
}

/// Select the tests matching `patterns` (all tests when empty) from the
/// device-side and host-side bundles, and resolve the remote fixture each
/// device-side test starts from.
pub fn resolve_tests(
    local: &[EntityInfo],
    remote: &[EntityInfo],
    patterns: &[glob::Pattern],
) -> Vec<ResolvedEntity> {
    let matches = |e: &&EntityInfo| {
        e.kind == EntityKind::Test
            && (patterns.is_empty() || patterns.iter().any(|p| p.matches(&e.name)))
    };
    let local_fixtures: HashMap<&str, &EntityInfo> = local
        .iter()
        .filter(|e| e.kind == EntityKind::Fixture)
        .map(|e| (e.name.as_str(), e))
        .collect();
    let remote_fixtures: HashSet<&str> = remote
        .iter()
        .filter(|e| e.kind == EntityKind::Fixture)
        .map(|e| e.name.as_str())
        .collect();

    let device = local.iter().filter(matches).map(|e| ResolvedEntity {
        entity: e.clone(),
        hops: HOPS_DEVICE,
        start_fixture_name: start_fixture_of(e, &local_fixtures, &remote_fixtures),
    });
    let host = remote.iter().filter(matches).map(|e| ResolvedEntity {
        entity: e.clone(),
        hops: HOPS_HOST,
        start_fixture_name: String::new(),
    });
    device.chain(host).collect()
}

/// Walk the fixture chain through device-side fixtures; the first one the
/// device does not have is the remote start fixture.
fn start_fixture_of(
    test: &EntityInfo,
    local_fixtures: &HashMap<&str, &EntityInfo>,
    remote_fixtures: &HashSet<&str>,
) -> String {
    let mut seen = HashSet::new();
    let mut name = test.fixture.as_str();
    while !name.is_empty() && seen.insert(name) {
        match local_fixtures.get(name) {
            Some(fixture) => name = fixture.fixture.as_str(),
            None if remote_fixtures.contains(name) => return name.to_string(),
            None => return String::new(),
        }
    }
    String::new()
}
