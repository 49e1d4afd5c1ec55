//! Remote-fixture grouping for device-side tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tether_common::{ResolvedEntity, RunContext, StartFixtureState, TestResult};
use tracing::{info, warn};

use super::failfast::FailureCounter;
use super::retry::{AttemptRunner, run_with_retries};
use super::{DriverError, PartialRun};

pub const CROSS_BUNDLE_REASON: &str = "cross-bundle local-remote fixture dependency is unsupported";

/// Starts remote fixtures on the host side.
#[async_trait]
pub trait FixtureStarter: Send + Sync {
    async fn start(&self, ctx: &RunContext, name: &str)
    -> Result<Box<dyn FixtureHandle>, DriverError>;
}

/// A running remote fixture.
#[async_trait]
pub trait FixtureHandle: Send {
    fn state(&self) -> &StartFixtureState;

    async fn stop(self: Box<Self>, ctx: &RunContext) -> Result<(), DriverError>;
}

/// Split device-side tests by the remote fixture they start from.
///
/// Tests outside `primary_bundle` that need a remote fixture come back as
/// synthetic failures instead of being grouped.
pub fn group_by_start_fixture(
    tests: Vec<ResolvedEntity>,
    primary_bundle: &str,
) -> (Vec<TestResult>, BTreeMap<String, Vec<ResolvedEntity>>) {
    let mut rejected = Vec::new();
    let mut groups: BTreeMap<String, Vec<ResolvedEntity>> = BTreeMap::new();
    for test in tests {
        if !test.start_fixture_name.is_empty() && test.entity.bundle != primary_bundle {
            warn!(
                "{} in bundle {} depends on remote fixture {}; rejecting",
                test.name(),
                test.entity.bundle,
                test.start_fixture_name
            );
            rejected.push(TestResult::synthetic_failure(&test.entity, CROSS_BUNDLE_REASON));
            continue;
        }
        groups
            .entry(test.start_fixture_name.clone())
            .or_default()
            .push(test);
    }
    (rejected, groups)
}

/// Run every group in key order, standing up its remote fixture first.
pub async fn run_fixture_groups(
    ctx: &RunContext,
    runner: &dyn AttemptRunner,
    starter: &dyn FixtureStarter,
    groups: BTreeMap<String, Vec<ResolvedEntity>>,
    max_retries: u32,
    failures: &mut FailureCounter,
) -> Result<Vec<TestResult>, PartialRun> {
    let mut results = Vec::new();
    for (fixture, tests) in groups {
        if fixture.is_empty() {
            match run_with_retries(ctx, runner, &tests, None, max_retries, failures).await {
                Ok(group) => results.extend(group),
                Err(partial) => {
                    results.extend(partial.results);
                    return Err(PartialRun::new(results, partial.source));
                }
            }
            continue;
        }

        info!("Starting remote fixture {} for {} test(s)", fixture, tests.len());
        let handle = match starter.start(ctx, &fixture).await {
            Ok(handle) => handle,
            Err(e) => return Err(PartialRun::new(results, e)),
        };
        let outcome = run_with_retries(
            ctx,
            runner,
            &tests,
            Some(handle.state()),
            max_retries,
            failures,
        )
        .await;
        let stopped = handle.stop(ctx).await;

        match (outcome, stopped) {
            (Ok(group), Ok(())) => results.extend(group),
            (Ok(group), Err(e)) => {
                results.extend(group);
                return Err(PartialRun::new(results, e));
            }
            (Err(partial), stopped) => {
                if let Err(e) = stopped {
                    warn!("Failed to stop remote fixture {}: {}", fixture, e);
                }
                results.extend(partial.results);
                return Err(PartialRun::new(results, partial.source));
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tether_common::EntityInfo;
    use tether_common::types::HOPS_DEVICE;

    use super::*;

    fn test(name: &str, bundle: &str, start: &str) -> ResolvedEntity {
        ResolvedEntity {
            entity: EntityInfo::test(name, bundle),
            hops: HOPS_DEVICE,
            start_fixture_name: start.into(),
        }
    }

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Runner {
        journal: Arc<Journal>,
        fail: bool,
    }

    #[async_trait]
    impl AttemptRunner for Runner {
        async fn run_once(
            &self,
            _ctx: &RunContext,
            tests: &[ResolvedEntity],
            start_fixture: Option<&StartFixtureState>,
        ) -> Result<Vec<TestResult>, PartialRun> {
            let names: Vec<&str> = tests.iter().map(ResolvedEntity::name).collect();
            self.journal.push(format!(
                "run {} under {:?}",
                names.join(","),
                start_fixture.map(|s| s.name.as_str())
            ));
            if self.fail {
                return Err(PartialRun::new(Vec::new(), DriverError::NoProgress));
            }
            Ok(tests
                .iter()
                .map(|t| TestResult::new(t.name(), &t.entity.bundle))
                .collect())
        }
    }

    struct Handle {
        state: StartFixtureState,
        journal: Arc<Journal>,
        fail_stop: bool,
    }

    #[async_trait]
    impl FixtureHandle for Handle {
        fn state(&self) -> &StartFixtureState {
            &self.state
        }

        async fn stop(self: Box<Self>, _ctx: &RunContext) -> Result<(), DriverError> {
            self.journal.push(format!("stop {}", self.state.name));
            if self.fail_stop {
                return Err(DriverError::Fixture {
                    name: self.state.name.clone(),
                    reason: "teardown failed".into(),
                });
            }
            Ok(())
        }
    }

    struct Starter {
        journal: Arc<Journal>,
        fail_stop: bool,
    }

    #[async_trait]
    impl FixtureStarter for Starter {
        async fn start(
            &self,
            _ctx: &RunContext,
            name: &str,
        ) -> Result<Box<dyn FixtureHandle>, DriverError> {
            self.journal.push(format!("start {name}"));
            Ok(Box::new(Handle {
                state: StartFixtureState {
                    name: name.to_string(),
                    setup_errors: Vec::new(),
                },
                journal: self.journal.clone(),
                fail_stop: self.fail_stop,
            }))
        }
    }

    #[test]
    fn test_groups_sorted_by_key() {
        let (rejected, groups) = group_by_start_fixture(
            vec![
                test("a", "cros", "remote.Zeta"),
                test("b", "cros", ""),
                test("c", "cros", "remote.Alpha"),
                test("d", "cros", "remote.Zeta"),
            ],
            "cros",
        );
        assert!(rejected.is_empty());
        let keys: Vec<&str> = groups.keys().map(String::as_str).collect();
        assert_eq!(keys, ["", "remote.Alpha", "remote.Zeta"]);
        assert_eq!(groups["remote.Zeta"].len(), 2);
    }

    #[test]
    fn test_cross_bundle_dependency_rejected() {
        let (rejected, groups) = group_by_start_fixture(
            vec![test("x", "extra", "remote.Lab"), test("y", "extra", "")],
            "cros",
        );
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].name, "x");
        assert_eq!(rejected[0].errors[0].reason, CROSS_BUNDLE_REASON);
        assert_eq!(groups[""].len(), 1);
    }

    #[tokio::test]
    async fn test_fixture_wraps_its_group() {
        let journal = Arc::new(Journal::default());
        let runner = Runner { journal: journal.clone(), fail: false };
        let starter = Starter { journal: journal.clone(), fail_stop: false };
        let (_, groups) = group_by_start_fixture(
            vec![test("a", "cros", "remote.Lab"), test("b", "cros", "")],
            "cros",
        );
        let results = run_fixture_groups(
            &RunContext::new(),
            &runner,
            &starter,
            groups,
            0,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(
            journal.entries(),
            [
                "run b under None",
                "start remote.Lab",
                "run a under Some(\"remote.Lab\")",
                "stop remote.Lab",
            ]
        );
    }

    #[tokio::test]
    async fn test_fixture_stopped_after_failed_group() {
        let journal = Arc::new(Journal::default());
        let runner = Runner { journal: journal.clone(), fail: true };
        let starter = Starter { journal: journal.clone(), fail_stop: true };
        let (_, groups) = group_by_start_fixture(vec![test("a", "cros", "remote.Lab")], "cros");
        let partial = run_fixture_groups(
            &RunContext::new(),
            &runner,
            &starter,
            groups,
            0,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap_err();

        // The run error wins over the teardown error.
        assert!(matches!(partial.source, DriverError::NoProgress));
        assert_eq!(journal.entries().last().unwrap(), "stop remote.Lab");
    }

    #[tokio::test]
    async fn test_teardown_error_reported_with_results() {
        let journal = Arc::new(Journal::default());
        let runner = Runner { journal: journal.clone(), fail: false };
        let starter = Starter { journal, fail_stop: true };
        let (_, groups) = group_by_start_fixture(vec![test("a", "cros", "remote.Lab")], "cros");
        let partial = run_fixture_groups(
            &RunContext::new(),
            &runner,
            &starter,
            groups,
            0,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap_err();
        assert!(matches!(partial.source, DriverError::Fixture { .. }));
        assert_eq!(partial.results.len(), 1);
    }
}
