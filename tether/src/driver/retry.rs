//! The retry loop shared by the local and remote halves of a run.

use std::collections::HashMap;

use async_trait::async_trait;
use tether_common::{ResolvedEntity, RunContext, StartFixtureState, TestResult};
use tracing::{info, warn};

use super::failfast::FailureCounter;
use super::{DriverError, PartialRun};

/// Runs a set of tests exactly once.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    /// Results come back in dispatch order. Tests that never started have
    /// no result.
    async fn run_once(
        &self,
        ctx: &RunContext,
        tests: &[ResolvedEntity],
        start_fixture: Option<&StartFixtureState>,
    ) -> Result<Vec<TestResult>, PartialRun>;
}

/// Run `tests` until each has a final result.
///
/// A failing test is run again while it has retries left; only its last
/// result is kept. Every failing result counts toward `failures`, and once
/// that threshold is reached the triggering result is kept and the run
/// stops with whatever has been accepted.
pub async fn run_with_retries(
    ctx: &RunContext,
    runner: &dyn AttemptRunner,
    tests: &[ResolvedEntity],
    start_fixture: Option<&StartFixtureState>,
    max_retries: u32,
    failures: &mut FailureCounter,
) -> Result<Vec<TestResult>, PartialRun> {
    let mut retries_left: HashMap<String, u32> = tests
        .iter()
        .map(|t| (t.name().to_string(), max_retries))
        .collect();
    let mut unstarted: Vec<ResolvedEntity> = tests.to_vec();
    let mut accepted: Vec<TestResult> = Vec::new();
    let mut attempt = 0u32;

    while !unstarted.is_empty() {
        if let Err(e) = failures.check() {
            return Err(PartialRun::new(accepted, e));
        }
        if let Some(e) = ctx.err() {
            return Err(PartialRun::new(accepted, e.into()));
        }
        attempt += 1;
        info!("Attempt {}: running {} test(s)", attempt, unstarted.len());

        let results = match runner.run_once(ctx, &unstarted, start_fixture).await {
            Ok(results) => results,
            Err(partial) => {
                accepted.extend(partial.results);
                return Err(PartialRun::new(accepted, partial.source));
            }
        };

        let mut matched = 0usize;
        for result in results {
            let Some(pos) = unstarted.iter().position(|t| t.name() == result.name) else {
                warn!("Ignoring result for {}, which was not part of this attempt", result.name);
                continue;
            };
            matched += 1;
            let failed = result.failed();
            if failed {
                failures.record();
            }
            let left = retries_left.entry(result.name.clone()).or_insert(0);
            if failed && *left > 0 && !failures.exceeded() {
                *left -= 1;
                info!("{} failed; retrying ({} retries left)", result.name, left);
                continue;
            }
            unstarted.remove(pos);
            accepted.push(result);
            if let Err(e) = failures.check() {
                return Err(PartialRun::new(accepted, e));
            }
        }

        if matched == 0 {
            return Err(PartialRun::new(accepted, DriverError::NoProgress));
        }
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tether_common::types::HOPS_DEVICE;
    use tether_common::{EntityInfo, ErrorRecord};

    use super::*;

    fn entity(name: &str) -> ResolvedEntity {
        ResolvedEntity {
            entity: EntityInfo::test(name, "cros"),
            hops: HOPS_DEVICE,
            start_fixture_name: String::new(),
        }
    }

    fn outcome(name: &str, fail: bool) -> TestResult {
        let mut result = TestResult::new(name, "cros");
        if fail {
            result.errors.push(ErrorRecord::new("failed"));
        }
        result
    }

    /// Fails each test a fixed number of times before passing it.
    struct Flaky {
        failures_before_pass: Mutex<HashMap<String, u32>>,
        attempts: Mutex<Vec<Vec<String>>>,
    }

    impl Flaky {
        fn new(plan: &[(&str, u32)]) -> Self {
            Self {
                failures_before_pass: Mutex::new(
                    plan.iter().map(|(n, k)| (n.to_string(), *k)).collect(),
                ),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AttemptRunner for Flaky {
        async fn run_once(
            &self,
            _ctx: &RunContext,
            tests: &[ResolvedEntity],
            _start_fixture: Option<&StartFixtureState>,
        ) -> Result<Vec<TestResult>, PartialRun> {
            self.attempts
                .lock()
                .unwrap()
                .push(tests.iter().map(|t| t.name().to_string()).collect());
            let mut plan = self.failures_before_pass.lock().unwrap();
            Ok(tests
                .iter()
                .map(|t| {
                    let left = plan.get_mut(t.name()).unwrap();
                    let fail = *left > 0;
                    *left = left.saturating_sub(1);
                    outcome(t.name(), fail)
                })
                .collect())
        }
    }

    struct Silent;

    #[async_trait]
    impl AttemptRunner for Silent {
        async fn run_once(
            &self,
            _ctx: &RunContext,
            _tests: &[ResolvedEntity],
            _start_fixture: Option<&StartFixtureState>,
        ) -> Result<Vec<TestResult>, PartialRun> {
            Ok(Vec::new())
        }
    }

    /// Runs only the first test, then breaks.
    struct BreaksAfterOne;

    #[async_trait]
    impl AttemptRunner for BreaksAfterOne {
        async fn run_once(
            &self,
            _ctx: &RunContext,
            tests: &[ResolvedEntity],
            _start_fixture: Option<&StartFixtureState>,
        ) -> Result<Vec<TestResult>, PartialRun> {
            Err(PartialRun::new(
                vec![outcome(tests[0].name(), false)],
                DriverError::NoProgress,
            ))
        }
    }

    #[tokio::test]
    async fn test_flaky_tests_need_k_plus_one_attempts() {
        let tests = [entity("a"), entity("b"), entity("c")];
        let runner = Flaky::new(&[("a", 2), ("b", 2), ("c", 2)]);
        let results = run_with_retries(
            &RunContext::new(),
            &runner,
            &tests,
            None,
            3,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap();

        assert_eq!(runner.attempts.lock().unwrap().len(), 3);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| !r.failed()));
    }

    #[tokio::test]
    async fn test_only_failed_tests_are_rerun() {
        let tests = [entity("a"), entity("b")];
        let runner = Flaky::new(&[("a", 0), ("b", 1)]);
        let results = run_with_retries(
            &RunContext::new(),
            &runner,
            &tests,
            None,
            1,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap();

        let attempts = runner.attempts.lock().unwrap().clone();
        assert_eq!(attempts, vec![vec!["a", "b"], vec!["b"]]);
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_out_of_retries_keeps_failure() {
        let tests = [entity("a")];
        let runner = Flaky::new(&[("a", 5)]);
        let results = run_with_retries(
            &RunContext::new(),
            &runner,
            &tests,
            None,
            2,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap();
        assert_eq!(runner.attempts.lock().unwrap().len(), 3);
        assert_eq!(results.len(), 1);
        assert!(results[0].failed());
    }

    #[tokio::test]
    async fn test_fail_fast_keeps_triggering_result() {
        let tests = [entity("a"), entity("b"), entity("c")];
        let runner = Flaky::new(&[("a", 1), ("b", 1), ("c", 1)]);
        let mut failures = FailureCounter::new(2);
        let partial = run_with_retries(&RunContext::new(), &runner, &tests, None, 0, &mut failures)
            .await
            .unwrap_err();

        assert!(matches!(partial.source, DriverError::TooManyFailures { .. }));
        let names: Vec<&str> = partial.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(partial.results.iter().all(TestResult::failed));
    }

    #[tokio::test]
    async fn test_zero_results_is_fatal() {
        let partial = run_with_retries(
            &RunContext::new(),
            &Silent,
            &[entity("a")],
            None,
            0,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap_err();
        assert!(matches!(partial.source, DriverError::NoProgress));
        assert_eq!(partial.source.to_string(), "no test ran in the last attempt");
    }

    #[tokio::test]
    async fn test_runner_error_stops_with_partial_results() {
        let partial = run_with_retries(
            &RunContext::new(),
            &BreaksAfterOne,
            &[entity("a"), entity("b")],
            None,
            5,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap_err();
        assert_eq!(partial.results.len(), 1);
        assert_eq!(partial.results[0].name, "a");
    }

    #[tokio::test]
    async fn test_empty_input_runs_nothing() {
        let results = run_with_retries(
            &RunContext::new(),
            &Silent,
            &[],
            None,
            0,
            &mut FailureCounter::unlimited(),
        )
        .await
        .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_before_dispatch() {
        let ctx = RunContext::new();
        ctx.cancel();
        let runner = Flaky::new(&[("a", 0)]);
        let partial = run_with_retries(&ctx, &runner, &[entity("a")], None, 0, &mut FailureCounter::unlimited())
            .await
            .unwrap_err();
        assert!(matches!(partial.source, DriverError::Context(_)));
        assert!(runner.attempts.lock().unwrap().is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_k_failures_take_k_plus_one_attempts(k in 0u32..4, extra in 0u32..3, count in 1usize..6) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let names: Vec<String> = (0..count).map(|i| format!("t{i}")).collect();
                let tests: Vec<ResolvedEntity> = names.iter().map(|n| entity(n)).collect();
                let plan: Vec<(&str, u32)> = names.iter().map(|n| (n.as_str(), k)).collect();
                let runner = Flaky::new(&plan);
                let results = rt.block_on(run_with_retries(
                    &RunContext::new(),
                    &runner,
                    &tests,
                    None,
                    k + extra,
                    &mut FailureCounter::unlimited(),
                )).unwrap();
                prop_assert_eq!(runner.attempts.lock().unwrap().len(), k as usize + 1);
                prop_assert_eq!(results.len(), count);
                prop_assert!(results.iter().all(|r| !r.failed()));
            }
        }
    }
}
