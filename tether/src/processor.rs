//! Turns the run event stream of one bundle invocation into test results.
//!
//! Every ended test is appended to `streamed_results.jsonl` right away, so
//! attempts that are later retried stay visible there even though only the
//! final attempt reaches the summary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tether_common::protocol::RunEvent;
use tether_common::util::truncate_for_log;
use tether_common::{EntityInfo, EntityKind, ErrorRecord, RunContext, TestResult, TimingLog};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::diagnose::Diagnose;

pub const STREAMED_RESULTS_FILE: &str = "streamed_results.jsonl";
pub const RESULTS_FILE: &str = "results.json";
pub const TESTS_DIR: &str = "tests";
pub const FIXTURES_DIR: &str = "fixtures";

const MAX_LOG_LINE: usize = 2000;

/// An entity output directory left on the bundle's machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPull {
    pub name: String,
    pub remote_dir: String,
    pub dst: PathBuf,
}

#[derive(Debug)]
struct Running {
    info: EntityInfo,
    result: TestResult,
}

pub struct Processor {
    results_dir: PathBuf,
    diagnoser: Option<Arc<dyn Diagnose>>,
    timing: Option<TimingLog>,
    fixtures: Vec<String>,
    running: Vec<Running>,
    results: Vec<TestResult>,
    pulls: Vec<PendingPull>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("results_dir", &self.results_dir)
            .field("running", &self.running.len())
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

impl Processor {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            diagnoser: None,
            timing: None,
            fixtures: Vec::new(),
            running: Vec::new(),
            results: Vec::new(),
            pulls: Vec::new(),
        }
    }

    /// Consulted when a run is interrupted with entities still running.
    pub fn with_diagnoser(mut self, diagnoser: Arc<dyn Diagnose>) -> Self {
        self.diagnoser = Some(diagnoser);
        self
    }

    /// Receives each entity's timing stages.
    pub fn with_timing(mut self, timing: TimingLog) -> Self {
        self.timing = Some(timing);
        self
    }

    fn entity_dir(&self, info: &EntityInfo) -> PathBuf {
        let sub = match info.kind {
            EntityKind::Test => TESTS_DIR,
            EntityKind::Fixture => FIXTURES_DIR,
        };
        self.results_dir.join(sub).join(&info.name)
    }

    fn running_mut(&mut self, name: &str) -> Option<&mut Running> {
        self.running.iter_mut().rev().find(|r| r.info.name == name)
    }

    pub async fn handle(&mut self, event: RunEvent) {
        match event {
            RunEvent::RunStart { time } => debug!("Run started at {}", time),
            RunEvent::EntityStart {
                time,
                entity,
                out_dir,
            } => {
                info!("Started {} {}", entity.kind, entity.name);
                let mut result = TestResult::new(&entity.name, &entity.bundle);
                result.start = Some(time);
                result.fixture_chain = self.fixtures.clone();
                if let Some(remote_dir) = out_dir {
                    let dst = self.entity_dir(&entity);
                    result.out_dir = Some(dst.clone());
                    self.pulls.push(PendingPull {
                        name: entity.name.clone(),
                        remote_dir,
                        dst,
                    });
                }
                if entity.kind == EntityKind::Fixture {
                    self.fixtures.push(entity.name.clone());
                }
                self.running.push(Running {
                    info: entity,
                    result,
                });
            }
            RunEvent::EntityLog { name, text, .. } => {
                info!(target: "tether::test", "[{}] {}", name, truncate_for_log(&text, MAX_LOG_LINE));
            }
            RunEvent::EntityError { name, error, .. } => match self.running_mut(&name) {
                Some(running) => {
                    warn!("[{}] Error: {}", name, error.reason);
                    running.result.errors.push(error);
                }
                None => warn!("Error reported for {} which is not running: {}", name, error.reason),
            },
            RunEvent::EntityEnd {
                time,
                name,
                skip_reasons,
                timing,
            } => {
                let Some(idx) = self.running.iter().rposition(|r| r.info.name == name) else {
                    warn!("End reported for {} which is not running", name);
                    return;
                };
                let Running { info, mut result } = self.running.remove(idx);
                if let Some(log) = &self.timing
                    && !timing.is_empty()
                {
                    log.import(timing);
                }
                match info.kind {
                    EntityKind::Fixture => {
                        if let Some(pos) = self.fixtures.iter().rposition(|f| *f == name) {
                            self.fixtures.remove(pos);
                        }
                        debug!("Fixture {} ended with {} error(s)", name, result.errors.len());
                    }
                    EntityKind::Test => {
                        result.end = Some(time);
                        result.skip_reason = skip_reasons.join(", ");
                        self.record(result).await;
                    }
                }
            }
            RunEvent::RunLog { text, .. } => info!(target: "tether::run", "{}", text),
            RunEvent::RunEnd { time } => debug!("Run ended at {}", time),
        }
    }

    async fn record(&mut self, result: TestResult) {
        let outcome = if result.failed() {
            "FAIL"
        } else if result.skipped() {
            "SKIP"
        } else {
            "PASS"
        };
        info!("{} {}", outcome, result.name);
        let path = self.results_dir.join(STREAMED_RESULTS_FILE);
        if let Err(e) = append_json_line(&path, &result).await {
            warn!("Failed to append to {}: {}", path.display(), e);
        }
        self.results.push(result);
    }

    /// Output directories reported so far, for pulling before `finish`.
    pub fn take_pulls(&mut self) -> Vec<PendingPull> {
        std::mem::take(&mut self.pulls)
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Close out the run. With `interrupted`, every test still running gets
    /// an error naming the reason and, if a diagnoser is set, its verdict.
    pub async fn finish(mut self, ctx: &RunContext, interrupted: Option<&str>) -> Vec<TestResult> {
        let unfinished: Vec<Running> = std::mem::take(&mut self.running)
            .into_iter()
            .filter(|r| r.info.kind == EntityKind::Test)
            .collect();
        if unfinished.is_empty() {
            return self.results;
        }

        let reason = interrupted.unwrap_or("run ended before the test did");
        let mut diagnosis = None;
        if interrupted.is_some()
            && let Some(diagnoser) = &self.diagnoser
        {
            let dir = self.entity_dir(&unfinished[0].info);
            diagnosis = diagnoser.diagnose(ctx, &dir).await;
        }
        let message = match &diagnosis {
            Some(diag) => format!("Test did not finish: {reason}; {diag}"),
            None => format!("Test did not finish: {reason}"),
        };

        for Running { mut result, .. } in unfinished {
            result.errors.push(ErrorRecord::new(message.clone()));
            result.end = Some(chrono::Utc::now());
            self.record(result).await;
        }
        self.results
    }
}

async fn append_json_line<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let json = serde_json::to_string(value)?;
    file.write_all(json.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

/// Write the final summary to `<results_dir>/results.json`.
pub async fn write_results(results_dir: &Path, results: &[TestResult]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(results_dir).await?;
    let path = results_dir.join(RESULTS_FILE);
    let json = serde_json::to_vec_pretty(results)?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    struct FixedDiagnosis {
        msg: Option<String>,
        dirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Diagnose for FixedDiagnosis {
        async fn diagnose(&self, _ctx: &RunContext, out_dir: &Path) -> Option<String> {
            self.dirs.lock().unwrap().push(out_dir.to_path_buf());
            self.msg.clone()
        }
    }

    fn start(entity: EntityInfo, out_dir: Option<&str>) -> RunEvent {
        RunEvent::EntityStart {
            time: Utc::now(),
            entity,
            out_dir: out_dir.map(str::to_string),
        }
    }

    fn error(name: &str, reason: &str) -> RunEvent {
        RunEvent::EntityError {
            time: Utc::now(),
            name: name.into(),
            error: ErrorRecord::new(reason),
        }
    }

    fn end(name: &str) -> RunEvent {
        RunEvent::EntityEnd {
            time: Utc::now(),
            name: name.into(),
            skip_reasons: Vec::new(),
            timing: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_results_follow_dispatch_order_and_skip_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = Processor::new(dir.path());
        for event in [
            RunEvent::RunStart { time: Utc::now() },
            start(EntityInfo::fixture("fixt.Boot", "cros"), None),
            start(EntityInfo::test("example.A", "cros").with_fixture("fixt.Boot"), Some("/tmp/a")),
            error("example.A", "boom"),
            end("example.A"),
            start(EntityInfo::test("example.B", "cros").with_fixture("fixt.Boot"), None),
            end("example.B"),
            end("fixt.Boot"),
            start(EntityInfo::test("example.C", "cros"), None),
            end("example.C"),
            RunEvent::RunEnd { time: Utc::now() },
        ] {
            processor.handle(event).await;
        }

        let pulls = processor.take_pulls();
        assert_eq!(
            pulls,
            vec![PendingPull {
                name: "example.A".into(),
                remote_dir: "/tmp/a".into(),
                dst: dir.path().join("tests/example.A"),
            }]
        );

        let results = processor.finish(&RunContext::new(), None).await;
        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["example.A", "example.B", "example.C"]);
        assert!(results[0].failed());
        assert_eq!(results[0].fixture_chain, ["fixt.Boot"]);
        assert!(!results[1].failed());
        assert!(results[2].fixture_chain.is_empty());
    }

    #[tokio::test]
    async fn test_every_ended_test_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = Processor::new(dir.path());
        processor.handle(start(EntityInfo::test("example.A", "cros"), None)).await;
        processor.handle(end("example.A")).await;
        processor.finish(&RunContext::new(), None).await;

        let mut second = Processor::new(dir.path());
        second.handle(start(EntityInfo::test("example.A", "cros"), None)).await;
        second.handle(end("example.A")).await;
        second.finish(&RunContext::new(), None).await;

        let streamed = std::fs::read_to_string(dir.path().join(STREAMED_RESULTS_FILE)).unwrap();
        let lines: Vec<TestResult> = streamed
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|r| r.name == "example.A"));
    }

    #[tokio::test]
    async fn test_skip_reasons_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = Processor::new(dir.path());
        processor.handle(start(EntityInfo::test("example.Skip", "cros"), None)).await;
        processor
            .handle(RunEvent::EntityEnd {
                time: Utc::now(),
                name: "example.Skip".into(),
                skip_reasons: vec!["missing SoftwareDeps: a".into(), "missing SoftwareDeps: b".into()],
                timing: Vec::new(),
            })
            .await;
        let results = processor.finish(&RunContext::new(), None).await;
        assert!(results[0].skipped());
        assert_eq!(results[0].skip_reason, "missing SoftwareDeps: a, missing SoftwareDeps: b");
    }

    #[tokio::test]
    async fn test_interrupted_test_gets_diagnosis() {
        let dir = tempfile::tempdir().unwrap();
        let diagnoser = Arc::new(FixedDiagnosis {
            msg: Some("target did not reboot, probably network issue.".into()),
            dirs: Mutex::new(Vec::new()),
        });
        let mut processor = Processor::new(dir.path()).with_diagnoser(diagnoser.clone());
        processor.handle(start(EntityInfo::test("example.Hang", "cros"), None)).await;

        let results = processor
            .finish(&RunContext::new(), Some("connection lost"))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].errors[0].reason,
            "Test did not finish: connection lost; target did not reboot, probably network issue."
        );
        assert_eq!(
            diagnoser.dirs.lock().unwrap().as_slice(),
            &[dir.path().join("tests/example.Hang")]
        );
    }

    #[tokio::test]
    async fn test_unknown_entities_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = Processor::new(dir.path());
        processor.handle(error("example.Ghost", "boo")).await;
        processor.handle(end("example.Ghost")).await;
        assert!(processor.finish(&RunContext::new(), None).await.is_empty());
    }

    #[tokio::test]
    async fn test_timing_is_imported() {
        let dir = tempfile::tempdir().unwrap();
        let timing = TimingLog::new();
        let mut processor = Processor::new(dir.path()).with_timing(timing.clone());
        processor.handle(start(EntityInfo::test("example.A", "cros"), None)).await;
        let stage = tether_common::timing::Stage {
            name: "example.A".into(),
            start: Utc::now(),
            end: Some(Utc::now()),
            children: Vec::new(),
        };
        processor
            .handle(RunEvent::EntityEnd {
                time: Utc::now(),
                name: "example.A".into(),
                skip_reasons: Vec::new(),
                timing: vec![stage],
            })
            .await;
        assert_eq!(timing.stages().len(), 1);
    }

    #[tokio::test]
    async fn test_write_results_creates_summary() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![TestResult::new("example.A", "cros")];
        let path = write_results(&dir.path().join("out"), &results).await.unwrap();
        let parsed: Vec<TestResult> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed, results);
    }
}
