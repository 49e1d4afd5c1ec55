//! Runs tests and fixtures from a [`Registry`], reporting [`RunEvent`]s.
//!
//! Tests run one at a time in registry order. Fixtures are set up lazily
//! when a test needs them and torn down as soon as the next test no longer
//! does; whatever is still up is torn down after the last test.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tether_common::protocol::{RunConfig, RunEvent};
use tether_common::rpc::{OutDirRegistry, Status};
use tether_common::{EntityInfo, EntityKind, ErrorRecord, StartFixtureState, TimingLog};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{Body, EntityState, Note, Registry};

/// Where run events go.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: RunEvent) -> Result<(), Status>;
}

pub fn fixture_failure(fixture: &str, reason: &str) -> String {
    format!("[Fixture failure] {fixture}: {reason}")
}

#[derive(Debug, Clone)]
struct SetupFailure {
    fixture: String,
    reason: String,
}

impl SetupFailure {
    fn message(&self) -> String {
        fixture_failure(&self.fixture, &self.reason)
    }
}

/// A fixture whose start event has been sent and whose end event is due
/// after teardown.
struct ActiveFixture {
    name: String,
    /// First set-up error of this fixture or one of its parents.
    failure: Option<SetupFailure>,
    teardown: Option<Body>,
    out_dir: Option<PathBuf>,
    timing: TimingLog,
}

/// Shared by test runs and remote-fixture pushes.
pub struct Executor<'a> {
    registry: &'a Registry,
    out_dirs: &'a OutDirRegistry,
    out_base: PathBuf,
    vars: Arc<BTreeMap<String, String>>,
    active: Vec<ActiveFixture>,
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a Registry, out_dirs: &'a OutDirRegistry, config: &RunConfig) -> Self {
        Self {
            registry,
            out_dirs,
            out_base: PathBuf::from(&config.out_dir),
            vars: Arc::new(config.vars.clone()),
            active: Vec::new(),
        }
    }

    /// Create and register `<out_dir>/<tests|fixtures>/<name>`.
    async fn out_dir(&self, info: &EntityInfo) -> Option<PathBuf> {
        if self.out_base.as_os_str().is_empty() {
            return None;
        }
        let sub = match info.kind {
            EntityKind::Test => "tests",
            EntityKind::Fixture => "fixtures",
        };
        let dir = self.out_base.join(sub).join(&info.name);
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {
                self.out_dirs.register(dir.clone());
                Some(dir)
            }
            Err(e) => {
                warn!("Failed to create output directory {}: {}", dir.display(), e);
                None
            }
        }
    }

    async fn start(
        &self,
        sink: &dyn EventSink,
        info: &EntityInfo,
        out_dir: Option<&PathBuf>,
    ) -> Result<(), Status> {
        sink.emit(RunEvent::EntityStart {
            time: Utc::now(),
            entity: info.clone(),
            out_dir: out_dir.map(|d| d.display().to_string()),
        })
        .await
    }

    async fn error(
        &self,
        sink: &dyn EventSink,
        name: &str,
        reason: impl Into<String>,
    ) -> Result<(), Status> {
        sink.emit(RunEvent::EntityError {
            time: Utc::now(),
            name: name.to_string(),
            error: ErrorRecord::new(reason),
        })
        .await
    }

    async fn end(
        &self,
        sink: &dyn EventSink,
        name: &str,
        skip_reasons: Vec<String>,
        timing: &TimingLog,
    ) -> Result<(), Status> {
        sink.emit(RunEvent::EntityEnd {
            time: Utc::now(),
            name: name.to_string(),
            skip_reasons,
            timing: timing.stages(),
        })
        .await
    }

    /// Run `body` and forward what it reported. Returns the first error.
    async fn invoke(
        &self,
        sink: &dyn EventSink,
        name: &str,
        body: &Body,
        out_dir: Option<PathBuf>,
    ) -> Result<Option<String>, Status> {
        let mut state = EntityState::new(self.vars.clone(), out_dir);
        body(&mut state);
        let mut first_error = None;
        for note in state.into_notes() {
            match note {
                Note::Log(text) => {
                    sink.emit(RunEvent::EntityLog {
                        time: Utc::now(),
                        name: name.to_string(),
                        text,
                    })
                    .await?
                }
                Note::Error(reason) => {
                    self.error(sink, name, reason.clone()).await?;
                    first_error.get_or_insert(reason);
                }
            }
        }
        Ok(first_error)
    }

    /// Make the fixture stack equal `chain`, tearing down what is no longer
    /// needed and setting up what is missing.
    pub async fn sync_fixtures(
        &mut self,
        sink: &dyn EventSink,
        chain: &[String],
    ) -> Result<(), Status> {
        let keep = self
            .active
            .iter()
            .zip(chain)
            .take_while(|(active, name)| active.name == **name)
            .count();
        while self.active.len() > keep {
            self.pop_fixture(sink).await?;
        }
        for name in &chain[keep..] {
            self.push_fixture(sink, name).await?;
        }
        Ok(())
    }

    async fn push_fixture(&mut self, sink: &dyn EventSink, name: &str) -> Result<(), Status> {
        let registry = self.registry;
        let Some(def) = registry.fixture(name) else {
            return Err(Status::not_found(format!("no fixture {name}")));
        };
        let inherited = self.active.last().and_then(|a| a.failure.clone());
        let timing = TimingLog::new();
        let out_dir = self.out_dir(&def.info).await;
        self.start(sink, &def.info, out_dir.as_ref()).await?;

        let failure = match inherited {
            Some(parent) => {
                debug!("Not setting up {} under failed fixture {}", name, parent.fixture);
                Some(parent)
            }
            None => {
                let stage = timing.start(format!("setup {name}"));
                let error = self.invoke(sink, name, &def.setup, out_dir.clone()).await?;
                stage.end();
                error.map(|reason| SetupFailure {
                    fixture: name.to_string(),
                    reason,
                })
            }
        };
        match &failure {
            Some(f) => warn!("Fixture {} is unusable: {}", name, f.message()),
            None => info!("Set up fixture {}", name),
        }
        self.active.push(ActiveFixture {
            name: name.to_string(),
            failure,
            teardown: def.teardown.clone(),
            out_dir,
            timing,
        });
        Ok(())
    }

    /// Tear down the innermost fixture; fixtures whose set-up did not
    /// succeed skip teardown.
    async fn pop_fixture(&mut self, sink: &dyn EventSink) -> Result<(), Status> {
        let Some(fixture) = self.active.pop() else {
            return Ok(());
        };
        if let (Some(teardown), None) = (&fixture.teardown, &fixture.failure) {
            let stage = fixture.timing.start(format!("teardown {}", fixture.name));
            self.invoke(sink, &fixture.name, teardown, fixture.out_dir.clone()).await?;
            stage.end();
        }
        debug!("Tore down fixture {}", fixture.name);
        self.end(sink, &fixture.name, Vec::new(), &fixture.timing).await
    }

    pub async fn teardown_all(&mut self, sink: &dyn EventSink) -> Result<(), Status> {
        while !self.active.is_empty() {
            self.pop_fixture(sink).await?;
        }
        Ok(())
    }

    /// Set-up errors of the innermost active fixture chain, for reporting a
    /// pushed fixture's state.
    pub fn setup_errors(&self) -> Vec<String> {
        let Some(innermost) = self.active.last() else {
            return Vec::new();
        };
        match &innermost.failure {
            Some(f) if f.fixture == innermost.name => vec![f.reason.clone()],
            Some(f) => vec![format!("{}: {}", f.fixture, f.reason)],
            None => Vec::new(),
        }
    }

    async fn run_test(
        &mut self,
        sink: &dyn EventSink,
        info: &EntityInfo,
        body: &Body,
        config: &RunConfig,
        features: &HashSet<&str>,
    ) -> Result<(), Status> {
        let (chain, remote) = self.registry.fixture_chain(&info.fixture);
        self.sync_fixtures(sink, &chain).await?;

        let timing = TimingLog::new();
        let out_dir = self.out_dir(info).await;
        self.start(sink, info, out_dir.as_ref()).await?;

        let mut failures: Vec<String> = self
            .active
            .last()
            .and_then(|a| a.failure.as_ref())
            .map(SetupFailure::message)
            .into_iter()
            .collect();
        if let (Some(remote), Some(StartFixtureState { name, setup_errors })) =
            (&remote, &config.start_fixture)
            && remote == name
        {
            failures.extend(setup_errors.iter().map(|e| fixture_failure(name, e)));
        }
        let missing: Vec<&str> = info
            .software_deps
            .iter()
            .map(String::as_str)
            .filter(|dep| !features.contains(dep))
            .collect();

        let mut skip_reasons = Vec::new();
        if !failures.is_empty() {
            for reason in failures {
                self.error(sink, &info.name, reason).await?;
            }
        } else if !missing.is_empty() {
            skip_reasons.push(format!("missing SoftwareDeps: {}", missing.join(", ")));
        } else {
            let stage = timing.start(info.name.clone());
            self.invoke(sink, &info.name, body, out_dir).await?;
            stage.end();
        }
        self.end(sink, &info.name, skip_reasons, &timing).await
    }

    /// Run the requested tests in registry order.
    pub async fn run_tests(
        &mut self,
        sink: &dyn EventSink,
        names: &[String],
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> Result<(), Status> {
        sink.emit(RunEvent::RunStart { time: Utc::now() }).await?;
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let known: HashSet<&str> = self
            .registry
            .tests()
            .iter()
            .map(|t| t.info.name.as_str())
            .collect();
        for name in names.iter().filter(|n| !known.contains(n.as_str())) {
            sink.emit(RunEvent::RunLog {
                time: Utc::now(),
                text: format!("No such test: {name}"),
            })
            .await?;
        }
        let features: HashSet<&str> = config.features.iter().map(String::as_str).collect();
        let registry = self.registry;

        for test in registry.tests().iter().filter(|t| wanted.contains(t.info.name.as_str())) {
            if cancel.is_cancelled() {
                warn!("Run cancelled before {}", test.info.name);
                break;
            }
            self.run_test(sink, &test.info, &test.body, config, &features).await?;
        }
        self.teardown_all(sink).await?;
        sink.emit(RunEvent::RunEnd { time: Utc::now() }).await
    }
}
