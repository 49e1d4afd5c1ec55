//! tether - run test bundles on a device over SSH.
//!
//! The host CLI connects to the target, starts the device-side bundle
//! through the SSH connection and the host-side bundle as a child process,
//! and drives both over the tether RPC transport.

#[cfg(not(unix))]
compile_error!("tether reaches targets through openssh, which needs a unix host");

mod config;
mod diagnose;
mod driver;
mod processor;
mod target;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tether_common::config::{Sourced, parse_key_value};
use tether_common::{ErrorCode, LogConfig, RunContext, TestResult, TimingLog, init_logging};
use tracing::{debug, error, info, warn};

use config::{ConfigError, SourceMap, TetherConfig};
use diagnose::Diagnoser;
use driver::bundle::{BundleRunner, BundleSettings, DeviceLauncher, HostLauncher};
use driver::{Driver, DriverConfig, resolve_tests};
use target::{ConnCache, Connector, ServiceOptions, SshConnector, SshOptions, TargetSpec};

const EXIT_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;
const TIMING_FILE: &str = "timing.json";

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about = "Run test bundles on a device over SSH")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run matching tests and write their results
    Run(RunArgs),
    /// List matching tests
    List(ListArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Extra attempts for a failing test
    #[arg(long)]
    retries: Option<u32>,

    /// Stop after this many failing results (0 = unlimited)
    #[arg(long)]
    max_test_failures: Option<u32>,

    /// Directory receiving results and test output
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Runtime variable, repeatable
    #[arg(long = "var", value_name = "K=V", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// [user@]host[:port]
    target: String,

    /// Glob patterns over test names; none selects every test
    patterns: Vec<String>,
}

#[derive(Args, Debug)]
struct ListArgs {
    /// [user@]host[:port]
    target: String,

    patterns: Vec<String>,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    parse_key_value(raw).ok_or_else(|| ErrorCode::ConfigInvalidVar.entry().format_brief())
}

/// A fatal outcome with its catalog entry.
#[derive(Debug)]
struct Fatal {
    code: ErrorCode,
    message: String,
}

impl Fatal {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn report(&self) -> ExitCode {
        error!("{}", self.message);
        eprint!("{}", self.code.entry().format_full());
        ExitCode::from(EXIT_FATAL)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _guards = match init_logging(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("{}: {}", ErrorCode::InternalLoggingError.entry().format_brief(), e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let (config, sources) = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(fatal) => return fatal.report(),
    };

    let outcome = match cli.command {
        Commands::Run(args) => run(config, sources, args).await,
        Commands::List(args) => {
            log_sources(&sources);
            list(config, args).await
        }
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<(TetherConfig, SourceMap), Fatal> {
    let to_fatal = |e: ConfigError| Fatal::new(e.code(), e.to_string());
    let (mut config, path) = TetherConfig::load_file(explicit).map_err(to_fatal)?;
    let mut sources = SourceMap::new();
    config.apply_env(&mut sources).map_err(to_fatal)?;
    if let Some(path) = path {
        debug!("Using config file {}", path.display());
    }
    Ok((config, sources))
}

fn log_sources(sources: &SourceMap) {
    for (key, source) in sources {
        debug!("{} set by {}", key, source);
    }
}

/// Command-line flags win over every other layer.
fn apply_run_args(config: &mut TetherConfig, args: &RunArgs, sources: &mut SourceMap) {
    let r = &mut config.run;
    if let Some(retries) = args.retries {
        config::set(&mut r.retries, Sourced::from_cli(retries, "retries"), "run.retries", sources);
    }
    if let Some(max) = args.max_test_failures {
        let max = Sourced::from_cli(max, "max-test-failures");
        config::set(&mut r.max_test_failures, max, "run.max_test_failures", sources);
    }
    if let Some(dir) = &args.results_dir {
        let dir = Sourced::from_cli(Some(dir.clone()), "results-dir");
        config::set(&mut r.results_dir, dir, "run.results_dir", sources);
    }
    if !args.vars.is_empty() {
        let vars = Sourced::from_cli(args.vars.clone(), "var");
        sources.insert("run.vars", vars.source.clone());
        r.vars.extend(vars.into_value());
    }
}

fn compile_patterns(raw: &[String]) -> Result<Vec<glob::Pattern>, Fatal> {
    raw.iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| {
                Fatal::new(ErrorCode::ConfigInvalidPattern, format!("invalid pattern {p:?}: {e}"))
            })
        })
        .collect()
}

fn default_results_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("tether")
        .join("results")
        .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string())
}

/// Everything a run or listing needs, torn down by [`Session::close`].
struct Session {
    ctx: RunContext,
    cache: Arc<ConnCache>,
    local: Arc<BundleRunner>,
    remote: Arc<BundleRunner>,
    timing: TimingLog,
    results_dir: PathBuf,
    _host_out: tempfile::TempDir,
}

impl Session {
    fn open(config: &TetherConfig, host: &str, results_dir: PathBuf) -> Result<Self, Fatal> {
        let spec: TargetSpec = host
            .parse()
            .map_err(|e: target::TargetError| Fatal::new(ErrorCode::ConfigInvalidTarget, e.to_string()))?;
        let host_out = tempfile::Builder::new()
            .prefix("tether-host-out")
            .tempdir()
            .map_err(|e| Fatal::new(ErrorCode::InternalStateError, format!("host output dir: {e}")))?;

        let ctx = RunContext::new().with_timeout(config.run.timeout);
        let cancel = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; canceling run");
                cancel.cancel();
            }
        });

        let connector: Arc<dyn Connector> =
            Arc::new(SshConnector::new(spec, SshOptions::from(&config.target)));
        let cache = Arc::new(
            ConnCache::new(connector, ServiceOptions::from(&config.services))
                .with_ping_timeout(config.target.ping_timeout),
        );

        let timing = TimingLog::new();
        let settings = |out_dir: String| BundleSettings {
            out_dir,
            vars: config.run.vars.clone(),
            features: config.run.features.clone(),
            results_dir: results_dir.clone(),
        };
        let local_argv = vec![
            config.run.local_bundle.clone(),
            "--role".to_string(),
            "local".to_string(),
            "rpc".to_string(),
        ];
        let local = BundleRunner::new(
            "local",
            Arc::new(DeviceLauncher::new(cache.clone(), local_argv, config.target.kill_session)),
            settings(config.run.device_out_dir.clone()),
        )
        .with_diagnoser(Arc::new(Diagnoser::new(cache.clone())))
        .with_timing(timing.clone());
        let remote = BundleRunner::new(
            "remote",
            Arc::new(HostLauncher::new(
                &config.run.remote_bundle,
                vec!["--role".into(), "remote".into(), "rpc".into()],
            )),
            settings(host_out.path().display().to_string()),
        )
        .with_timing(timing.clone());

        Ok(Self {
            ctx,
            cache,
            local: Arc::new(local),
            remote: Arc::new(remote),
            timing,
            results_dir,
            _host_out: host_out,
        })
    }

    async fn resolve(&self, patterns: &[glob::Pattern]) -> Result<Vec<tether_common::ResolvedEntity>, Fatal> {
        let local = self
            .local
            .list_entities(&self.ctx)
            .await
            .map_err(|e| Fatal::new(e.code(), format!("listing device-side tests: {e}")))?;
        let remote = self
            .remote
            .list_entities(&self.ctx)
            .await
            .map_err(|e| Fatal::new(e.code(), format!("listing host-side tests: {e}")))?;
        Ok(resolve_tests(&local, &remote, patterns))
    }

    async fn close(self) {
        self.cache.close().await;
    }
}

async fn list(config: TetherConfig, args: ListArgs) -> Result<ExitCode> {
    let patterns = match compile_patterns(&args.patterns) {
        Ok(patterns) => patterns,
        Err(fatal) => return Ok(fatal.report()),
    };
    let session = match Session::open(&config, &args.target, std::env::temp_dir()) {
        Ok(session) => session,
        Err(fatal) => return Ok(fatal.report()),
    };
    let resolved = session.resolve(&patterns).await;
    session.close().await;
    match resolved {
        Ok(tests) => {
            for test in &tests {
                let side = if test.runs_on_device() { "device" } else { "host" };
                println!("{}\t{}\t{}", test.name(), test.entity.bundle, side);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(fatal) => Ok(fatal.report()),
    }
}

async fn run(mut config: TetherConfig, mut sources: SourceMap, args: RunArgs) -> Result<ExitCode> {
    apply_run_args(&mut config, &args, &mut sources);
    log_sources(&sources);
    let patterns = match compile_patterns(&args.patterns) {
        Ok(patterns) => patterns,
        Err(fatal) => return Ok(fatal.report()),
    };
    let results_dir = config.run.results_dir.clone().unwrap_or_else(default_results_dir);
    tokio::fs::create_dir_all(&results_dir)
        .await
        .with_context(|| format!("failed to create {}", results_dir.display()))?;
    info!("Writing results to {}", results_dir.display());

    let session = match Session::open(&config, &args.target, results_dir) {
        Ok(session) => session,
        Err(fatal) => return Ok(fatal.report()),
    };
    let tests = match session.resolve(&patterns).await {
        Ok(tests) if tests.is_empty() => {
            session.close().await;
            return Ok(Fatal::new(ErrorCode::RunNoTestsMatched, "no test matched").report());
        }
        Ok(tests) => tests,
        Err(fatal) => {
            session.close().await;
            return Ok(fatal.report());
        }
    };

    let driver = Driver::new(
        DriverConfig {
            max_retries: config.run.retries,
            max_test_failures: config.run.max_test_failures,
            primary_bundle: config.run.primary_bundle.clone(),
        },
        session.local.clone(),
        session.remote.clone(),
        session.remote.clone(),
    );
    let (results, fatal) = match driver.run(&session.ctx, tests).await {
        Ok(results) => (results, None),
        Err(partial) => {
            let fatal = Fatal::new(partial.source.code(), partial.source.to_string());
            (partial.results, Some(fatal))
        }
    };

    let results_dir = session.results_dir.clone();
    write_timing(&results_dir, &session.timing).await;
    session.close().await;

    if let Err(e) = processor::write_results(&results_dir, &results).await {
        return Ok(Fatal::new(
            ErrorCode::TransferResultsWriteFailed,
            format!("failed to write results to {}: {e}", results_dir.display()),
        )
        .report());
    }
    summarize(&results);

    if let Some(fatal) = fatal {
        return Ok(fatal.report());
    }
    if results.iter().any(TestResult::failed) {
        return Ok(ExitCode::from(EXIT_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

async fn write_timing(results_dir: &Path, timing: &TimingLog) {
    let path = results_dir.join(TIMING_FILE);
    let written = match serde_json::to_vec_pretty(&timing.stages()) {
        Ok(json) => tokio::fs::write(&path, json).await,
        Err(e) => Err(std::io::Error::other(e)),
    };
    if let Err(e) = written {
        warn!("Failed to write {}: {}", path.display(), e);
    }
}

fn summarize(results: &[TestResult]) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for result in results {
        let outcome = if result.failed() {
            "failed"
        } else if result.skipped() {
            "skipped"
        } else {
            "passed"
        };
        *counts.entry(outcome).or_default() += 1;
        if result.failed() {
            for err in &result.errors {
                warn!("{}: {}", result.name, err.reason);
            }
        }
    }
    info!(
        "{} test(s): {} passed, {} failed, {} skipped",
        results.len(),
        counts.get("passed").copied().unwrap_or(0),
        counts.get("failed").copied().unwrap_or(0),
        counts.get("skipped").copied().unwrap_or(0)
    );
}
