//! SSH-backed target connections (`openssh` multiplexed sessions).

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use openssh::{Child, ForwardType, KnownHosts, Session, SessionBuilder, Stdio};
use tether_common::process::ChildProcess;
use tether_common::util::shell_join;
use tether_common::{PipeConn, RunContext};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{Connector, TargetConn, TargetError, TargetSpec};
use crate::config::TargetSettings;

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub key_file: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Extra attempts after the first failed connect.
    pub connect_retries: u32,
    pub retry_interval: Duration,
}

impl From<&TargetSettings> for SshOptions {
    fn from(settings: &TargetSettings) -> Self {
        Self {
            key_file: settings.key_file.clone(),
            connect_timeout: settings.connect_timeout,
            connect_retries: settings.connect_retries,
            retry_interval: settings.connect_retry_interval,
        }
    }
}

pub struct SshConnector {
    target: TargetSpec,
    options: SshOptions,
}

impl SshConnector {
    pub fn new(target: TargetSpec, options: SshOptions) -> Self {
        Self { target, options }
    }

    async fn connect_once(&self) -> Result<Session, openssh::Error> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(self.options.connect_timeout);
        if let Some(user) = &self.target.user {
            builder.user(user.clone());
        }
        if let Some(port) = self.target.port {
            builder.port(port);
        }
        if let Some(key) = &self.options.key_file {
            builder.keyfile(key);
        }
        builder.connect(&self.target.host).await
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, ctx: &RunContext) -> Result<Arc<dyn TargetConn>, TargetError> {
        let attempts = self.options.connect_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match ctx.run(self.connect_once()).await? {
                Ok(session) => {
                    info!("Connected to {} (attempt {}/{})", self.target, attempt, attempts);
                    return Ok(Arc::new(SshConn::new(self.target.clone(), session)));
                }
                Err(e) => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}",
                        self.target, attempt, attempts, e
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                ctx.run(tokio::time::sleep(self.options.retry_interval)).await?;
            }
        }
        Err(TargetError::Connect {
            target: self.target.to_string(),
            attempts,
            reason: last_error,
        })
    }
}

/// One multiplexed SSH session to the device.
pub struct SshConn {
    target: TargetSpec,
    session: Mutex<Option<Arc<Session>>>,
}

impl std::fmt::Debug for SshConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConn")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn command_error(command: impl Into<String>, err: impl std::fmt::Display) -> TargetError {
    TargetError::Command {
        command: command.into(),
        reason: err.to_string(),
    }
}

fn forward_error(err: openssh::Error) -> TargetError {
    TargetError::Forward(err.to_string())
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

impl SshConn {
    fn new(target: TargetSpec, session: Session) -> Self {
        Self {
            target,
            session: Mutex::new(Some(Arc::new(session))),
        }
    }

    fn session(&self) -> Result<Arc<Session>, TargetError> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(TargetError::Closed)
    }
}

#[async_trait]
impl TargetConn for SshConn {
    fn target(&self) -> &TargetSpec {
        &self.target
    }

    async fn ping(&self, timeout: Duration) -> Result<(), TargetError> {
        let session = self.session()?;
        let status = tokio::time::timeout(timeout, session.command("true").status())
            .await
            .map_err(|_| TargetError::PingTimeout(timeout))?
            .map_err(|e| command_error("true", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(command_error("true", status))
        }
    }

    async fn run(&self, argv: &[&str]) -> Result<Vec<u8>, TargetError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| command_error("", "empty command line"))?;
        let session = self.session()?;
        let line = argv.join(" ");
        debug!("Running on {}: {}", self.target, line);
        let output = session
            .command(*program)
            .args(args.iter().copied())
            .output()
            .await
            .map_err(|e| command_error(line.clone(), e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(command_error(
                line,
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }

    async fn start_bundle(
        &self,
        argv: &[String],
        kill_session: bool,
    ) -> Result<(PipeConn, Box<dyn ChildProcess>), TargetError> {
        let session = self.session()?;
        let line = shell_join(argv);
        // The first stdout line is the shell's pid; exec keeps it for the bundle.
        let script = format!("echo $$; exec {line}");
        let mut command = session.clone().arc_command("sh");
        command
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command
            .spawn()
            .await
            .map_err(|e| command_error(line.clone(), e))?;

        let (Some(stdin), Some(stdout)) = (child.stdin().take(), child.stdout().take()) else {
            return Err(command_error(line, "remote process has no stdio pipes"));
        };
        let mut reader = BufReader::new(stdout);
        let mut pid_line = String::new();
        reader.read_line(&mut pid_line).await?;
        let pid: u32 = pid_line
            .trim()
            .parse()
            .map_err(|_| command_error(line.clone(), format!("bad pid line {pid_line:?}")))?;
        debug!("Started {} on {} as pid {}", line, self.target, pid);

        let conn = PipeConn::new(reader, stdin).with_peer(format!("{}:{}", self.target, line));
        let process = RemoteProcess {
            session,
            child: Some(child),
            pid,
            kill_session,
        };
        Ok((conn, Box::new(process)))
    }

    async fn forward_remote(&self, remote_port: u16, local: SocketAddr) -> Result<(), TargetError> {
        let session = self.session()?;
        session
            .request_port_forward(ForwardType::Remote, loopback(remote_port), local)
            .await
            .map_err(forward_error)?;
        debug!("Forwarding {}:{} to {}", self.target, remote_port, local);
        Ok(())
    }

    async fn cancel_forward(&self, remote_port: u16, local: SocketAddr) -> Result<(), TargetError> {
        let session = self.session()?;
        session
            .close_port_forward(ForwardType::Remote, loopback(remote_port), local)
            .await
            .map_err(forward_error)
    }

    async fn close(&self) -> Result<(), TargetError> {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(session) = session else {
            return Ok(());
        };
        // Running bundles may still hold the session; it closes when they drop it.
        match Arc::try_unwrap(session) {
            Ok(session) => session
                .close()
                .await
                .map_err(|e| command_error("ssh -O exit", e)),
            Err(_) => {
                debug!("Session to {} still shared; dropping our handle", self.target);
                Ok(())
            }
        }
    }
}

/// A bundle started over SSH.
struct RemoteProcess {
    session: Arc<Session>,
    child: Option<Child<Arc<Session>>>,
    pid: u32,
    kill_session: bool,
}

#[async_trait]
impl ChildProcess for RemoteProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn terminate(&mut self) -> io::Result<()> {
        let pid = self.pid.to_string();
        // The remote shell is a session leader, so its pid is the session id.
        let argv: [&str; 3] = if self.kill_session {
            ["pkill", "-KILL", "-s"]
        } else {
            ["kill", "-KILL", "--"]
        };
        let status = self
            .session
            .command(argv[0])
            .args(&argv[1..])
            .arg(&pid)
            .status()
            .await
            .map_err(|e| io::Error::other(e.to_string()))?;
        debug!("{} {} exited with {}", argv.join(" "), pid, status);

        if let Some(child) = self.child.take() {
            // Death by SIGKILL is the expected outcome here.
            match child.wait().await {
                Ok(status) => debug!("Remote bundle {} exited with {}", pid, status),
                Err(e) => debug!("Remote bundle {} wait failed: {}", pid, e),
            }
        }
        Ok(())
    }
}
