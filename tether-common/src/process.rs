//! Peer process lifecycle.
//!
//! An RPC client may own the process on the other end of its pipe. Closing
//! the client terminates that process through [`ChildProcess`]; local
//! subprocesses and remote SSH commands provide their own implementations.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;
use tracing::debug;

/// How many times a process group is swept with SIGKILL. Children forked
/// between sweeps are caught by the next one.
pub const KILL_PASSES: usize = 3;

const KILL_PASS_INTERVAL: Duration = Duration::from_millis(50);

/// A process whose lifetime is tied to an RPC client.
#[async_trait]
pub trait ChildProcess: Send {
    /// Process id, if known.
    fn id(&self) -> Option<u32>;

    /// Forcibly stop the process and wait for it to exit. Exiting because of
    /// the kill itself is not an error.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// A subprocess spawned on this machine.
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
    kill_session: bool,
}

impl LocalProcess {
    /// `kill_session` means the child leads its own process group and the
    /// whole group is killed on terminate.
    pub fn new(child: Child, kill_session: bool) -> Self {
        Self {
            child,
            kill_session,
        }
    }
}

#[async_trait]
impl ChildProcess for LocalProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> io::Result<()> {
        if let Some(pid) = self.child.id() {
            if self.kill_session {
                kill_process_group(pid).await;
            }
        }
        // Already-exited children make start_kill fail; wait() below still
        // reaps them.
        let _ = self.child.start_kill();
        let status = self.child.wait().await?;
        check_exit(status)
    }
}

/// Accept a clean exit or death by SIGKILL; anything else is reported.
pub fn check_exit(status: ExitStatus) -> io::Result<()> {
    if status.success() || killed_by_sigkill(status) {
        return Ok(());
    }
    Err(io::Error::other(format!("process exited with {status}")))
}

#[cfg(unix)]
fn killed_by_sigkill(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: ExitStatus) -> bool {
    false
}

/// Sweep a process group with SIGKILL until it is gone or
/// [`KILL_PASSES`] sweeps have been made.
pub async fn kill_process_group(pgid: u32) {
    for pass in 0..KILL_PASSES {
        let status = tokio::process::Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{pgid}"))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => {
                debug!(pgid, pass, "Swept process group");
            }
            Ok(_) => {
                debug!(pgid, pass, "Process group gone");
                return;
            }
            Err(e) => {
                debug!(pgid, pass, "Failed to spawn kill: {}", e);
                return;
            }
        }
        tokio::time::sleep(KILL_PASS_INTERVAL).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_terminate_plain_child() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let mut process = LocalProcess::new(child, false);
        assert!(process.id().is_some());
        tokio::time::timeout(Duration::from_secs(10), process.terminate())
            .await
            .expect("terminate hung")
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminate_kills_whole_group() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30")
            .process_group(0)
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let mut process = LocalProcess::new(child, true);
        tokio::time::timeout(Duration::from_secs(10), process.terminate())
            .await
            .expect("terminate hung")
            .unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let mut child = Command::new("sh").arg("-c").arg("exit 3").spawn().unwrap();
        let status = child.wait().await.unwrap();
        let err = check_exit(status).unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_ok() {
        let child = Command::new("true").spawn().unwrap();
        let mut process = LocalProcess::new(child, false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.terminate().await.unwrap();
    }
}
