//! Post-mortem for a lost target connection.
//!
//! When a run is interrupted the processor asks the [`Diagnoser`] for a
//! one-line cause. The diagnoser reconnects, compares boot ids, and when
//! the device rebooted saves and inspects the previous boot's system log
//! and the console ramoops.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tether_common::RunContext;
use tracing::{debug, info, warn};

use crate::target::{ConnCache, SSH_PING_TIMEOUT, TargetConn};

pub const UNIFIED_LOGS_FILE: &str = "unified-logs.before-reboot.txt";
pub const RAMOOPS_FILE: &str = "console-ramoops.txt";
pub const RAMOOPS_PATH: &str = "/sys/fs/pstore/console-ramoops-0";
const SYSLOG_LINES: usize = 1000;

pub const MSG_NO_REBOOT: &str = "target did not reboot, probably network issue.";
pub const MSG_UNKNOWN_CRASH: &str = "target rebooted for unknown crash.";

/// Explains why the target went away. Never fails; `None` means the
/// connection looks fine or there was no time to look.
#[async_trait]
pub trait Diagnose: Send + Sync {
    async fn diagnose(&self, ctx: &RunContext, out_dir: &Path) -> Option<String>;
}

pub struct Diagnoser {
    cache: Arc<ConnCache>,
}

impl Diagnoser {
    pub fn new(cache: Arc<ConnCache>) -> Self {
        Self { cache }
    }

    async fn ping_ok(&self, ctx: &RunContext) -> bool {
        let Some(conn) = self.cache.conn() else {
            return false;
        };
        matches!(ctx.run(conn.ping(SSH_PING_TIMEOUT)).await, Ok(Ok(())))
    }

    async fn fetch(&self, ctx: &RunContext, conn: &dyn TargetConn, argv: &[&str]) -> Option<String> {
        match ctx.run(conn.run(argv)).await {
            Ok(Ok(out)) => Some(String::from_utf8_lossy(&out).into_owned()),
            Ok(Err(e)) => {
                debug!("Failed to fetch `{}`: {}", argv.join(" "), e);
                None
            }
            Err(e) => {
                debug!("Gave up fetching `{}`: {}", argv.join(" "), e);
                None
            }
        }
    }
}

#[async_trait]
impl Diagnose for Diagnoser {
    async fn diagnose(&self, ctx: &RunContext, out_dir: &Path) -> Option<String> {
        if let Some(remaining) = ctx.remaining()
            && remaining < SSH_PING_TIMEOUT
        {
            debug!("Skipping diagnosis: only {:?} left", remaining);
            return None;
        }
        if self.ping_ok(ctx).await {
            return None;
        }

        info!("Reconnecting to diagnose lost connection");
        let conn = match self.cache.ensure_conn(ctx).await {
            Ok(conn) => conn,
            Err(e) => return Some(format!("target did not come back: {e}")),
        };

        let boot_id = match ctx.run(conn.boot_id()).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                warn!("Failed to read boot id after reconnect: {}", e);
                return Some(MSG_UNKNOWN_CRASH.to_string());
            }
            Err(e) => {
                warn!("Failed to read boot id after reconnect: {}", e);
                return Some(MSG_UNKNOWN_CRASH.to_string());
            }
        };
        let Some(initial) = self.cache.initial_boot_id() else {
            return Some(MSG_UNKNOWN_CRASH.to_string());
        };
        if boot_id == initial {
            return Some(MSG_NO_REBOOT.to_string());
        }

        let boot_arg = format!("--boot={initial}");
        let lines_arg = format!("--lines={SYSLOG_LINES}");
        let syslog = self
            .fetch(ctx, conn.as_ref(), &["croslog", "--quiet", &boot_arg, &lines_arg])
            .await;
        let ramoops = self.fetch(ctx, conn.as_ref(), &["cat", RAMOOPS_PATH]).await;

        // Unfetchable logs are saved empty.
        let syslog = syslog.unwrap_or_default();
        let ramoops = ramoops.unwrap_or_default();
        save_artifact(out_dir, UNIFIED_LOGS_FILE, &syslog).await;
        save_artifact(out_dir, RAMOOPS_FILE, &ramoops).await;

        Some(classify(&syslog, &ramoops))
    }
}

async fn save_artifact(out_dir: &Path, name: &str, content: &str) {
    if let Err(e) = tokio::fs::create_dir_all(out_dir).await {
        warn!("Failed to create {}: {}", out_dir.display(), e);
        return;
    }
    let path = out_dir.join(name);
    if let Err(e) = tokio::fs::write(&path, content).await {
        warn!("Failed to save {}: {}", path.display(), e);
    }
}

/// Turn the previous boot's logs into a one-line cause, most specific
/// match first.
pub fn classify(syslog: &str, ramoops: &str) -> String {
    if let Some(reason) = shutdown_reason(syslog) {
        return format!("target normally shut down for reboot ({reason}).");
    }
    if let Some(symbol) = panic_symbol(ramoops) {
        return format!("kernel crashed in {symbol}.");
    }
    if let Some((task, symbol)) = hung_task(ramoops) {
        return format!("kernel crashed: {task} hung in {symbol}.");
    }
    MSG_UNKNOWN_CRASH.to_string()
}

fn first_capture(pattern: &str, text: &str) -> Option<String> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!("Bad diagnosis pattern {:?}: {}", pattern, e);
            return None;
        }
    };
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn shutdown_reason(syslog: &str) -> Option<String> {
    first_capture(r"(?m)Shutting down for reboot: (\S+)", syslog)
}

fn panic_symbol(ramoops: &str) -> Option<String> {
    if !ramoops.contains("Kernel panic") && !ramoops.contains("BUG:") {
        return None;
    }
    // arm reports "PC is at", x86 "RIP: 0010:".
    first_capture(r"(?m)PC is at (\S+)", ramoops)
        .or_else(|| first_capture(r"(?m)RIP: [0-9a-fA-F]{4}:(\S+)", ramoops))
}

fn hung_task(ramoops: &str) -> Option<(String, String)> {
    let task = first_capture(
        r"(?m)INFO: task (\S+) blocked for more than \d+ seconds",
        ramoops,
    )?;
    // Optional printk timestamp, optional "[<address>]", optional "?".
    let frame = Regex::new(
        r"^\s*(?:\[\s*\d+\.\d+\]\s*)?(?:\[<[0-9a-fA-F]+>\]\s*)?(?:\?\s*)?([A-Za-z_][\w.]*\+0x[0-9a-fA-F]+/0x[0-9a-fA-F]+)",
    )
    .ok()?;
    let (_, trace) = ramoops.split_once("Call Trace:")?;
    let symbol = trace.lines().find_map(|line| {
        let caps = frame.captures(line)?;
        let symbol = caps.get(1)?.as_str();
        (!symbol.contains("schedule")).then(|| symbol.to_string())
    })?;
    Some((task, symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ServiceOptions;
    use crate::target::fake::{FakeConn, FakeConnector};
    use std::time::Duration;

    async fn connected_cache(conns: Vec<Arc<FakeConn>>) -> Arc<ConnCache> {
        let cache = Arc::new(ConnCache::new(
            FakeConnector::with(conns),
            ServiceOptions::default(),
        ));
        cache.ensure_conn(&RunContext::new()).await.unwrap();
        cache
    }

    fn syslog_command(boot_id: &str) -> String {
        format!("croslog --quiet --boot={boot_id} --lines=1000")
    }

    #[tokio::test]
    async fn test_live_connection_needs_no_diagnosis() {
        let cache = connected_cache(vec![FakeConn::new("boot-1")]).await;
        let dir = tempfile::tempdir().unwrap();
        let msg = Diagnoser::new(cache).diagnose(&RunContext::new(), dir.path()).await;
        assert_eq!(msg, None);
    }

    #[tokio::test]
    async fn test_short_deadline_skips_diagnosis() {
        let first = FakeConn::new("boot-1");
        let cache = connected_cache(vec![first.clone()]).await;
        first.kill();
        let ctx = RunContext::new().with_timeout(Duration::from_secs(1));
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Diagnoser::new(cache).diagnose(&ctx, dir.path()).await, None);
    }

    #[tokio::test]
    async fn test_same_boot_id_is_network_issue() {
        let first = FakeConn::new("boot-1");
        let cache = connected_cache(vec![first.clone(), FakeConn::new("boot-1")]).await;
        first.kill();
        let dir = tempfile::tempdir().unwrap();
        let msg = Diagnoser::new(cache).diagnose(&RunContext::new(), dir.path()).await;
        assert_eq!(msg.as_deref(), Some("target did not reboot, probably network issue."));
    }

    #[tokio::test]
    async fn test_canceled_reconnect_reports_target_gone() {
        let first = FakeConn::new("boot-1");
        let cache = connected_cache(vec![first.clone(), FakeConn::new("boot-2")]).await;
        first.kill();
        let ctx = RunContext::new();
        ctx.cancel();
        let dir = tempfile::tempdir().unwrap();
        let msg = Diagnoser::new(cache).diagnose(&ctx, dir.path()).await;
        assert_eq!(msg.as_deref(), Some("target did not come back: context canceled"));
    }

    #[tokio::test]
    async fn test_normal_shutdown_is_recognized() {
        let first = FakeConn::new("boot-1");
        let second = FakeConn::new("boot-2");
        second.set_output(
            &syslog_command("boot-1"),
            "2026-01-01T00:00:00Z INFO pre-shutdown[123]: Shutting down for reboot: system-update\n",
        );
        let cache = connected_cache(vec![first.clone(), second]).await;
        first.kill();
        let dir = tempfile::tempdir().unwrap();
        let msg = Diagnoser::new(cache).diagnose(&RunContext::new(), dir.path()).await;
        assert_eq!(
            msg.as_deref(),
            Some("target normally shut down for reboot (system-update).")
        );
    }

    #[tokio::test]
    async fn test_artifacts_are_saved_verbatim() {
        let first = FakeConn::new("boot-1");
        let second = FakeConn::new("boot-2");
        second.set_output(&syslog_command("boot-1"), "foo");
        second.set_output(&format!("cat {RAMOOPS_PATH}"), "bar");
        let cache = connected_cache(vec![first.clone(), second]).await;
        first.kill();
        let dir = tempfile::tempdir().unwrap();
        let msg = Diagnoser::new(cache).diagnose(&RunContext::new(), dir.path()).await;
        assert_eq!(msg.as_deref(), Some("target rebooted for unknown crash."));

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![RAMOOPS_FILE, UNIFIED_LOGS_FILE]);
        assert_eq!(std::fs::read_to_string(dir.path().join(UNIFIED_LOGS_FILE)).unwrap(), "foo");
        assert_eq!(std::fs::read_to_string(dir.path().join(RAMOOPS_FILE)).unwrap(), "bar");
    }

    #[tokio::test]
    async fn test_missing_ramoops_saved_empty() {
        let first = FakeConn::new("boot-1");
        let second = FakeConn::new("boot-2");
        second.set_output(&syslog_command("boot-1"), "foo");
        let cache = connected_cache(vec![first.clone(), second]).await;
        first.kill();
        let dir = tempfile::tempdir().unwrap();
        let msg = Diagnoser::new(cache).diagnose(&RunContext::new(), dir.path()).await;
        assert_eq!(msg.as_deref(), Some(MSG_UNKNOWN_CRASH));

        assert_eq!(std::fs::read_to_string(dir.path().join(UNIFIED_LOGS_FILE)).unwrap(), "foo");
        assert_eq!(std::fs::read_to_string(dir.path().join(RAMOOPS_FILE)).unwrap(), "");
    }

    #[test]
    fn test_classify_arm_panic() {
        let ramoops = "[  12.3] Unable to handle kernel NULL pointer dereference\n\
                       [  12.3] PC is at foo_probe+0x1c/0x80\n\
                       [  12.4] Kernel panic - not syncing: Fatal exception\n";
        assert_eq!(classify("", ramoops), "kernel crashed in foo_probe+0x1c/0x80.");
    }

    #[test]
    fn test_classify_x86_bug() {
        let ramoops = "[   3.1] BUG: kernel NULL pointer dereference, address: 0000000000000008\n\
                       [   3.1] RIP: 0010:drm_atomic_commit+0x2a/0x60\n";
        assert_eq!(classify("", ramoops), "kernel crashed in drm_atomic_commit+0x2a/0x60.");
    }

    #[test]
    fn test_classify_hung_task() {
        let ramoops = "[ 245.0] INFO: task jbd2/mmcblk0p1:201 blocked for more than 120 seconds.\n\
                       [ 245.0] Call Trace:\n\
                       [ 245.0]  __schedule+0x2fc/0x900\n\
                       [ 245.0]  schedule+0x3c/0xa0\n\
                       [ 245.0]  jbd2_journal_commit_transaction+0x1a4/0x1640\n\
                       [ 245.1] Kernel panic - not syncing: hung_task: blocked tasks\n";
        assert_eq!(
            classify("", ramoops),
            "kernel crashed: jbd2/mmcblk0p1:201 hung in jbd2_journal_commit_transaction+0x1a4/0x1640."
        );
    }

    #[test]
    fn test_shutdown_marker_wins_over_ramoops() {
        let syslog = "pre-shutdown: Shutting down for reboot: user-request\n";
        let ramoops = "Kernel panic\nPC is at foo+0x1/0x2\n";
        assert_eq!(
            classify(syslog, ramoops),
            "target normally shut down for reboot (user-request)."
        );
    }

    #[test]
    fn test_unmatched_logs_fall_back_to_unknown() {
        assert_eq!(classify("boring", "Kernel panic without a location"), MSG_UNKNOWN_CRASH);
    }
}
