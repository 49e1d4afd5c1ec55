//! Cancellation and deadline propagation.
//!
//! Every suspend point in the harness (SSH pings, reconnects, RPC calls, the
//! retry loop) takes a [`RunContext`]. A context is a cancellation token plus
//! an optional deadline; children inherit both and may only shorten the
//! deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl RunContext {
    /// Create a root context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context that expires after `timeout` (or earlier, if
    /// the parent's deadline comes first). Cancelling the parent cancels the
    /// child; cancelling the child leaves the parent alone.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context with the same deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` if there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the reason this context is done, if it is.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Race `fut` against this context.
    ///
    /// An already-done context fails immediately without polling `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = RunContext::new().with_timeout(Duration::from_secs(5));
        let out = ctx.run(async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let ctx = RunContext::new();
        ctx.cancel();
        let out = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(out, Err(ContextError::Canceled));
        assert_eq!(ContextError::Canceled.to_string(), "context canceled");
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(10));
        let out = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(out, Err(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_child_never_extends_parent_deadline() {
        let parent = RunContext::new().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        assert!(child.remaining().unwrap() <= Duration::from_secs(1));
    }

    #[test]
    fn test_parent_cancel_propagates_to_child() {
        let parent = RunContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = RunContext::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
