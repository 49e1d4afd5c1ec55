//! Hierarchical timing logs.
//!
//! A [`TimingLog`] records nested named stages. Remote servers serialize
//! their log into the `tether-timing` trailer and the client splices it
//! under whatever stage is open locally.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Stage>,
}

impl Stage {
    fn open(name: String) -> Self {
        Self {
            name,
            start: Utc::now(),
            end: None,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct TimingState {
    roots: Vec<Stage>,
    /// Index path from `roots` to the innermost open stage.
    open: Vec<usize>,
}

fn children_at<'a>(roots: &'a mut Vec<Stage>, path: &[usize]) -> &'a mut Vec<Stage> {
    let mut current = roots;
    for &idx in path {
        current = &mut current[idx].children;
    }
    current
}

/// Shared, cloneable timing log.
#[derive(Debug, Clone, Default)]
pub struct TimingLog {
    inner: Arc<Mutex<TimingState>>,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TimingState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a stage nested under the innermost open stage. The stage ends
    /// when the returned guard is dropped.
    pub fn start(&self, name: impl Into<String>) -> StageGuard {
        let mut guard = self.lock();
        let state = &mut *guard;
        let siblings = children_at(&mut state.roots, &state.open);
        siblings.push(Stage::open(name.into()));
        let idx = siblings.len() - 1;
        state.open.push(idx);
        StageGuard {
            log: self.clone(),
            depth: state.open.len(),
        }
    }

    fn end_to_depth(&self, depth: usize) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let now = Utc::now();
        while state.open.len() >= depth && !state.open.is_empty() {
            let Some((&last, parents)) = state.open.split_last() else {
                break;
            };
            let stage = &mut children_at(&mut state.roots, parents)[last];
            stage.end.get_or_insert(now);
            state.open.pop();
        }
    }

    /// Splice stages recorded elsewhere under the innermost open stage.
    pub fn import(&self, stages: Vec<Stage>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        children_at(&mut state.roots, &state.open).extend(stages);
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.lock().roots.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().roots.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.stages())
    }
}

/// Ends its stage, and any stage still open inside it, on drop.
#[must_use = "the stage ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct StageGuard {
    log: TimingLog,
    depth: usize,
}

impl StageGuard {
    pub fn end(self) {}
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.log.end_to_depth(self.depth);
    }
}
