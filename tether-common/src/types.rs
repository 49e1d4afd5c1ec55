//! Common types used across tether components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hop count of an entity that executes on the host (remote bundles).
pub const HOPS_HOST: u8 = 0;

/// Hop count of an entity that executes on the device (local bundles).
pub const HOPS_DEVICE: u8 = 1;

/// Whether an entity is a test or a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Test,
    Fixture,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Fixture => write!(f, "fixture"),
        }
    }
}

/// Static description of a test or fixture as reported by its bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    /// Fully-qualified name, e.g. "example.Pass".
    pub name: String,
    pub kind: EntityKind,
    /// Bundle that owns the entity.
    pub bundle: String,
    /// Parent fixture within the same bundle; empty for none.
    #[serde(default)]
    pub fixture: String,
    /// Fully-qualified names of user services the entity calls.
    #[serde(default)]
    pub service_deps: Vec<String>,
    /// Software features the entity requires.
    #[serde(default)]
    pub software_deps: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl EntityInfo {
    pub fn test(name: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Test,
            bundle: bundle.into(),
            fixture: String::new(),
            service_deps: Vec::new(),
            software_deps: Vec::new(),
            description: String::new(),
        }
    }

    pub fn fixture(name: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Fixture,
            ..Self::test(name, bundle)
        }
    }

    pub fn with_fixture(mut self, fixture: impl Into<String>) -> Self {
        self.fixture = fixture.into();
        self
    }
}

/// An entity placed on a concrete execution side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub entity: EntityInfo,
    /// 0 = host side, 1 = device side.
    pub hops: u8,
    /// Remote fixture a device-side test must start from; empty for none.
    #[serde(default)]
    pub start_fixture_name: String,
}

impl ResolvedEntity {
    pub fn name(&self) -> &str {
        &self.entity.name
    }

    pub fn runs_on_device(&self) -> bool {
        self.hops >= HOPS_DEVICE
    }
}

/// One error reported by a test or fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub stack: String,
}

impl ErrorRecord {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            reason: reason.into(),
            file: String::new(),
            line: 0,
            stack: String::new(),
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }
}

/// Final outcome of one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub bundle: String,
    /// Fixtures the test ran under, outermost first.
    #[serde(default)]
    pub fixture_chain: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub skip_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bundle: bundle.into(),
            fixture_chain: Vec::new(),
            start: None,
            end: None,
            errors: Vec::new(),
            skip_reason: String::new(),
            out_dir: None,
        }
    }

    /// A result for a test that was never dispatched.
    pub fn synthetic_failure(entity: &EntityInfo, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            start: Some(now),
            end: Some(now),
            errors: vec![ErrorRecord::new(reason)],
            ..Self::new(&entity.name, &entity.bundle)
        }
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn skipped(&self) -> bool {
        !self.skip_reason.is_empty()
    }
}

/// What a remote fixture left behind for the device-side tests that start
/// from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartFixtureState {
    pub name: String,
    #[serde(default)]
    pub setup_errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EntityKind::Fixture).unwrap();
        assert_eq!(json, "\"fixture\"");
    }

    #[test]
    fn test_entity_info_defaults_on_minimal_json() {
        let json = r#"{"name":"example.Pass","kind":"test","bundle":"cros"}"#;
        let info: EntityInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info, EntityInfo::test("example.Pass", "cros"));
    }

    #[test]
    fn test_synthetic_failure_has_single_error() {
        let entity = EntityInfo::test("example.Cross", "private");
        let result = TestResult::synthetic_failure(&entity, "not supported");
        assert!(result.failed());
        assert_eq!(result.bundle, "private");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].reason, "not supported");
        assert!(result.start.is_some() && result.end.is_some());
    }

    #[test]
    fn test_hops_route_to_device() {
        let entity = ResolvedEntity {
            entity: EntityInfo::test("a", "b"),
            hops: HOPS_DEVICE,
            start_fixture_name: String::new(),
        };
        assert!(entity.runs_on_device());
        let host = ResolvedEntity {
            hops: HOPS_HOST,
            ..entity
        };
        assert!(!host.runs_on_device());
    }
}
