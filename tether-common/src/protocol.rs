//! Wire messages exchanged between the harness and its bundles.
//!
//! Three layers share one framed stream:
//! 1. the handshake ([`HandshakeRequest`] / [`HandshakeResponse`]), sent once;
//! 2. the multiplexed RPC layer ([`Frame`]);
//! 3. per-service payloads carried inside `Frame::Message`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rpc::Metadata;
use crate::rpc::Status;
use crate::timing::Stage;
use crate::types::{EntityInfo, ErrorRecord, StartFixtureState};

// ============================================================================
// Handshake
// ============================================================================

/// First message sent by the client on a fresh connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Register user-declared services on the server.
    #[serde(default)]
    pub need_user_services: bool,
    /// Glob selecting which bundles' services to expose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_params: Option<BundleInitParams>,
}

/// Per-connection parameters handed to user services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInitParams {
    /// Runtime variable bindings.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Server reply to the handshake. `error` is set when the server refuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandshakeError>,
}

impl HandshakeResponse {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(HandshakeError {
                reason: reason.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeError {
    pub reason: String,
}

// ============================================================================
// RPC frames
// ============================================================================

/// One unit of the multiplexed RPC layer. Every call is identified by the
/// client-assigned `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client opens a call.
    Request {
        id: u64,
        service: String,
        method: String,
        #[serde(default)]
        metadata: Metadata,
    },
    /// A payload in either direction.
    Message { id: u64, payload: serde_json::Value },
    /// Client has nothing more to send on this call.
    HalfClose { id: u64 },
    /// Server finished the call.
    Response {
        id: u64,
        status: Status,
        #[serde(default)]
        trailers: Metadata,
    },
    /// Client abandons the call.
    Cancel { id: u64 },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Self::Request { id, .. }
            | Self::Message { id, .. }
            | Self::HalfClose { id }
            | Self::Response { id, .. }
            | Self::Cancel { id } => *id,
        }
    }
}

// ============================================================================
// Core services
// ============================================================================

/// Streamed by `Logging.ReadLogs`. The first message after subscription has
/// no entry and only confirms the stream is live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadLogsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullDirectoryRequest {
    pub path: String,
    /// Delete without streaming anything back.
    #[serde(default)]
    pub discard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveEntryKind {
    Dir,
    File,
    Symlink,
}

/// One item of a pulled directory, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: String,
    pub kind: ArchiveEntryKind,
    #[serde(default)]
    pub mode: u32,
    /// Base64 file contents, or the link target for symlinks.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// Continues the previous file entry instead of starting it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListServicesResponse {
    pub services: Vec<String>,
}

// ============================================================================
// Bundle protocol
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntitiesResponse {
    pub entities: Vec<EntityInfo>,
}

/// Settings shared by test runs and fixture pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory on the bundle's machine under which per-entity output
    /// directories are created.
    pub out_dir: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Software features available on the device.
    #[serde(default)]
    pub features: Vec<String>,
    /// State of the remote fixture the tests start from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_fixture: Option<StartFixtureState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTestsRequest {
    pub tests: Vec<String>,
    pub config: RunConfig,
}

/// Progress event streamed by `TestService.RunTests` and
/// `FixtureService.RunFixture`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStart {
        time: DateTime<Utc>,
    },
    EntityStart {
        time: DateTime<Utc>,
        entity: EntityInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        out_dir: Option<String>,
    },
    EntityLog {
        time: DateTime<Utc>,
        name: String,
        text: String,
    },
    EntityError {
        time: DateTime<Utc>,
        name: String,
        error: ErrorRecord,
    },
    EntityEnd {
        time: DateTime<Utc>,
        name: String,
        #[serde(default)]
        skip_reasons: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        timing: Vec<Stage>,
    },
    RunLog {
        time: DateTime<Utc>,
        text: String,
    },
    RunEnd {
        time: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Self::RunStart { time }
            | Self::EntityStart { time, .. }
            | Self::EntityLog { time, .. }
            | Self::EntityError { time, .. }
            | Self::EntityEnd { time, .. }
            | Self::RunLog { time, .. }
            | Self::RunEnd { time } => *time,
        }
    }
}

/// Client side of `FixtureService.RunFixture`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FixtureRequest {
    Push { name: String, config: RunConfig },
    Pop,
}

/// Server side of `FixtureService.RunFixture`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FixtureResponse {
    Event { event: RunEvent },
    PushDone { state: StartFixtureState },
    PopDone,
}
