//! Per-call authorization of user services.
//!
//! A test may only call user services it declared. Services that any test
//! may call are listed in [`ALWAYS_ALLOWED`].

use std::collections::HashSet;
use std::sync::OnceLock;

use super::{Code, Status};
use crate::errors::ErrorCode;
use super::metadata::{Metadata, SERVICE_DEPS};
use super::service::{ServiceId, ServiceName};

/// User services every caller may use without declaring them. The bundles
/// in this workspace do not implement them; a bundle that does registers
/// them with [`Server::with_user_service`](super::Server::with_user_service).
pub const ALWAYS_ALLOWED: [&str; 2] = ["tether.baserpc.FaillogService", "tether.baserpc.FileSystem"];

fn always_allowed() -> &'static HashSet<ServiceName> {
    static SET: OnceLock<HashSet<ServiceName>> = OnceLock::new();
    SET.get_or_init(|| ALWAYS_ALLOWED.iter().map(|s| ServiceName::new(*s)).collect())
}

/// Declared dependencies carried in call metadata, or `None` if the caller
/// sent no dependency list at all.
pub fn declared_deps(metadata: &Metadata) -> Option<HashSet<ServiceName>> {
    metadata
        .get(SERVICE_DEPS)
        .map(|deps| deps.iter().map(|d| ServiceName::new(d.as_str())).collect())
}

/// Decide whether a call to `service` may proceed.
///
/// Core and bundle-protocol services are always allowed. A user service
/// requires a dependency list; with one present, the service must be in it
/// or in [`ALWAYS_ALLOWED`].
pub fn authorize(service: &ServiceId, declared: Option<&HashSet<ServiceName>>) -> Result<(), Status> {
    let ServiceId::User(name) = service else {
        return Ok(());
    };
    let Some(declared) = declared else {
        return Err(undeclared(format!(
            "{name}: caller did not declare service dependencies"
        )));
    };
    if declared.contains(name) || always_allowed().contains(name) {
        return Ok(());
    }
    Err(undeclared(format!(
        "{name} is not declared in service dependencies"
    )))
}

fn undeclared(reason: String) -> Status {
    let code = ErrorCode::TransportUndeclaredService.code_string();
    Status::failed_precondition(format!("[{code}] {reason}"))
}

/// True for the status [`authorize`] returns when it rejects a call.
pub fn is_undeclared_service(status: &Status) -> bool {
    let code = ErrorCode::TransportUndeclaredService.code_string();
    status.code == Code::FailedPrecondition && status.message.starts_with(&format!("[{code}]"))
}
