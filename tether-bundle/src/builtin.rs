//! Tests, fixtures and services compiled into this bundle.
//!
//! The `local` role runs on the device; the `remote` role runs on the host
//! and owns the fixtures device tests may start from.

use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use serde_json::{Value, json};
use tether_common::EntityInfo;
use tether_common::rpc::{CallScope, ServiceName, Status, UserService};

use crate::registry::{EntityState, Registry, RegistryError};

pub const PRIMARY_BUNDLE: &str = "cros";
pub const EXTRA_BUNDLE: &str = "extra";
pub const LAB_FIXTURE: &str = "remote.Lab";
pub const ECHO_SERVICE: &str = "tether.example.Echo";

/// Set to any value to make the lab fixture fail its set-up.
pub const LAB_FAIL_VAR: &str = "lab.fail";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Local,
    Remote,
}

pub fn registry(role: Role) -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    match role {
        Role::Local => local(&mut registry)?,
        Role::Remote => remote(&mut registry)?,
    }
    Ok(registry)
}

fn write_out(state: &mut EntityState, file: &str, contents: &str) {
    let Some(dir) = state.out_dir().map(|d| d.join(file)) else {
        state.error("no output directory");
        return;
    };
    if let Err(e) = std::fs::write(&dir, contents) {
        state.error(format!("writing {}: {e}", dir.display()));
    }
}

fn local(r: &mut Registry) -> Result<(), RegistryError> {
    r.add_fixture(
        EntityInfo::fixture("example.Booted", PRIMARY_BUNDLE),
        |s| s.log("device is booted"),
        Some(Arc::new(|s: &mut EntityState| s.log("restoring device state"))),
    )?;
    r.add_fixture(
        EntityInfo::fixture("example.LabDevice", PRIMARY_BUNDLE).with_fixture(LAB_FIXTURE),
        |s| s.log("device enrolled in lab"),
        None,
    )?;

    r.add_test(EntityInfo::test("example.Pass", PRIMARY_BUNDLE), |_| {})?;
    r.add_test(EntityInfo::test("example.Fail", PRIMARY_BUNDLE), |s| {
        s.error("this test always fails")
    })?;
    r.add_test(EntityInfo::test("example.Log", PRIMARY_BUNDLE), |s| {
        s.log("hello from the device");
        s.log("goodbye from the device");
    })?;
    r.add_test(EntityInfo::test("example.OutFile", PRIMARY_BUNDLE), |s| {
        write_out(s, "hello.txt", "written on the device\n")
    })?;
    r.add_test(EntityInfo::test("example.Var", PRIMARY_BUNDLE), |s| {
        match s.var("example.greeting").map(str::to_string) {
            Some(value) => s.log(format!("greeting is {value}")),
            None => s.error("variable example.greeting is not set"),
        }
    })?;

    let mut wifi = EntityInfo::test("example.Wifi", PRIMARY_BUNDLE);
    wifi.software_deps = vec!["wifi".into()];
    wifi.description = "Needs the wifi feature".into();
    r.add_test(wifi, |s| s.log("wifi is up"))?;

    r.add_test(
        EntityInfo::test("example.WithFixture", PRIMARY_BUNDLE).with_fixture("example.Booted"),
        |s| s.log("running on a booted device"),
    )?;
    r.add_test(
        EntityInfo::test("example.InLab", PRIMARY_BUNDLE).with_fixture("example.LabDevice"),
        |s| s.log("running in the lab"),
    )?;
    r.add_test(
        EntityInfo::test("extra.InLab", EXTRA_BUNDLE).with_fixture(LAB_FIXTURE),
        |_| {},
    )?;

    r.add_user_service(Arc::new(Echo));
    Ok(())
}

fn remote(r: &mut Registry) -> Result<(), RegistryError> {
    r.add_fixture(
        EntityInfo::fixture(LAB_FIXTURE, PRIMARY_BUNDLE),
        |s| {
            if s.var(LAB_FAIL_VAR).is_some() {
                s.error("lab is unreachable");
                return;
            }
            s.log("lab reserved");
            write_out(s, "reservation.txt", "reserved\n");
        },
        Some(Arc::new(|s: &mut EntityState| s.log("lab released"))),
    )?;
    r.add_test(EntityInfo::test("host.Pass", PRIMARY_BUNDLE), |s| {
        s.log("ran on the host")
    })?;
    Ok(())
}

/// Echoes requests back and reports per-call scope.
pub struct Echo;

#[async_trait]
impl UserService for Echo {
    fn name(&self) -> ServiceName {
        ServiceName::new(ECHO_SERVICE)
    }

    async fn call(&self, method: &str, request: Value, scope: &CallScope) -> Result<Value, Status> {
        match method {
            "Echo" => {
                scope.log(format!("echo {request}"));
                Ok(request)
            }
            "Var" => {
                let name = request
                    .as_str()
                    .ok_or_else(|| Status::invalid_argument("expected a variable name"))?;
                Ok(json!(scope.var(name)))
            }
            "Labels" => Ok(json!(scope.labels)),
            other => Err(Status::unimplemented(format!("{ECHO_SERVICE} has no method {other}"))),
        }
    }
}
