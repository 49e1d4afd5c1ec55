//! The explicitly constructed set of tests and fixtures a bundle serves.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tether_common::rpc::UserService;
use tether_common::{EntityInfo, EntityKind};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate entity {0}")]
    Duplicate(String),

    #[error("{0} is registered as a {1}")]
    WrongKind(String, EntityKind),
}

/// What a test or fixture body reported, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Log(String),
    Error(String),
}

/// Handed to a test or fixture body while it runs.
#[derive(Debug)]
pub struct EntityState {
    vars: Arc<BTreeMap<String, String>>,
    out_dir: Option<PathBuf>,
    notes: Vec<Note>,
}

impl EntityState {
    pub fn new(vars: Arc<BTreeMap<String, String>>, out_dir: Option<PathBuf>) -> Self {
        Self {
            vars,
            out_dir,
            notes: Vec::new(),
        }
    }

    pub fn log(&mut self, msg: impl Into<String>) {
        self.notes.push(Note::Log(msg.into()));
    }

    pub fn error(&mut self, reason: impl Into<String>) {
        self.notes.push(Note::Error(reason.into()));
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    pub fn has_errors(&self) -> bool {
        self.notes.iter().any(|n| matches!(n, Note::Error(_)))
    }

    pub fn into_notes(self) -> Vec<Note> {
        self.notes
    }
}

pub type Body = Arc<dyn Fn(&mut EntityState) + Send + Sync>;

pub struct TestDef {
    pub info: EntityInfo,
    pub body: Body,
}

pub struct FixtureDef {
    pub info: EntityInfo,
    pub setup: Body,
    pub teardown: Option<Body>,
}

#[derive(Default)]
pub struct Registry {
    tests: Vec<TestDef>,
    fixtures: BTreeMap<String, FixtureDef>,
    user_services: Vec<Arc<dyn UserService>>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&mut self, info: &EntityInfo, kind: EntityKind) -> Result<(), RegistryError> {
        if info.kind != kind {
            return Err(RegistryError::WrongKind(info.name.clone(), info.kind));
        }
        if !self.names.insert(info.name.clone()) {
            return Err(RegistryError::Duplicate(info.name.clone()));
        }
        Ok(())
    }

    pub fn add_test<F>(&mut self, info: EntityInfo, body: F) -> Result<(), RegistryError>
    where
        F: Fn(&mut EntityState) + Send + Sync + 'static,
    {
        self.claim(&info, EntityKind::Test)?;
        self.tests.push(TestDef {
            info,
            body: Arc::new(body),
        });
        Ok(())
    }

    pub fn add_fixture<S>(
        &mut self,
        info: EntityInfo,
        setup: S,
        teardown: Option<Body>,
    ) -> Result<(), RegistryError>
    where
        S: Fn(&mut EntityState) + Send + Sync + 'static,
    {
        self.claim(&info, EntityKind::Fixture)?;
        self.fixtures.insert(
            info.name.clone(),
            FixtureDef {
                info,
                setup: Arc::new(setup),
                teardown,
            },
        );
        Ok(())
    }

    pub fn add_user_service(&mut self, service: Arc<dyn UserService>) {
        self.user_services.push(service);
    }

    pub fn user_services(&self) -> &[Arc<dyn UserService>] {
        &self.user_services
    }

    /// Tests in registration order, then fixtures by name.
    pub fn entities(&self) -> Vec<EntityInfo> {
        self.tests
            .iter()
            .map(|t| t.info.clone())
            .chain(self.fixtures.values().map(|f| f.info.clone()))
            .collect()
    }

    pub fn tests(&self) -> &[TestDef] {
        &self.tests
    }

    pub fn fixture(&self, name: &str) -> Option<&FixtureDef> {
        self.fixtures.get(name)
    }

    /// Fixtures `parent` leads through in this registry, outermost first,
    /// plus the first fixture name this registry does not have (which the
    /// host resolved to a remote fixture).
    pub fn fixture_chain(&self, parent: &str) -> (Vec<String>, Option<String>) {
        let mut chain = Vec::new();
        let mut name = parent;
        while !name.is_empty() && !chain.iter().any(|c: &String| c == name) {
            match self.fixtures.get(name) {
                Some(fixture) => {
                    chain.push(name.to_string());
                    name = &fixture.info.fixture;
                }
                None => {
                    chain.reverse();
                    return (chain, Some(name.to_string()));
                }
            }
        }
        chain.reverse();
        (chain, None)
    }
}
