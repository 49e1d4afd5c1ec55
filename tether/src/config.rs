//! Host configuration.
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file
//! (`~/.config/tether/config.toml` unless `--config` is given), `TETHER_*`
//! environment variables, then command-line flags (applied in `main`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_common::ErrorCode;
use tether_common::config::{ConfigValueSource, EnvError, EnvParser, Sourced};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment: {}", join_env_errors(.0))]
    Env(Vec<EnvError>),
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
        }
    }
}

fn join_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Durations in the file use humantime syntax ("30s", "2m").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TetherConfig {
    pub target: TargetSettings,
    pub run: RunSettings,
    pub services: ServiceSettings,
}

/// How to reach and probe the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetSettings {
    pub key_file: Option<PathBuf>,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
    /// Extra attempts after the first failed connect.
    pub connect_retries: u32,
    #[serde(with = "duration_str")]
    pub connect_retry_interval: Duration,
    #[serde(with = "duration_str")]
    pub ping_timeout: Duration,
    /// Kill the device-side bundle's whole session on close.
    pub kill_session: bool,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            key_file: None,
            connect_timeout: Duration::from_secs(10),
            connect_retries: 2,
            connect_retry_interval: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(5),
            kill_session: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSettings {
    /// Bundle executable on the device (hop 1).
    pub local_bundle: String,
    /// Bundle executable on this host (hop 0).
    pub remote_bundle: String,
    /// Only tests of this bundle may start from a remote fixture.
    pub primary_bundle: String,
    /// Extra attempts for a failing test.
    pub retries: u32,
    /// Stop after this many failing results; 0 means unlimited.
    pub max_test_failures: u32,
    pub results_dir: Option<PathBuf>,
    /// Directory on the device under which bundles create test output.
    pub device_out_dir: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub vars: BTreeMap<String, String>,
    pub features: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            local_bundle: "/usr/local/libexec/tether/tether-bundle".to_string(),
            remote_bundle: "tether-bundle".to_string(),
            primary_bundle: "cros".to_string(),
            retries: 0,
            max_test_failures: 0,
            results_dir: None,
            device_out_dir: "/usr/local/tmp/tether/out".to_string(),
            timeout: Duration::from_secs(3600),
            vars: BTreeMap::new(),
            features: Vec::new(),
        }
    }
}

/// Ancillary services bound to the device connection. `tlw_server` wins
/// over `ephemeral_devserver` when both are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSettings {
    /// `host:port` of a lab wiring service to reverse-forward to the device.
    pub tlw_server: Option<String>,
    pub ephemeral_devserver: bool,
    pub devserver_cache_dirs: Vec<PathBuf>,
    /// Port the forward listens on, on the device.
    pub device_port: u16,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            tlw_server: None,
            ephemeral_devserver: false,
            devserver_cache_dirs: Vec::new(),
            device_port: 28080,
        }
    }
}

/// Which ancillary service a connection should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AncillaryKind {
    Tlw(String),
    EphemeralDevserver(Vec<PathBuf>),
    None,
}

impl ServiceSettings {
    pub fn ancillary(&self) -> AncillaryKind {
        if let Some(addr) = self.tlw_server.as_ref().filter(|a| !a.is_empty()) {
            AncillaryKind::Tlw(addr.clone())
        } else if self.ephemeral_devserver {
            AncillaryKind::EphemeralDevserver(self.devserver_cache_dirs.clone())
        } else {
            AncillaryKind::None
        }
    }
}

/// Where each non-default setting came from, keyed by dotted path.
pub type SourceMap = BTreeMap<&'static str, ConfigValueSource>;

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}

impl TetherConfig {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the file layer. An explicit path must exist; the default path
    /// may be absent.
    pub fn load_file(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok((Self::default(), None)),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                debug!("Loaded config from {}", path.display());
                Ok((Self::from_toml(&content, &path)?, Some(path)))
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}", path.display());
                Ok((Self::default(), None))
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Overlay `TETHER_*` variables. Every invalid variable is reported.
    pub fn apply_env(&mut self, sources: &mut SourceMap) -> Result<(), ConfigError> {
        let mut env = EnvParser::new();

        let t = &mut self.target;
        let key_file = env.get_path("KEY_FILE");
        set(&mut t.key_file, key_file, "target.key_file", sources);
        let connect_timeout = env.get_duration("CONNECT_TIMEOUT", t.connect_timeout);
        set(&mut t.connect_timeout, connect_timeout, "target.connect_timeout", sources);
        let connect_retries = env.get_u32_range("CONNECT_RETRIES", t.connect_retries, 0, 100);
        set(&mut t.connect_retries, connect_retries, "target.connect_retries", sources);
        let ping_timeout = env.get_duration("PING_TIMEOUT", t.ping_timeout);
        set(&mut t.ping_timeout, ping_timeout, "target.ping_timeout", sources);

        let r = &mut self.run;
        let local_bundle = env.get_string("LOCAL_BUNDLE", &r.local_bundle);
        set(&mut r.local_bundle, local_bundle, "run.local_bundle", sources);
        let remote_bundle = env.get_string("REMOTE_BUNDLE", &r.remote_bundle);
        set(&mut r.remote_bundle, remote_bundle, "run.remote_bundle", sources);
        let retries = env.get_u32_range("RETRIES", r.retries, 0, 1000);
        set(&mut r.retries, retries, "run.retries", sources);
        let max_failures = env.get_u32_range("MAX_TEST_FAILURES", r.max_test_failures, 0, u32::MAX);
        set(&mut r.max_test_failures, max_failures, "run.max_test_failures", sources);
        let results_dir = env.get_path("RESULTS_DIR");
        set(&mut r.results_dir, results_dir, "run.results_dir", sources);
        let timeout = env.get_duration("RUN_TIMEOUT", r.timeout);
        set(&mut r.timeout, timeout, "run.timeout", sources);
        let vars = env.get_key_values("VARS");
        if !vars.is_default() {
            sources.insert("run.vars", vars.source.clone());
            r.vars.extend(vars.into_value());
        }

        let s = &mut self.services;
        let tlw_server = env.get_optional_string("TLW_SERVER");
        set(&mut s.tlw_server, tlw_server, "services.tlw_server", sources);
        let ephemeral = env.get_bool("EPHEMERAL_DEVSERVER", s.ephemeral_devserver);
        set(&mut s.ephemeral_devserver, ephemeral, "services.ephemeral_devserver", sources);

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(())
    }
}

/// Store `value` in `slot` unless it is a default, recording its source.
pub fn set<T: SetFrom>(slot: &mut T, value: Sourced<T>, key: &'static str, sources: &mut SourceMap) {
    if !value.is_default() && slot.set_from(value.value) {
        sources.insert(key, value.source);
    }
}

/// Plain values are replaced; optional values only when the variable holds
/// something.
pub trait SetFrom: Sized {
    fn set_from(&mut self, value: Self) -> bool;
}

macro_rules! replace_on_set {
    ($($ty:ty),*) => {
        $(impl SetFrom for $ty {
            fn set_from(&mut self, value: Self) -> bool {
                *self = value;
                true
            }
        })*
    };
}

replace_on_set!(u32, bool, String, Duration);

impl<T> SetFrom for Option<T> {
    fn set_from(&mut self, value: Self) -> bool {
        if value.is_none() {
            return false;
        }
        *self = value;
        true
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: ENV_LOCK serializes every test in this module that touches the environment
        unsafe { std::env::set_var(key, value) };
    }

    fn remove_env(key: &str) {
        // SAFETY: ENV_LOCK serializes every test in this module that touches the environment
        unsafe { std::env::remove_var(key) };
    }

    const FULL: &str = r#"
[target]
key_file = "/keys/testing_rsa"
connect_timeout = "20s"
connect_retries = 5
ping_timeout = "3s"

[run]
retries = 2
max_test_failures = 10
primary_bundle = "cros"
timeout = "30m"
features = ["camera", "wifi"]

[run.vars]
"servo.host" = "labstation1"

[services]
tlw_server = "10.0.0.5:7151"
ephemeral_devserver = true
device_port = 9000
"#;

    #[test]
    fn test_parse_full_config() {
        let config = TetherConfig::from_toml(FULL, Path::new("config.toml")).unwrap();
        assert_eq!(config.target.key_file, Some(PathBuf::from("/keys/testing_rsa")));
        assert_eq!(config.target.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.target.connect_retries, 5);
        assert_eq!(config.run.retries, 2);
        assert_eq!(config.run.timeout, Duration::from_secs(1800));
        assert_eq!(config.run.vars.get("servo.host").map(String::as_str), Some("labstation1"));
        assert_eq!(config.services.device_port, 9000);
        // Untouched fields keep their defaults.
        assert_eq!(config.target.connect_retry_interval, Duration::from_secs(2));
        assert_eq!(config.run.remote_bundle, "tether-bundle");
    }

    #[test]
    fn test_tlw_wins_over_ephemeral_devserver() {
        let config = TetherConfig::from_toml(FULL, Path::new("config.toml")).unwrap();
        assert_eq!(config.services.ancillary(), AncillaryKind::Tlw("10.0.0.5:7151".into()));

        let mut services = config.services.clone();
        services.tlw_server = None;
        assert!(matches!(services.ancillary(), AncillaryKind::EphemeralDevserver(_)));
        services.ephemeral_devserver = false;
        assert_eq!(services.ancillary(), AncillaryKind::None);
    }

    #[test]
    fn test_parse_errors_name_the_file() {
        let err = TetherConfig::from_toml("[run]\nretries = \"many\"", Path::new("/etc/t.toml"))
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to parse /etc/t.toml"));

        let err = TetherConfig::from_toml("[bogus]\n", Path::new("t.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.code(), ErrorCode::ConfigParseError);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TetherConfig::load_file(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.code(), ErrorCode::ConfigReadError);
    }

    #[test]
    fn test_load_file_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[run]\nretries = 3\n").unwrap();
        let (config, loaded) = TetherConfig::load_file(Some(&path)).unwrap();
        assert_eq!(config.run.retries, 3);
        assert_eq!(loaded, Some(path));
    }

    #[test]
    fn test_env_overrides_file() {
        let _guard = env_lock();
        set_env("TETHER_RETRIES", "4");
        set_env("TETHER_PING_TIMEOUT", "750ms");
        set_env("TETHER_VARS", "a=1,b=2");

        let mut config = TetherConfig::from_toml("[run]\nretries = 2\n", Path::new("c.toml")).unwrap();
        config.run.vars.insert("a".into(), "0".into());
        let mut sources = SourceMap::new();
        config.apply_env(&mut sources).unwrap();

        assert_eq!(config.run.retries, 4);
        assert_eq!(config.target.ping_timeout, Duration::from_millis(750));
        assert_eq!(config.run.vars.get("a").map(String::as_str), Some("1"));
        assert_eq!(config.run.vars.get("b").map(String::as_str), Some("2"));
        assert_eq!(
            sources.get("run.retries"),
            Some(&ConfigValueSource::EnvVar("TETHER_RETRIES".into()))
        );
        assert!(!sources.contains_key("run.max_test_failures"));

        for var in ["TETHER_RETRIES", "TETHER_PING_TIMEOUT", "TETHER_VARS"] {
            remove_env(var);
        }
    }

    #[test]
    fn test_env_errors_are_collected() {
        let _guard = env_lock();
        set_env("TETHER_RETRIES", "lots");
        set_env("TETHER_CONNECT_TIMEOUT", "never");

        let mut config = TetherConfig::default();
        let err = config.apply_env(&mut SourceMap::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigEnvError);
        match err {
            ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }

        remove_env("TETHER_RETRIES");
        remove_env("TETHER_CONNECT_TIMEOUT");
    }

    #[test]
    fn test_empty_tlw_env_keeps_file_value() {
        let _guard = env_lock();
        set_env("TETHER_TLW_SERVER", "");
        let mut config = TetherConfig::default();
        config.services.tlw_server = Some("lab:1".into());
        config.apply_env(&mut SourceMap::new()).unwrap();
        assert_eq!(config.services.tlw_server.as_deref(), Some("lab:1"));
        remove_env("TETHER_TLW_SERVER");
    }
}
