//! Where a configuration value came from.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Layers in increasing order of precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::File => "config file",
            Self::Environment => "environment",
            Self::Cli => "command line",
        };
        f.write_str(name)
    }
}

/// Detail of where a value was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigValueSource {
    Default,
    File(PathBuf),
    EnvVar(String),
    CliFlag(String),
}

impl ConfigValueSource {
    pub fn layer(&self) -> ConfigSource {
        match self {
            Self::Default => ConfigSource::Default,
            Self::File(_) => ConfigSource::File,
            Self::EnvVar(_) => ConfigSource::Environment,
            Self::CliFlag(_) => ConfigSource::Cli,
        }
    }
}

impl fmt::Display for ConfigValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File(path) => write!(f, "{}", path.display()),
            Self::EnvVar(var) => write!(f, "${var}"),
            Self::CliFlag(flag) => write!(f, "--{flag}"),
        }
    }
}

/// A value plus its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigValueSource,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigValueSource::Default,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigValueSource::EnvVar(var.into()),
        }
    }

    pub fn from_file(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            source: ConfigValueSource::File(path.into()),
        }
    }

    pub fn from_cli(value: T, flag: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigValueSource::CliFlag(flag.into()),
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == ConfigValueSource::Default
    }

    /// Keep whichever of `self` and `other` comes from the higher layer;
    /// ties go to `other`.
    pub fn overlay(self, other: Self) -> Self {
        if other.source.layer() >= self.source.layer() {
            other
        } else {
            self
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_ordered_by_precedence() {
        assert!(ConfigSource::Cli > ConfigSource::Environment);
        assert!(ConfigSource::Environment > ConfigSource::File);
        assert!(ConfigSource::File > ConfigSource::Default);
    }

    #[test]
    fn test_overlay_keeps_higher_layer() {
        let file = Sourced::from_file(3u32, "/etc/tether.toml");
        let env = Sourced::from_env(5u32, "TETHER_RETRIES");
        assert_eq!(file.clone().overlay(env.clone()).value, 5);
        assert_eq!(env.overlay(file).value, 5);
    }

    #[test]
    fn test_source_display() {
        assert_eq!(ConfigValueSource::EnvVar("TETHER_X".into()).to_string(), "$TETHER_X");
        assert_eq!(ConfigValueSource::CliFlag("retries".into()).to_string(), "--retries");
    }
}
