//! Environment variable parsing with type safety.
//!
//! Reads `TETHER_*` variables, collecting every problem so they can be
//! reported together instead of failing on the first one.

use super::source::Sourced;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var}={value:?} is not a valid {expected}")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var}={value:?} is not a duration (try \"30s\" or \"2m\")")]
    InvalidDuration { var: String, value: String },

    #[error("{var}={value} is outside {min}..={max}")]
    OutOfRange {
        var: String,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{var}={value:?} is not a log level")]
    InvalidLogLevel { var: String, value: String },
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Reads `TETHER_<NAME>` variables. Bad values fall back to the default and
/// are remembered in [`EnvParser::errors`].
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "TETHER_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// The full variable name and its value, if set.
    fn lookup(&self, name: &str) -> Option<(String, String)> {
        let var = format!("{}{name}", self.prefix);
        env::var(&var).ok().map(|value| (var, value))
    }

    /// Parse a set variable with `parse`, falling back to `default` and
    /// recording the error it returns.
    fn parse_with<T>(
        &mut self,
        name: &str,
        default: T,
        parse: impl FnOnce(&str, &str) -> Result<T, EnvError>,
    ) -> Sourced<T> {
        let Some((var, value)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        match parse(&var, &value) {
            Ok(parsed) => Sourced::from_env(parsed, var),
            Err(e) => {
                self.errors.push(e);
                Sourced::default_value(default)
            }
        }
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match self.lookup(name) {
            Some((var, value)) => Sourced::from_env(value, var),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// `None` when unset or empty.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            Some((var, value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), var),
            None => Sourced::default_value(None),
        }
    }

    /// Accepts 1/true/yes/on and 0/false/no/off (any case); empty is false.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        self.parse_with(name, default, |var, value| {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" | "" => Ok(false),
                _ => Err(EnvError::InvalidValue {
                    var: var.to_string(),
                    expected: "boolean",
                    value: value.to_string(),
                }),
            }
        })
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.parse_with(name, default, |var, value| {
            let n: u32 = value.trim().parse().map_err(|_| EnvError::InvalidValue {
                var: var.to_string(),
                expected: "unsigned integer",
                value: value.to_string(),
            })?;
            if (min..=max).contains(&n) {
                Ok(n)
            } else {
                Err(EnvError::OutOfRange {
                    var: var.to_string(),
                    value: n,
                    min,
                    max,
                })
            }
        })
    }

    /// Humantime form: "30s", "2m", "1h 5m".
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        self.parse_with(name, default, |var, value| {
            humantime::parse_duration(value.trim()).map_err(|_| EnvError::InvalidDuration {
                var: var.to_string(),
                value: value.to_string(),
            })
        })
    }

    /// With `~/` expanded; empty means unset.
    pub fn get_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        match self.lookup(name) {
            Some((var, value)) if value.is_empty() => Sourced::from_env(None, var),
            Some((var, value)) => Sourced::from_env(Some(expand_tilde(&value)), var),
            None => Sourced::default_value(None),
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        self.parse_with(name, default.to_string(), |var, value| {
            let lower = value.trim().to_ascii_lowercase();
            if LOG_LEVELS.contains(&lower.as_str()) {
                Ok(lower)
            } else {
                Err(EnvError::InvalidLogLevel {
                    var: var.to_string(),
                    value: value.to_string(),
                })
            }
        })
    }

    /// Comma-separated `KEY=VALUE` pairs. Malformed items are skipped and
    /// recorded; the well-formed ones are kept.
    pub fn get_key_values(&mut self, name: &str) -> Sourced<BTreeMap<String, String>> {
        let Some((var, value)) = self.lookup(name) else {
            return Sourced::default_value(BTreeMap::new());
        };
        let mut pairs = BTreeMap::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_key_value(item) {
                Some((k, v)) => {
                    pairs.insert(k, v);
                }
                None => self.errors.push(EnvError::InvalidValue {
                    var: var.clone(),
                    expected: "KEY=VALUE pair",
                    value: item.to_string(),
                }),
            }
        }
        Sourced::from_env(pairs, var)
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `KEY=VALUE`; the key must be non-empty.
pub fn parse_key_value(item: &str) -> Option<(String, String)> {
    let (key, value) = item.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(stripped) => match dirs::home_dir() {
            Some(home) => home.join(stripped),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use proptest::prelude::*;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env_test_lock serializes every test that touches the environment
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env_test_lock serializes every test that touches the environment
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_true_values() {
        let _guard = env_test_lock();
        let vars = ["TETHER_TEST_BOOL_TRUE"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE", "Yes"] {
            set_env("TETHER_TEST_BOOL_TRUE", val);
            let mut parser = EnvParser::new();
            let result = parser.get_bool("TEST_BOOL_TRUE", false);
            assert!(result.value, "Expected true for '{}'", val);
            assert!(!parser.has_errors());
        }

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_bool_invalid_uses_default() {
        let _guard = env_test_lock();
        let vars = ["TETHER_BAD_BOOL"];
        cleanup_env(&vars);

        set_env("TETHER_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("BAD_BOOL", false);
        assert!(!result.value);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u32_range_out_of_range() {
        let _guard = env_test_lock();
        let vars = ["TETHER_TEST_U32_OOR"];
        cleanup_env(&vars);

        set_env("TETHER_TEST_U32_OOR", "200");
        let mut parser = EnvParser::new();
        let result = parser.get_u32_range("TEST_U32_OOR", 10, 0, 100);
        assert_eq!(result.value, 10);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_humantime() {
        let _guard = env_test_lock();
        let vars = ["TETHER_TEST_DURATION"];
        cleanup_env(&vars);

        set_env("TETHER_TEST_DURATION", "1m 30s");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_DURATION", Duration::from_secs(5));
        assert_eq!(result.value, Duration::from_secs(90));
        assert!(!result.is_default());

        set_env("TETHER_TEST_DURATION", "soon");
        let result = parser.get_duration("TEST_DURATION", Duration::from_secs(5));
        assert_eq!(result.value, Duration::from_secs(5));
        assert!(matches!(parser.errors()[0], EnvError::InvalidDuration { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_key_values_collects_bad_items() {
        let _guard = env_test_lock();
        let vars = ["TETHER_TEST_VARS"];
        cleanup_env(&vars);

        set_env("TETHER_TEST_VARS", "a=1, b=x=y ,broken,=nokey");
        let mut parser = EnvParser::new();
        let result = parser.get_key_values("TEST_VARS");
        assert_eq!(result.value.get("a").map(String::as_str), Some("1"));
        assert_eq!(result.value.get("b").map(String::as_str), Some("x=y"));
        assert_eq!(result.value.len(), 2);
        assert_eq!(parser.take_errors().len(), 2);
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_missing_variables_use_defaults() {
        let _guard = env_test_lock();
        cleanup_env(&["TETHER_TEST_ABSENT"]);
        let mut parser = EnvParser::new();
        assert!(parser.get_string("TEST_ABSENT", "x").is_default());
        assert_eq!(parser.get_optional_string("TEST_ABSENT").value, None);
        assert_eq!(parser.get_path("TEST_ABSENT").value, None);
        assert_eq!(parser.get_log_level("TEST_ABSENT", "info").value, "info");
        assert!(!parser.has_errors());
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/keys/id"), home.join("keys/id"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn test_parse_key_value_splits_on_first_equals(
            key in "[A-Za-z_][A-Za-z0-9_.]{0,15}",
            value in "[^,]{0,20}",
        ) {
            let (k, v) = parse_key_value(&format!("{key}={value}")).unwrap();
            prop_assert_eq!(k, key);
            prop_assert_eq!(v, value);
        }
    }
}
