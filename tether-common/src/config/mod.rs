//! Configuration building blocks shared by the tether binaries.
//!
//! Values are layered: defaults, then the config file, then `TETHER_*`
//! environment variables, then command-line flags. [`Sourced`] records
//! which layer won so `tether -v` can explain where a setting came from.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser, expand_tilde, parse_key_value};
pub use source::{ConfigSource, ConfigValueSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
