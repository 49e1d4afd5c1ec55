//! Helpers for tests across the tether crates.

mod log;

pub use log::init_test_logging;
