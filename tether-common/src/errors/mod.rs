//! Error catalog for tether.
//!
//! Stable `TTH-Exxx` codes with messages and remediation, used by the CLI
//! to explain fatal run outcomes.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};
