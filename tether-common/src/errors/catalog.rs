//! Error catalog for tether.
//!
//! Each fatal outcome the CLI can report has a stable code (`TTH-Exxx`),
//! a one-line message and remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors           |
//! | E100-E199  | Target      | SSH connectivity and device liveness     |
//! | E200-E299  | Transport   | Framing, handshake and RPC failures      |
//! | E300-E399  | Run         | Test orchestration outcomes              |
//! | E400-E499  | Transfer    | Output directory and artifact transfer   |
//! | E500-E599  | Internal    | Internal/unexpected errors               |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering every tether fatal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Target spec is not `[user@]host[:port]`
    ConfigInvalidTarget,
    /// A `-var` binding is not `KEY=VALUE`
    ConfigInvalidVar,
    /// A test pattern is not a valid glob
    ConfigInvalidPattern,
    /// Bundle executable could not be located
    ConfigBundleNotFound,

    // =========================================================================
    // Target Errors (E100-E199)
    // =========================================================================
    /// SSH connection could not be established
    TargetConnectFailed,
    /// Liveness probe timed out
    TargetPingTimeout,
    /// Boot ID could not be read from the device
    TargetBootIdUnavailable,
    /// Target did not come back after a disconnect
    TargetLost,
    /// Port forward for an ancillary service failed
    TargetForwardFailed,

    // =========================================================================
    // Transport Errors (E200-E299)
    // =========================================================================
    /// Bundle rejected the handshake
    TransportHandshakeRejected,
    /// Malformed or oversized frame
    TransportFramingError,
    /// Bundle process could not be started
    TransportSpawnFailed,
    /// Call rejected because a service dependency was not declared
    TransportUndeclaredService,
    /// Connection closed while calls were outstanding
    TransportConnectionClosed,

    // =========================================================================
    // Run Errors (E300-E399)
    // =========================================================================
    /// Fail-fast threshold reached
    RunTooManyFailures,
    /// An attempt produced no results
    RunNoProgress,
    /// A remote fixture failed to start or stop
    RunFixtureFailed,
    /// Run was canceled or timed out
    RunCanceled,
    /// No test matched the given patterns
    RunNoTestsMatched,

    // =========================================================================
    // Transfer Errors (E400-E499)
    // =========================================================================
    /// Pulling an output directory failed
    TransferPullFailed,
    /// Archive entry escaped the destination directory
    TransferUnsafePath,
    /// Results could not be written locally
    TransferResultsWriteFailed,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Unexpected internal state
    InternalStateError,
    /// Serialization/deserialization error
    InternalSerdeError,
    /// Logging system error
    InternalLoggingError,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigReadError => 1,
            Self::ConfigParseError => 2,
            Self::ConfigEnvError => 3,
            Self::ConfigInvalidTarget => 4,
            Self::ConfigInvalidVar => 5,
            Self::ConfigInvalidPattern => 6,
            Self::ConfigBundleNotFound => 7,

            Self::TargetConnectFailed => 100,
            Self::TargetPingTimeout => 101,
            Self::TargetBootIdUnavailable => 102,
            Self::TargetLost => 103,
            Self::TargetForwardFailed => 104,

            Self::TransportHandshakeRejected => 200,
            Self::TransportFramingError => 201,
            Self::TransportSpawnFailed => 202,
            Self::TransportUndeclaredService => 203,
            Self::TransportConnectionClosed => 204,

            Self::RunTooManyFailures => 300,
            Self::RunNoProgress => 301,
            Self::RunFixtureFailed => 302,
            Self::RunCanceled => 303,
            Self::RunNoTestsMatched => 304,

            Self::TransferPullFailed => 400,
            Self::TransferUnsafePath => 401,
            Self::TransferResultsWriteFailed => 402,

            Self::InternalStateError => 500,
            Self::InternalSerdeError => 501,
            Self::InternalLoggingError => 502,
        }
    }

    /// Returns the formatted error code string (e.g., "TTH-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("TTH-E{:03}", self.code_number())
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Target,
            200..=299 => ErrorCategory::Transport,
            300..=399 => ErrorCategory::Run,
            400..=499 => ErrorCategory::Transfer,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML syntax",
            Self::ConfigEnvError => "Environment variable has invalid value",
            Self::ConfigInvalidTarget => "Target must be [user@]host[:port]",
            Self::ConfigInvalidVar => "Variable binding must be KEY=VALUE",
            Self::ConfigInvalidPattern => "Test pattern is not a valid glob",
            Self::ConfigBundleNotFound => "Bundle executable not found",

            Self::TargetConnectFailed => "Failed to connect to target",
            Self::TargetPingTimeout => "Target did not answer the liveness probe",
            Self::TargetBootIdUnavailable => "Could not read the target boot ID",
            Self::TargetLost => "Target did not come back after a disconnect",
            Self::TargetForwardFailed => "Failed to set up a port forward to the target",

            Self::TransportHandshakeRejected => "Bundle rejected the handshake",
            Self::TransportFramingError => "Malformed or oversized message on the wire",
            Self::TransportSpawnFailed => "Failed to start the bundle process",
            Self::TransportUndeclaredService => "Call to a service the test did not declare",
            Self::TransportConnectionClosed => "Connection closed with calls outstanding",

            Self::RunTooManyFailures => "Too many test failures; run stopped early",
            Self::RunNoProgress => "No test ran in the last attempt",
            Self::RunFixtureFailed => "Remote fixture failed",
            Self::RunCanceled => "Run was canceled or timed out",
            Self::RunNoTestsMatched => "No test matched the given patterns",

            Self::TransferPullFailed => "Failed to pull an output directory",
            Self::TransferUnsafePath => "Archive entry escapes the destination directory",
            Self::TransferResultsWriteFailed => "Failed to write results",

            Self::InternalStateError => "Unexpected internal state",
            Self::InternalSerdeError => "Serialization error",
            Self::InternalLoggingError => "Failed to initialize logging",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigReadError => &[
                "Check that the file given with --config exists and is readable",
                "Remove --config to use ~/.config/tether/config.toml",
            ],
            Self::ConfigParseError => &[
                "Fix the TOML syntax at the reported line",
                "Only [target], [run] and [services] sections are recognized",
            ],
            Self::ConfigEnvError => &[
                "Unset or correct the TETHER_* variable named in the message",
                "Durations use humantime syntax, e.g. 30s or 2m",
            ],
            Self::ConfigInvalidTarget => &[
                "Use host, user@host or user@host:port",
                "IPv6 addresses must be bracketed: [::1]:22",
            ],
            Self::ConfigInvalidVar => &["Pass variables as --var name=value"],
            Self::ConfigInvalidPattern => &["Use glob syntax: *, ? and [...]"],
            Self::ConfigBundleNotFound => &[
                "Set run.local_bundle / run.remote_bundle in the config file",
                "Install tether-bundle on the device and on this host",
            ],

            Self::TargetConnectFailed => &[
                "Check that the device is powered on and reachable",
                "Verify SSH access manually: ssh <target> true",
                "Increase target.connect_retries for flaky networks",
            ],
            Self::TargetPingTimeout => &[
                "Check the network path to the device",
                "Increase target.ping_timeout",
            ],
            Self::TargetBootIdUnavailable => &[
                "Ensure /proc/sys/kernel/random/boot_id is readable on the device",
            ],
            Self::TargetLost => &[
                "Inspect unified-logs.before-reboot.txt and console-ramoops.txt in the results directory",
                "Power-cycle the device if it is unresponsive",
            ],
            Self::TargetForwardFailed => &[
                "Check that AllowTcpForwarding is enabled on the device's sshd",
                "Verify the services.tlw_server address",
            ],

            Self::TransportHandshakeRejected => &[
                "Check the bundle's stderr for the rejection reason",
                "Make sure host and device run the same tether version",
            ],
            Self::TransportFramingError => &[
                "Make sure nothing else writes to the bundle's stdout",
                "Make sure host and device run the same tether version",
            ],
            Self::TransportSpawnFailed => &[
                "Verify the bundle path and that it is executable",
            ],
            Self::TransportUndeclaredService => &[
                "Add the service to the test's service dependencies",
            ],
            Self::TransportConnectionClosed => &[
                "The bundle exited early; check its stderr",
                "Re-run with -v to see the log relay",
            ],

            Self::RunTooManyFailures => &[
                "Fix the failing tests or raise --max-test-failures",
                "Pass --max-test-failures 0 to disable the limit",
            ],
            Self::RunNoProgress => &[
                "The bundle dropped every requested test; check that it matches the host's test list",
            ],
            Self::RunFixtureFailed => &[
                "Check the remote fixture's logs in the results directory",
            ],
            Self::RunCanceled => &[
                "Re-run; increase run.timeout if the run needs more time",
            ],
            Self::RunNoTestsMatched => &[
                "Run `tether list <target>` to see available tests",
            ],

            Self::TransferPullFailed => &[
                "Check free disk space in the results directory",
                "Check that the bundle is still running",
            ],
            Self::TransferUnsafePath => &[
                "The bundle sent a path with '..' or an absolute path; report this as a bug",
            ],
            Self::TransferResultsWriteFailed => &[
                "Check permissions and free space of --results-dir",
            ],

            Self::InternalStateError => &["Re-run with -v and report the log as a bug"],
            Self::InternalSerdeError => &[
                "Make sure host and device run the same tether version",
            ],
            Self::InternalLoggingError => &[
                "Check TETHER_LOG_FILE points to a writable location",
            ],
        }
    }

    /// All catalog codes, in numeric order.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigEnvError,
            Self::ConfigInvalidTarget,
            Self::ConfigInvalidVar,
            Self::ConfigInvalidPattern,
            Self::ConfigBundleNotFound,
            Self::TargetConnectFailed,
            Self::TargetPingTimeout,
            Self::TargetBootIdUnavailable,
            Self::TargetLost,
            Self::TargetForwardFailed,
            Self::TransportHandshakeRejected,
            Self::TransportFramingError,
            Self::TransportSpawnFailed,
            Self::TransportUndeclaredService,
            Self::TransportConnectionClosed,
            Self::RunTooManyFailures,
            Self::RunNoProgress,
            Self::RunFixtureFailed,
            Self::RunCanceled,
            Self::RunNoTestsMatched,
            Self::TransferPullFailed,
            Self::TransferUnsafePath,
            Self::TransferResultsWriteFailed,
            Self::InternalStateError,
            Self::InternalSerdeError,
            Self::InternalLoggingError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and setup errors (E001-E099)
    Config,
    /// SSH connectivity and device liveness (E100-E199)
    Target,
    /// Framing, handshake and RPC failures (E200-E299)
    Transport,
    /// Test orchestration outcomes (E300-E399)
    Run,
    /// Output directory and artifact transfer (E400-E499)
    Transfer,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Target => "Target",
            Self::Transport => "Transport",
            Self::Run => "Run",
            Self::Transfer => "Transfer",
            Self::Internal => "Internal",
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Config => "Configuration file, environment and argument issues",
            Self::Target => "SSH connectivity and device liveness issues",
            Self::Transport => "Bundle process and RPC channel issues",
            Self::Run => "Test orchestration outcomes that stop a run",
            Self::Transfer => "Output directory and result file issues",
            Self::Internal => "Internal errors that may indicate bugs",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}
