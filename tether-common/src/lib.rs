//! Shared building blocks for tether: framing, pipe connections, the RPC
//! transport with its side channels, and the types exchanged between the
//! host and bundles.

pub mod config;
pub mod context;
pub mod errors;
pub mod framing;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod rpc;
pub mod testing;
pub mod timing;
pub mod types;
pub mod util;
pub mod vconn;

pub use config::{ConfigSource, EnvParser, Sourced};
pub use context::{ContextError, RunContext};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry};
pub use framing::{FramingError, receive_message, send_message};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use timing::TimingLog;
pub use types::{EntityInfo, EntityKind, ErrorRecord, ResolvedEntity, StartFixtureState, TestResult};
pub use vconn::{ConnError, PipeConn, PipeListener};
