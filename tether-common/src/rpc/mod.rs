//! Multiplexed RPC over a single framed stream.
//!
//! After the handshake both sides exchange [`Frame`]s. The client numbers
//! calls; the server runs each call in its own task and finishes it with a
//! `Response` frame carrying a [`Status`] and trailers. Core services
//! (reflection, log relay, file transfer) are always registered; user
//! services only when the handshake asks for them, and every call to one is
//! authorized against the caller's declared dependencies.

pub mod auth;
pub mod client;
pub mod file_transfer;
pub mod logging;
pub mod metadata;
pub mod server;
pub mod service;
pub mod status;

pub use file_transfer::OutDirRegistry;
pub use client::{CallContext, ClientCall, DialOptions, LogSink, RpcClient, TracingLogSink};
pub use logging::{LogHub, RemoteLogger};
pub use metadata::Metadata;
pub use server::{CallScope, Server};
pub use service::{CallStream, ServerCall, Service, ServiceId, ServiceKind, ServiceName, UserService};
pub use status::{Code, Status};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::context::ContextError;
use crate::framing::{FramingError, encode_message};
use crate::protocol::Frame;
use crate::vconn::ConnError;

/// Frames buffered between call tasks and the connection writer.
pub(crate) const FRAME_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Status(#[from] Status),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {key} trailer: {reason}")]
    Trailer { key: &'static str, reason: String },

    #[error("log relay stopped before sequence {0} arrived")]
    LogRelay(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("terminated by {0}")]
    Terminated(String),

    #[error("failed to terminate peer process: {0}")]
    Terminate(#[source] std::io::Error),
}

impl RpcError {
    /// True when the failure means the connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Status(status) => status.is_connection_closed(),
            Self::Framing(_) | Self::Conn(_) => true,
            _ => false,
        }
    }
}

/// Drain `frames` into `writer` until the channel closes or `stop` fires,
/// then shut the write side down.
///
/// A frame that cannot be encoded (or exceeds the size limit) is dropped and
/// replaced by whatever `reject` builds for its call, so one oversized
/// payload fails only that call. Write errors still end the writer.
pub(crate) fn spawn_writer<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    stop: CancellationToken,
    reject: fn(u64, &FramingError) -> Frame,
) -> JoinHandle<Result<(), FramingError>>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = stop.cancelled() => break,
            };
            let buf = match encode_message(&frame) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!(id = frame.id(), "Dropping unsendable frame: {}", e);
                    encode_message(&reject(frame.id(), &e))?
                }
            };
            writer.write_all(&buf).await?;
            writer.flush().await?;
        }
        writer.shutdown().await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests;
