//! Virtual connections over arbitrary byte streams.
//!
//! RPC peers talk over a subprocess's stdin/stdout (or an SSH channel), not a
//! socket. [`PipeConn`] presents such a reader/writer pair as one
//! bidirectional connection, and [`PipeListener`] hands it out exactly once
//! to code that expects to accept connections.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection already closed")]
    AlreadyClosed,

    #[error("{0} is not supported on pipe connections")]
    NotImplemented(&'static str),

    #[error("no more connections")]
    EndOfInput,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A bidirectional connection built from a separate reader and writer.
pub struct PipeConn {
    reader: BoxedReader,
    writer: Option<BoxedWriter>,
    closed: bool,
    peer: String,
}

impl std::fmt::Debug for PipeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConn")
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PipeConn {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Some(Box::new(writer)),
            closed: false,
            peer: "pipe".to_string(),
        }
    }

    /// Label used in logs, e.g. the command on the other end.
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut down the write side and stop reading. Fails if this connection
    /// was already closed.
    pub async fn close(&mut self) -> Result<(), ConnError> {
        if self.closed {
            return Err(ConnError::AlreadyClosed);
        }
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    pub fn set_deadline(&self, _deadline: Instant) -> Result<(), ConnError> {
        Err(ConnError::NotImplemented("set_deadline"))
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> Result<(), ConnError> {
        Err(ConnError::NotImplemented("set_read_deadline"))
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> Result<(), ConnError> {
        Err(ConnError::NotImplemented("set_write_deadline"))
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl AsyncRead for PipeConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Err(closed_pipe())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Yields its single connection on the first accept, then reports end of
/// input forever.
#[derive(Debug)]
pub struct PipeListener {
    conn: Mutex<Option<PipeConn>>,
    closed: AtomicBool,
}

impl PipeListener {
    pub fn new(conn: PipeConn) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn accept(&self) -> Result<PipeConn, ConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::EndOfInput);
        }
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ConnError::EndOfInput)
    }

    /// Stop handing out the connection. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn addr(&self) -> &'static str {
        "pipe"
    }
}
