//! Service identities and the handler trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Status;
use super::metadata::Metadata;
use super::server::CallScope;
use crate::protocol::Frame;

/// Fully-qualified name of a user-declared service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Every service a server can expose. Core and bundle-protocol services are
/// never subject to dependency authorization; user services always are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Reflection,
    Logging,
    FileTransfer,
    TestService,
    FixtureService,
    User(ServiceName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Core,
    BundleProtocol,
    User,
}

impl ServiceId {
    pub fn full_name(&self) -> &str {
        match self {
            Self::Reflection => "tether.core.Reflection",
            Self::Logging => "tether.core.Logging",
            Self::FileTransfer => "tether.core.FileTransfer",
            Self::TestService => "tether.bundle.TestService",
            Self::FixtureService => "tether.bundle.FixtureService",
            Self::User(name) => name.as_str(),
        }
    }

    pub fn parse(full_name: &str) -> Self {
        match full_name {
            "tether.core.Reflection" => Self::Reflection,
            "tether.core.Logging" => Self::Logging,
            "tether.core.FileTransfer" => Self::FileTransfer,
            "tether.bundle.TestService" => Self::TestService,
            "tether.bundle.FixtureService" => Self::FixtureService,
            other => Self::User(ServiceName::new(other)),
        }
    }

    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::Reflection | Self::Logging | Self::FileTransfer => ServiceKind::Core,
            Self::TestService | Self::FixtureService => ServiceKind::BundleProtocol,
            Self::User(_) => ServiceKind::User,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.full_name())
    }
}

// ============================================================================
// Server-side call plumbing
// ============================================================================

#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Value),
    HalfClose,
}

/// Server side of one call's message stream.
#[derive(Debug)]
pub struct CallStream {
    id: u64,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::Sender<Frame>,
    half_closed: bool,
}

impl CallStream {
    pub(crate) fn new(
        id: u64,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        outbound: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            inbound,
            outbound,
            half_closed: false,
        }
    }

    /// Next client message, or `None` once the client half-closed.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, Status> {
        if self.half_closed {
            return Ok(None);
        }
        match self.inbound.recv().await {
            Some(Inbound::Message(value)) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| Status::invalid_argument(format!("malformed request: {e}"))),
            Some(Inbound::HalfClose) | None => {
                self.half_closed = true;
                Ok(None)
            }
        }
    }

    /// Exactly one request message, as unary methods expect.
    pub async fn recv_one<T: DeserializeOwned>(&mut self) -> Result<T, Status> {
        self.recv()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing request message"))
    }

    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), Status> {
        let payload = serde_json::to_value(message)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;
        self.outbound
            .send(Frame::Message {
                id: self.id,
                payload,
            })
            .await
            .map_err(|_| Status::connection_closed())
    }
}

/// Everything a handler receives for one call.
#[derive(Debug)]
pub struct ServerCall {
    pub method: String,
    pub metadata: Metadata,
    pub stream: CallStream,
    pub scope: CallScope,
    pub cancel: CancellationToken,
}

/// A service exposed by an RPC server.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn id(&self) -> ServiceId;

    async fn handle(&self, call: ServerCall) -> Result<(), Status>;
}

/// A user-declared service: unary methods over JSON values.
///
/// The server adapts it into a [`Service`] whose calls are authorized
/// against the caller's declared dependencies.
#[async_trait]
pub trait UserService: Send + Sync + 'static {
    fn name(&self) -> ServiceName;

    async fn call(&self, method: &str, request: Value, scope: &CallScope) -> Result<Value, Status>;
}

pub(crate) struct UserServiceAdapter(pub(crate) Arc<dyn UserService>);

#[async_trait]
impl Service for UserServiceAdapter {
    fn id(&self) -> ServiceId {
        ServiceId::User(self.0.name())
    }

    async fn handle(&self, mut call: ServerCall) -> Result<(), Status> {
        let request: Value = call.stream.recv_one().await?;
        let response = self.0.call(&call.method, request, &call.scope).await?;
        call.stream.send(&response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_names_parse_back() {
        for id in [
            ServiceId::Reflection,
            ServiceId::Logging,
            ServiceId::FileTransfer,
            ServiceId::TestService,
            ServiceId::FixtureService,
        ] {
            assert_eq!(ServiceId::parse(id.full_name()), id);
            assert!(!id.is_user());
        }
    }

    #[test]
    fn test_unknown_name_is_user_service() {
        let id = ServiceId::parse("tether.example.Echo");
        assert_eq!(id, ServiceId::User(ServiceName::new("tether.example.Echo")));
        assert_eq!(id.kind(), ServiceKind::User);
        assert_eq!(id.to_string(), "tether.example.Echo");
    }

    #[tokio::test]
    async fn test_stream_recv_stops_after_half_close() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::channel(4);
        let mut stream = CallStream::new(1, in_rx, out_tx);
        in_tx.send(Inbound::Message(serde_json::json!(5))).unwrap();
        in_tx.send(Inbound::HalfClose).unwrap();
        in_tx.send(Inbound::Message(serde_json::json!(6))).unwrap();

        assert_eq!(stream.recv::<u32>().await.unwrap(), Some(5));
        assert_eq!(stream.recv::<u32>().await.unwrap(), None);
        assert_eq!(stream.recv::<u32>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_one_requires_message() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::channel(4);
        let mut stream = CallStream::new(1, in_rx, out_tx);
        in_tx.send(Inbound::HalfClose).unwrap();
        let err = stream.recv_one::<u32>().await.unwrap_err();
        assert_eq!(err.code, super::super::Code::InvalidArgument);
    }
}
