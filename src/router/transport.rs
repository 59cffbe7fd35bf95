use super::PeerGateway;
use crate::protocol::MultiAgentMessage;
use crate::Result;
use async_trait::async_trait;

/// Outbound seam to peer gateways.
///
/// The core never implements the wire; an injected transport fulfills
/// delivery (WebSocket, HTTP, in-process for tests). Delivery is
/// fire-and-forget from the router's perspective — a transport may layer
/// at-least-once semantics on top without core changes, since the dedup
/// window absorbs redelivery on the receiving side.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_to_peer(&self, peer: &PeerGateway, message: &MultiAgentMessage) -> Result<()>;
}

/// Default transport: drops everything on the floor.
#[derive(Debug, Default)]
pub struct NoopTransport;

#[async_trait]
impl PeerTransport for NoopTransport {
    async fn send_to_peer(&self, _peer: &PeerGateway, _message: &MultiAgentMessage) -> Result<()> {
        Ok(())
    }
}
