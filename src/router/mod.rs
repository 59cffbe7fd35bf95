//! Message routing between co-located agents and peer gateways.
//!
//! The router owns subscription dispatch, duplicate suppression, TTL and
//! hop-count enforcement, and the local-vs-remote delivery split. Routing
//! never fails from the caller's perspective: invalid or duplicate messages
//! are dropped with a debug log, and handler failures are sunk per handler
//! so one bad subscriber cannot starve the rest.

mod dedup;
mod transport;

pub use dedup::DedupWindow;
pub use transport::{NoopTransport, PeerTransport};

use crate::protocol::{
    AgentIdentity, Direction, Envelope, EnvelopeOptions, MultiAgentMessage, Payload,
};
use crate::{constants, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Future returned by a message handler; failures are logged, never raised.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type MessageHandler = Arc<dyn Fn(MultiAgentMessage) -> HandlerFuture + Send + Sync>;

/// Connection state of a peer gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Connected,
    Connecting,
    Disconnected,
}

/// A peer gateway in the mesh, maintained by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerGateway {
    pub gateway_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status: PeerStatus,
}

/// Dispatch filter; omitted fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub payload_type: Option<String>,
    pub from_agent_config_id: Option<String>,
    pub from_role_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn for_payload_type(payload_type: impl Into<String>) -> Self {
        Self {
            payload_type: Some(payload_type.into()),
            ..Default::default()
        }
    }

    fn matches(&self, message: &MultiAgentMessage) -> bool {
        if let Some(payload_type) = &self.payload_type {
            if message.payload.kind() != payload_type {
                return false;
            }
        }
        if let Some(config_id) = &self.from_agent_config_id {
            if &message.envelope.from.agent_config_id != config_id {
                return false;
            }
        }
        if let Some(role_id) = &self.from_role_id {
            if message.envelope.from.role_id.as_deref() != Some(role_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Handle returned by [`Router::subscribe`]; pass to [`Router::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: SubscriptionFilter,
    handler: MessageHandler,
}

pub struct Router {
    gateway_id: String,
    local_agents: RwLock<HashMap<String, AgentIdentity>>,
    peers: RwLock<HashMap<String, PeerGateway>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription_id: AtomicU64,
    seen: Mutex<DedupWindow>,
    transport: RwLock<Arc<dyn PeerTransport>>,
}

impl Router {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            local_agents: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
            seen: Mutex::new(DedupWindow::new(constants::DEDUP_WINDOW_SIZE)),
            transport: RwLock::new(Arc::new(NoopTransport)),
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Injects the outbound transport; replaces the no-op default.
    pub async fn set_transport(&self, transport: Arc<dyn PeerTransport>) {
        *self.transport.write().await = transport;
    }

    // --- local agents -----------------------------------------------------

    pub async fn register_local_agent(&self, identity: AgentIdentity) {
        let mut agents = self.local_agents.write().await;
        info!(
            "Registered local agent {} ({})",
            identity.agent_instance_id, identity.agent_config_id
        );
        agents.insert(identity.agent_instance_id.clone(), identity);
    }

    pub async fn unregister_local_agent(&self, instance_id: &str) -> bool {
        let removed = self.local_agents.write().await.remove(instance_id);
        if removed.is_some() {
            info!("Unregistered local agent {}", instance_id);
        }
        removed.is_some()
    }

    pub async fn get_local_agent(&self, instance_id: &str) -> Option<AgentIdentity> {
        self.local_agents.read().await.get(instance_id).cloned()
    }

    pub async fn list_local_agents(&self) -> Vec<AgentIdentity> {
        self.local_agents.read().await.values().cloned().collect()
    }

    // --- peers ------------------------------------------------------------

    pub async fn register_peer(&self, peer: PeerGateway) {
        info!("Registered peer gateway {} ({:?})", peer.gateway_id, peer.status);
        self.peers.write().await.insert(peer.gateway_id.clone(), peer);
    }

    pub async fn remove_peer(&self, gateway_id: &str) -> bool {
        self.peers.write().await.remove(gateway_id).is_some()
    }

    pub async fn set_peer_status(&self, gateway_id: &str, status: PeerStatus) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(gateway_id) {
            Some(peer) => {
                peer.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn list_peers(&self) -> Vec<PeerGateway> {
        self.peers.read().await.values().cloned().collect()
    }

    // --- subscriptions ----------------------------------------------------

    /// Registers a handler for messages matching `filter`.
    ///
    /// The closure runs synchronously in dispatch order; the future it
    /// returns is spawned with an error sink attached.
    pub async fn subscribe<F>(&self, filter: SubscriptionFilter, handler: F) -> SubscriptionId
    where
        F: Fn(MultiAgentMessage) -> HandlerFuture + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().await.push(Subscription {
            id,
            filter,
            handler: Arc::new(handler),
        });
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    // --- sending and routing ----------------------------------------------

    /// Constructs an envelope for `payload` and routes it immediately.
    ///
    /// Direction defaults to `request` when `to` is present, `broadcast`
    /// otherwise; the correlation id is inherited from `opts` or minted.
    pub async fn send(
        &self,
        from: AgentIdentity,
        to: Option<AgentIdentity>,
        payload: Payload,
        opts: EnvelopeOptions,
    ) -> Envelope {
        let envelope = Envelope::new(from, to, opts);
        let message = MultiAgentMessage {
            envelope: envelope.clone(),
            payload,
        };
        self.route(message).await;
        envelope
    }

    /// Entry point for locally originated and peer-received messages.
    pub async fn route(&self, message: MultiAgentMessage) {
        // Dedup: at most one delivery per message id within the window.
        {
            let mut seen = self.seen.lock().await;
            if !seen.insert(&message.envelope.message_id) {
                debug!(
                    "Dropping duplicate message {}",
                    message.envelope.message_id
                );
                return;
            }
        }

        if let Some(ttl) = message.envelope.ttl_seconds {
            let age = message.envelope.age_seconds(Utc::now());
            if age > ttl as i64 {
                debug!(
                    "Dropping expired message {} (age {}s, ttl {}s)",
                    message.envelope.message_id, age, ttl
                );
                return;
            }
        }

        let hops = message.envelope.hop_count.unwrap_or(0);
        if hops >= constants::MAX_HOP_COUNT {
            debug!(
                "Dropping message {} at hop limit ({})",
                message.envelope.message_id, hops
            );
            return;
        }

        let is_broadcast = message.envelope.direction == Direction::Broadcast;
        let (is_local, is_remote) = match &message.envelope.to {
            None => (true, false),
            Some(to) => (
                to.gateway_id == self.gateway_id,
                to.gateway_id != self.gateway_id,
            ),
        };

        if is_local || is_broadcast {
            self.deliver_local(&message).await;
        }
        if is_remote || is_broadcast {
            self.forward_to_peers(&message).await;
        }
    }

    async fn deliver_local(&self, message: &MultiAgentMessage) {
        let handlers: Vec<(SubscriptionId, MessageHandler)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| s.filter.matches(message))
                .map(|s| (s.id, s.handler.clone()))
                .collect()
        };

        for (id, handler) in handlers {
            let future = handler(message.clone());
            let message_id = message.envelope.message_id.clone();
            // Error sink: handler failures are logged, never propagated,
            // and never block sibling subscribers.
            tokio::spawn(async move {
                if let Err(e) = future.await {
                    warn!(
                        "Handler {:?} failed for message {}: {}",
                        id, message_id, e
                    );
                }
            });
        }
    }

    async fn forward_to_peers(&self, message: &MultiAgentMessage) {
        let mut forwarded = message.clone();
        forwarded.envelope.hop_count = Some(message.envelope.hop_count.unwrap_or(0) + 1);

        let target_gateway = message
            .envelope
            .to
            .as_ref()
            .map(|to| to.gateway_id.clone())
            .filter(|gw| gw != &self.gateway_id);

        let recipients: Vec<PeerGateway> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| p.status == PeerStatus::Connected)
                .filter(|p| match &target_gateway {
                    // target-specific: only the matching peer
                    Some(gw) => &p.gateway_id == gw,
                    // broadcast: every connected peer
                    None => true,
                })
                .cloned()
                .collect()
        };

        if recipients.is_empty() {
            return;
        }

        let transport = self.transport.read().await.clone();
        for peer in recipients {
            if let Err(e) = transport.send_to_peer(&peer, &forwarded).await {
                debug!(
                    "Transport failed forwarding {} to {}: {}",
                    forwarded.envelope.message_id, peer.gateway_id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn heartbeat(load: f64) -> Payload {
        Payload::Heartbeat {
            load,
            active_tasks: None,
            status_line: None,
        }
    }

    fn identity(config_id: &str, gateway: &str) -> AgentIdentity {
        AgentIdentity::new(config_id, gateway)
    }

    /// Collects message ids synchronously at dispatch time.
    fn recording_handler(
        log: Arc<StdMutex<Vec<String>>>,
    ) -> impl Fn(MultiAgentMessage) -> HandlerFuture + Send + Sync {
        move |message: MultiAgentMessage| {
            log.lock().unwrap().push(message.envelope.message_id.clone());
            Box::pin(async { Ok(()) }) as HandlerFuture
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<(String, MultiAgentMessage)>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send_to_peer(
            &self,
            peer: &PeerGateway,
            message: &MultiAgentMessage,
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((peer.gateway_id.clone(), message.clone()));
            Ok(())
        }
    }

    fn peer(gateway_id: &str, status: PeerStatus) -> PeerGateway {
        PeerGateway {
            gateway_id: gateway_id.to_string(),
            url: Some(format!("wss://{gateway_id}.example.com")),
            status,
        }
    }

    #[tokio::test]
    async fn test_dedup_delivers_at_most_once() {
        let router = Router::new("gw-a");
        let log = Arc::new(StdMutex::new(Vec::new()));
        router
            .subscribe(SubscriptionFilter::default(), recording_handler(log.clone()))
            .await;

        let envelope = router
            .send(
                identity("a1", "gw-a"),
                None,
                heartbeat(0.1),
                EnvelopeOptions::default(),
            )
            .await;

        // replay the exact same message
        let replay = MultiAgentMessage {
            envelope,
            payload: heartbeat(0.1),
        };
        router.route(replay).await;

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_filters() {
        let router = Router::new("gw-a");
        let heartbeats = Arc::new(StdMutex::new(Vec::new()));
        let from_coder = Arc::new(StdMutex::new(Vec::new()));
        let everything = Arc::new(StdMutex::new(Vec::new()));

        router
            .subscribe(
                SubscriptionFilter::for_payload_type("heartbeat"),
                recording_handler(heartbeats.clone()),
            )
            .await;
        router
            .subscribe(
                SubscriptionFilter {
                    from_role_id: Some("coder".to_string()),
                    ..Default::default()
                },
                recording_handler(from_coder.clone()),
            )
            .await;
        router
            .subscribe(SubscriptionFilter::default(), recording_handler(everything.clone()))
            .await;

        router
            .send(
                identity("a1", "gw-a").with_role("coder"),
                None,
                Payload::TaskResult {
                    status: TaskOutcome::Success,
                    workflow_step_id: None,
                    task_id: None,
                    result: None,
                    error: None,
                    duration_ms: None,
                },
                EnvelopeOptions::default(),
            )
            .await;
        router
            .send(
                identity("a2", "gw-a"),
                None,
                heartbeat(0.5),
                EnvelopeOptions::default(),
            )
            .await;

        assert_eq!(heartbeats.lock().unwrap().len(), 1);
        assert_eq!(from_coder.lock().unwrap().len(), 1);
        assert_eq!(everything.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let router = Router::new("gw-a");
        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = router
            .subscribe(SubscriptionFilter::default(), recording_handler(log.clone()))
            .await;

        router
            .send(identity("a1", "gw-a"), None, heartbeat(0.1), EnvelopeOptions::default())
            .await;
        assert!(router.unsubscribe(id).await);
        router
            .send(identity("a1", "gw-a"), None, heartbeat(0.2), EnvelopeOptions::default())
            .await;

        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(!router.unsubscribe(id).await);
    }

    #[tokio::test]
    async fn test_hop_limit_blocks_routing() {
        let router = Router::new("gw-a");
        let log = Arc::new(StdMutex::new(Vec::new()));
        router
            .subscribe(SubscriptionFilter::default(), recording_handler(log.clone()))
            .await;

        let transport = Arc::new(RecordingTransport::default());
        router.set_transport(transport.clone()).await;
        router.register_peer(peer("gw-b", PeerStatus::Connected)).await;

        let mut envelope = Envelope::new(identity("a1", "gw-a"), None, EnvelopeOptions::default());
        envelope.hop_count = Some(constants::MAX_HOP_COUNT);
        router
            .route(MultiAgentMessage {
                envelope,
                payload: heartbeat(0.1),
            })
            .await;

        assert!(log.lock().unwrap().is_empty());
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_ttl_dropped() {
        let router = Router::new("gw-a");
        let log = Arc::new(StdMutex::new(Vec::new()));
        router
            .subscribe(SubscriptionFilter::default(), recording_handler(log.clone()))
            .await;

        let mut envelope = Envelope::new(identity("a1", "gw-a"), None, EnvelopeOptions::default());
        envelope.ttl_seconds = Some(10);
        envelope.timestamp = Utc::now() - chrono::Duration::seconds(11);
        router
            .route(MultiAgentMessage {
                envelope,
                payload: heartbeat(0.1),
            })
            .await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_forward_reaches_matching_peer_only() {
        let router = Router::new("gw-a");
        let transport = Arc::new(RecordingTransport::default());
        router.set_transport(transport.clone()).await;
        router.register_peer(peer("gw-b", PeerStatus::Connected)).await;
        router.register_peer(peer("gw-c", PeerStatus::Connected)).await;

        router
            .send(
                identity("a1", "gw-a"),
                Some(identity("b1", "gw-b")),
                heartbeat(0.3),
                EnvelopeOptions::default(),
            )
            .await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "gw-b");
        // hop count incremented on the forwarded clone
        assert_eq!(sent[0].1.envelope.hop_count, Some(1));
    }

    #[tokio::test]
    async fn test_broadcast_forwards_to_connected_peers_only() {
        let router = Router::new("gw-a");
        let transport = Arc::new(RecordingTransport::default());
        router.set_transport(transport.clone()).await;
        router.register_peer(peer("gw-b", PeerStatus::Connected)).await;
        router.register_peer(peer("gw-c", PeerStatus::Disconnected)).await;
        router.register_peer(peer("gw-d", PeerStatus::Connecting)).await;

        router
            .send(identity("a1", "gw-a"), None, heartbeat(0.3), EnvelopeOptions::default())
            .await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "gw-b");
    }

    #[tokio::test]
    async fn test_remote_message_not_delivered_locally() {
        let router = Router::new("gw-a");
        let log = Arc::new(StdMutex::new(Vec::new()));
        router
            .subscribe(SubscriptionFilter::default(), recording_handler(log.clone()))
            .await;

        router
            .send(
                identity("a1", "gw-a"),
                Some(identity("b1", "gw-b")),
                heartbeat(0.3),
                EnvelopeOptions::default(),
            )
            .await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let router = Router::new("gw-a");
        let log = Arc::new(StdMutex::new(Vec::new()));

        router
            .subscribe(SubscriptionFilter::default(), |_message| {
                Box::pin(async {
                    Err(crate::MeshError::Routing {
                        message: "handler exploded".to_string(),
                    })
                }) as HandlerFuture
            })
            .await;
        router
            .subscribe(SubscriptionFilter::default(), recording_handler(log.clone()))
            .await;

        router
            .send(identity("a1", "gw-a"), None, heartbeat(0.1), EnvelopeOptions::default())
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_local_agent_registry() {
        let router = Router::new("gw-a");
        let agent = identity("a1", "gw-a");
        let instance_id = agent.agent_instance_id.clone();

        router.register_local_agent(agent).await;
        assert!(router.get_local_agent(&instance_id).await.is_some());
        assert_eq!(router.list_local_agents().await.len(), 1);

        assert!(router.unregister_local_agent(&instance_id).await);
        assert!(!router.unregister_local_agent(&instance_id).await);
        assert!(router.get_local_agent(&instance_id).await.is_none());
    }

    #[tokio::test]
    async fn test_peer_status_updates() {
        let router = Router::new("gw-a");
        router.register_peer(peer("gw-b", PeerStatus::Connecting)).await;

        assert!(router.set_peer_status("gw-b", PeerStatus::Connected).await);
        assert!(!router.set_peer_status("gw-x", PeerStatus::Connected).await);

        let peers = router.list_peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Connected);

        assert!(router.remove_peer("gw-b").await);
        assert!(router.list_peers().await.is_empty());
    }
}
