//! Typed message schema for the gateway mesh.
//!
//! An [`Envelope`] is the transport-neutral header wrapping one [`Payload`]
//! variant; the pair travels as a [`MultiAgentMessage`]. Envelopes are JSON
//! on the wire with camelCase fields, ISO-8601 timestamps, and v4 UUID
//! message/correlation ids.

mod payload;

pub use payload::{DiscoveryAction, Payload, TaskOutcome};

use crate::{constants, MeshError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable identity of an agent in the mesh.
///
/// The instance id is a fresh v4 UUID per agent start; the config id is the
/// declarative identifier reused across restarts. Identities are value
/// types — replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub agent_instance_id: String,
    pub agent_config_id: String,
    pub gateway_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

impl AgentIdentity {
    /// New identity with a freshly minted instance id.
    pub fn new(agent_config_id: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        Self {
            agent_instance_id: Uuid::new_v4().to_string(),
            agent_config_id: agent_config_id.into(),
            gateway_id: gateway_id.into(),
            role_id: None,
            display_name: None,
            capabilities: None,
        }
    }

    pub fn with_role(mut self, role_id: impl Into<String>) -> Self {
        self.role_id = Some(role_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Direction of an envelope on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
    Broadcast,
    Event,
}

/// Transport-neutral header wrapping a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub from: AgentIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<AgentIdentity>,
    pub direction: Direction,
    pub protocol_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hop_count: Option<u32>,
}

/// Optional envelope fields supplied at send time.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    /// Inherited from a request/response exchange; minted when absent.
    pub correlation_id: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub direction: Option<Direction>,
}

impl Envelope {
    /// Construct an envelope with a fresh message id.
    ///
    /// Direction defaults to `request` when a recipient is present and
    /// `broadcast` otherwise; the hop count starts at zero.
    pub fn new(from: AgentIdentity, to: Option<AgentIdentity>, opts: EnvelopeOptions) -> Self {
        let direction = opts.direction.unwrap_or(if to.is_some() {
            Direction::Request
        } else {
            Direction::Broadcast
        });

        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: opts
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp: Utc::now(),
            from,
            to,
            direction,
            protocol_version: constants::PROTOCOL_VERSION.to_string(),
            signature: None,
            ttl_seconds: opts.ttl_seconds,
            hop_count: Some(0),
        }
    }

    /// Bounds validation for envelope fields.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_version != constants::PROTOCOL_VERSION {
            return Err(MeshError::Validation(format!(
                "unsupported protocol version: {}",
                self.protocol_version
            )));
        }
        if let Some(ttl) = self.ttl_seconds {
            if !(constants::MIN_TTL_SECONDS..=constants::MAX_TTL_SECONDS).contains(&ttl) {
                return Err(MeshError::Validation(format!(
                    "ttlSeconds out of range: {ttl}"
                )));
            }
        }
        if let Some(hops) = self.hop_count {
            if hops > constants::MAX_ENVELOPE_HOP_COUNT {
                return Err(MeshError::Validation(format!(
                    "hopCount out of range: {hops}"
                )));
            }
        }
        Ok(())
    }

    /// Age of the envelope relative to its timestamp, in whole seconds.
    /// Negative when the timestamp lies in the future.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

/// An envelope paired with its payload — the unit the router moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiAgentMessage {
    pub envelope: Envelope,
    pub payload: Payload,
}
