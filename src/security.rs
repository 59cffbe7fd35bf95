//! Per-agent security policy enforcement.
//!
//! The security manager gates every inbound message: sliding-window rate
//! limits, cross-gateway policy, HMAC-SHA256 envelope signatures (verified
//! in constant time), and a payload-type-to-permission map. Every decision
//! that denies, and every permission check, lands in a bounded audit log.

use crate::protocol::{Envelope, MultiAgentMessage, Payload};
use crate::{constants, MeshError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// The fixed permission enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "task.assign")]
    TaskAssign,
    #[serde(rename = "task.cancel")]
    TaskCancel,
    #[serde(rename = "role.assign")]
    RoleAssign,
    #[serde(rename = "role.manage")]
    RoleManage,
    #[serde(rename = "agent.register")]
    AgentRegister,
    #[serde(rename = "agent.unregister")]
    AgentUnregister,
    #[serde(rename = "workflow.create")]
    WorkflowCreate,
    #[serde(rename = "workflow.abort")]
    WorkflowAbort,
    #[serde(rename = "config.read")]
    ConfigRead,
    #[serde(rename = "config.write")]
    ConfigWrite,
    #[serde(rename = "report.read")]
    ReportRead,
    #[serde(rename = "report.export")]
    ReportExport,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::TaskAssign => "task.assign",
            Permission::TaskCancel => "task.cancel",
            Permission::RoleAssign => "role.assign",
            Permission::RoleManage => "role.manage",
            Permission::AgentRegister => "agent.register",
            Permission::AgentUnregister => "agent.unregister",
            Permission::WorkflowCreate => "workflow.create",
            Permission::WorkflowAbort => "workflow.abort",
            Permission::ConfigRead => "config.read",
            Permission::ConfigWrite => "config.write",
            Permission::ReportRead => "report.read",
            Permission::ReportExport => "report.export",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission required to deliver a payload, if any.
pub fn required_permission(payload: &Payload) -> Option<Permission> {
    match payload {
        Payload::TaskAssign { .. } => Some(Permission::TaskAssign),
        Payload::RoleAssign { .. } => Some(Permission::RoleAssign),
        Payload::AgentDiscovery { .. } => Some(Permission::AgentRegister),
        _ => None,
    }
}

/// Per-agent policy; absent policies fall back to [`SecurityPolicy::default_for`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    pub agent_id: String,
    pub permissions: Vec<Permission>,
    pub network_allowlist: Vec<String>,
    pub max_concurrent_tasks: u32,
    pub max_messages_per_minute: u32,
    pub allow_cross_gateway: bool,
}

impl SecurityPolicy {
    /// Defaults applied when an agent has no explicit policy.
    pub fn default_for(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            permissions: vec![
                Permission::TaskAssign,
                Permission::ReportRead,
                Permission::ConfigRead,
            ],
            network_allowlist: Vec::new(),
            max_concurrent_tasks: constants::DEFAULT_MAX_CONCURRENT_TASKS,
            max_messages_per_minute: constants::DEFAULT_MAX_MESSAGES_PER_MINUTE,
            allow_cross_gateway: false,
        }
    }
}

/// One audited decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub action: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of [`SecurityManager::authorize_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Authorization {
    fn granted() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

struct AuditLog {
    entries: VecDeque<AuditEntry>,
    trim_pending: bool,
}

pub struct SecurityManager {
    secret: Vec<u8>,
    policies: RwLock<HashMap<String, SecurityPolicy>>,
    rate_windows: Mutex<HashMap<String, RateWindow>>,
    audit: Arc<Mutex<AuditLog>>,
}

impl SecurityManager {
    /// `secret` signs envelopes; when absent a random 32-byte secret is
    /// generated, which is fine for a single gateway but means peers cannot
    /// verify each other until they share one.
    pub fn new(secret: Option<Vec<u8>>) -> Self {
        let secret = secret.unwrap_or_else(|| {
            let mut bytes = vec![0u8; constants::SHARED_SECRET_BYTES];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        });
        Self {
            secret,
            policies: RwLock::new(HashMap::new()),
            rate_windows: Mutex::new(HashMap::new()),
            audit: Arc::new(Mutex::new(AuditLog {
                entries: VecDeque::new(),
                trim_pending: false,
            })),
        }
    }

    // --- policies ---------------------------------------------------------

    pub async fn set_policy(&self, policy: SecurityPolicy) {
        debug!("Set security policy for {}", policy.agent_id);
        self.policies
            .write()
            .await
            .insert(policy.agent_id.clone(), policy);
    }

    pub async fn remove_policy(&self, agent_id: &str) -> bool {
        self.policies.write().await.remove(agent_id).is_some()
    }

    /// Returns the stored policy, or the defaults when none is set.
    pub async fn get_policy(&self, agent_id: &str) -> SecurityPolicy {
        self.policies
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| SecurityPolicy::default_for(agent_id))
    }

    pub async fn export_policies(&self) -> Vec<SecurityPolicy> {
        self.policies.read().await.values().cloned().collect()
    }

    /// Total replace of the policy store.
    pub async fn import_policies(&self, policies: Vec<SecurityPolicy>) {
        let mut store = self.policies.write().await;
        store.clear();
        for policy in policies {
            store.insert(policy.agent_id.clone(), policy);
        }
    }

    // --- permission and rate checks ---------------------------------------

    pub async fn has_permission(&self, agent_id: &str, permission: Permission) -> bool {
        let allowed = self
            .get_policy(agent_id)
            .await
            .permissions
            .contains(&permission);
        self.record_audit(
            agent_id,
            format!("permission.check:{permission}"),
            allowed,
            None,
        )
        .await;
        allowed
    }

    /// Sliding 60 s window per agent, reset lazily on the first check after
    /// the window lapses.
    pub async fn check_rate_limit(&self, agent_id: &str) -> bool {
        let limit = self.get_policy(agent_id).await.max_messages_per_minute;
        let now = Utc::now();

        let (allowed, count) = {
            let mut windows = self.rate_windows.lock().await;
            let window = windows.entry(agent_id.to_string()).or_insert(RateWindow {
                window_start: now,
                count: 0,
            });
            if (now - window.window_start).num_milliseconds() > constants::RATE_WINDOW_MS {
                window.window_start = now;
                window.count = 0;
            }
            window.count += 1;
            (window.count <= limit, window.count)
        };

        if !allowed {
            warn!("Rate limit exceeded for {} ({}/{})", agent_id, count, limit);
            self.record_audit(
                agent_id,
                "rate-limit.exceeded",
                false,
                Some(format!("{count}/{limit}")),
            )
            .await;
        }
        allowed
    }

    // --- signatures -------------------------------------------------------

    fn compute_signature(&self, envelope: &Envelope, payload: &Payload) -> Result<Vec<u8>> {
        let canonical = serde_json::to_vec(&serde_json::json!({
            "messageId": envelope.message_id,
            "payload": payload,
        }))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| MeshError::Security("invalid HMAC key".to_string()))?;
        mac.update(&canonical);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// HMAC-SHA256 over the message id and payload, base64-encoded.
    pub fn sign_message(&self, envelope: &Envelope, payload: &Payload) -> Result<String> {
        Ok(BASE64.encode(self.compute_signature(envelope, payload)?))
    }

    /// Constant-time verification. False when the signature is absent,
    /// undecodable, or of the wrong length.
    pub fn verify_signature(&self, envelope: &Envelope, payload: &Payload) -> bool {
        let Some(signature) = &envelope.signature else {
            return false;
        };
        let Ok(provided) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(expected) = self.compute_signature(envelope, payload) else {
            return false;
        };
        if provided.len() != expected.len() {
            return false;
        }
        provided.ct_eq(&expected).into()
    }

    // --- message authorization --------------------------------------------

    /// Gate applied to every inbound message, in order: rate limit,
    /// cross-gateway policy, signature (when present), payload permission.
    pub async fn authorize_message(&self, message: &MultiAgentMessage) -> Authorization {
        let from = &message.envelope.from;
        let agent_id = from.agent_instance_id.as_str();

        if !self.check_rate_limit(agent_id).await {
            return Authorization::denied("rate limit exceeded");
        }

        if let Some(to) = &message.envelope.to {
            if to.gateway_id != from.gateway_id {
                let policy = self.get_policy(agent_id).await;
                if !policy.allow_cross_gateway {
                    self.record_audit(
                        agent_id,
                        "cross-gateway.denied",
                        false,
                        Some(format!("{} -> {}", from.gateway_id, to.gateway_id)),
                    )
                    .await;
                    return Authorization::denied("cross-gateway messaging not permitted");
                }
            }
        }

        if message.envelope.signature.is_some()
            && !self.verify_signature(&message.envelope, &message.payload)
        {
            self.record_audit(agent_id, "signature.invalid", false, None).await;
            return Authorization::denied("invalid signature");
        }

        if let Some(required) = required_permission(&message.payload) {
            if !self.has_permission(agent_id, required).await {
                return Authorization::denied(format!("missing permission {required}"));
            }
        }

        Authorization::granted()
    }

    // --- challenges -------------------------------------------------------

    /// Challenge payload for peer handshakes. Response verification is
    /// delegated to a pluggable Ed25519 verifier outside the core.
    pub fn generate_challenge(&self) -> Payload {
        let mut nonce = [0u8; constants::CHALLENGE_NONCE_BYTES];
        rand::thread_rng().fill_bytes(&mut nonce);
        Payload::SecurityChallenge {
            nonce: BASE64.encode(nonce),
            algorithm: "ed25519".to_string(),
        }
    }

    // --- audit log --------------------------------------------------------

    async fn record_audit(
        &self,
        agent_id: &str,
        action: impl Into<String>,
        allowed: bool,
        detail: Option<String>,
    ) {
        let mut log = self.audit.lock().await;
        log.entries.push_back(AuditEntry {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            action: action.into(),
            allowed,
            detail,
        });

        // Trim asynchronously; the pending flag keeps a burst from queueing
        // a trim per entry.
        if log.entries.len() > constants::AUDIT_LOG_CAPACITY && !log.trim_pending {
            log.trim_pending = true;
            let audit = Arc::clone(&self.audit);
            tokio::spawn(async move {
                let mut log = audit.lock().await;
                let excess =
                    (log.entries.len().saturating_sub(constants::AUDIT_LOG_CAPACITY))
                        .max(constants::AUDIT_TRIM_BATCH);
                for _ in 0..excess {
                    log.entries.pop_front();
                }
                log.trim_pending = false;
            });
        }
    }

    /// Most recent entries, oldest first.
    pub async fn get_audit_log(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        let limit = limit.unwrap_or(constants::DEFAULT_AUDIT_LIMIT);
        let log = self.audit.lock().await;
        let skip = log.entries.len().saturating_sub(limit);
        log.entries.iter().skip(skip).cloned().collect()
    }

    /// Most recent entries for one agent, oldest first.
    pub async fn get_agent_audit_log(&self, agent_id: &str, limit: Option<usize>) -> Vec<AuditEntry> {
        let limit = limit.unwrap_or(constants::DEFAULT_AGENT_AUDIT_LIMIT);
        let log = self.audit.lock().await;
        let matching: Vec<AuditEntry> = log
            .entries
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }
}
