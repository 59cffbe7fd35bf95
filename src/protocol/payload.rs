use super::AgentIdentity;
use crate::{constants, MeshError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome reported in a `task.result` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Success,
    Partial,
    Failure,
    Timeout,
}

/// Action carried by an `agent.discovery` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryAction {
    Join,
    Leave,
    Announce,
}

/// Typed message payloads, discriminated by the literal `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    #[serde(rename = "task.assign")]
    #[serde(rename_all = "camelCase")]
    TaskAssign {
        task_id: String,
        task: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        priority: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_step_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_plan_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        requested_by: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
    },

    #[serde(rename = "task.result")]
    #[serde(rename_all = "camelCase")]
    TaskResult {
        status: TaskOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_step_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    #[serde(rename = "task.progress")]
    #[serde(rename_all = "camelCase")]
    TaskProgress {
        #[serde(skip_serializing_if = "Option::is_none")]
        workflow_step_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_line: Option<String>,
    },

    #[serde(rename = "heartbeat")]
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// Current load in [0, 1]; feeds agent selection.
        load: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_tasks: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_line: Option<String>,
    },

    #[serde(rename = "agent.discovery")]
    #[serde(rename_all = "camelCase")]
    AgentDiscovery {
        action: DiscoveryAction,
        agent: AgentIdentity,
    },

    #[serde(rename = "role.assign")]
    #[serde(rename_all = "camelCase")]
    RoleAssign {
        agent_instance_id: String,
        role_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        assigned_by: Option<String>,
    },

    #[serde(rename = "security.challenge")]
    #[serde(rename_all = "camelCase")]
    SecurityChallenge { nonce: String, algorithm: String },

    #[serde(rename = "security.response")]
    #[serde(rename_all = "camelCase")]
    SecurityResponse {
        nonce: String,
        signature: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
}

impl Payload {
    /// The literal `type` discriminator, used for subscription filters and
    /// the payload-to-permission map.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::TaskAssign { .. } => "task.assign",
            Payload::TaskResult { .. } => "task.result",
            Payload::TaskProgress { .. } => "task.progress",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::AgentDiscovery { .. } => "agent.discovery",
            Payload::RoleAssign { .. } => "role.assign",
            Payload::SecurityChallenge { .. } => "security.challenge",
            Payload::SecurityResponse { .. } => "security.response",
        }
    }

    /// Bounds validation for payload fields.
    pub fn validate(&self) -> Result<()> {
        match self {
            Payload::TaskAssign { task, priority, .. } => {
                if task.len() > constants::MAX_TASK_DESCRIPTION_LENGTH {
                    return Err(MeshError::Validation(format!(
                        "task description exceeds {} characters",
                        constants::MAX_TASK_DESCRIPTION_LENGTH
                    )));
                }
                if let Some(p) = priority {
                    if *p > 100 {
                        return Err(MeshError::Validation(format!(
                            "task priority out of range: {p}"
                        )));
                    }
                }
            }
            Payload::TaskResult { result, error, .. } => {
                for text in [result, error].into_iter().flatten() {
                    if text.len() > constants::MAX_RESULT_TEXT_LENGTH {
                        return Err(MeshError::Validation(format!(
                            "result text exceeds {} characters",
                            constants::MAX_RESULT_TEXT_LENGTH
                        )));
                    }
                }
            }
            Payload::TaskProgress {
                percent,
                status_line,
                ..
            } => {
                if let Some(p) = percent {
                    if !(0.0..=100.0).contains(p) {
                        return Err(MeshError::Validation(format!(
                            "progress percent out of range: {p}"
                        )));
                    }
                }
                if let Some(line) = status_line {
                    if line.len() > constants::MAX_STATUS_LINE_LENGTH {
                        return Err(MeshError::Validation(format!(
                            "status line exceeds {} characters",
                            constants::MAX_STATUS_LINE_LENGTH
                        )));
                    }
                }
            }
            Payload::Heartbeat { load, status_line, .. } => {
                if !(0.0..=1.0).contains(load) {
                    return Err(MeshError::Validation(format!(
                        "heartbeat load out of range: {load}"
                    )));
                }
                if let Some(line) = status_line {
                    if line.len() > constants::MAX_STATUS_LINE_LENGTH {
                        return Err(MeshError::Validation(format!(
                            "status line exceeds {} characters",
                            constants::MAX_STATUS_LINE_LENGTH
                        )));
                    }
                }
            }
            Payload::AgentDiscovery { .. }
            | Payload::RoleAssign { .. }
            | Payload::SecurityChallenge { .. }
            | Payload::SecurityResponse { .. } => {}
        }
        Ok(())
    }
}
