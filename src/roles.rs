//! Role definitions and assignments with concurrency quotas.
//!
//! Six built-in roles are seeded on construction and may be re-defined.
//! The invariant enforced here: a role with `max_concurrent = k` never has
//! more than k distinct agent instances assigned to it at once.

use crate::constants;
use crate::protocol::AgentIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A named capability/constraint bundle assignable to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_fragment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_tools: Option<Vec<String>>,
    /// Hard cap on simultaneous assignments, in [1, 64].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
    /// Scheduling weight, in [0, 100].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl Role {
    pub fn new(role_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            name: name.into(),
            description: None,
            system_prompt_fragment: None,
            allowed_tools: None,
            denied_tools: None,
            max_concurrent: None,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(constants::MAX_ROLE_PRIORITY));
        self
    }

    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = Some(max.clamp(1, constants::MAX_ROLE_CONCURRENT));
        self
    }
}

/// A role held by one agent instance. At most one assignment per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub agent_instance_id: String,
    pub agent_config_id: String,
    pub gateway_id: String,
    pub role: Role,
    pub assigned_at: DateTime<Utc>,
    pub assigned_by: String,
}

/// Deep-copied snapshot for checkpointing; import is a total replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleManagerState {
    pub roles: Vec<Role>,
    pub assignments: Vec<RoleAssignment>,
}

pub struct RoleManager {
    roles: RwLock<HashMap<String, Role>>,
    assignments: RwLock<HashMap<String, RoleAssignment>>,
}

fn builtin_roles() -> Vec<Role> {
    vec![
        Role::new("orchestrator", "Orchestrator").with_priority(100),
        Role::new("monitor", "Monitor").with_priority(80),
        Role::new("reviewer", "Reviewer").with_priority(70),
        Role::new("coder", "Coder").with_priority(60),
        Role::new("researcher", "Researcher").with_priority(50),
        Role::new("executor", "Executor").with_priority(40),
    ]
}

impl RoleManager {
    /// New manager with the six built-in roles seeded.
    pub fn new() -> Self {
        let mut roles = HashMap::new();
        for role in builtin_roles() {
            roles.insert(role.role_id.clone(), role);
        }
        Self {
            roles: RwLock::new(roles),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    /// Upserts a role definition.
    pub async fn define_role(&self, role: Role) {
        debug!("Defining role {}", role.role_id);
        self.roles.write().await.insert(role.role_id.clone(), role);
    }

    /// Removes a role definition. Existing assignments are untouched.
    pub async fn remove_role(&self, role_id: &str) -> bool {
        self.roles.write().await.remove(role_id).is_some()
    }

    pub async fn get_role(&self, role_id: &str) -> Option<Role> {
        self.roles.read().await.get(role_id).cloned()
    }

    pub async fn list_roles(&self) -> Vec<Role> {
        self.roles.read().await.values().cloned().collect()
    }

    /// Assigns `role_id` to the agent, replacing any prior assignment for
    /// that instance.
    ///
    /// Returns `None` when the role does not exist or its `max_concurrent`
    /// quota is already held by other agents. An agent that already holds
    /// the role is not counted against the quota a second time.
    pub async fn assign_role(
        &self,
        agent: &AgentIdentity,
        role_id: &str,
        assigned_by: &str,
    ) -> Option<RoleAssignment> {
        let role = match self.get_role(role_id).await {
            Some(role) => role,
            None => {
                warn!("Cannot assign unknown role {}", role_id);
                return None;
            }
        };

        let mut assignments = self.assignments.write().await;

        if let Some(max) = role.max_concurrent {
            let holders = assignments
                .values()
                .filter(|a| {
                    a.role.role_id == role_id
                        && a.agent_instance_id != agent.agent_instance_id
                })
                .count();
            if holders as u32 >= max {
                warn!(
                    "Role {} at capacity ({}/{}), refusing assignment for {}",
                    role_id, holders, max, agent.agent_instance_id
                );
                return None;
            }
        }

        let assignment = RoleAssignment {
            agent_instance_id: agent.agent_instance_id.clone(),
            agent_config_id: agent.agent_config_id.clone(),
            gateway_id: agent.gateway_id.clone(),
            role,
            assigned_at: Utc::now(),
            assigned_by: assigned_by.to_string(),
        };

        info!(
            "Assigned role {} to agent {}",
            role_id, agent.agent_instance_id
        );
        assignments.insert(agent.agent_instance_id.clone(), assignment.clone());
        Some(assignment)
    }

    pub async fn unassign_role(&self, agent_instance_id: &str) -> bool {
        let removed = self.assignments.write().await.remove(agent_instance_id);
        if let Some(assignment) = &removed {
            info!(
                "Unassigned role {} from agent {}",
                assignment.role.role_id, agent_instance_id
            );
        }
        removed.is_some()
    }

    pub async fn get_assignment(&self, agent_instance_id: &str) -> Option<RoleAssignment> {
        self.assignments.read().await.get(agent_instance_id).cloned()
    }

    pub async fn count_agents_with_role(&self, role_id: &str) -> usize {
        self.assignments
            .read()
            .await
            .values()
            .filter(|a| a.role.role_id == role_id)
            .count()
    }

    pub async fn get_agents_with_role(&self, role_id: &str) -> Vec<RoleAssignment> {
        self.assignments
            .read()
            .await
            .values()
            .filter(|a| a.role.role_id == role_id)
            .cloned()
            .collect()
    }

    pub async fn list_assignments(&self) -> Vec<RoleAssignment> {
        self.assignments.read().await.values().cloned().collect()
    }

    pub async fn export_state(&self) -> RoleManagerState {
        RoleManagerState {
            roles: self.roles.read().await.values().cloned().collect(),
            assignments: self.assignments.read().await.values().cloned().collect(),
        }
    }

    /// Total replace of roles and assignments from a snapshot.
    pub async fn import_state(&self, state: RoleManagerState) {
        let mut roles = self.roles.write().await;
        let mut assignments = self.assignments.write().await;
        roles.clear();
        assignments.clear();
        for role in state.roles {
            roles.insert(role.role_id.clone(), role);
        }
        for assignment in state.assignments {
            assignments.insert(assignment.agent_instance_id.clone(), assignment);
        }
        info!(
            "Imported role state ({} roles, {} assignments)",
            roles.len(),
            assignments.len()
        );
    }
}

impl Default for RoleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(config_id: &str) -> AgentIdentity {
        AgentIdentity::new(config_id, "gw-a")
    }

    #[tokio::test]
    async fn test_builtin_roles_seeded() {
        let manager = RoleManager::new();
        let roles = manager.list_roles().await;
        assert_eq!(roles.len(), 6);

        for (role_id, priority) in [
            ("orchestrator", 100),
            ("monitor", 80),
            ("reviewer", 70),
            ("coder", 60),
            ("researcher", 50),
            ("executor", 40),
        ] {
            let role = manager.get_role(role_id).await.unwrap();
            assert_eq!(role.priority, Some(priority));
        }
    }

    #[tokio::test]
    async fn test_define_role_upserts() {
        let manager = RoleManager::new();
        manager
            .define_role(Role::new("coder", "Coder v2").with_priority(65))
            .await;

        let role = manager.get_role("coder").await.unwrap();
        assert_eq!(role.name, "Coder v2");
        assert_eq!(role.priority, Some(65));
        assert_eq!(manager.list_roles().await.len(), 6);
    }

    #[tokio::test]
    async fn test_assign_unknown_role_returns_none() {
        let manager = RoleManager::new();
        let result = manager.assign_role(&agent("a1"), "nonexistent", "test").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_max_concurrent_quota() {
        let manager = RoleManager::new();
        manager
            .define_role(Role::new("monitor", "Monitor").with_max_concurrent(1))
            .await;

        let a1 = agent("a1");
        let a2 = agent("a2");

        assert!(manager.assign_role(&a1, "monitor", "test").await.is_some());
        assert!(manager.assign_role(&a2, "monitor", "test").await.is_none());

        // releasing the quota makes room
        assert!(manager.unassign_role(&a1.agent_instance_id).await);
        assert!(manager.assign_role(&a2, "monitor", "test").await.is_some());
    }

    #[tokio::test]
    async fn test_reassigning_same_agent_not_double_counted() {
        let manager = RoleManager::new();
        manager
            .define_role(Role::new("monitor", "Monitor").with_max_concurrent(1))
            .await;

        let a1 = agent("a1");
        assert!(manager.assign_role(&a1, "monitor", "test").await.is_some());
        assert!(manager.assign_role(&a1, "monitor", "test").await.is_some());
        assert_eq!(manager.count_agents_with_role("monitor").await, 1);
    }

    #[tokio::test]
    async fn test_assignment_replaced_per_instance() {
        let manager = RoleManager::new();
        let a1 = agent("a1");

        manager.assign_role(&a1, "coder", "test").await.unwrap();
        manager.assign_role(&a1, "reviewer", "test").await.unwrap();

        let assignment = manager.get_assignment(&a1.agent_instance_id).await.unwrap();
        assert_eq!(assignment.role.role_id, "reviewer");
        assert_eq!(manager.count_agents_with_role("coder").await, 0);
        assert_eq!(manager.list_assignments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_role_does_not_cascade() {
        let manager = RoleManager::new();
        let a1 = agent("a1");
        manager.assign_role(&a1, "coder", "test").await.unwrap();

        assert!(manager.remove_role("coder").await);
        assert!(manager.get_role("coder").await.is_none());
        // existing assignment survives the definition removal
        assert!(manager.get_assignment(&a1.agent_instance_id).await.is_some());
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let manager = RoleManager::new();
        manager
            .define_role(Role::new("auditor", "Auditor").with_priority(90))
            .await;
        manager.assign_role(&agent("a1"), "auditor", "test").await.unwrap();

        let exported = manager.export_state().await;

        let restored = RoleManager::new();
        restored.import_state(exported.clone()).await;
        let reexported = restored.export_state().await;

        let mut a = exported.roles.clone();
        let mut b = reexported.roles.clone();
        a.sort_by(|x, y| x.role_id.cmp(&y.role_id));
        b.sort_by(|x, y| x.role_id.cmp(&y.role_id));
        assert_eq!(a, b);
        assert_eq!(exported.assignments.len(), reexported.assignments.len());
    }
}
