//! Composition root for the coordination core.
//!
//! The orchestrator exclusively owns the router, role manager, work
//! tracker, and security manager, wires the built-in message handlers at
//! construction, selects agents for submitted tasks, and runs the periodic
//! cleanup and announce timers. Sub-managers expose pure APIs and hold no
//! back-references.

mod events;
mod selection;

pub use events::{EventListener, OrchestratorEvent};

use crate::config::Config;
use crate::protocol::{
    AgentIdentity, Direction, DiscoveryAction, Envelope, EnvelopeOptions, MultiAgentMessage,
    Payload,
};
use crate::roles::{RoleAssignment, RoleManager, RoleManagerState};
use crate::router::{HandlerFuture, Router, SubscriptionFilter};
use crate::security::{SecurityManager, SecurityPolicy};
use crate::validation::InputValidator;
use crate::work_tracker::{
    CreateTaskOptions, ReportOptions, TaskFilter, TaskResultRecord, TrackedTask, WorkReport,
    WorkSummary, WorkTracker,
};
use crate::{constants, Result};
use chrono::{DateTime, Utc};
use events::EventBus;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Latest heartbeat observed from an agent.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub load: f64,
    pub active_tasks: Option<u32>,
    pub status_line: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Inputs for [`Orchestrator::submit_task`].
#[derive(Debug, Clone, Default)]
pub struct SubmitTaskOptions {
    pub task: String,
    /// Restrict selection to holders of this role.
    pub target_role_id: Option<String>,
    /// Pin the task to one agent; selection yields none if it is not
    /// locally registered.
    pub target_agent_instance_id: Option<String>,
    pub priority: Option<u8>,
    pub deadline: Option<DateTime<Utc>>,
    pub workflow_step_id: Option<String>,
    pub workflow_plan_id: Option<String>,
    pub max_retries: Option<u32>,
    pub tags: Vec<String>,
    pub requested_by: Option<String>,
}

pub struct Orchestrator {
    config: Config,
    identity: AgentIdentity,
    validator: InputValidator,
    router: Arc<Router>,
    roles: Arc<RoleManager>,
    tracker: Arc<WorkTracker>,
    security: Arc<SecurityManager>,
    heartbeats: Arc<RwLock<HashMap<String, HeartbeatRecord>>>,
    events: Arc<EventBus>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub async fn new(config: Config) -> Result<Self> {
        let identity = AgentIdentity {
            agent_instance_id: constants::ORCHESTRATOR_INSTANCE_ID.to_string(),
            agent_config_id: constants::ORCHESTRATOR_CONFIG_ID.to_string(),
            gateway_id: config.gateway_id.clone(),
            role_id: Some("orchestrator".to_string()),
            display_name: Some("Orchestrator".to_string()),
            capabilities: None,
        };

        let router = Arc::new(Router::new(config.gateway_id.clone()));
        let roles = Arc::new(RoleManager::new());
        let tracker = Arc::new(WorkTracker::new());
        let security = Arc::new(SecurityManager::new(
            config.shared_secret.clone().map(String::into_bytes),
        ));
        let heartbeats: Arc<RwLock<HashMap<String, HeartbeatRecord>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let events = Arc::new(EventBus::new());

        Self::subscribe_handlers(&router, &tracker, &heartbeats, &events, &config.gateway_id)
            .await;

        info!("Orchestrator initialized on gateway {}", config.gateway_id);
        Ok(Self {
            config,
            identity,
            validator: InputValidator::new()?,
            router,
            roles,
            tracker,
            security,
            heartbeats,
            events,
            timers: Mutex::new(Vec::new()),
        })
    }

    async fn subscribe_handlers(
        router: &Arc<Router>,
        tracker: &Arc<WorkTracker>,
        heartbeats: &Arc<RwLock<HashMap<String, HeartbeatRecord>>>,
        events: &Arc<EventBus>,
        gateway_id: &str,
    ) {
        // task.result: correlate through the step index, finish the task
        {
            let tracker = tracker.clone();
            let events = events.clone();
            router
                .subscribe(
                    SubscriptionFilter::for_payload_type("task.result"),
                    move |message| {
                        let tracker = tracker.clone();
                        let events = events.clone();
                        Box::pin(async move {
                            let Payload::TaskResult {
                                workflow_step_id,
                                status,
                                result,
                                error,
                                duration_ms,
                                ..
                            } = message.payload
                            else {
                                return Ok(());
                            };
                            let Some(step_id) = workflow_step_id else {
                                // results without a step correlation are ignored
                                debug!("Ignoring task.result without workflowStepId");
                                return Ok(());
                            };
                            let Some(task_id) = tracker.task_for_step(&step_id).await else {
                                debug!("No tracked task for workflow step {}", step_id);
                                return Ok(());
                            };
                            let record = TaskResultRecord {
                                status,
                                result,
                                error,
                                duration_ms,
                            };
                            if tracker.complete_task(&task_id, record).await {
                                if let Some(task) = tracker.get_task(&task_id).await {
                                    events
                                        .emit(&OrchestratorEvent::TaskCompleted {
                                            task_id,
                                            status: task.status,
                                        })
                                        .await;
                                }
                            }
                            Ok(())
                        }) as HandlerFuture
                    },
                )
                .await;
        }

        // task.progress: idempotent progress updates
        {
            let tracker = tracker.clone();
            let events = events.clone();
            router
                .subscribe(
                    SubscriptionFilter::for_payload_type("task.progress"),
                    move |message| {
                        let tracker = tracker.clone();
                        let events = events.clone();
                        Box::pin(async move {
                            let Payload::TaskProgress {
                                workflow_step_id,
                                percent,
                                status_line,
                                ..
                            } = message.payload
                            else {
                                return Ok(());
                            };
                            let Some(step_id) = workflow_step_id else {
                                debug!("Ignoring task.progress without workflowStepId");
                                return Ok(());
                            };
                            let Some(task_id) = tracker.task_for_step(&step_id).await else {
                                debug!("No tracked task for workflow step {}", step_id);
                                return Ok(());
                            };
                            if tracker
                                .update_progress(&task_id, percent, status_line.clone())
                                .await
                            {
                                events
                                    .emit(&OrchestratorEvent::TaskProgress {
                                        task_id,
                                        percent,
                                        status_line,
                                    })
                                    .await;
                            }
                            Ok(())
                        }) as HandlerFuture
                    },
                )
                .await;
        }

        // heartbeat: remember the latest load per agent for selection
        {
            let heartbeats = heartbeats.clone();
            router
                .subscribe(
                    SubscriptionFilter::for_payload_type("heartbeat"),
                    move |message| {
                        let heartbeats = heartbeats.clone();
                        Box::pin(async move {
                            let Payload::Heartbeat {
                                load,
                                active_tasks,
                                status_line,
                            } = message.payload
                            else {
                                return Ok(());
                            };
                            heartbeats.write().await.insert(
                                message.envelope.from.agent_instance_id.clone(),
                                HeartbeatRecord {
                                    load,
                                    active_tasks,
                                    status_line,
                                    received_at: Utc::now(),
                                },
                            );
                            Ok(())
                        }) as HandlerFuture
                    },
                )
                .await;
        }

        // agent.discovery: surface join/leave of remote agents as events
        {
            let events = events.clone();
            let local_gateway = gateway_id.to_string();
            router
                .subscribe(
                    SubscriptionFilter::for_payload_type("agent.discovery"),
                    move |message| {
                        let events = events.clone();
                        let local_gateway = local_gateway.clone();
                        Box::pin(async move {
                            let Payload::AgentDiscovery { action, agent } = message.payload
                            else {
                                return Ok(());
                            };
                            if agent.gateway_id == local_gateway {
                                return Ok(());
                            }
                            let event = match action {
                                DiscoveryAction::Join | DiscoveryAction::Announce => {
                                    OrchestratorEvent::AgentJoined { agent }
                                }
                                DiscoveryAction::Leave => OrchestratorEvent::AgentLeft { agent },
                            };
                            events.emit(&event).await;
                            Ok(())
                        }) as HandlerFuture
                    },
                )
                .await;
        }
    }

    // --- composition accessors --------------------------------------------

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn roles(&self) -> &Arc<RoleManager> {
        &self.roles
    }

    pub fn tracker(&self) -> &Arc<WorkTracker> {
        &self.tracker
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    // --- events -----------------------------------------------------------

    pub async fn on_event<F>(&self, listener: F)
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(Arc::new(listener)).await;
    }

    // --- agent registry ---------------------------------------------------

    /// Registers a local agent and broadcasts its arrival to the mesh.
    pub async fn register_agent(&self, agent: AgentIdentity) -> Result<()> {
        self.validator
            .validate_agent_config_id(&agent.agent_config_id)?;
        self.validator.validate_uuid(&agent.agent_instance_id)?;

        self.router.register_local_agent(agent.clone()).await;
        self.router
            .send(
                self.identity.clone(),
                None,
                Payload::AgentDiscovery {
                    action: DiscoveryAction::Join,
                    agent,
                },
                EnvelopeOptions::default(),
            )
            .await;
        Ok(())
    }

    /// Unregisters a local agent, evicts its heartbeat, and broadcasts the
    /// departure.
    pub async fn unregister_agent(&self, agent_instance_id: &str) -> bool {
        let Some(agent) = self.router.get_local_agent(agent_instance_id).await else {
            return false;
        };
        self.router.unregister_local_agent(agent_instance_id).await;
        self.heartbeats.write().await.remove(agent_instance_id);
        self.router
            .send(
                self.identity.clone(),
                None,
                Payload::AgentDiscovery {
                    action: DiscoveryAction::Leave,
                    agent,
                },
                EnvelopeOptions::default(),
            )
            .await;
        true
    }

    pub async fn list_agents(&self) -> Vec<AgentIdentity> {
        self.router.list_local_agents().await
    }

    pub async fn latest_heartbeat(&self, agent_instance_id: &str) -> Option<HeartbeatRecord> {
        self.heartbeats.read().await.get(agent_instance_id).cloned()
    }

    // --- roles ------------------------------------------------------------

    /// Assigns a role to a locally registered agent. `None` when the agent
    /// is unknown, the role is undefined, or its quota is exhausted.
    pub async fn assign_role(
        &self,
        agent_instance_id: &str,
        role_id: &str,
        assigned_by: &str,
    ) -> Option<RoleAssignment> {
        let agent = self.router.get_local_agent(agent_instance_id).await?;
        let assignment = self.roles.assign_role(&agent, role_id, assigned_by).await?;

        // identities are value types: replace the stored one so future
        // envelopes from this agent carry the role
        self.router
            .register_local_agent(agent.with_role(role_id))
            .await;

        self.router
            .send(
                self.identity.clone(),
                None,
                Payload::RoleAssign {
                    agent_instance_id: agent_instance_id.to_string(),
                    role_id: role_id.to_string(),
                    assigned_by: Some(assigned_by.to_string()),
                },
                EnvelopeOptions {
                    direction: Some(Direction::Event),
                    ..Default::default()
                },
            )
            .await;
        Some(assignment)
    }

    pub async fn unassign_role(&self, agent_instance_id: &str) -> bool {
        let removed = self.roles.unassign_role(agent_instance_id).await;
        if removed {
            if let Some(agent) = self.router.get_local_agent(agent_instance_id).await {
                let mut cleared = agent;
                cleared.role_id = None;
                self.router.register_local_agent(cleared).await;
            }
        }
        removed
    }

    // --- tasks ------------------------------------------------------------

    /// Validates and tracks a task, then tries to place it on the best
    /// local agent (load ascending, role priority descending). With no
    /// eligible agent the task stays `pending` — a normal state, not an
    /// error.
    pub async fn submit_task(&self, opts: SubmitTaskOptions) -> Result<TrackedTask> {
        self.validator.validate_task_description(&opts.task)?;
        let description = self.validator.sanitize(&opts.task);
        if let Some(role_id) = &opts.target_role_id {
            self.validator.validate_role_id(role_id)?;
        }

        let task = self
            .tracker
            .create_task(CreateTaskOptions {
                task: description.clone(),
                correlation_id: None,
                requested_by: opts.requested_by.clone(),
                workflow_step_id: opts.workflow_step_id.clone(),
                workflow_plan_id: opts.workflow_plan_id.clone(),
                priority: opts.priority,
                deadline: opts.deadline,
                max_retries: opts.max_retries,
                tags: opts.tags.clone(),
            })
            .await;

        let selected = self
            .select_agent(
                opts.target_agent_instance_id.as_deref(),
                opts.target_role_id.as_deref(),
            )
            .await;

        let Some(agent) = selected else {
            debug!("No eligible agent for task {}; leaving pending", task.task_id);
            return Ok(task);
        };

        self.tracker
            .assign_task(&task.task_id, &agent.agent_instance_id)
            .await;
        self.tracker.start_task(&task.task_id).await;
        self.events
            .emit(&OrchestratorEvent::TaskAssigned {
                task_id: task.task_id.clone(),
                agent_instance_id: agent.agent_instance_id.clone(),
            })
            .await;

        let payload = Payload::TaskAssign {
            task_id: task.task_id.clone(),
            task: description,
            priority: Some(task.priority),
            workflow_step_id: task.workflow_step_id.clone(),
            workflow_plan_id: task.workflow_plan_id.clone(),
            deadline: task.deadline,
            requested_by: task.requested_by.clone(),
            tags: Some(task.tags.clone()),
        };
        let mut envelope = Envelope::new(
            self.identity.clone(),
            Some(agent),
            EnvelopeOptions {
                correlation_id: Some(task.correlation_id.clone()),
                ..Default::default()
            },
        );
        envelope.signature = Some(self.security.sign_message(&envelope, &payload)?);
        self.router
            .route(MultiAgentMessage { envelope, payload })
            .await;

        Ok(self.tracker.get_task(&task.task_id).await.unwrap_or(task))
    }

    async fn select_agent(
        &self,
        target_instance: Option<&str>,
        target_role: Option<&str>,
    ) -> Option<AgentIdentity> {
        if let Some(instance_id) = target_instance {
            return self.router.get_local_agent(instance_id).await;
        }

        let mut local = self.router.list_local_agents().await;
        if let Some(role_id) = target_role {
            let holders: HashSet<String> = self
                .roles
                .get_agents_with_role(role_id)
                .await
                .into_iter()
                .map(|a| a.agent_instance_id)
                .collect();
            local.retain(|a| holders.contains(&a.agent_instance_id));
        }

        let loads: HashMap<String, f64> = {
            let heartbeats = self.heartbeats.read().await;
            heartbeats
                .iter()
                .map(|(id, record)| (id.clone(), record.load))
                .collect()
        };

        let mut candidates = Vec::with_capacity(local.len());
        for agent in &local {
            let role_priority = self
                .roles
                .get_assignment(&agent.agent_instance_id)
                .await
                .and_then(|a| a.role.priority)
                .unwrap_or(constants::DEFAULT_ROLE_PRIORITY);
            candidates.push(selection::Candidate {
                agent_instance_id: agent.agent_instance_id.clone(),
                load: loads.get(&agent.agent_instance_id).copied().unwrap_or(0.0),
                role_priority,
            });
        }

        let chosen = selection::pick(candidates)?;
        local.into_iter().find(|a| a.agent_instance_id == chosen)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TrackedTask> {
        self.tracker.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<TrackedTask> {
        self.tracker.list_tasks(filter).await
    }

    pub async fn update_progress(
        &self,
        task_id: &str,
        percent: Option<f64>,
        status_line: Option<String>,
    ) -> bool {
        self.tracker.update_progress(task_id, percent, status_line).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> bool {
        self.tracker.cancel_task(task_id).await
    }

    pub async fn retry_task(&self, task_id: &str) -> bool {
        self.tracker.retry_task(task_id).await
    }

    pub async fn get_summary(&self) -> WorkSummary {
        self.tracker.get_summary().await
    }

    pub async fn generate_report(&self, opts: ReportOptions) -> WorkReport {
        self.tracker.generate_report(opts).await
    }

    // --- inbound gate -----------------------------------------------------

    /// Entry point for transport-inbound messages: protocol bounds and the
    /// security gate run before anything reaches a subscriber. Returns
    /// whether the message was accepted for routing.
    pub async fn ingest(&self, message: MultiAgentMessage) -> bool {
        let bounds = message
            .envelope
            .validate()
            .and_then(|_| message.payload.validate())
            .and_then(|_| self.validator.validate_payload_size(&message.payload));
        if let Err(e) = bounds {
            debug!(
                "Dropping invalid message {}: {}",
                message.envelope.message_id, e
            );
            return false;
        }

        let auth = self.security.authorize_message(&message).await;
        if !auth.allowed {
            debug!(
                "Rejected message {} from {}: {}",
                message.envelope.message_id,
                message.envelope.from.agent_instance_id,
                auth.reason.as_deref().unwrap_or("denied")
            );
            return false;
        }
        self.router.route(message).await;
        true
    }

    // --- checkpointing ----------------------------------------------------

    pub async fn export_state(&self) -> RoleManagerState {
        self.roles.export_state().await
    }

    pub async fn import_state(&self, state: RoleManagerState) {
        self.roles.import_state(state).await;
    }

    pub async fn export_policies(&self) -> Vec<SecurityPolicy> {
        self.security.export_policies().await
    }

    pub async fn import_policies(&self, policies: Vec<SecurityPolicy>) {
        self.security.import_policies(policies).await;
    }

    // --- lifecycle --------------------------------------------------------

    /// Announces local agents and starts the cleanup and announce timers.
    /// Idempotent while running.
    pub async fn start(&self) {
        let mut timers = self.timers.lock().await;
        if !timers.is_empty() {
            return;
        }

        self.broadcast_discovery(DiscoveryAction::Announce).await;

        let tracker = self.tracker.clone();
        let cleanup_secs = self.config.cleanup_interval_secs.max(1);
        timers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(cleanup_secs));
            interval.tick().await; // consume the immediate tick
            loop {
                interval.tick().await;
                tracker.cleanup(constants::TASK_MAX_AGE_MS).await;
            }
        }));

        let router = self.router.clone();
        let identity = self.identity.clone();
        let announce_secs = self.config.announce_interval_secs.max(1);
        timers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(announce_secs));
            interval.tick().await;
            loop {
                interval.tick().await;
                for agent in router.list_local_agents().await {
                    router
                        .send(
                            identity.clone(),
                            None,
                            Payload::AgentDiscovery {
                                action: DiscoveryAction::Announce,
                                agent,
                            },
                            EnvelopeOptions::default(),
                        )
                        .await;
                }
            }
        }));

        info!("Orchestrator started on gateway {}", self.config.gateway_id);
    }

    /// Cancels the timers and broadcasts a leave for every local agent.
    pub async fn stop(&self) {
        let mut timers = self.timers.lock().await;
        for timer in timers.drain(..) {
            timer.abort();
        }
        drop(timers);

        self.broadcast_discovery(DiscoveryAction::Leave).await;
        info!("Orchestrator stopped on gateway {}", self.config.gateway_id);
    }

    /// Alias for [`Orchestrator::stop`].
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    async fn broadcast_discovery(&self, action: DiscoveryAction) {
        for agent in self.router.list_local_agents().await {
            self.router
                .send(
                    self.identity.clone(),
                    None,
                    Payload::AgentDiscovery { action, agent },
                    EnvelopeOptions::default(),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests;
