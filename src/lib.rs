//! # Mesh Core
//!
//! Mesh Core is the coordination heart of a multi-agent gateway mesh: it
//! routes typed messages between agents co-located on a gateway and across
//! peer gateways, assigns roles under concurrency quotas, tracks tasks
//! through their lifecycle with load-based agent selection, and enforces
//! per-agent security policies.
//!
//! ## Architecture
//!
//! Five components compose the core:
//! - **Protocol**: the typed envelope schema and payload variants
//! - **Router**: subscription dispatch, dedup, TTL/hop enforcement, peer
//!   forwarding through an injected transport
//! - **Role Manager**: role definitions and quota-checked assignments
//! - **Work Tracker**: the task state machine, indices, and workload stats
//! - **Security Manager**: policies, HMAC signatures, rate limits, audit
//!
//! The [`orchestrator::Orchestrator`] owns all four managers and is the
//! only mutation path between them; it can be instantiated any number of
//! times in one process.
//!
//! State is in-memory. Export/import snapshots cover checkpointing; the
//! peer transport, RPC surface, and dashboards are external collaborators.

/// Runtime configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Composition root: agent selection, handlers, lifecycle
pub mod orchestrator;
/// Typed message schema (envelope, identity, payloads)
pub mod protocol;
/// Role definitions and quota-checked assignments
pub mod roles;
/// Message routing, dedup, peer forwarding
pub mod router;
/// Policies, signatures, rate limiting, audit log
pub mod security;
/// Input validation and sanitization
pub mod validation;
/// Task lifecycle tracking and workload statistics
pub mod work_tracker;

pub use error::{MeshError, Result};
pub use orchestrator::{Orchestrator, OrchestratorEvent, SubmitTaskOptions};
pub use protocol::{AgentIdentity, Envelope, MultiAgentMessage, Payload};
