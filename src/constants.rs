//! System-wide constants for the coordination core.

// Protocol
/// Wire protocol version literal carried by every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Agent instance id used for system-originated messages.
pub const ORCHESTRATOR_INSTANCE_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Agent config id used for system-originated messages.
pub const ORCHESTRATOR_CONFIG_ID: &str = "__orchestrator__";

// Routing
/// Dedup window capacity; exceeding it evicts the oldest entries.
pub const DEDUP_WINDOW_SIZE: usize = 10_000;

/// Fraction of the dedup window evicted on overflow (oldest first).
pub const DEDUP_EVICT_BATCH: usize = DEDUP_WINDOW_SIZE / 5;

/// Messages at or above this hop count are dropped, never forwarded.
pub const MAX_HOP_COUNT: u32 = 16;

/// Hard bound on the envelope hop-count field itself.
pub const MAX_ENVELOPE_HOP_COUNT: u32 = 32;

pub const MIN_TTL_SECONDS: u64 = 1;
pub const MAX_TTL_SECONDS: u64 = 86_400;

// Payload bounds
/// JSON-serialized payload size cap at the validation boundary.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Task description cap inside a `task.assign` payload.
pub const MAX_TASK_DESCRIPTION_LENGTH: usize = 65_536;

/// Task description cap at the external submission boundary.
pub const MAX_SUBMITTED_TASK_LENGTH: usize = 16_384;

pub const MAX_RESULT_TEXT_LENGTH: usize = 262_144;
pub const MAX_STATUS_LINE_LENGTH: usize = 1_024;
pub const MAX_AGENT_CONFIG_ID_LENGTH: usize = 128;
pub const MAX_ROLE_ID_LENGTH: usize = 64;

// Roles
pub const MAX_ROLE_CONCURRENT: u32 = 64;
pub const MAX_ROLE_PRIORITY: u8 = 100;

/// Role priority assumed for agents whose assignment carries none.
pub const DEFAULT_ROLE_PRIORITY: u8 = 50;

// Tasks
pub const DEFAULT_TASK_PRIORITY: u8 = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Tasks in a terminal state older than this are removed by cleanup.
pub const TASK_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// A non-terminal task is at risk once remaining time falls below this
/// fraction of its original deadline budget.
pub const AT_RISK_RATIO: f64 = 0.20;

// Security
pub const AUDIT_LOG_CAPACITY: usize = 10_000;
pub const AUDIT_TRIM_BATCH: usize = AUDIT_LOG_CAPACITY / 5;
pub const RATE_WINDOW_MS: i64 = 60_000;
pub const SHARED_SECRET_BYTES: usize = 32;
pub const CHALLENGE_NONCE_BYTES: usize = 32;
pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const DEFAULT_AGENT_AUDIT_LIMIT: usize = 50;

/// Policy defaults applied when an agent has no explicit policy.
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 8;
pub const DEFAULT_MAX_MESSAGES_PER_MINUTE: u32 = 120;

// Timers
pub const CLEANUP_INTERVAL_SECS: u64 = 3_600;
pub const ANNOUNCE_INTERVAL_SECS: u64 = 300;
