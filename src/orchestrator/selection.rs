//! Load-based agent selection.

/// A local agent eligible for a task, scored by its latest heartbeat load
/// and the priority of its assigned role.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub agent_instance_id: String,
    pub load: f64,
    pub role_priority: u8,
}

/// Least-loaded wins; role priority (descending) breaks ties.
pub(crate) fn pick(mut candidates: Vec<Candidate>) -> Option<String> {
    candidates.sort_by(|a, b| {
        a.load
            .total_cmp(&b.load)
            .then_with(|| b.role_priority.cmp(&a.role_priority))
    });
    candidates.into_iter().next().map(|c| c.agent_instance_id)
}
