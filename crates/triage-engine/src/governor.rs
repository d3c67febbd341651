use dashmap::DashMap;
use tracing::warn;

use triage_core::ids::SessionId;

pub const DEFAULT_TOOL_CALL_CEILING: u32 = 30;

/// Counters are scoped to one stage within one session.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct GovernorKey {
    pub session_id: SessionId,
    pub stage: String,
}

impl GovernorKey {
    pub fn new(session_id: &SessionId, stage: &str) -> Self {
        Self {
            session_id: session_id.clone(),
            stage: stage.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Allow { count: u32 },
    Deny { ceiling: u32 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }
}

/// Caps how many tool calls a stage may dispatch in one session.
pub struct ToolCallGovernor {
    counters: DashMap<GovernorKey, u32>,
    default_ceiling: u32,
}

impl ToolCallGovernor {
    pub fn new(default_ceiling: u32) -> Self {
        Self {
            counters: DashMap::new(),
            default_ceiling,
        }
    }

    pub fn default_ceiling(&self) -> u32 {
        self.default_ceiling
    }

    /// Count one dispatch for `key`. Denied once the count would exceed the ceiling.
    pub fn admit(&self, key: &GovernorKey, ceiling: Option<u32>) -> Admission {
        let ceiling = ceiling.unwrap_or(self.default_ceiling);
        let mut count = self.counters.entry(key.clone()).or_insert(0);
        if *count >= ceiling {
            warn!(
                session_id = %key.session_id,
                stage = %key.stage,
                ceiling,
                "tool call ceiling reached"
            );
            return Admission::Deny { ceiling };
        }
        *count += 1;
        Admission::Allow { count: *count }
    }

    /// Raise the counter to at least `count`, used when a suspended stage resumes
    /// in a process that never saw its earlier dispatches.
    pub fn restore(&self, key: &GovernorKey, count: u32) {
        let mut current = self.counters.entry(key.clone()).or_insert(0);
        if *current < count {
            *current = count;
        }
    }

    pub fn count(&self, key: &GovernorKey) -> u32 {
        self.counters.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Drop every counter belonging to `session_id`.
    pub fn reset(&self, session_id: &SessionId) {
        self.counters.retain(|key, _| &key.session_id != session_id);
    }
}

impl Default for ToolCallGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_CALL_CEILING)
    }
}
