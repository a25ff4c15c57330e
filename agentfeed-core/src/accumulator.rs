use indexmap::IndexMap;

/// Per-agent concatenation of delta fragments for the current round.
///
/// Agents keep their first-seen order so flushes are deterministic.
#[derive(Debug, Default, Clone)]
pub struct AgentAccumulator {
    buffers: IndexMap<String, String>,
}

impl AgentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the agent's cumulative text.
    pub fn append(&mut self, agent_id: &str, fragment: &str) -> &str {
        let buf = self.buffers.entry(agent_id.to_string()).or_default();
        buf.push_str(fragment);
        buf.as_str()
    }

    pub fn get(&self, agent_id: &str) -> Option<&str> {
        self.buffers.get(agent_id).map(String::as_str)
    }

    /// Remove and return an agent's buffer. Empty buffers come back as `None`.
    pub fn take(&mut self, agent_id: &str) -> Option<String> {
        self.buffers
            .shift_remove(agent_id)
            .filter(|s| !s.is_empty())
    }

    /// Remove every non-empty buffer, in first-seen order.
    pub fn drain_non_empty(&mut self) -> Vec<(String, String)> {
        self.buffers
            .drain(..)
            .filter(|(_, text)| !text.is_empty())
            .collect()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.values().all(String::is_empty)
    }

    /// Number of agents seen in this round.
    pub fn agents(&self) -> usize {
        self.buffers.len()
    }

    /// Total accumulated bytes across all agents.
    pub fn total_len(&self) -> usize {
        self.buffers.values().map(String::len).sum()
    }
}
