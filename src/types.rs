//! Agent identity and clock helpers used across the crate

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

pub type AgentId = String;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// `start + timeout`, saturating to roughly thirty years out so that
/// `Duration::MAX` reads as "no deadline"
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + Duration::from_secs(86400 * 365 * 30))
}

/// A swarm member as supplied by the membership directory at request time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Explicit voting weight; `None` falls back to the algorithm's table
    pub weight: Option<f64>,
    /// Expertise domain used by weighted presets
    pub domain: Option<String>,
    /// Last state version counter observed for this agent
    pub state_version: u64,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            weight: None,
            domain: None,
            state_version: 0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

impl From<&str> for Agent {
    fn from(id: &str) -> Self {
        Agent::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_saturates() {
        let start = Instant::now();
        assert_eq!(deadline_after(start, Duration::from_secs(1)), start + Duration::from_secs(1));
        assert!(deadline_after(start, Duration::MAX) > start + Duration::from_secs(86400 * 365));
    }
}
