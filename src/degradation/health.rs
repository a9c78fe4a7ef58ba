use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unavailable,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Health of one registered service, owned by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthRecord {
    pub name: String,
    pub state: HealthState,
    /// Degraded/unavailable marks since the last healthy mark
    pub consecutive_failures: u32,
    pub last_transition_at: DateTime<Utc>,
    pub reason: Option<String>,
}

impl ServiceHealthRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_transition_at: Utc::now(),
            reason: None,
        }
    }

    /// Apply a mark; returns the previous state
    pub(crate) fn transition(&mut self, state: HealthState, reason: Option<String>) -> HealthState {
        let previous = self.state;
        if state == HealthState::Healthy {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        if previous != state {
            self.last_transition_at = Utc::now();
        }
        self.state = state;
        self.reason = reason;
        previous
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_tracks_failures_and_timestamp() {
        let mut record = ServiceHealthRecord::new("database");
        let created = record.last_transition_at;

        assert_eq!(
            record.transition(HealthState::Degraded, Some("slow".to_string())),
            HealthState::Healthy
        );
        assert_eq!(
            record.transition(HealthState::Unavailable, Some("down".to_string())),
            HealthState::Degraded
        );
        assert_eq!(record.consecutive_failures, 2);
        assert!(record.last_transition_at >= created);

        record.transition(HealthState::Healthy, None);
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.is_healthy());
        assert_eq!(record.reason, None);
    }
}
