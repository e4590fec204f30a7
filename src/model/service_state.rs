//! Generic per-service KV store model (§3).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateType {
    Candidate,
    Cursor,
    Monitoring,
    Publication,
}

impl StateType {
    pub fn as_str(self) -> &'static str {
        match self {
            StateType::Candidate => "candidate",
            StateType::Cursor => "cursor",
            StateType::Monitoring => "monitoring",
            StateType::Publication => "publication",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(StateType::Candidate),
            "cursor" => Some(StateType::Cursor),
            "monitoring" => Some(StateType::Monitoring),
            "publication" => Some(StateType::Publication),
            _ => None,
        }
    }
}

/// A `(service_name, state_type, state_key)` keyed JSON blob (§3). Used by
/// Finder for cursors, Validator for candidates, Synchronizer for
/// `last_synced_at`, and Monitor for publication timestamps.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service_name: String,
    pub state_type: StateType,
    pub state_key: String,
    pub payload: Value,
    pub updated_at: i64,
}

impl ServiceState {
    pub fn new(
        service_name: impl Into<String>,
        state_type: StateType,
        state_key: impl Into<String>,
        payload: Value,
        updated_at: i64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            state_type,
            state_key: state_key.into(),
            payload,
            updated_at,
        }
    }
}

/// The payload shape stored for a Validator candidate (§3, §4.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CandidatePayload {
    pub network: String,
    pub failed_attempts: u32,
    pub discovered_at: i64,
}
