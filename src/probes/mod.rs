//! Never-raising health probes (§4.8).
//!
//! Every probe in this module returns a [`ProbeOutcome`] instead of
//! propagating an error: a probe failure is relay-reported data, not a
//! service fault. Callers that want to branch on "did the probe fail" check
//! `outcome.success`; `outcome.data` is only meaningful when it's `true`.

pub mod dns;
pub mod geo;
pub mod http;
pub mod net;
pub mod nip11;
pub mod rtt;
pub mod ssl;

use serde_json::Value;

/// The outcome of a single probe invocation (§4.8). `logs` accumulates
/// human-readable steps taken, useful for diagnosing why a relay failed a
/// check without needing to reproduce it.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,
    pub data: Value,
    pub reason: Option<String>,
    pub logs: Vec<String>,
}

impl ProbeOutcome {
    pub fn ok(data: Value, logs: Vec<String>) -> Self {
        Self {
            success: true,
            data,
            reason: None,
            logs,
        }
    }

    /// A failed probe still returns `Ok` at the Rust level; `reason`
    /// defaults to the `Display` of whatever error was classified, per the
    /// "never raise" contract (§4.8, and the open question resolved in
    /// SPEC_FULL.md §12).
    pub fn failed(reason: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            reason: Some(reason.into()),
            logs,
        }
    }
}
