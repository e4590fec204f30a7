//! Frozen, validated domain entities (§3, §4.9).

pub mod canonical_json;
pub mod event;
pub mod metadata;
pub mod relay;
pub mod service_state;

pub use canonical_json::canonical_json;
pub use event::{Event, EventError};
pub use metadata::{Metadata, MetadataError, MetadataType};
pub use relay::{Network, Relay, RelayError};
pub use service_state::{CandidatePayload, ServiceState, StateType};
