//! Connection pool and database facade (§4.1, §4.2).

pub mod facade;
pub mod pool;

pub use facade::{Database, DatabaseError, EventRelayRecord, RelayMetadataRecord};
pub use pool::{BbQueryError as QueryError, ConnectionPool, ConnectionPoolError};

// The specification's §7 taxonomy distinguishes `ConnectionPoolError`
// (transient) from `QueryError` (permanent). `pool::QueryError` is the
// concrete permanent-failure type; `BbQueryError` wraps both into the
// facade-facing error surface and is re-exported here as `QueryError` so
// `crate::error::BigbrotrError` only needs one `#[from]` arm for database
// failures, matching the two-tier taxonomy from the outside while keeping
// the transient/permanent distinction available via `QueryError::Pool` /
// `QueryError::Query` for callers that need to branch on it (e.g. metrics
// labeling by error kind, §4.3).
