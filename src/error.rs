use crate::config::ConfigError;
use crate::db::{ConnectionPoolError, QueryError};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, BigbrotrError>;

/// Top-level error type for all five services.
///
/// Variants map onto the error taxonomy in the specification: configuration
/// errors are fatal at startup, database errors are either transient
/// (`ConnectionPool`) or permanent (`Query`), and everything else surfaces
/// from a single cycle failure without being process-fatal on its own.
#[derive(Error, Debug)]
pub enum BigbrotrError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("connection pool error: {0}")]
    ConnectionPool(#[from] ConnectionPoolError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("nostr key error: {0}")]
    NostrKey(#[from] nostr::key::Error),

    #[error("nostr event builder error: {0}")]
    NostrEventBuilder(#[from] nostr::event::builder::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}
