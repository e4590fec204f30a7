//! BigBrotr: a Nostr relay observatory.
//!
//! Five services — Finder, Validator, Monitor, Synchronizer, Seeder —
//! coordinate exclusively through PostgreSQL (§1, §2). This crate provides
//! the shared library they're built from: configuration, the validated
//! domain model, the connection pool and database facade, the service
//! lifecycle, the never-raising health probes, and the shared WebSocket
//! transport. Each service's binary lives under `src/bin/`.

pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod probes;
pub mod services;
pub mod ws;

pub use error::{BigbrotrError, Result};

use once_cell::sync::OnceCell;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Initializes a global `tracing` subscriber, JSON-formatted to stdout with
/// an `EnvFilter` driven by `RUST_LOG` (default `info`). Idempotent: later
/// calls in the same process are no-ops.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    });
}
