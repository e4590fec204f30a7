//! Finder (§4.4): grows the candidate pool from configured API sources and
//! from relay URLs embedded in already-archived events.

use crate::config::{ApiSource, FinderConfig};
use crate::db::{Database, DatabaseError};
use crate::lifecycle::Service;
use crate::model::{CandidatePayload, Relay, ServiceState, StateType};
use async_trait::async_trait;
use jmespatch as jmespath;
use reqwest::Client;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const SERVICE_NAME: &str = "finder";
/// Event kinds whose tags reference relay URLs: recommend-relay (2),
/// contact-list (3), relay-list metadata (10002).
const DISCOVERY_KINDS: [i32; 3] = [2, 3, 10002];

#[derive(Error, Debug)]
pub enum FinderError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

pub struct Finder {
    db: Database,
    http: Client,
    config: FinderConfig,
}

impl Finder {
    pub fn new(db: Database, config: FinderConfig) -> Self {
        Self {
            db,
            http: Client::new(),
            config,
        }
    }

    async fn discover_from_apis(&self) {
        for source in &self.config.api_sources {
            if let Err(e) = self.discover_from_one_api(source).await {
                tracing::warn!(
                    target: "bigbrotr::finder",
                    source = %source.url, error = %e, "api discovery source failed, skipping"
                );
            }
            tokio::time::sleep(Duration::from_millis(self.config.delay_between_requests_ms)).await;
        }
    }

    async fn discover_from_one_api(&self, source: &ApiSource) -> Result<(), String> {
        let body: serde_json::Value = self
            .http
            .get(&source.url)
            .timeout(Duration::from_secs(source.timeout_secs))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        // `jmespatch::Variable` search results are `Rc`-based and therefore
        // `!Send`; confine them to this block so nothing non-Send is held
        // live across the `.await` below (the future otherwise fails to be
        // `Send`, which `#[async_trait] Service::run_cycle` requires).
        let urls: Vec<String> = {
            let expr = jmespath::compile(&source.jmespath_expr).map_err(|e| e.to_string())?;
            let data: jmespath::Variable =
                body.try_into().map_err(|e: jmespath::JmespathError| e.to_string())?;
            let result = expr.search(Rc::new(data)).map_err(|e| e.to_string())?;
            result
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_string().cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        self.upsert_candidates(urls).await.map_err(|e| e.to_string())
    }

    async fn upsert_candidates(&self, urls: Vec<String>) -> Result<(), FinderError> {
        let existing = self.db.list_relays(None).await?;
        let known: std::collections::HashSet<String> =
            existing.iter().map(|r| r.url().to_string()).collect();

        let now = now_unix();
        let mut states = Vec::new();
        for raw in urls {
            let Ok(relay) = Relay::new(&raw, now) else {
                continue;
            };
            if known.contains(relay.url()) {
                continue;
            }
            let payload = CandidatePayload {
                network: relay.network().as_str().to_string(),
                failed_attempts: 0,
                discovered_at: now,
            };
            let value = match serde_json::to_value(&payload) {
                Ok(v) => v,
                Err(_) => continue,
            };
            states.push(ServiceState::new(
                SERVICE_NAME,
                StateType::Candidate,
                relay.url(),
                value,
                now,
            ));
        }
        if !states.is_empty() {
            self.db.upsert_service_state(&states).await?;
        }
        Ok(())
    }

    async fn discover_from_events(&self) -> Result<(), FinderError> {
        let cursor_key = "event_scan";
        let cursor = self
            .db
            .get_service_state(SERVICE_NAME, StateType::Cursor, cursor_key)
            .await?
            .and_then(|s| s.payload.as_i64())
            .unwrap_or(0);

        let rows = self
            .db
            .scan_events_for_relay_urls(&DISCOVERY_KINDS, cursor, self.config.batch_size)
            .await?;

        if rows.is_empty() {
            return Ok(());
        }

        let max_created_at = rows.iter().map(|(ts, _)| *ts).max().unwrap_or(cursor);
        let urls: Vec<String> = rows.into_iter().flat_map(|(_, values)| values).collect();
        self.upsert_candidates(urls).await?;

        let now = now_unix();
        let state = ServiceState::new(
            SERVICE_NAME,
            StateType::Cursor,
            cursor_key,
            serde_json::json!(max_created_at),
            now,
        );
        self.db
            .upsert_service_state(std::slice::from_ref(&state))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Service for Finder {
    type Error = FinderError;

    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn run_cycle(&self) -> Result<(), FinderError> {
        self.discover_from_apis().await;
        self.discover_from_events().await?;
        Ok(())
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
