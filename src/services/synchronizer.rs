//! Synchronizer (§4.7): archives events from every validated relay with
//! per-relay incremental cursors.

use crate::config::SynchronizerConfig;
use crate::db::{Database, DatabaseError, EventRelayRecord};
use crate::lifecycle::Service;
use crate::model::{Event, Relay, ServiceState, StateType};
use crate::services::NetworkSemaphores;
use crate::ws::{self, ProxyConfig};
use async_trait::async_trait;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use nostr::message::{ClientMessage, RelayMessage};
use nostr::{EventBuilder, Keys, Kind, Tag};
use rand::seq::SliceRandom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

const SERVICE_NAME: &str = "synchronizer";

#[derive(Error, Debug)]
pub enum SynchronizerError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

pub struct Synchronizer {
    db: Database,
    config: SynchronizerConfig,
    semaphores: NetworkSemaphores,
    proxy: Option<ProxyConfig>,
    keys: Option<Keys>,
}

impl Synchronizer {
    pub fn new(
        db: Database,
        config: SynchronizerConfig,
        proxy: Option<ProxyConfig>,
        keys: Option<Keys>,
    ) -> Self {
        let semaphores = NetworkSemaphores::new(&config.network_concurrency);
        Self {
            db,
            config,
            semaphores,
            proxy,
            keys,
        }
    }

    async fn cursor_for(&self, url: &str) -> Result<i64, SynchronizerError> {
        let state = self
            .db
            .get_service_state(SERVICE_NAME, StateType::Cursor, url)
            .await?;
        Ok(state
            .and_then(|s| s.payload.as_i64())
            .unwrap_or(self.config.default_start))
    }

    async fn sync_one(&self, relay: Relay) {
        let sem = self.semaphores.for_network(relay.network());
        let _permit = sem.acquire().await.expect("semaphore is never closed");

        let cursor = match self.cursor_for(relay.url()).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(target: "bigbrotr::synchronizer", url = relay.url(), error = %e, "failed loading cursor");
                return;
            }
        };

        let now = now_unix();
        let window_start = (cursor + 1).max(self.config.default_start);
        let window_end = now - self.config.lookback_seconds;
        if window_start > window_end {
            return;
        }

        let timeout = Duration::from_secs(self.config.relay_timeout_secs);
        match tokio::time::timeout(
            timeout,
            self.pull_events(&relay, window_start, window_end),
        )
        .await
        {
            Ok(Ok(max_seen)) => {
                if let Some(max_seen) = max_seen {
                    self.flush_cursor(relay.url(), max_seen).await;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "bigbrotr::synchronizer", url = relay.url(), error = %e, "sync failed");
            }
            Err(_) => {
                tracing::warn!(target: "bigbrotr::synchronizer", url = relay.url(), "sync timed out, flushing partial progress");
            }
        }
    }

    async fn flush_cursor(&self, url: &str, created_at: i64) {
        let state = ServiceState::new(
            SERVICE_NAME,
            StateType::Cursor,
            url,
            serde_json::json!(created_at),
            now_unix(),
        );
        if let Err(e) = self
            .db
            .upsert_service_state(std::slice::from_ref(&state))
            .await
        {
            tracing::warn!(target: "bigbrotr::synchronizer", url, error = %e, "failed flushing cursor");
        }
    }

    /// Streams events from `relay` within `[window_start, window_end]`,
    /// validating and batching them, returning the max `created_at` seen.
    async fn pull_events(
        &self,
        relay: &Relay,
        window_start: i64,
        window_end: i64,
    ) -> Result<Option<i64>, String> {
        let mut socket = ws::dial(
            relay.url(),
            relay.network(),
            self.proxy.as_ref(),
            self.config.allow_insecure_tls_fallback,
            Duration::from_secs(self.config.relay_timeout_secs),
        )
        .await
        .map_err(|e| e.to_string())?;

        let mut filter = nostr::Filter::new()
            .since(nostr::Timestamp::from(window_start.max(0) as u64))
            .until(nostr::Timestamp::from(window_end.max(0) as u64))
            .limit(self.config.subscription_limit);
        if let Some(kinds) = &self.config.filter_kinds {
            filter = filter.kinds(kinds.iter().map(|k| nostr::Kind::Custom(*k)));
        }
        if let Some(authors) = &self.config.filter_authors {
            let keys: Vec<nostr::PublicKey> = authors
                .iter()
                .filter_map(|a| nostr::PublicKey::from_hex(a).ok())
                .collect();
            filter = filter.authors(keys);
        }

        let sub_id = nostr::SubscriptionId::generate();
        let req = ClientMessage::req(sub_id.clone(), vec![filter]);
        socket
            .send(Message::Text(req.as_json()))
            .await
            .map_err(|e| e.to_string())?;

        let mut batch = Vec::new();
        let mut max_seen: Option<i64> = None;
        let mut last_flush = std::time::Instant::now();
        let flush_interval = Duration::from_secs(self.config.cursor_flush_interval_secs);

        while let Some(msg) = socket.next().await {
            let msg = msg.map_err(|e| e.to_string())?;
            let Message::Text(text) = msg else { continue };
            match RelayMessage::from_json(&text) {
                Ok(RelayMessage::Event { event, .. }) => {
                    if let Ok(valid) = Event::from_nostr_event(&event, window_start, window_end) {
                        let created_at = valid.created_at();
                        max_seen = Some(max_seen.map_or(created_at, |m| m.max(created_at)));
                        batch.push(EventRelayRecord {
                            relay: relay.clone(),
                            event: valid,
                            seen_at: now_unix(),
                        });
                    }
                    if batch.len() >= 1000 {
                        self.flush_batch(&mut batch).await;
                    }
                }
                Ok(RelayMessage::EndOfStoredEvents(id)) if id == sub_id => break,
                Ok(RelayMessage::Auth { challenge }) => {
                    if let Some(keys) = &self.keys {
                        if let Ok(event) = build_auth_event(relay.url(), &challenge, keys) {
                            let auth = ClientMessage::auth(event);
                            let _ = socket.send(Message::Text(auth.as_json())).await;
                        }
                    }
                }
                _ => {}
            }

            if last_flush.elapsed() >= flush_interval {
                if let Some(ts) = max_seen {
                    self.flush_cursor(relay.url(), ts).await;
                }
                last_flush = std::time::Instant::now();
            }
        }

        self.flush_batch(&mut batch).await;
        let _ = socket.send(Message::Text(ClientMessage::close(sub_id).as_json())).await;
        let _ = socket.close(None).await;
        Ok(max_seen)
    }

    async fn flush_batch(&self, batch: &mut Vec<EventRelayRecord>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.db.insert_event_relay_cascade(batch).await {
            tracing::warn!(target: "bigbrotr::synchronizer", error = %e, "batch insert failed");
        }
        batch.clear();
    }
}

#[async_trait]
impl Service for Synchronizer {
    type Error = SynchronizerError;

    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn run_cycle(&self) -> Result<(), SynchronizerError> {
        self.db.delete_orphan_cursors(SERVICE_NAME).await?;

        let networks: Option<Vec<&str>> = self
            .config
            .enabled_networks
            .as_ref()
            .map(|nets| nets.iter().map(String::as_str).collect());
        let mut relays = self.db.list_relays(networks.as_deref()).await?;
        relays.shuffle(&mut rand::thread_rng());

        let tasks = relays.into_iter().map(|relay| self.sync_one(relay));
        join_all(tasks).await;
        Ok(())
    }
}

/// Builds the NIP-42 kind-22242 auth event answering `challenge`.
fn build_auth_event(
    relay_url: &str,
    challenge: &str,
    keys: &Keys,
) -> Result<nostr::Event, nostr::event::builder::Error> {
    let tags = vec![
        Tag::custom(nostr::TagKind::Custom("relay".into()), [relay_url.to_string()]),
        Tag::custom(nostr::TagKind::Custom("challenge".into()), [challenge.to_string()]),
    ];
    EventBuilder::new(Kind::Custom(22242), "", tags).to_event(keys)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
