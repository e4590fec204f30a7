//! Validator (§4.5): moves candidates to relays atomically, probing each
//! with a minimal "is this a Nostr relay" WebSocket handshake.

use crate::config::ValidatorConfig;
use crate::db::{Database, DatabaseError};
use crate::lifecycle::Service;
use crate::model::{CandidatePayload, Network, Relay};
use crate::services::NetworkSemaphores;
use crate::ws::{self, ProxyConfig};
use async_trait::async_trait;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use nostr::message::{ClientMessage, RelayMessage};
use nostr::{EventBuilder, Filter, Keys, Kind, Tag};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

const SERVICE_NAME: &str = "validator";

#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

pub struct Validator {
    db: Database,
    config: ValidatorConfig,
    semaphores: NetworkSemaphores,
    proxy: Option<ProxyConfig>,
    keys: Option<Keys>,
}

impl Validator {
    pub fn new(
        db: Database,
        config: ValidatorConfig,
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

    fn enabled_networks(&self) -> Option<Vec<&str>> {
        self.config
            .enabled_networks
            .as_ref()
            .map(|nets| nets.iter().map(String::as_str).collect())
    }

    async fn process_chunk(&self) -> Result<usize, ValidatorError> {
        let networks = self.enabled_networks();
        let chunk = self
            .db
            .fetch_candidate_chunk(
                SERVICE_NAME,
                networks.as_deref(),
                self.config.chunk_size,
            )
            .await?;
        if chunk.is_empty() {
            return Ok(0);
        }

        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let futures = chunk.into_iter().map(|(url, payload)| {
            let sem = self.semaphores.for_network(
                Network::parse(&payload.network).unwrap_or(Network::Clearnet),
            );
            let proxy = self.proxy.clone();
            let keys = self.keys.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore is never closed");
                let is_relay =
                    is_nostr_relay(&url, &payload, proxy.as_ref(), keys.as_ref(), timeout).await;
                (url, payload, is_relay)
            }
        });

        let results = join_all(futures).await;
        let count = results.len();

        for (url, payload, is_relay) in results {
            if is_relay {
                if let Ok(relay) = Relay::new(&url, payload.discovered_at) {
                    if let Err(e) = self.db.promote_candidate(&relay, SERVICE_NAME).await {
                        tracing::warn!(target: "bigbrotr::validator", url = %url, error = %e, "promotion failed");
                    }
                }
            } else {
                let now = now_unix();
                if let Err(e) = self
                    .db
                    .record_candidate_failure(
                        SERVICE_NAME,
                        &url,
                        payload,
                        self.config.max_failures,
                        now,
                    )
                    .await
                {
                    tracing::warn!(target: "bigbrotr::validator", url = %url, error = %e, "failure recording failed");
                }
            }
        }

        Ok(count)
    }
}

#[async_trait]
impl Service for Validator {
    type Error = ValidatorError;

    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn run_cycle(&self) -> Result<(), ValidatorError> {
        self.db.delete_stale_candidates(SERVICE_NAME).await?;
        self.db
            .delete_exhausted_candidates(SERVICE_NAME, self.config.max_failures)
            .await?;

        let mut processed = 0u64;
        loop {
            let n = self.process_chunk().await?;
            if n == 0 {
                break;
            }
            processed += n as u64;
            if processed >= self.config.max_candidates_per_cycle {
                break;
            }
        }
        Ok(())
    }
}

/// Liveness probe: open a WebSocket connection, send a `REQ`, and accept
/// only the documented Nostr relay responses as proof the endpoint speaks
/// the protocol (§4.5 step 4, §6): an `EOSE` for our subscription, a
/// `CLOSED "auth-required: ..."`, or an `AUTH` challenge (which, when a
/// signing key is configured, is answered with a kind-22242 event per
/// NIP-42 before being accepted). Never raises: any failure maps to
/// `false`.
async fn is_nostr_relay(
    url: &str,
    payload: &CandidatePayload,
    proxy: Option<&ProxyConfig>,
    keys: Option<&Keys>,
    timeout: Duration,
) -> bool {
    let network = Network::parse(&payload.network).unwrap_or(Network::Clearnet);
    let mut socket = match ws::dial(url, network, proxy, false, timeout).await {
        Ok(s) => s,
        Err(_) => return false,
    };

    let sub_id = nostr::SubscriptionId::generate();
    let filter = Filter::new().limit(0);
    let req = ClientMessage::req(sub_id.clone(), vec![filter]);
    if socket.send(Message::Text(req.as_json())).await.is_err() {
        let _ = socket.close(None).await;
        return false;
    }

    let accepted = tokio::time::timeout(
        timeout,
        wait_for_validation_signal(&mut socket, &sub_id, url, keys),
    )
    .await;
    let _ = socket.close(None).await;
    matches!(accepted, Ok(true))
}

/// Reads relay messages until one of the documented validation signals
/// arrives, or the connection closes.
async fn wait_for_validation_signal(
    socket: &mut ws::Socket,
    sub_id: &nostr::SubscriptionId,
    relay_url: &str,
    keys: Option<&Keys>,
) -> bool {
    loop {
        let msg = match socket.next().await {
            Some(Ok(m)) => m,
            _ => return false,
        };
        let Message::Text(text) = msg else { continue };
        match RelayMessage::from_json(&text) {
            Ok(RelayMessage::EndOfStoredEvents(id)) if &id == sub_id => return true,
            Ok(RelayMessage::Closed { subscription_id, message })
                if &subscription_id == sub_id && message.starts_with("auth-required") =>
            {
                return true;
            }
            Ok(RelayMessage::Auth { challenge }) => {
                if let Some(keys) = keys {
                    if let Ok(event) = build_auth_event(relay_url, &challenge, keys) {
                        let auth = ClientMessage::auth(event);
                        let _ = socket.send(Message::Text(auth.as_json())).await;
                    }
                }
                return true;
            }
            _ => continue,
        }
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
