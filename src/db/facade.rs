//! Database facade (§4.2): the only object services talk to. Wraps
//! [`ConnectionPool`] and translates validated domain types into the
//! parallel-array stored-procedure calls defined in `migrations/`.

use crate::db::pool::{BbQueryError, ConnectionPool, Params};
use crate::model::{CandidatePayload, Event, Metadata, MetadataType, Relay, ServiceState, StateType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio_postgres::Row;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Query(#[from] BbQueryError),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("candidate payload is not valid json: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("stored metadata failed its integrity check: {0}")]
    Metadata(#[from] crate::model::MetadataError),
}

/// One `(relay, event, seen_at)` tuple bound for `insert_event_relay_cascade`
/// (§4.2, §9). The relay identifies where the event was seen.
#[derive(Debug, Clone)]
pub struct EventRelayRecord {
    pub relay: Relay,
    pub event: Event,
    pub seen_at: i64,
}

/// One `(relay, metadata, generated_at)` tuple bound for
/// `insert_relay_metadata_cascade` (§4.2, §9).
#[derive(Debug, Clone)]
pub struct RelayMetadataRecord {
    pub relay: Relay,
    pub metadata: Metadata,
    pub generated_at: i64,
}

/// Identifiers accepted by `refresh_materialized_view`: the stored-procedure
/// interface can't bind a view name as a query parameter, so it is validated
/// against this pattern before being interpolated into `REFRESH MATERIALIZED
/// VIEW CONCURRENTLY <name>` (§4.2).
static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap());

fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    if IDENT_RE.is_match(name) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// The facade services are built against. Owns a [`ConnectionPool`] and
/// exposes one method per §4.2 operation, each chunking its input at
/// `batch_max_size` so a single call never ships an unbounded array to
/// Postgres.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
    batch_max_size: usize,
}

impl Database {
    pub fn new(pool: ConnectionPool, batch_max_size: usize) -> Self {
        Self {
            pool,
            batch_max_size: batch_max_size.max(1),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Applies the embedded core schema and stored procedures. Idempotent:
    /// every statement uses `CREATE TABLE IF NOT EXISTS` / `CREATE OR REPLACE
    /// FUNCTION`.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");
        const PROCEDURES: &str = include_str!("../../migrations/0002_procedures.sql");
        self.pool.acquire_healthy().await.map_err(BbQueryError::from)?;
        self.pool.execute_batch(SCHEMA).await?;
        self.pool.execute_batch(PROCEDURES).await?;
        tracing::info!(target: "bigbrotr::db::facade", "schema migrated");
        Ok(())
    }

    fn chunks<'a, T>(&self, items: &'a [T]) -> impl Iterator<Item = &'a [T]> {
        items.chunks(self.batch_max_size)
    }

    /// `insert_relay` (§4.2): deduplicates by url, discards duplicates.
    pub async fn insert_relay(&self, relays: &[Relay]) -> Result<(), DatabaseError> {
        for chunk in self.chunks(relays) {
            let urls: Vec<&str> = chunk.iter().map(|r| r.url()).collect();
            let networks: Vec<&str> = chunk.iter().map(|r| r.network().as_str()).collect();
            let discovered_ats: Vec<i64> = chunk.iter().map(|r| r.discovered_at()).collect();
            let params: Params<'_> = &[&urls, &networks, &discovered_ats];
            self.pool
                .execute("SELECT insert_relay($1, $2, $3)", params)
                .await?;
        }
        Ok(())
    }

    /// `insert_metadata` (§4.2): content-addressed, deduplicates by
    /// `(id, type)`.
    pub async fn insert_metadata(&self, items: &[Metadata]) -> Result<(), DatabaseError> {
        for chunk in self.chunks(items) {
            let ids: Vec<&str> = chunk.iter().map(|m| m.id()).collect();
            let types: Vec<&str> = chunk.iter().map(|m| m.metadata_type().as_str()).collect();
            let datas: Vec<&Value> = chunk.iter().map(|m| m.data()).collect();
            let params: Params<'_> = &[&ids, &types, &datas];
            self.pool
                .execute("SELECT insert_metadata($1, $2, $3)", params)
                .await?;
        }
        Ok(())
    }

    /// `insert_event_relay_cascade` (§4.2, §9): atomically inserts the
    /// relay(s), the event(s), and the sighting link, one round trip per
    /// chunk.
    pub async fn insert_event_relay_cascade(
        &self,
        records: &[EventRelayRecord],
    ) -> Result<(), DatabaseError> {
        for chunk in self.chunks(records) {
            let relay_urls: Vec<&str> = chunk.iter().map(|r| r.relay.url()).collect();
            let relay_networks: Vec<&str> =
                chunk.iter().map(|r| r.relay.network().as_str()).collect();
            let relay_discovered_ats: Vec<i64> =
                chunk.iter().map(|r| r.relay.discovered_at()).collect();
            let event_ids: Vec<&[u8]> = chunk.iter().map(|r| r.event.id().as_slice()).collect();
            let event_pubkeys: Vec<&[u8]> =
                chunk.iter().map(|r| r.event.pubkey().as_slice()).collect();
            let event_sigs: Vec<&[u8]> = chunk.iter().map(|r| r.event.sig().as_slice()).collect();
            let event_created_ats: Vec<i64> =
                chunk.iter().map(|r| r.event.created_at()).collect();
            let event_kinds: Vec<i32> =
                chunk.iter().map(|r| r.event.kind() as i32).collect();
            let event_tags: Vec<Value> = chunk
                .iter()
                .map(|r| serde_json::to_value(r.event.tags()).unwrap_or(Value::Null))
                .collect();
            let event_contents: Vec<&str> = chunk.iter().map(|r| r.event.content()).collect();
            let event_tagvalues: Vec<Value> = chunk
                .iter()
                .map(|r| serde_json::to_value(r.event.tagvalues()).unwrap_or(Value::Null))
                .collect();
            let seen_ats: Vec<i64> = chunk.iter().map(|r| r.seen_at).collect();

            let params: Params<'_> = &[
                &relay_urls,
                &relay_networks,
                &relay_discovered_ats,
                &event_ids,
                &event_pubkeys,
                &event_sigs,
                &event_created_ats,
                &event_kinds,
                &event_tags,
                &event_contents,
                &event_tagvalues,
                &seen_ats,
            ];
            self.pool
                .execute(
                    "SELECT insert_event_relay_cascade($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                    params,
                )
                .await?;
        }
        Ok(())
    }

    /// `insert_relay_metadata_cascade` (§4.2, §8, §9).
    pub async fn insert_relay_metadata_cascade(
        &self,
        records: &[RelayMetadataRecord],
    ) -> Result<(), DatabaseError> {
        for chunk in self.chunks(records) {
            let relay_urls: Vec<&str> = chunk.iter().map(|r| r.relay.url()).collect();
            let relay_networks: Vec<&str> =
                chunk.iter().map(|r| r.relay.network().as_str()).collect();
            let relay_discovered_ats: Vec<i64> =
                chunk.iter().map(|r| r.relay.discovered_at()).collect();
            let metadata_ids: Vec<&str> = chunk.iter().map(|r| r.metadata.id()).collect();
            let metadata_types: Vec<&str> =
                chunk.iter().map(|r| r.metadata.metadata_type().as_str()).collect();
            let metadata_datas: Vec<&Value> = chunk.iter().map(|r| r.metadata.data()).collect();
            let generated_ats: Vec<i64> = chunk.iter().map(|r| r.generated_at).collect();

            let params: Params<'_> = &[
                &relay_urls,
                &relay_networks,
                &relay_discovered_ats,
                &metadata_ids,
                &metadata_types,
                &metadata_datas,
                &generated_ats,
            ];
            self.pool
                .execute(
                    "SELECT insert_relay_metadata_cascade($1, $2, $3, $4, $5, $6, $7)",
                    params,
                )
                .await?;
        }
        Ok(())
    }

    /// `upsert_service_state` (§4.2, §4.5): last-write-wins per
    /// `(service_name, state_type, state_key)`.
    pub async fn upsert_service_state(&self, states: &[ServiceState]) -> Result<(), DatabaseError> {
        for chunk in self.chunks(states) {
            let service_names: Vec<&str> = chunk.iter().map(|s| s.service_name.as_str()).collect();
            let state_types: Vec<&str> =
                chunk.iter().map(|s| s.state_type.as_str()).collect();
            let state_keys: Vec<&str> = chunk.iter().map(|s| s.state_key.as_str()).collect();
            let payloads: Vec<&Value> = chunk.iter().map(|s| &s.payload).collect();
            let updated_ats: Vec<i64> = chunk.iter().map(|s| s.updated_at).collect();

            let params: Params<'_> = &[
                &service_names,
                &state_types,
                &state_keys,
                &payloads,
                &updated_ats,
            ];
            self.pool
                .execute(
                    "SELECT upsert_service_state($1, $2, $3, $4, $5)",
                    params,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn get_service_state(
        &self,
        service_name: &str,
        state_type: StateType,
        state_key: &str,
    ) -> Result<Option<ServiceState>, DatabaseError> {
        let row = self
            .pool
            .fetchrow(
                "SELECT service_name, state_type, state_key, payload, updated_at \
                 FROM service_state WHERE service_name = $1 AND state_type = $2 AND state_key = $3",
                &[&service_name, &state_type.as_str(), &state_key],
            )
            .await?;
        Ok(row.map(|r| row_to_service_state(&r)))
    }

    /// Fetches every row of `state_type` for `service_name`, e.g. all
    /// Validator candidates or Synchronizer cursors.
    pub async fn list_service_state(
        &self,
        service_name: &str,
        state_type: StateType,
        limit: i64,
    ) -> Result<Vec<ServiceState>, DatabaseError> {
        let rows = self
            .pool
            .fetch(
                "SELECT service_name, state_type, state_key, payload, updated_at \
                 FROM service_state WHERE service_name = $1 AND state_type = $2 \
                 ORDER BY updated_at ASC LIMIT $3",
                &[&service_name, &state_type.as_str(), &limit],
            )
            .await?;
        Ok(rows.iter().map(row_to_service_state).collect())
    }

    pub async fn delete_service_state(
        &self,
        service_name: &str,
        state_type: StateType,
        state_key: &str,
    ) -> Result<(), DatabaseError> {
        self.pool
            .execute(
                "DELETE FROM service_state WHERE service_name = $1 AND state_type = $2 AND state_key = $3",
                &[&service_name, &state_type.as_str(), &state_key],
            )
            .await?;
        Ok(())
    }

    /// `promote_candidate` (§3, §4.5, §9): atomically inserts the relay and
    /// deletes its candidate row, in a single transaction so a crash between
    /// the two never leaves a relay with no candidate or a candidate with no
    /// relay.
    pub async fn promote_candidate(
        &self,
        relay: &Relay,
        service_name: &str,
    ) -> Result<(), DatabaseError> {
        self.pool
            .execute(
                "SELECT promote_candidate($1, $2, $3, $4)",
                &[
                    &relay.url(),
                    &relay.network().as_str(),
                    &relay.discovered_at(),
                    &service_name,
                ],
            )
            .await?;
        Ok(())
    }

    /// Records a failed probe attempt by bumping `failed_attempts` on the
    /// candidate's payload, or deletes it outright once `max_failures` is
    /// reached (§4.5).
    pub async fn record_candidate_failure(
        &self,
        service_name: &str,
        url: &str,
        mut payload: CandidatePayload,
        max_failures: u32,
        now: i64,
    ) -> Result<(), DatabaseError> {
        payload.failed_attempts += 1;
        if payload.failed_attempts >= max_failures {
            self.delete_service_state(service_name, StateType::Candidate, url)
                .await
        } else {
            let value = serde_json::to_value(&payload)?;
            let state =
                ServiceState::new(service_name, StateType::Candidate, url, value, now);
            self.upsert_service_state(std::slice::from_ref(&state)).await
        }
    }

    /// Batched `delete_orphan_event` (§4.2, §4.6): removes events with no
    /// remaining `event_relay` rows, `limit` rows per call, repeated by the
    /// caller until it returns 0.
    pub async fn delete_orphan_event(&self, limit: i64) -> Result<i64, DatabaseError> {
        let deleted: i64 = self
            .pool
            .fetchval("SELECT delete_orphan_event($1)", &[&limit])
            .await?;
        Ok(deleted)
    }

    /// Batched `delete_orphan_metadata` (§4.2, §4.6).
    pub async fn delete_orphan_metadata(&self, limit: i64) -> Result<i64, DatabaseError> {
        let deleted: i64 = self
            .pool
            .fetchval("SELECT delete_orphan_metadata($1)", &[&limit])
            .await?;
        Ok(deleted)
    }

    /// `REFRESH MATERIALIZED VIEW CONCURRENTLY <name>` (§4.2). The view name
    /// cannot be bound as a query parameter, so it is checked against
    /// [`IDENT_RE`] before being interpolated.
    pub async fn refresh_materialized_view(&self, name: &str) -> Result<(), DatabaseError> {
        validate_identifier(name)?;
        let sql = format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {name}");
        self.pool.execute_batch(&sql).await?;
        Ok(())
    }
}

impl Database {
    /// All validated relays, optionally filtered to `networks` (§4.7 step
    /// 2, §4.6 step 1).
    pub async fn list_relays(&self, networks: Option<&[&str]>) -> Result<Vec<Relay>, DatabaseError> {
        let rows = match networks {
            Some(nets) => {
                self.pool
                    .fetch(
                        "SELECT url, network, discovered_at FROM relay WHERE network = ANY($1)",
                        &[&nets],
                    )
                    .await?
            }
            None => {
                self.pool
                    .fetch("SELECT url, network, discovered_at FROM relay", &[])
                    .await?
            }
        };
        Ok(rows.iter().filter_map(row_to_relay).collect())
    }

    /// Relays whose most recent `relay_metadata.generated_at` for `metadata_type`
    /// is older than `cutoff`, or that have none at all (§4.6 step 1).
    pub async fn relays_due_for_check(
        &self,
        metadata_type: MetadataType,
        cutoff: i64,
        limit: i64,
    ) -> Result<Vec<Relay>, DatabaseError> {
        let rows = self
            .pool
            .fetch(
                "SELECT r.url, r.network, r.discovered_at FROM relay r \
                 LEFT JOIN (\
                   SELECT relay_url, MAX(generated_at) AS last_checked \
                   FROM relay_metadata WHERE metadata_type = $1 GROUP BY relay_url\
                 ) rm ON rm.relay_url = r.url \
                 WHERE rm.last_checked IS NULL OR rm.last_checked < $2 \
                 ORDER BY COALESCE(rm.last_checked, 0) ASC LIMIT $3",
                &[&metadata_type.as_str(), &cutoff, &limit],
            )
            .await?;
        Ok(rows.iter().filter_map(row_to_relay).collect())
    }

    /// Candidate rows ordered for Validator's fetch-chunk step (§4.5 step
    /// 3): fewer failed attempts first, then oldest.
    pub async fn fetch_candidate_chunk(
        &self,
        service_name: &str,
        networks: Option<&[&str]>,
        limit: i64,
    ) -> Result<Vec<(String, CandidatePayload)>, DatabaseError> {
        let rows = match networks {
            Some(nets) => {
                self.pool
                    .fetch(
                        "SELECT state_key, payload FROM service_state \
                         WHERE service_name = $1 AND state_type = 'candidate' \
                           AND payload->>'network' = ANY($2) \
                         ORDER BY (payload->>'failed_attempts')::int ASC, updated_at ASC \
                         LIMIT $3",
                        &[&service_name, &nets, &limit],
                    )
                    .await?
            }
            None => {
                self.pool
                    .fetch(
                        "SELECT state_key, payload FROM service_state \
                         WHERE service_name = $1 AND state_type = 'candidate' \
                         ORDER BY (payload->>'failed_attempts')::int ASC, updated_at ASC \
                         LIMIT $2",
                        &[&service_name, &limit],
                    )
                    .await?
            }
        };
        rows.iter()
            .map(|row| {
                let url: String = row.get("state_key");
                let payload: Value = row.get("payload");
                let candidate: CandidatePayload = serde_json::from_value(payload)?;
                Ok((url, candidate))
            })
            .collect()
    }

    /// Deletes candidates whose url already exists in `relay` (§4.5 step 1).
    pub async fn delete_stale_candidates(&self, service_name: &str) -> Result<u64, DatabaseError> {
        let n = self
            .pool
            .execute(
                "DELETE FROM service_state \
                 WHERE service_name = $1 AND state_type = 'candidate' \
                   AND state_key IN (SELECT url FROM relay)",
                &[&service_name],
            )
            .await?;
        Ok(n)
    }

    /// Deletes candidates that have exhausted `max_failures` (§4.5 step 2).
    pub async fn delete_exhausted_candidates(
        &self,
        service_name: &str,
        max_failures: u32,
    ) -> Result<u64, DatabaseError> {
        let n = self
            .pool
            .execute(
                "DELETE FROM service_state \
                 WHERE service_name = $1 AND state_type = 'candidate' \
                   AND (payload->>'failed_attempts')::int >= $2",
                &[&service_name, &(max_failures as i32)],
            )
            .await?;
        Ok(n)
    }

    /// Deletes cursors (`state_type = 'cursor'`) whose relay no longer
    /// exists (§4.7 step 1).
    pub async fn delete_orphan_cursors(&self, service_name: &str) -> Result<u64, DatabaseError> {
        let n = self
            .pool
            .execute(
                "DELETE FROM service_state \
                 WHERE service_name = $1 AND state_type = 'cursor' \
                   AND state_key NOT IN (SELECT url FROM relay)",
                &[&service_name],
            )
            .await?;
        Ok(n)
    }

    /// Event tagvalues for Finder's event-based discovery (§4.4 step 2):
    /// relay urls referenced by single-character-keyed tags of events of
    /// `kinds` created after `cursor`, up to `batch_size` events, ordered by
    /// `created_at`. Returns `(event created_at, tagvalues)` pairs; the
    /// caller advances its cursor to the maximum `created_at` returned.
    pub async fn scan_events_for_relay_urls(
        &self,
        kinds: &[i32],
        cursor: i64,
        batch_size: i64,
    ) -> Result<Vec<(i64, Vec<String>)>, DatabaseError> {
        let rows = self
            .pool
            .fetch(
                "SELECT created_at, tagvalues FROM event \
                 WHERE kind = ANY($1) AND created_at > $2 \
                 ORDER BY created_at ASC LIMIT $3",
                &[&kinds, &cursor, &batch_size],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let created_at: i64 = row.get("created_at");
                let tagvalues: Value = row.get("tagvalues");
                let values: Vec<String> = serde_json::from_value(tagvalues).unwrap_or_default();
                (created_at, values)
            })
            .collect())
    }
}

fn row_to_relay(row: &Row) -> Option<Relay> {
    let url: String = row.get("url");
    let discovered_at: i64 = row.get("discovered_at");
    Relay::new(&url, discovered_at).ok()
}

fn row_to_service_state(row: &Row) -> ServiceState {
    let state_type_str: String = row.get("state_type");
    ServiceState {
        service_name: row.get("service_name"),
        state_type: StateType::parse(&state_type_str).unwrap_or(StateType::Cursor),
        state_key: row.get("state_key"),
        payload: row.get("payload"),
        updated_at: row.get("updated_at"),
    }
}
