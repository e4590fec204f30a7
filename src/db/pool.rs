//! Bounded, retrying PostgreSQL connection pool (§4.1).
//!
//! Built on `deadpool-postgres` + `tokio-postgres` for the pool and wire
//! protocol, with `backoff` supplying the exponential-retry policy — the
//! same combination the pack's job-driver binary utilities use for their
//! own Postgres bring-up (see DESIGN.md).

use crate::config::DatabaseConfig;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use deadpool_postgres::{Config as DpConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use thiserror::Error;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

pub type Params<'a> = &'a [&'a (dyn ToSql + Sync)];

/// Transient failures: connection lost, broken pipe, timeout acquiring a
/// connection. Retried inside the pool with backoff (§7).
#[derive(Error, Debug)]
pub enum ConnectionPoolError {
    #[error("failed to build pool: {0}")]
    Build(String),
    #[error("exhausted {attempts} attempts acquiring a connection: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: deadpool_postgres::PoolError,
    },
    #[error("pool acquisition error: {0}")]
    Acquire(#[from] deadpool_postgres::PoolError),
    #[error("health check failed: {0}")]
    HealthCheck(String),
}

/// Permanent failures: constraint violations, bad SQL, type mismatches.
/// Surfaced immediately, never retried (§7).
#[derive(Error, Debug)]
#[error("query failed: {0}")]
pub struct QueryError(#[from] tokio_postgres::Error);

impl QueryError {
    pub fn inner(&self) -> &tokio_postgres::Error {
        &self.0
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    pool: Pool,
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    exponential_backoff: bool,
    health_check_timeout: Duration,
}

impl ConnectionPool {
    /// Brings the pool up, retrying acquisition of the first connection up
    /// to `cfg.max_attempts` times with backoff from `initial_delay` to
    /// `max_delay`.
    pub async fn connect(
        cfg: &DatabaseConfig,
        user: &str,
        password: &str,
    ) -> Result<Self, ConnectionPoolError> {
        let mut dp_cfg = DpConfig::new();
        dp_cfg.host = Some(cfg.host.clone());
        dp_cfg.port = Some(cfg.port);
        dp_cfg.dbname = Some(cfg.dbname.clone());
        dp_cfg.user = Some(user.to_string());
        dp_cfg.password = Some(password.to_string());
        dp_cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        dp_cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: cfg.max_size as usize,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(cfg.acquisition_timeout()),
                create: Some(cfg.acquisition_timeout()),
                recycle: Some(cfg.acquisition_timeout()),
            },
            ..Default::default()
        });

        let pool = dp_cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ConnectionPoolError::Build(e.to_string()))?;

        let this = Self {
            pool,
            max_attempts: cfg.max_attempts,
            initial_delay: cfg.initial_delay(),
            max_delay: cfg.max_delay(),
            exponential_backoff: cfg.exponential_backoff,
            health_check_timeout: cfg.health_check_timeout(),
        };

        this.acquire_healthy().await?;
        tracing::info!(
            target: "bigbrotr::db::pool",
            host = %cfg.host, dbname = %cfg.dbname, "connection pool established"
        );
        Ok(this)
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        let mut b = ExponentialBackoff {
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            multiplier: if self.exponential_backoff { 2.0 } else { 1.0 },
            max_elapsed_time: Some(self.max_delay * self.max_attempts.max(1)),
            ..Default::default()
        };
        b.reset();
        b
    }

    /// Idempotent teardown.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Checks out a connection and issues a lightweight health query,
    /// discarding and retrying the checkout up to `max_attempts` times on
    /// failure.
    pub async fn acquire_healthy(&self) -> Result<(), ConnectionPoolError> {
        let mut attempt = 0u32;
        let mut backoff = self.backoff_policy();
        loop {
            attempt += 1;
            let result: Result<(), ConnectionPoolError> = async {
                let client = self.pool.get().await?;
                tokio::time::timeout(
                    self.health_check_timeout,
                    client.simple_query("SELECT 1"),
                )
                .await
                .map_err(|_| ConnectionPoolError::HealthCheck("timed out".into()))?
                .map_err(|e| ConnectionPoolError::HealthCheck(e.to_string()))?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(ConnectionPoolError::HealthCheck(format!(
                        "gave up after {attempt} attempts: {e}"
                    )))
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_delay);
                    tracing::warn!(
                        target: "bigbrotr::db::pool",
                        attempt, error = %e, "health check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, ConnectionPoolError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, deadpool_postgres::PoolError>>,
    {
        let mut attempt = 0u32;
        let mut backoff = self.backoff_policy();
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !is_transient(&e) || attempt >= self.max_attempts => {
                    return Err(ConnectionPoolError::Exhausted {
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_delay);
                    tracing::warn!(
                        target: "bigbrotr::db::pool",
                        attempt, error = %e, "transient pool error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Parameterized read returning all matching rows. Retries on transient
    /// connection errors only; SQL errors surface immediately as
    /// [`QueryError`].
    pub async fn fetch(&self, query: &str, args: Params<'_>) -> Result<Vec<Row>, BbQueryError> {
        let client = self
            .with_retry(|| async { self.pool.get().await })
            .await?;
        client
            .query(query, args)
            .await
            .map_err(|e| BbQueryError::Query(QueryError(e)))
    }

    pub async fn fetchrow(&self, query: &str, args: Params<'_>) -> Result<Option<Row>, BbQueryError> {
        let client = self
            .with_retry(|| async { self.pool.get().await })
            .await?;
        client
            .query_opt(query, args)
            .await
            .map_err(|e| BbQueryError::Query(QueryError(e)))
    }

    pub async fn fetchval<T>(&self, query: &str, args: Params<'_>) -> Result<T, BbQueryError>
    where
        T: for<'a> tokio_postgres::types::FromSql<'a>,
    {
        let client = self
            .with_retry(|| async { self.pool.get().await })
            .await?;
        client
            .query_one(query, args)
            .await
            .map_err(|e| BbQueryError::Query(QueryError(e)))
            .map(|row| row.get(0))
    }

    /// Parameterized mutation; returns the number of rows affected.
    pub async fn execute(&self, query: &str, args: Params<'_>) -> Result<u64, BbQueryError> {
        let client = self
            .with_retry(|| async { self.pool.get().await })
            .await?;
        client
            .execute(query, args)
            .await
            .map_err(|e| BbQueryError::Query(QueryError(e)))
    }

    /// Runs a multi-statement script (schema/DDL) with no parameter
    /// binding, retrying transient connection errors only.
    pub async fn execute_batch(&self, script: &str) -> Result<(), BbQueryError> {
        let client = self
            .with_retry(|| async { self.pool.get().await })
            .await?;
        client
            .batch_execute(script)
            .await
            .map_err(|e| BbQueryError::Query(QueryError(e)))
    }

    /// Scoped acquisition of a single connection with a BEGIN/COMMIT
    /// boundary (§4.1). The returned [`PoolTransaction`] rolls back on
    /// every exit path that isn't an explicit `commit()`, including a
    /// panic or an early return — see its `Drop` impl.
    pub async fn transaction(&self) -> Result<PoolTransaction, BbQueryError> {
        let client = self
            .with_retry(|| async { self.pool.get().await })
            .await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| BbQueryError::Query(QueryError(e)))?;
        Ok(PoolTransaction {
            client: Some(client),
        })
    }
}

/// A scoped, single-connection transaction. Holding this value keeps one
/// pool connection checked out with an open `BEGIN`. Dropping it without
/// calling [`PoolTransaction::commit`] spawns a best-effort `ROLLBACK` on
/// the connection before it is returned to the pool.
pub struct PoolTransaction {
    client: Option<deadpool_postgres::Object>,
}

impl PoolTransaction {
    pub async fn execute(&self, query: &str, args: Params<'_>) -> Result<u64, QueryError> {
        self.client
            .as_ref()
            .expect("transaction already finished")
            .execute(query, args)
            .await
            .map_err(QueryError)
    }

    pub async fn fetch(&self, query: &str, args: Params<'_>) -> Result<Vec<Row>, QueryError> {
        self.client
            .as_ref()
            .expect("transaction already finished")
            .query(query, args)
            .await
            .map_err(QueryError)
    }

    pub async fn fetchrow(&self, query: &str, args: Params<'_>) -> Result<Option<Row>, QueryError> {
        self.client
            .as_ref()
            .expect("transaction already finished")
            .query_opt(query, args)
            .await
            .map_err(QueryError)
    }

    /// Commits the transaction. Consumes `self` so a double-commit is a
    /// compile error, not a runtime one.
    pub async fn commit(mut self) -> Result<(), QueryError> {
        let client = self.client.take().expect("transaction already finished");
        client.batch_execute("COMMIT").await.map_err(QueryError)
    }

    /// Explicitly rolls back. Equivalent to dropping `self` without
    /// committing, but lets the caller observe rollback failures.
    pub async fn rollback(mut self) -> Result<(), QueryError> {
        let client = self.client.take().expect("transaction already finished");
        client.batch_execute("ROLLBACK").await.map_err(QueryError)
    }
}

impl Drop for PoolTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            tokio::spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!(
                        target: "bigbrotr::db::pool",
                        error = %e, "rollback on drop failed"
                    );
                }
            });
        }
    }
}

#[derive(Error, Debug)]
pub enum BbQueryError {
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

fn is_transient(e: &deadpool_postgres::PoolError) -> bool {
    use deadpool_postgres::PoolError;
    matches!(e, PoolError::Timeout(_) | PoolError::Backend(_) | PoolError::Closed)
}
