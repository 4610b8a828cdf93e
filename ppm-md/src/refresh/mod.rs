//! Refresh controller
//!
//! One cycle: IDLE -> ATTEMPTING -> SUCCESS | DEGRADED | FAILED.
//!
//! ATTEMPTING runs the aggregation engine and hands the rows to the strategy
//! chain. Every outcome upserts the job's collection status row. A failed or
//! cancelled cycle never touches the published aggregate: each strategy is
//! all-or-nothing, and a timed-out cycle drops its open transaction, which
//! rolls back.
//!
//! At most one cycle runs at a time per controller. [`RefreshController::refresh`]
//! waits for a running cycle; [`RefreshController::try_refresh`] reports
//! [`RefreshError::Busy`] instead.

pub mod strategy;

pub use strategy::{ChainOutcome, StrategyChain, StrategyFailure};

use crate::aggregation::{AggregationEngine, AggregationRun};
use chrono::{DateTime, Utc};
use ppm_common::config::TomlConfig;
use ppm_common::db::models::CollectionStatus;
use ppm_common::db::{EntityStore, ObservationStore, RunRecord, StatusStore};
use ppm_common::read::ReadInterface;
use ppm_common::store::{AggregateStore, SnapshotStats};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Terminal status of a refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshStatus {
    Success,
    /// Published through a fallback strategy
    Degraded,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Success => "SUCCESS",
            RefreshStatus::Degraded => "DEGRADED",
            RefreshStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Idle,
    Attempting,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// One strategy failed; the chain moves on to the next
    #[error("{strategy} failed: {message}")]
    Strategy { strategy: String, message: String },

    /// Every strategy in the chain failed
    #[error("all refresh strategies failed: {}", summarize(.attempts))]
    Fatal { attempts: Vec<StrategyFailure> },

    /// Entity or observation store could not be read
    #[error("aggregation failed: {0}")]
    Aggregation(#[source] ppm_common::Error),

    #[error("a refresh cycle is already running")]
    Busy,

    #[error("refresh cycle exceeded {0:?}")]
    TimedOut(Duration),
}

fn summarize(attempts: &[StrategyFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Structured result of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub cycle_id: Uuid,
    pub status: RefreshStatus,
    /// Rows published by this cycle; for FAILED, rows still being served
    pub entity_count: i64,
    pub avg_completeness: f64,
    pub duration_seconds: f64,
    /// Strategy that published the rows
    pub strategy: Option<String>,
    pub failed_strategies: Vec<StrategyFailure>,
    pub join_errors: usize,
    pub invalid_entities: usize,
    pub error: Option<String>,
    pub refreshed_at: DateTime<Utc>,
}

impl RefreshReport {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_seconds.max(0.0))
    }

    pub fn is_published(&self) -> bool {
        self.status != RefreshStatus::Failed
    }
}

struct Published {
    run: AggregationRun,
    outcome: ChainOutcome,
}

pub struct RefreshController {
    engine: AggregationEngine,
    store: Arc<dyn AggregateStore>,
    status: StatusStore,
    chain: StrategyChain,
    job_name: String,
    healthy_completeness: f64,
    cycle_lock: Mutex<()>,
    read_cache: Option<Arc<ReadInterface>>,
}

impl RefreshController {
    pub fn new(
        engine: AggregationEngine,
        store: Arc<dyn AggregateStore>,
        status: StatusStore,
        chain: StrategyChain,
        job_name: impl Into<String>,
        healthy_completeness: f64,
    ) -> Self {
        Self {
            engine,
            store,
            status,
            chain,
            job_name: job_name.into(),
            healthy_completeness,
            cycle_lock: Mutex::new(()),
            read_cache: None,
        }
    }

    /// Controller over `pool` (entities, observations, status) publishing into `store`;
    /// the strategy chain is fixed here from the store's capabilities
    pub fn from_config(
        pool: SqlitePool,
        store: Arc<dyn AggregateStore>,
        config: &TomlConfig,
    ) -> ppm_common::Result<Self> {
        let engine = AggregationEngine::new(
            EntityStore::new(pool.clone()),
            ObservationStore::new(pool.clone()),
            &config.aggregation,
        );
        let chain = StrategyChain::for_capabilities(store.capabilities())?;
        info!(backend = store.backend(), strategies = ?chain.names(), "Refresh strategy chain selected");

        Ok(Self::new(
            engine,
            store,
            StatusStore::new(pool),
            chain,
            config.refresh.job_name.clone(),
            config.aggregation.healthy_completeness,
        ))
    }

    /// Invalidate `read`'s cache after every publish
    pub fn with_read_cache(mut self, read: Arc<ReadInterface>) -> Self {
        self.read_cache = Some(read);
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    pub fn chain(&self) -> &StrategyChain {
        &self.chain
    }

    pub fn healthy_completeness(&self) -> f64 {
        self.healthy_completeness
    }

    pub fn state(&self) -> ControllerState {
        match self.cycle_lock.try_lock() {
            Ok(_) => ControllerState::Idle,
            Err(_) => ControllerState::Attempting,
        }
    }

    /// Collection status row of this job
    pub async fn status(&self) -> ppm_common::Result<Option<CollectionStatus>> {
        self.status.load(&self.job_name).await
    }

    /// Run one cycle, waiting for a running cycle to finish first
    pub async fn refresh(&self) -> RefreshReport {
        let _guard = self.cycle_lock.lock().await;
        self.run_cycle(None).await
    }

    /// Run one cycle, cancelled and recorded as FAILED after `timeout`
    pub async fn refresh_with_timeout(&self, timeout: Duration) -> RefreshReport {
        let _guard = self.cycle_lock.lock().await;
        self.run_cycle(Some(timeout)).await
    }

    /// Run one cycle unless one is already running
    pub async fn try_refresh(&self, timeout: Option<Duration>) -> Result<RefreshReport, RefreshError> {
        let _guard = self.cycle_lock.try_lock().map_err(|_| RefreshError::Busy)?;
        Ok(self.run_cycle(timeout).await)
    }

    /// Run one cycle unless the last successful refresh is younger than `min_age`
    pub async fn refresh_if_stale(
        &self,
        min_age: Duration,
        timeout: Option<Duration>,
    ) -> ppm_common::Result<Option<RefreshReport>> {
        let _guard = self.cycle_lock.lock().await;

        let now = ppm_common::time::now();
        if let Some(status) = self.status.load(&self.job_name).await? {
            if let Some(age) = status.refresh_age(now) {
                let fresh = age.to_std().map(|age| age < min_age).unwrap_or(true);
                if fresh {
                    info!(
                        job = %self.job_name,
                        age_seconds = age.num_seconds(),
                        min_age_seconds = min_age.as_secs(),
                        "Aggregate is fresh, skipping refresh"
                    );
                    return Ok(None);
                }
            }
        }

        Ok(Some(self.run_cycle(timeout).await))
    }

    /// Caller holds `cycle_lock`
    async fn run_cycle(&self, timeout: Option<Duration>) -> RefreshReport {
        let cycle_id = Uuid::new_v4();
        let started = Instant::now();
        let attempted_at = ppm_common::time::now();
        info!(%cycle_id, job = %self.job_name, backend = self.store.backend(), "Refresh cycle attempting");

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.attempt(attempted_at)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RefreshError::TimedOut(limit)),
            },
            None => self.attempt(attempted_at).await,
        };
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(published) => self.complete(cycle_id, attempted_at, duration, published).await,
            Err(e) => self.fail(cycle_id, attempted_at, duration, e).await,
        }
    }

    async fn attempt(&self, refreshed_at: DateTime<Utc>) -> Result<Published, RefreshError> {
        let run = self
            .engine
            .aggregate(refreshed_at)
            .await
            .map_err(RefreshError::Aggregation)?;
        let outcome = self.chain.publish(self.store.as_ref(), &run.rows).await?;
        Ok(Published { run, outcome })
    }

    async fn complete(
        &self,
        cycle_id: Uuid,
        attempted_at: DateTime<Utc>,
        duration: f64,
        published: Published,
    ) -> RefreshReport {
        let Published { run, outcome } = published;
        if let Some(read) = &self.read_cache {
            read.invalidate();
        }

        let status = if outcome.degraded() {
            RefreshStatus::Degraded
        } else {
            RefreshStatus::Success
        };
        let stats = SnapshotStats::from_rows(&run.rows, self.healthy_completeness);

        let mut report = RefreshReport {
            cycle_id,
            status,
            entity_count: stats.entity_count,
            avg_completeness: stats.avg_completeness,
            duration_seconds: duration,
            strategy: Some(outcome.strategy.to_string()),
            failed_strategies: outcome.failures,
            join_errors: run.join_errors.len(),
            invalid_entities: run.invalid_entities.len(),
            error: None,
            refreshed_at: attempted_at,
        };

        let record = RunRecord {
            attempted_at,
            duration_seconds: duration,
            details: json!({
                "cycle_id": cycle_id,
                "status": status,
                "backend": self.store.backend(),
                "strategy": outcome.strategy,
                "failed_strategies": report.failed_strategies,
                "entity_count": stats.entity_count,
                "avg_completeness": stats.avg_completeness,
                "avg_composite": stats.avg_composite,
                "healthy_count": stats.healthy_count,
                "join_errors": run.join_errors,
                "invalid_entities": run.invalid_entities,
                "skipped_without_coordinates": run.skipped_without_coordinates,
                "unattributable_observations": run.unattributable_observations,
            }),
        };
        if let Err(e) = self
            .status
            .record_success(&self.job_name, &record, stats.healthy_fraction(), stats.entity_count)
            .await
        {
            error!(%cycle_id, error = %e, "Aggregate published but status row was not written");
            report.error = Some(format!("status bookkeeping failed: {}", e));
        }

        info!(
            %cycle_id,
            status = status.as_str(),
            strategy = outcome.strategy,
            entities = report.entity_count,
            avg_completeness = report.avg_completeness,
            join_errors = report.join_errors,
            invalid_entities = report.invalid_entities,
            duration_seconds = duration,
            "Refresh cycle finished"
        );
        report
    }

    async fn fail(
        &self,
        cycle_id: Uuid,
        attempted_at: DateTime<Utc>,
        duration: f64,
        failure: RefreshError,
    ) -> RefreshReport {
        let message = failure.to_string();
        let attempts = match &failure {
            RefreshError::Fatal { attempts } => attempts.clone(),
            _ => Vec::new(),
        };

        // Report what readers still see
        let served = match self.store.snapshot_stats(self.healthy_completeness).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(%cycle_id, error = %e, "Could not read the served snapshot");
                SnapshotStats::default()
            }
        };

        let record = RunRecord {
            attempted_at,
            duration_seconds: duration,
            details: json!({
                "cycle_id": cycle_id,
                "status": RefreshStatus::Failed,
                "backend": self.store.backend(),
                "error": message,
                "failed_strategies": attempts,
            }),
        };
        if let Err(e) = self.status.record_failure(&self.job_name, &record).await {
            error!(%cycle_id, error = %e, "Failed to record refresh failure");
        }

        error!(
            %cycle_id,
            error = %message,
            served_entities = served.entity_count,
            duration_seconds = duration,
            "Refresh cycle FAILED, previous snapshot kept"
        );

        RefreshReport {
            cycle_id,
            status: RefreshStatus::Failed,
            entity_count: served.entity_count,
            avg_completeness: served.avg_completeness,
            duration_seconds: duration,
            strategy: None,
            failed_strategies: attempts,
            join_errors: 0,
            invalid_entities: 0,
            error: Some(message),
            refreshed_at: attempted_at,
        }
    }
}
