//! Sync pipeline orchestration: snapshot sync, ads.txt regeneration, scheduling.

pub mod adstxt;
pub mod bulk;
pub mod config;
pub mod detector;
pub mod metadata;
pub mod outcome;
pub mod reconcile;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pubsync_core::{AdsTxtLineCandidate, RelationshipKind};
use pubsync_snapshot::{load_snapshot, ManagerRemap};
use pubsync_storage::{BackoffPolicy, LocalSnapshotStore, S3Config, S3SnapshotStore, SnapshotStore};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use adstxt::AdsTxtError;
pub use config::{ConfigError, LookupFailurePolicy, StoreKind, SyncConfig};
pub use outcome::{OutcomeStore, PgOutcomeStore};
pub use reconcile::{default_hooks, ObjectReport, ReconcileError, ReconcileHook};

pub const CRATE_NAME: &str = "pubsync-sync";

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed_objects: usize,
    pub selected_objects: usize,
    pub succeeded_objects: usize,
    pub failed_objects: usize,
    pub publishers_upserted: usize,
    pub adstxt: Option<AdsTxtSummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdsTxtSummary {
    pub candidates: usize,
    pub batches: usize,
    pub lines_inserted: u64,
    pub metadata_records: usize,
}

pub async fn connect_pool(config: &SyncConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

pub struct SyncPipeline {
    config: SyncConfig,
    pool: PgPool,
    store: Arc<dyn SnapshotStore>,
    outcomes: Arc<dyn OutcomeStore>,
    remap: ManagerRemap,
    hooks: Vec<Box<dyn ReconcileHook>>,
    backoff: BackoffPolicy,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        pool: PgPool,
        store: Arc<dyn SnapshotStore>,
        outcomes: Arc<dyn OutcomeStore>,
        remap: ManagerRemap,
    ) -> Self {
        let backoff = BackoffPolicy {
            max_retries: config.fetch_max_retries,
            ..BackoffPolicy::default()
        };
        Self {
            config,
            pool,
            store,
            outcomes,
            remap,
            hooks: default_hooks(),
            backoff,
            run_lock: Mutex::new(()),
        }
    }

    /// Validates `config`, loads the manager remap table, connects and picks
    /// the snapshot store backend.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let remap_path = config
            .manager_remap_path
            .clone()
            .ok_or(ConfigError::Missing {
                name: "PUBSYNC_MANAGER_REMAP_PATH",
                context: "starting the sync worker",
            })?;
        let remap = ManagerRemap::load(&remap_path).map_err(ConfigError::from)?;
        info!(path = %remap_path.display(), entries = remap.len(), "loaded manager remap");

        let pool = connect_pool(&config).await?;
        let store: Arc<dyn SnapshotStore> = match config.store {
            StoreKind::S3 => {
                let bucket = config.bucket.clone().ok_or(ConfigError::Missing {
                    name: "PUBSYNC_BUCKET",
                    context: "PUBSYNC_STORE=s3",
                })?;
                Arc::new(
                    S3SnapshotStore::new(&S3Config {
                        bucket,
                        region: config.region.clone(),
                        endpoint: config.endpoint.clone(),
                    })
                    .await,
                )
            }
            StoreKind::Local => Arc::new(LocalSnapshotStore::new(config.local_root.clone())),
        };
        let outcomes = Arc::new(PgOutcomeStore::new(pool.clone()));
        Ok(Self::new(config, pool, store, outcomes, remap))
    }

    /// Replaces the reconcile hooks; they run in the order given.
    pub fn with_hooks(mut self, hooks: Vec<Box<dyn ReconcileHook>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs one sync cycle, waiting for any cycle already in flight.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.run_cycle().await
    }

    /// Runs one sync cycle unless another is already in flight.
    pub async fn try_run_once(&self) -> Option<Result<SyncRunSummary>> {
        let _guard = self.run_lock.try_lock().ok()?;
        Some(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::now_v7();
        let listings = self
            .store
            .list(&self.config.prefix)
            .await
            .with_context(|| format!("listing snapshot objects under {:?}", self.config.prefix))?;
        let listed_objects = listings.len();

        let selected = detector::select_objects(
            listings,
            self.outcomes.as_ref(),
            started_at,
            self.config.lookback(),
            self.config.lookup_failure_policy,
        )
        .await;
        info!(%run_id, listed = listed_objects, selected = selected.len(), "sync cycle started");

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            listed_objects,
            selected_objects: selected.len(),
            succeeded_objects: 0,
            failed_objects: 0,
            publishers_upserted: 0,
            adstxt: None,
        };
        let mut changed = BTreeSet::new();

        for object in &selected {
            let key = object.listing.key.as_str();
            let span = info_span!("sync_object", %run_id, key, reason = ?object.reason);
            let had_error = match self.sync_object(key).instrument(span.clone()).await {
                Ok(report) => {
                    summary.publishers_upserted += report.upserted.len();
                    changed.extend(report.upserted.iter().cloned());
                    report.had_error()
                }
                Err(err) => {
                    span.in_scope(|| error!(error = %format!("{err:#}"), "snapshot object failed"));
                    true
                }
            };
            if had_error {
                summary.failed_objects += 1;
            } else {
                summary.succeeded_objects += 1;
            }
            if let Err(err) = self.outcomes.record(key, had_error, Utc::now()).await {
                span.in_scope(|| error!(error = %err, had_error, "recording sync outcome failed"));
            }
        }

        if !self.config.adstxt_enabled {
            info!("ads.txt regeneration disabled for this cycle");
        } else if !changed.is_empty() {
            let publisher_ids: Vec<String> = changed.into_iter().collect();
            match self.regenerate_for_publishers(&publisher_ids).await {
                Ok(adstxt) => summary.adstxt = Some(adstxt),
                Err(err) => error!(error = %err, publishers = publisher_ids.len(), "ads.txt regeneration failed"),
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            succeeded = summary.succeeded_objects,
            failed = summary.failed_objects,
            publishers = summary.publishers_upserted,
            "sync cycle finished"
        );
        Ok(summary)
    }

    async fn sync_object(&self, key: &str) -> Result<ObjectReport> {
        let snapshot = load_snapshot(self.store.as_ref(), key, &self.backoff).await?;
        let report =
            reconcile::reconcile_object(&self.pool, &snapshot, &self.remap, &self.hooks).await?;
        Ok(report)
    }

    /// Regenerates lines of every kind for `publisher_ids` against all active
    /// connections, in one transaction.
    pub async fn regenerate_for_publishers(
        &self,
        publisher_ids: &[String],
    ) -> Result<AdsTxtSummary, AdsTxtError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| AdsTxtError::Transaction { source })?;
        let mut candidates = Vec::new();
        for kind in RelationshipKind::ALL {
            let ids = adstxt::active_connection_ids(&mut tx, kind).await?;
            candidates.extend(
                adstxt::generate_candidates(&mut tx, kind, &ids, Some(publisher_ids)).await?,
            );
        }
        let summary = self.write_and_emit(&mut tx, candidates).await?;
        tx.commit()
            .await
            .map_err(|source| AdsTxtError::Transaction { source })?;
        info!(publishers = publisher_ids.len(), lines = summary.lines_inserted, "ads.txt regenerated");
        Ok(summary)
    }

    /// Regenerates lines for newly created or changed connections of one kind,
    /// across every publisher domain.
    pub async fn regenerate_for_connections(
        &self,
        kind: RelationshipKind,
        connection_ids: &[i64],
    ) -> Result<AdsTxtSummary, AdsTxtError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| AdsTxtError::Transaction { source })?;
        let candidates = adstxt::generate_candidates(&mut tx, kind, connection_ids, None).await?;
        let summary = self.write_and_emit(&mut tx, candidates).await?;
        tx.commit()
            .await
            .map_err(|source| AdsTxtError::Transaction { source })?;
        info!(%kind, connections = connection_ids.len(), lines = summary.lines_inserted, "ads.txt regenerated");
        Ok(summary)
    }

    async fn write_and_emit(
        &self,
        conn: &mut PgConnection,
        candidates: Vec<AdsTxtLineCandidate>,
    ) -> Result<AdsTxtSummary, AdsTxtError> {
        let lines = adstxt::dedup_candidates(candidates);
        let written = bulk::write_lines(conn, &lines, self.config.chunk_size).await?;
        let metadata_records = metadata::emit_changes(conn, &lines).await?;
        Ok(AdsTxtSummary {
            candidates: lines.len(),
            batches: written.batches,
            lines_inserted: written.rows_inserted,
            metadata_records,
        })
    }

    /// Builds a scheduler that runs a cycle on `schedule_cron`. A tick that
    /// fires while a cycle is still running is skipped.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.schedule_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.try_run_once().await {
                    Some(Ok(summary)) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed_objects,
                        "scheduled sync complete"
                    ),
                    Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    None => warn!("previous sync still running; skipping scheduled tick"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

pub async fn migrate_from_env() -> Result<()> {
    let config = SyncConfig::load_env()?;
    let pool = connect_pool(&config).await?;
    migrate(&pool).await
}

pub async fn regenerate_from_env(
    kind: RelationshipKind,
    connection_ids: &[i64],
) -> Result<AdsTxtSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config).await?;
    Ok(pipeline.regenerate_for_connections(kind, connection_ids).await?)
}

/// Runs the scheduler until ctrl-c.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    let cron = config.schedule_cron.clone();
    let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
    let mut sched = pipeline.build_scheduler().await?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
