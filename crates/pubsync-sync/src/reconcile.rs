//! Turns snapshot records into sparse publisher upserts plus domain rows and
//! applies them for one snapshot object.

use std::collections::HashSet;

use pubsync_core::{Publisher, PublisherColumn, PublisherDomain};
use pubsync_snapshot::{LoadedSnapshot, ManagerRef, ManagerRemap, SnapshotRecord};
use sqlx::{Acquire, PgConnection, PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bulk::MAX_BIND_PARAMS;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("upserting publisher {publisher_id}: {source}")]
    Upsert {
        publisher_id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("hook {hook} rejected publisher {publisher_id}: {message}")]
    Hook {
        hook: &'static str,
        publisher_id: String,
        message: String,
    },
    #[error("transaction for snapshot {key}: {source}")]
    Transaction {
        key: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Everything written for one publisher: the upsert row, the columns its
/// conflict clause must leave alone, and its domain rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherPlan {
    pub publisher: Publisher,
    pub excluded: Vec<PublisherColumn>,
    pub domains: Vec<PublisherDomain>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn non_zero(value: Option<i64>) -> Option<i64> {
    value.filter(|v| *v != 0)
}

fn manager_id(manager: Option<&ManagerRef>, remap: &ManagerRemap) -> Option<String> {
    non_empty(manager.and_then(|m| m.id.as_deref())).map(|id| remap.resolve(&id))
}

pub fn build_plan(record: &SnapshotRecord, remap: &ManagerRemap) -> PublisherPlan {
    let publisher = Publisher {
        publisher_id: record.id.clone(),
        name: record.name.clone(),
        account_manager_id: manager_id(record.account_manager.as_ref(), remap),
        media_buyer_id: manager_id(record.media_buyer.as_ref(), remap),
        campaign_manager_id: manager_id(record.campaign_manager.as_ref(), remap),
        office_location: non_empty(record.office_location.as_deref()),
        pause_timestamp: non_zero(record.paused_date),
        start_timestamp: non_zero(record.start_date),
        reactivate_timestamp: non_zero(record.reactivated_date),
    };
    let excluded = PublisherColumn::OPTIONAL
        .into_iter()
        .filter(|column| !publisher.has_value(*column))
        .collect();

    let domains = record
        .site
        .iter()
        .map(|domain| {
            let option = record.domain_option(domain);
            PublisherDomain {
                publisher_id: record.id.clone(),
                domain: domain.clone(),
                mirror_publisher_id: non_empty(option.and_then(|o| o.mirror_publisher.as_deref())),
                integration_type: non_empty(option.and_then(|o| o.integration_type.as_deref())),
            }
        })
        .collect();

    PublisherPlan {
        publisher,
        excluded,
        domains,
    }
}

/// Callback run around each publisher's upsert. Hooks run in list order.
pub trait ReconcileHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_upsert(&self, _plan: &mut PublisherPlan) -> Result<(), String> {
        Ok(())
    }

    fn after_upsert(&self, _plan: &PublisherPlan) {}
}

/// Trims and lowercases site domains, dropping blanks and repeats.
#[derive(Debug, Default)]
pub struct DomainNormalizationHook;

impl ReconcileHook for DomainNormalizationHook {
    fn name(&self) -> &'static str {
        "domain_normalization"
    }

    fn before_upsert(&self, plan: &mut PublisherPlan) -> Result<(), String> {
        let mut seen = HashSet::new();
        plan.domains.retain_mut(|row| {
            row.domain = row.domain.trim().trim_end_matches('.').to_ascii_lowercase();
            !row.domain.is_empty() && seen.insert(row.domain.clone())
        });
        Ok(())
    }
}

pub fn default_hooks() -> Vec<Box<dyn ReconcileHook>> {
    vec![Box::new(DomainNormalizationHook)]
}

pub fn run_before_hooks(
    hooks: &[Box<dyn ReconcileHook>],
    plan: &mut PublisherPlan,
) -> Result<(), ReconcileError> {
    for hook in hooks {
        hook.before_upsert(plan).map_err(|message| ReconcileError::Hook {
            hook: hook.name(),
            publisher_id: plan.publisher.publisher_id.clone(),
            message,
        })?;
    }
    Ok(())
}

fn optional_value(publisher: &Publisher, column: PublisherColumn) -> OptionalValue<'_> {
    match column {
        PublisherColumn::AccountManagerId => OptionalValue::Text(publisher.account_manager_id.as_deref()),
        PublisherColumn::MediaBuyerId => OptionalValue::Text(publisher.media_buyer_id.as_deref()),
        PublisherColumn::CampaignManagerId => OptionalValue::Text(publisher.campaign_manager_id.as_deref()),
        PublisherColumn::OfficeLocation => OptionalValue::Text(publisher.office_location.as_deref()),
        PublisherColumn::PauseTimestamp => OptionalValue::Epoch(publisher.pause_timestamp),
        PublisherColumn::StartTimestamp => OptionalValue::Epoch(publisher.start_timestamp),
        PublisherColumn::ReactivateTimestamp => OptionalValue::Epoch(publisher.reactivate_timestamp),
    }
}

enum OptionalValue<'a> {
    Text(Option<&'a str>),
    Epoch(Option<i64>),
}

/// Full-row `INSERT ... ON CONFLICT DO UPDATE` whose SET list skips every
/// excluded column, so absent snapshot fields never overwrite stored values.
pub fn publisher_upsert_query(plan: &PublisherPlan) -> QueryBuilder<'_, Postgres> {
    let publisher = &plan.publisher;
    let mut qb = QueryBuilder::new("INSERT INTO publisher (publisher_id, name");
    for column in PublisherColumn::OPTIONAL {
        qb.push(", ").push(column.as_str());
    }
    qb.push(", updated_at) VALUES (");
    {
        let mut values = qb.separated(", ");
        values.push_bind(publisher.publisher_id.as_str());
        values.push_bind(publisher.name.as_str());
        for column in PublisherColumn::OPTIONAL {
            match optional_value(publisher, column) {
                OptionalValue::Text(v) => values.push_bind(v),
                OptionalValue::Epoch(v) => values.push_bind(v),
            };
        }
        values.push("NOW()");
    }
    qb.push(") ON CONFLICT (publisher_id) DO UPDATE SET name = EXCLUDED.name");
    for column in PublisherColumn::OPTIONAL {
        if plan.excluded.contains(&column) {
            continue;
        }
        qb.push(", ")
            .push(column.as_str())
            .push(" = EXCLUDED.")
            .push(column.as_str());
    }
    qb.push(", updated_at = EXCLUDED.updated_at");
    qb
}

/// Multi-row domain insert; rows already present are left as they are.
pub fn domain_insert_query(domains: &[PublisherDomain]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO publisher_domain (publisher_id, domain, mirror_publisher_id, integration_type) ",
    );
    qb.push_values(domains, |mut b, row| {
        b.push_bind(row.publisher_id.as_str())
            .push_bind(row.domain.as_str())
            .push_bind(row.mirror_publisher_id.as_deref())
            .push_bind(row.integration_type.as_deref());
    });
    qb.push(" ON CONFLICT (publisher_id, domain) DO NOTHING");
    qb
}

/// publisher_id, domain, mirror_publisher_id, integration_type.
const DOMAIN_BINDS_PER_ROW: usize = 4;

pub const MAX_DOMAINS_PER_INSERT: usize = MAX_BIND_PARAMS / DOMAIN_BINDS_PER_ROW;

/// One insert per chunk of at most [`MAX_DOMAINS_PER_INSERT`] rows.
pub fn domain_insert_queries(domains: &[PublisherDomain]) -> Vec<QueryBuilder<'_, Postgres>> {
    domains
        .chunks(MAX_DOMAINS_PER_INSERT)
        .map(domain_insert_query)
        .collect()
}

/// Writes one plan on `conn`; the publisher row always precedes its domains.
pub async fn apply_plan(conn: &mut PgConnection, plan: &PublisherPlan) -> Result<u64, sqlx::Error> {
    publisher_upsert_query(plan).build().execute(&mut *conn).await?;
    let mut inserted = 0;
    for mut query in domain_insert_queries(&plan.domains) {
        inserted += query.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

#[derive(Debug, Clone, Default)]
pub struct ObjectReport {
    pub key: String,
    pub upserted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub domains_inserted: u64,
}

impl ObjectReport {
    pub fn had_error(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Reconciles every publisher of one snapshot inside a single transaction.
///
/// Each publisher runs in its own savepoint: a failing publisher is rolled back
/// and recorded in the report while its siblings still commit. Errors opening
/// or committing the enclosing transaction fail the whole object.
pub async fn reconcile_object(
    pool: &PgPool,
    snapshot: &LoadedSnapshot,
    remap: &ManagerRemap,
    hooks: &[Box<dyn ReconcileHook>],
) -> Result<ObjectReport, ReconcileError> {
    let tx_err = |source| ReconcileError::Transaction {
        key: snapshot.key.clone(),
        source,
    };
    let mut report = ObjectReport {
        key: snapshot.key.clone(),
        ..Default::default()
    };

    let mut tx = pool.begin().await.map_err(tx_err)?;
    for record in &snapshot.records {
        let mut plan = build_plan(record, remap);
        if let Err(err) = run_before_hooks(hooks, &mut plan) {
            warn!(key = %snapshot.key, publisher_id = %record.id, error = %err, "publisher skipped");
            report.failed.push((record.id.clone(), err.to_string()));
            continue;
        }

        let mut savepoint = tx.begin().await.map_err(tx_err)?;
        match apply_plan(&mut savepoint, &plan).await {
            Ok(inserted) => {
                savepoint.commit().await.map_err(tx_err)?;
                for hook in hooks {
                    hook.after_upsert(&plan);
                }
                debug!(publisher_id = %record.id, domains_inserted = inserted, "publisher reconciled");
                report.domains_inserted += inserted;
                report.upserted.push(record.id.clone());
            }
            Err(source) => {
                savepoint.rollback().await.map_err(tx_err)?;
                let err = ReconcileError::Upsert {
                    publisher_id: record.id.clone(),
                    source,
                };
                warn!(key = %snapshot.key, publisher_id = %record.id, error = %err, "publisher upsert failed");
                report.failed.push((record.id.clone(), err.to_string()));
            }
        }
    }
    tx.commit().await.map_err(tx_err)?;

    info!(
        key = %snapshot.key,
        upserted = report.upserted.len(),
        failed = report.failed.len(),
        domains_inserted = report.domains_inserted,
        "snapshot reconciled"
    );
    Ok(report)
}
