//! Per-partner change records queued for downstream consumers.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use pubsync_core::{AdsTxtLineCandidate, MetadataChangeRecord, PublisherDomainPair};
use sqlx::{PgConnection, Row};
use tracing::debug;
use uuid::Uuid;

use crate::adstxt::AdsTxtError;

/// A publisher ready to work with a partner on at least one media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyToWork {
    pub publisher_id: String,
    pub demand_partner_id: String,
}

/// Groups `candidates` by demand partner, keeping only publishers ready to
/// work with that partner. Pairs repeated across media types collapse to one;
/// partners left with no pairs produce no record.
pub fn build_change_records(
    candidates: &[AdsTxtLineCandidate],
    ready: &[ReadyToWork],
    mut next_id: impl FnMut() -> Uuid,
) -> Vec<MetadataChangeRecord> {
    let ready: HashSet<(&str, &str)> = ready
        .iter()
        .map(|r| (r.demand_partner_id.as_str(), r.publisher_id.as_str()))
        .collect();

    let mut by_partner: BTreeMap<&str, BTreeSet<PublisherDomainPair>> = BTreeMap::new();
    for candidate in candidates {
        let partner = candidate.demand_partner_id.as_str();
        if !ready.contains(&(partner, candidate.publisher_id.as_str())) {
            continue;
        }
        by_partner.entry(partner).or_default().insert(PublisherDomainPair {
            publisher_id: candidate.publisher_id.clone(),
            domain: candidate.domain.clone(),
        });
    }

    by_partner
        .into_iter()
        .map(|(partner, pairs)| MetadataChangeRecord {
            transaction_id: next_id(),
            demand_partner_id: partner.to_string(),
            pairs: pairs.into_iter().collect(),
        })
        .collect()
}

pub async fn load_ready_to_work(
    conn: &mut PgConnection,
    publisher_ids: &[String],
) -> Result<Vec<ReadyToWork>, AdsTxtError> {
    if publisher_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT publisher_id, demand_partner_id
          FROM publisher_demand
         WHERE active
           AND publisher_id = ANY($1)
        "#,
    )
    .bind(publisher_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|source| AdsTxtError::Emit { source })?;

    rows.into_iter()
        .map(|row| {
            Ok(ReadyToWork {
                publisher_id: row.try_get("publisher_id")?,
                demand_partner_id: row.try_get("demand_partner_id")?,
            })
        })
        .collect::<Result<_, sqlx::Error>>()
        .map_err(|source| AdsTxtError::Emit { source })
}

/// Appends `records` to the queue. Earlier pending records for the same
/// partner are left alone.
pub async fn insert_records(
    conn: &mut PgConnection,
    records: &[MetadataChangeRecord],
) -> Result<usize, AdsTxtError> {
    for record in records {
        let value = record
            .value_json()
            .map_err(|err| AdsTxtError::Emit {
                source: sqlx::Error::Encode(Box::new(err)),
            })?;
        sqlx::query(
            r#"
            INSERT INTO metadata_queue (transaction_id, key, value, created_at, updated_at)
            VALUES ($1, $2, $3, now(), now())
            "#,
        )
        .bind(record.transaction_id)
        .bind(record.key())
        .bind(value)
        .execute(&mut *conn)
        .await
        .map_err(|source| AdsTxtError::Emit { source })?;
        debug!(key = %record.key(), pairs = record.pairs.len(), "queued metadata change");
    }
    Ok(records.len())
}

/// Builds and queues change records for `candidates` in one step.
pub async fn emit_changes(
    conn: &mut PgConnection,
    candidates: &[AdsTxtLineCandidate],
) -> Result<usize, AdsTxtError> {
    let publisher_ids: Vec<String> = candidates
        .iter()
        .map(|c| c.publisher_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let ready = load_ready_to_work(conn, &publisher_ids).await?;
    let records = build_change_records(candidates, &ready, Uuid::now_v7);
    insert_records(conn, &records).await
}
