//! Ads.txt line candidate generation across the three relationship shapes.

use std::collections::HashSet;

use pubsync_core::{AdsTxtLineCandidate, DemandStatus, RelationshipKind};
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AdsTxtError {
    #[error("generating {kind} candidates: {source}")]
    Query {
        kind: RelationshipKind,
        #[source]
        source: sqlx::Error,
    },
    #[error("unexpected demand status {value:?} for {kind}")]
    Status {
        kind: RelationshipKind,
        value: String,
    },
    #[error("inserting ads.txt chunk {chunk} ({rows} rows): {source}")]
    Insert {
        chunk: usize,
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("ads.txt transaction: {source}")]
    Transaction {
        #[source]
        source: sqlx::Error,
    },
    #[error("emitting metadata changes: {source}")]
    Emit {
        #[source]
        source: sqlx::Error,
    },
}

/// The per-kind pieces of the candidate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipTemplate {
    /// Table holding the connection ids, aliased `rel`.
    pub source_table: &'static str,
    /// Join path from `rel` to the partner that owns the approval flag, aliased `dp`.
    pub join_clause: &'static str,
    pub status_expr: &'static str,
    /// Foreign-key column on `ads_txt` that carries the connection id.
    pub output_column: &'static str,
}

pub const fn template(kind: RelationshipKind) -> RelationshipTemplate {
    match kind {
        RelationshipKind::DirectConnection => RelationshipTemplate {
            source_table: "demand_partner_connection",
            join_clause: "JOIN demand_partner dp ON dp.demand_partner_id = rel.demand_partner_id",
            status_expr: "CASE WHEN dp.manual_approve THEN 'not_sent' ELSE 'approved' END",
            output_column: "demand_partner_connection_id",
        },
        RelationshipKind::Child => RelationshipTemplate {
            source_table: "demand_partner_child",
            join_clause: "JOIN demand_partner_connection parent ON parent.id = rel.dp_connection_id \
                          JOIN demand_partner dp ON dp.demand_partner_id = parent.demand_partner_id",
            status_expr: "CASE WHEN dp.manual_approve THEN 'not_sent' ELSE 'approved' END",
            output_column: "demand_partner_child_id",
        },
        RelationshipKind::SeatOwner => RelationshipTemplate {
            source_table: "seat_owner",
            join_clause: "JOIN demand_partner dp ON dp.demand_partner_id = rel.demand_partner_id",
            status_expr: "'approved'",
            output_column: "seat_owner_id",
        },
    }
}

/// Candidate query for `connection_ids` of one kind, optionally restricted to
/// a set of publishers. Every publisher domain pairs with every connection.
pub fn candidate_query<'a>(
    kind: RelationshipKind,
    connection_ids: &'a [i64],
    publisher_ids: Option<&'a [String]>,
) -> QueryBuilder<'a, Postgres> {
    let t = template(kind);
    let mut qb = QueryBuilder::new("SELECT pd.publisher_id, pd.domain, rel.id AS connection_id, dp.demand_partner_id, ");
    qb.push(t.status_expr)
        .push(" AS demand_status FROM publisher_domain pd CROSS JOIN ")
        .push(t.source_table)
        .push(" rel ")
        .push(t.join_clause)
        .push(" WHERE rel.id = ANY(")
        .push_bind(connection_ids)
        .push(")");
    if let Some(publisher_ids) = publisher_ids {
        qb.push(" AND pd.publisher_id = ANY(").push_bind(publisher_ids).push(")");
    }
    qb.push(" ORDER BY pd.publisher_id, pd.domain, rel.id");
    qb
}

pub async fn generate_candidates(
    conn: &mut PgConnection,
    kind: RelationshipKind,
    connection_ids: &[i64],
    publisher_ids: Option<&[String]>,
) -> Result<Vec<AdsTxtLineCandidate>, AdsTxtError> {
    if connection_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = candidate_query(kind, connection_ids, publisher_ids)
        .build()
        .fetch_all(&mut *conn)
        .await
        .map_err(|source| AdsTxtError::Query { kind, source })?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row
            .try_get("demand_status")
            .map_err(|source| AdsTxtError::Query { kind, source })?;
        let demand_status = status
            .parse::<DemandStatus>()
            .map_err(|_| AdsTxtError::Status { kind, value: status.clone() })?;
        candidates.push(AdsTxtLineCandidate {
            publisher_id: row
                .try_get("publisher_id")
                .map_err(|source| AdsTxtError::Query { kind, source })?,
            domain: row
                .try_get("domain")
                .map_err(|source| AdsTxtError::Query { kind, source })?,
            kind,
            connection_id: row
                .try_get("connection_id")
                .map_err(|source| AdsTxtError::Query { kind, source })?,
            demand_partner_id: row
                .try_get("demand_partner_id")
                .map_err(|source| AdsTxtError::Query { kind, source })?,
            demand_status,
        });
    }
    debug!(%kind, connections = connection_ids.len(), candidates = candidates.len(), "generated candidates");
    Ok(candidates)
}

/// Ids of every active connection of `kind`.
pub async fn active_connection_ids(
    conn: &mut PgConnection,
    kind: RelationshipKind,
) -> Result<Vec<i64>, AdsTxtError> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT id FROM ");
    qb.push(template(kind).source_table)
        .push(" WHERE active ORDER BY id");
    qb.build_query_scalar::<i64>()
        .fetch_all(&mut *conn)
        .await
        .map_err(|source| AdsTxtError::Query { kind, source })
}

/// Drops repeats of the `(publisher, domain, kind, connection)` key, keeping
/// the first occurrence.
pub fn dedup_candidates(candidates: Vec<AdsTxtLineCandidate>) -> Vec<AdsTxtLineCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| {
            let (publisher_id, domain, kind, connection_id) = c.unique_key();
            seen.insert((publisher_id.to_owned(), domain.to_owned(), kind, connection_id))
        })
        .collect()
}
