//! Multi-row ads.txt inserts bounded by the Postgres bind parameter limit.

use pubsync_core::{AdsTxtLineCandidate, RelationshipKind};
use serde::Serialize;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::debug;

use crate::adstxt::{template, AdsTxtError};

/// Postgres wire protocol caps a statement at `u16::MAX` bind parameters.
pub const MAX_BIND_PARAMS: usize = u16::MAX as usize;

/// publisher_id, domain, three relationship ids, demand_status.
pub const BINDS_PER_LINE: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkWriteReport {
    pub batches: usize,
    pub rows_inserted: u64,
}

/// Sizes of the batches `total` rows split into at `chunk_size`.
pub fn chunk_sizes(total: usize, chunk_size: usize) -> Vec<usize> {
    if chunk_size == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(chunk_size)
        .map(|start| chunk_size.min(total - start))
        .collect()
}

pub fn insert_chunk_query(chunk: &[AdsTxtLineCandidate]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new("INSERT INTO ads_txt (publisher_id, domain, ");
    for kind in RelationshipKind::ALL {
        qb.push(template(kind).output_column).push(", ");
    }
    qb.push("demand_status) ");
    qb.push_values(chunk, |mut b, line| {
        b.push_bind(&line.publisher_id).push_bind(&line.domain);
        for kind in RelationshipKind::ALL {
            b.push_bind((line.kind == kind).then_some(line.connection_id));
        }
        b.push_bind(line.demand_status.as_str());
    });
    qb.push(" ON CONFLICT DO NOTHING");
    qb
}

/// Writes `lines` in chunks of at most `chunk_size` inside the caller's
/// transaction. The first failing chunk aborts the write.
pub async fn write_lines(
    conn: &mut PgConnection,
    lines: &[AdsTxtLineCandidate],
    chunk_size: usize,
) -> Result<BulkWriteReport, AdsTxtError> {
    let mut report = BulkWriteReport::default();
    if lines.is_empty() {
        return Ok(report);
    }
    let chunk_size = chunk_size.clamp(1, MAX_BIND_PARAMS / BINDS_PER_LINE);
    debug!(
        lines = lines.len(),
        batches = chunk_sizes(lines.len(), chunk_size).len(),
        "writing ads.txt lines"
    );
    for (index, chunk) in lines.chunks(chunk_size).enumerate() {
        let result = insert_chunk_query(chunk)
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|source| AdsTxtError::Insert {
                chunk: index,
                rows: chunk.len(),
                source,
            })?;
        report.batches += 1;
        report.rows_inserted += result.rows_affected();
        debug!(chunk = index, rows = chunk.len(), inserted = result.rows_affected(), "ads.txt chunk written");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubsync_core::DemandStatus;

    fn line(kind: RelationshipKind, id: i64) -> AdsTxtLineCandidate {
        AdsTxtLineCandidate {
            publisher_id: "1".into(),
            domain: "a.com".into(),
            kind,
            connection_id: id,
            demand_partner_id: "dp".into(),
            demand_status: DemandStatus::NotSent,
        }
    }

    #[test]
    fn batches_are_ceil_n_over_c_with_remainder_last() {
        assert_eq!(chunk_sizes(10, 3), vec![3, 3, 3, 1]);
        assert_eq!(chunk_sizes(9, 3), vec![3, 3, 3]);
        assert_eq!(chunk_sizes(2, 1000), vec![2]);
        assert!(chunk_sizes(0, 5).is_empty());

        for (n, c) in [(1_usize, 1_usize), (999, 1000), (1000, 1000), (2501, 1000), (17, 4)] {
            let sizes = chunk_sizes(n, c);
            assert_eq!(sizes.len(), n.div_ceil(c));
            let expected_last = if n % c == 0 { c } else { n % c };
            assert_eq!(sizes.last().copied(), Some(expected_last));
            assert_eq!(sizes.iter().sum::<usize>(), n);
        }
    }

    #[test]
    fn chunk_query_binds_six_params_per_row() {
        let lines = vec![
            line(RelationshipKind::DirectConnection, 1),
            line(RelationshipKind::Child, 2),
        ];
        let query = insert_chunk_query(&lines);
        let sql = query.sql();
        assert!(sql.starts_with(
            "INSERT INTO ads_txt (publisher_id, domain, demand_partner_connection_id, \
             demand_partner_child_id, seat_owner_id, demand_status) VALUES ($1, $2, $3, $4, $5, $6)"
        ));
        assert!(sql.contains("($7, $8, $9, $10, $11, $12)"));
        assert!(!sql.contains("$13"));
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));
    }
}
