//! Runs against a live Postgres when `DATABASE_URL` is set; otherwise every
//! test returns early. Rows are namespaced by a per-test tag so runs can share
//! a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use pubsync_core::{DemandStatus, RelationshipKind};
use pubsync_snapshot::{parse_snapshot, LoadedSnapshot, ManagerRemap};
use pubsync_storage::LocalSnapshotStore;
use pubsync_sync::{adstxt, bulk, default_hooks, metadata, reconcile, OutcomeStore};
use pubsync_sync::{PgOutcomeStore, SyncConfig, SyncPipeline};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

async fn pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    pubsync_sync::migrate(&pool).await.expect("migrate");
    Some(pool)
}

fn tag() -> String {
    Uuid::now_v7().simple().to_string()
}

fn snapshot(key: &str, json: &str) -> LoadedSnapshot {
    LoadedSnapshot {
        key: key.to_string(),
        last_modified: Utc::now(),
        content_hash: String::new(),
        records: parse_snapshot(key, json.as_bytes()).expect("parse snapshot"),
    }
}

async fn count(pool: &PgPool, sql: &str, publisher_id: &str) -> i64 {
    sqlx::query_scalar(sql)
        .bind(publisher_id)
        .fetch_one(pool)
        .await
        .expect("count")
}

#[tokio::test]
async fn reconciling_the_same_snapshot_twice_leaves_one_row_per_entity() {
    let Some(pool) = pool().await else { return };
    let id = format!("pub-{}", tag());
    let snap = snapshot(
        &format!("{id}.json"),
        &format!(r#"[{{"_id":"{id}","name":"Acme","site":["a.example","B.example"]}}]"#),
    );
    let hooks = default_hooks();
    let remap = ManagerRemap::default();

    let first = reconcile::reconcile_object(&pool, &snap, &remap, &hooks).await.expect("first");
    let second = reconcile::reconcile_object(&pool, &snap, &remap, &hooks).await.expect("second");

    assert_eq!(first.upserted, vec![id.clone()]);
    assert_eq!(first.domains_inserted, 2);
    assert_eq!(second.upserted, vec![id.clone()]);
    assert_eq!(second.domains_inserted, 0);
    assert!(!second.had_error());
    assert_eq!(count(&pool, "SELECT count(*) FROM publisher WHERE publisher_id = $1", &id).await, 1);
    assert_eq!(
        count(&pool, "SELECT count(*) FROM publisher_domain WHERE publisher_id = $1", &id).await,
        2
    );
}

#[tokio::test]
async fn sparse_snapshot_keeps_stored_optional_columns() {
    let Some(pool) = pool().await else { return };
    let id = format!("pub-{}", tag());
    let hooks = default_hooks();
    let remap = ManagerRemap::new(HashMap::from([("ext1".to_string(), "18".to_string())]));

    let full = snapshot(
        &format!("{id}-full.json"),
        &format!(
            r#"[{{"_id":"{id}","name":"Acme","officeLocation":"TLV",
                 "accountManager":{{"id":"ext1"}},"startDate":1700000000,
                 "site":["a.example"]}}]"#
        ),
    );
    let sparse = snapshot(
        &format!("{id}-sparse.json"),
        &format!(r#"[{{"_id":"{id}","name":"Acme Renamed","site":["a.example"]}}]"#),
    );
    reconcile::reconcile_object(&pool, &full, &remap, &hooks).await.expect("full");
    reconcile::reconcile_object(&pool, &sparse, &remap, &hooks).await.expect("sparse");

    let row = sqlx::query(
        "SELECT name, office_location, account_manager_id, start_timestamp FROM publisher WHERE publisher_id = $1",
    )
    .bind(&id)
    .fetch_one(&pool)
    .await
    .expect("publisher row");
    assert_eq!(row.get::<String, _>("name"), "Acme Renamed");
    assert_eq!(row.get::<Option<String>, _>("office_location").as_deref(), Some("TLV"));
    assert_eq!(row.get::<Option<String>, _>("account_manager_id").as_deref(), Some("18"));
    assert_eq!(row.get::<Option<i64>, _>("start_timestamp"), Some(1_700_000_000));
}

#[tokio::test]
async fn one_failing_publisher_does_not_roll_back_its_siblings() {
    let Some(pool) = pool().await else { return };
    let tag = tag();
    let (good_a, bad, good_b) = (format!("{tag}-a"), format!("{tag}-bad"), format!("{tag}-b"));
    let root = tempfile::tempdir().expect("tempdir");
    let store = LocalSnapshotStore::new(root.path());
    let key = format!("{tag}/publishers.json");
    // Postgres rejects NUL bytes in TEXT, so the middle upsert fails server-side.
    let body = format!(
        r#"[{{"_id":"{good_a}","name":"A","site":["a.example"]}},
            {{"_id":"{bad}","name":"bad\u0000name","site":["bad.example"]}},
            {{"_id":"{good_b}","name":"B","site":["b.example"]}}]"#
    );
    store.put(&key, body.as_bytes()).await.expect("put snapshot");

    let config = SyncConfig {
        prefix: format!("{tag}/"),
        adstxt_enabled: false,
        ..SyncConfig::default()
    };
    let outcomes = Arc::new(PgOutcomeStore::new(pool.clone()));
    let pipeline = SyncPipeline::new(
        config,
        pool.clone(),
        Arc::new(store),
        outcomes.clone(),
        ManagerRemap::default(),
    );

    let summary = pipeline.run_once().await.expect("sync cycle");
    assert_eq!(summary.selected_objects, 1);
    assert_eq!(summary.failed_objects, 1);
    assert_eq!(summary.publishers_upserted, 2);

    let stored: Vec<String> = sqlx::query_scalar(
        "SELECT publisher_id FROM publisher WHERE publisher_id LIKE $1 ORDER BY publisher_id",
    )
    .bind(format!("{tag}-%"))
    .fetch_all(&pool)
    .await
    .expect("publishers");
    assert_eq!(stored, vec![good_a, good_b]);
    assert_eq!(
        count(&pool, "SELECT count(*) FROM publisher_domain WHERE publisher_id = $1", &bad).await,
        0
    );

    let outcome = outcomes.last_outcome(&key).await.expect("lookup").expect("outcome row");
    assert!(outcome.had_error);
}

struct Seeded {
    publisher_id: String,
    domain: String,
    manual_partner: String,
    auto_partner: String,
    /// kind -> (manual partner's connection id, auto partner's connection id)
    ids: BTreeMap<RelationshipKind, (i64, i64)>,
}

async fn insert_id(conn: &mut PgConnection, sql: &str, a: &str, b: &str) -> i64 {
    sqlx::query_scalar(sql)
        .bind(a)
        .bind(b)
        .fetch_one(&mut *conn)
        .await
        .expect("seed row")
}

async fn seed(conn: &mut PgConnection, tag: &str) -> Seeded {
    let publisher_id = format!("{tag}-pub");
    let domain = format!("{tag}.example");
    sqlx::query("INSERT INTO publisher (publisher_id, name) VALUES ($1, 'Seeded')")
        .bind(&publisher_id)
        .execute(&mut *conn)
        .await
        .expect("seed publisher");
    sqlx::query("INSERT INTO publisher_domain (publisher_id, domain) VALUES ($1, $2)")
        .bind(&publisher_id)
        .bind(&domain)
        .execute(&mut *conn)
        .await
        .expect("seed domain");

    let mut per_partner = Vec::new();
    for (suffix, manual) in [("manual", true), ("auto", false)] {
        let partner = format!("{tag}-{suffix}");
        sqlx::query("INSERT INTO demand_partner (demand_partner_id, name, manual_approve) VALUES ($1, $1, $2)")
            .bind(&partner)
            .bind(manual)
            .execute(&mut *conn)
            .await
            .expect("seed partner");
        let direct = insert_id(
            conn,
            "INSERT INTO demand_partner_connection (demand_partner_id, publisher_account) VALUES ($1, $2) RETURNING id",
            &partner,
            "acct",
        )
        .await;
        let child: i64 = sqlx::query_scalar(
            "INSERT INTO demand_partner_child (dp_connection_id, child_domain) VALUES ($1, $2) RETURNING id",
        )
        .bind(direct)
        .bind(format!("child.{suffix}.example"))
        .fetch_one(&mut *conn)
        .await
        .expect("seed child");
        let seat = insert_id(
            conn,
            "INSERT INTO seat_owner (demand_partner_id, seat_domain) VALUES ($1, $2) RETURNING id",
            &partner,
            &format!("seat.{suffix}.example"),
        )
        .await;
        per_partner.push((partner, direct, child, seat));
    }

    let (manual, auto) = (&per_partner[0], &per_partner[1]);
    Seeded {
        publisher_id,
        domain,
        manual_partner: manual.0.clone(),
        auto_partner: auto.0.clone(),
        ids: BTreeMap::from([
            (RelationshipKind::DirectConnection, (manual.1, auto.1)),
            (RelationshipKind::Child, (manual.2, auto.2)),
            (RelationshipKind::SeatOwner, (manual.3, auto.3)),
        ]),
    }
}

#[tokio::test]
async fn candidates_follow_manual_approval_per_relationship_kind() {
    let Some(pool) = pool().await else { return };
    let mut tx = pool.begin().await.expect("begin");
    let seeded = seed(&mut tx, &tag()).await;
    let publishers = [seeded.publisher_id.clone()];

    let mut all = Vec::new();
    for kind in RelationshipKind::ALL {
        let (manual, auto) = seeded.ids[&kind];
        let candidates = adstxt::generate_candidates(&mut tx, kind, &[manual, auto], Some(&publishers))
            .await
            .expect("candidates");
        let statuses: BTreeMap<i64, DemandStatus> =
            candidates.iter().map(|c| (c.connection_id, c.demand_status)).collect();

        let expected_manual = match kind {
            RelationshipKind::SeatOwner => DemandStatus::Approved,
            RelationshipKind::DirectConnection | RelationshipKind::Child => DemandStatus::NotSent,
        };
        assert_eq!(statuses.len(), 2, "{kind}");
        assert_eq!(statuses[&manual], expected_manual, "{kind} manual_approve = true");
        assert_eq!(statuses[&auto], DemandStatus::Approved, "{kind} manual_approve = false");
        assert!(candidates.iter().all(|c| c.domain == seeded.domain && c.kind == kind));
        all.extend(candidates);
    }

    let lines = adstxt::dedup_candidates(all);
    assert_eq!(lines.len(), 6);
    let first = bulk::write_lines(&mut tx, &lines, 4).await.expect("first write");
    assert_eq!((first.batches, first.rows_inserted), (2, 6));
    let again = bulk::write_lines(&mut tx, &lines, 4).await.expect("second write");
    assert_eq!(again.rows_inserted, 0);

    tx.rollback().await.expect("rollback");
}

#[tokio::test]
async fn metadata_changes_only_cover_ready_partners_once_per_pair() {
    let Some(pool) = pool().await else { return };
    let mut tx = pool.begin().await.expect("begin");
    let seeded = seed(&mut tx, &tag()).await;
    let publishers = [seeded.publisher_id.clone()];

    for (partner, media_type, active) in [
        (&seeded.manual_partner, "banner", true),
        (&seeded.manual_partner, "video", true),
        (&seeded.auto_partner, "banner", false),
    ] {
        sqlx::query(
            "INSERT INTO publisher_demand (publisher_id, demand_partner_id, media_type, active) VALUES ($1, $2, $3, $4)",
        )
        .bind(&seeded.publisher_id)
        .bind(partner)
        .bind(media_type)
        .bind(active)
        .execute(&mut *tx)
        .await
        .expect("seed publisher_demand");
    }

    let mut candidates = Vec::new();
    for kind in RelationshipKind::ALL {
        let (manual, auto) = seeded.ids[&kind];
        candidates.extend(
            adstxt::generate_candidates(&mut tx, kind, &[manual, auto], Some(&publishers))
                .await
                .expect("candidates"),
        );
    }

    let emitted = metadata::emit_changes(&mut tx, &candidates).await.expect("emit");
    assert_eq!(emitted, 1);

    let values: Vec<serde_json::Value> = sqlx::query_scalar("SELECT value FROM metadata_queue WHERE key = $1")
        .bind(format!("adstxt:{}", seeded.manual_partner))
        .fetch_all(&mut *tx)
        .await
        .expect("queued records");
    assert_eq!(
        values,
        vec![serde_json::json!([
            {"publisher_id": seeded.publisher_id, "domain": seeded.domain}
        ])]
    );
    let auto_rows: i64 = sqlx::query_scalar("SELECT count(*) FROM metadata_queue WHERE key = $1")
        .bind(format!("adstxt:{}", seeded.auto_partner))
        .fetch_one(&mut *tx)
        .await
        .expect("count");
    assert_eq!(auto_rows, 0);

    tx.rollback().await.expect("rollback");
}
