use std::path::{Path, PathBuf};

use pubsync_snapshot::{parse_snapshot, ManagerRemap};

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/snapshots")
}

#[test]
fn fixture_snapshot_parses_every_publisher() {
    let bytes = std::fs::read(fixtures_dir().join("publishers.json")).expect("read fixture");
    let records = parse_snapshot("publishers/publishers.json", &bytes).expect("parse fixture");

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].site, vec!["a.com", "b.com"]);
    assert_eq!(records[1].office_location.as_deref(), Some("TLV"));
    assert_eq!(
        records[1]
            .domain_option("m.northwind.example")
            .and_then(|o| o.mirror_publisher.as_deref()),
        Some("31")
    );
}

#[test]
fn fixture_remap_file_loads() {
    let remap = ManagerRemap::load(fixtures_dir().join("manager_remap.json")).expect("load remap");
    assert_eq!(remap.len(), 2);
    assert_eq!(remap.resolve("ext1"), "18");
    assert_eq!(remap.resolve("mb-7"), "mb-7");
}
