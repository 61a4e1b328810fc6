// Fixture-driven checks for the GS Engage paging contract.

use std::path::{Path, PathBuf};

use perfdash_adapters::{
    fetch_all_pages, fetch_snapshot, AdapterContext, Endpoint, FixturePageSource, PageSize,
    PaginationPolicy, StopReason,
};
use perfdash_core::ProspectionStatus;
use uuid::Uuid;

fn sample_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/gs-engage/sample")
}

fn ctx() -> AdapterContext {
    AdapterContext::new(Uuid::new_v4())
}

#[test]
fn sample_fixture_files_exist() {
    let dir = sample_dir();
    assert!(dir.join("prospections.json").exists());
    assert!(dir.join("leads.json").exists());
}

#[tokio::test]
async fn snapshot_reads_both_collections() {
    let source = FixturePageSource::from_dir(sample_dir()).unwrap();
    assert_eq!(source.len(Endpoint::Prospections), 12);
    assert_eq!(source.len(Endpoint::Leads), 9);

    let snapshot = fetch_snapshot(&source, &ctx(), PaginationPolicy::default())
        .await
        .unwrap();
    assert_eq!(snapshot.prospections.len(), 12);
    assert_eq!(snapshot.leads.len(), 9);
    assert_eq!(snapshot.pages_fetched, 2);
    assert_eq!(snapshot.malformed_records, 0);

    let paused = snapshot
        .prospections
        .iter()
        .find(|p| p.id.as_deref() == Some("p-009"))
        .unwrap();
    assert_eq!(paused.status, ProspectionStatus::Other("PAUSED".into()));
    assert!(paused.has_meeting);

    let unowned = snapshot
        .prospections
        .iter()
        .filter(|p| p.responsible.is_none())
        .count();
    assert_eq!(unowned, 1);
}

#[tokio::test]
async fn small_pages_walk_to_the_declared_last_page() {
    let source = FixturePageSource::from_dir(sample_dir()).unwrap();
    let policy = PaginationPolicy {
        page_size: PageSize::new(5).unwrap(),
        max_pages: 20,
    };
    let collected = fetch_all_pages(&source, &ctx(), Endpoint::Prospections, policy)
        .await
        .unwrap();
    assert_eq!(collected.records.len(), 12);
    assert_eq!(collected.pages_fetched, 3);
    assert_eq!(collected.stop, StopReason::LastDeclaredPage);
}

#[tokio::test]
async fn page_bound_truncates_large_collections() {
    let source = FixturePageSource::from_dir(sample_dir()).unwrap();
    let policy = PaginationPolicy {
        page_size: PageSize::new(2).unwrap(),
        max_pages: 2,
    };
    let collected = fetch_all_pages(&source, &ctx(), Endpoint::Leads, policy)
        .await
        .unwrap();
    assert_eq!(collected.records.len(), 4);
    assert_eq!(collected.stop, StopReason::PageBound);
}

#[test]
fn missing_fixture_directory_is_an_error() {
    let err = FixturePageSource::from_dir(sample_dir().join("absent")).unwrap_err();
    assert!(format!("{err:#}").contains("prospections.json"));
}
