use pubmed2gene_adapters::{load_fixture_store, CurationStore};
use pubmed2gene_core::{CuratedPair, ReconcileRules};

fn sample_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample/curation.json")
}

#[tokio::test]
async fn sample_fixture_store_loads() {
    let store = load_fixture_store(sample_path()).expect("sample fixture");
    assert_eq!(store.store_id(), "sample");

    let rules = ReconcileRules::default();
    let feed = store.feed_pairs(rules.taxon_id).await.unwrap();
    assert_eq!(feed.len(), 7);
    assert!(feed.windows(2).all(|w| w[0].pubmed_id <= w[1].pubmed_id));

    let curated = store.curated_pairs(&rules).await.unwrap();
    assert_eq!(
        curated,
        vec![CuratedPair {
            refs_key: 500,
            marker_key: 701
        }]
    );

    let statuses = store
        .workflow_statuses_for(rules.workflow_group_key, &["MGI:6100502".to_string()])
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status_key, 31576672);
}
