use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use pubmed2gene_adapters::{load_fixture_store, FixtureCurationStore};
use pubmed2gene_core::{KeyStrategy, ReconcileRules};
use pubmed2gene_sync::{load_rules, FixtureBulkLoader, LoadConfig, LoadOptions, LoadPipeline};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn config(dir: &Path) -> LoadConfig {
    LoadConfig {
        database_url: String::new(),
        db_server: "fixture".into(),
        db_name: "fixture".into(),
        output_dir: dir.to_path_buf(),
        bulk_file: dir.join("MGI_Reference_Assoc.bcp"),
        curation_log: dir.join("pubmed2geneload.cur.log"),
        dbutils_dir: dir.to_path_buf(),
        api_url: None,
        api_token: None,
        update_batch: 250,
        rules_path: workspace_root().join("rules/reconcile.yaml"),
        http_timeout_secs: 5,
    }
}

fn sample_store() -> Arc<FixtureCurationStore> {
    Arc::new(load_fixture_store(workspace_root().join("fixtures/sample/curation.json")).expect("fixture"))
}

fn sample_pipeline(
    cfg: LoadConfig,
    rules: ReconcileRules,
    store: Arc<FixtureCurationStore>,
) -> LoadPipeline {
    let options = LoadOptions {
        bulk_load: true,
        status_updates: false,
    };
    LoadPipeline::new(cfg, rules, options, store.clone())
        .with_bulk_loader(Box::new(FixtureBulkLoader::new(store)))
        .with_load_date(NaiveDate::from_ymd_opt(2026, 10, 17).unwrap())
}

#[tokio::test]
async fn sample_fixture_run_replaces_own_rows() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let rules = load_rules(&cfg.rules_path).expect("rules");
    assert_eq!(rules.key_strategy, KeyStrategy::Sequence);

    let store = sample_store();
    let summary = sample_pipeline(cfg, rules, store.clone())
        .run_once()
        .await
        .expect("sample run");

    assert_eq!(summary.total_feed_pairs, 7);
    assert_eq!(summary.added, 2);
    assert_eq!(summary.already_in_db, 1);
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.pubmed_not_found, 1);
    assert_eq!(summary.pubmed_multi_reference, 1);
    assert_eq!(summary.gene_not_found, 1);
    assert_eq!(summary.gene_multi_marker, 1);
    assert_eq!(summary.discarded_or_rejected, 1);

    let bulk = std::fs::read_to_string(dir.path().join("MGI_Reference_Assoc.bcp")).unwrap();
    assert_eq!(
        bulk,
        "91|500|700|2|1018|1571|1571|10/17/2026|10/17/2026\n92|502|700|2|1018|1571|1571|10/17/2026|10/17/2026\n"
    );
    let keys: Vec<i64> = store.associations().iter().map(|a| a.assoc_key).collect();
    assert_eq!(keys, vec![90, 91, 92]);
    assert_eq!(store.assoc_sequence(), 92);

    let log = std::fs::read_to_string(dir.path().join("pubmed2geneload.cur.log")).unwrap();
    assert!(log.contains("Total PubMed/EG ID added to the Database: 2"));
    assert!(log.contains("33333\t23456"));
    assert!(log.contains("22222\t23456\tMGI:95661|Gata1, MGI:95662|Gata1-ps"));
}

#[tokio::test]
async fn rerun_with_shipped_rules_writes_identical_bulk_file() {
    let dir = tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let rules = load_rules(&cfg.rules_path).expect("rules");
    let store = sample_store();
    let pipeline = sample_pipeline(cfg, rules, store.clone());
    let bulk_path = dir.path().join("MGI_Reference_Assoc.bcp");

    let first = pipeline.run_once().await.expect("first run");
    let first_bytes = std::fs::read(&bulk_path).unwrap();
    let second = pipeline.run_once().await.expect("second run");
    let second_bytes = std::fs::read(&bulk_path).unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.bulk_file_sha256, second.bulk_file_sha256);
    assert_eq!(second.deleted, first.added as u64);
    let keys: Vec<i64> = store.associations().iter().map(|a| a.assoc_key).collect();
    assert_eq!(keys, vec![90, 91, 92]);
    assert_eq!(store.assoc_sequence(), 92);
}
