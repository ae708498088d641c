//! Curation database adapter contracts + Postgres and fixture-backed stores.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use pubmed2gene_core::{
    CuratedPair, FeedPair, KeyStrategy, MarkerRow, ReconcileRules, ReferenceRow,
    WorkflowStatusRow,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "pubmed2gene-adapters";

/// Bulk-load target table.
pub const ASSOC_TABLE: &str = "MGI_Reference_Assoc";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{query} query failed: {source}")]
    Query {
        query: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Read and write access the load needs from the curation database.
#[async_trait]
pub trait CurationStore: Send + Sync {
    fn store_id(&self) -> &str;

    /// References with a preferred `MGI:` ID, a J: number and a PubMed ID.
    async fn references_with_pubmed_ids(&self) -> Result<Vec<ReferenceRow>, StoreError>;

    /// Feed pairs for one taxon, ordered by PubMed ID.
    async fn feed_pairs(&self, taxon_id: i32) -> Result<Vec<FeedPair>, StoreError>;

    async fn markers_by_gene_id(&self) -> Result<Vec<MarkerRow>, StoreError>;

    /// Pairs of the configured association type not created by this load.
    async fn curated_pairs(&self, rules: &ReconcileRules) -> Result<Vec<CuratedPair>, StoreError>;

    async fn workflow_statuses(&self, group_key: i64) -> Result<Vec<WorkflowStatusRow>, StoreError>;

    async fn workflow_statuses_for(
        &self,
        group_key: i64,
        ref_ids: &[String],
    ) -> Result<Vec<WorkflowStatusRow>, StoreError>;

    async fn next_assoc_key(
        &self,
        strategy: KeyStrategy,
        created_by_key: i64,
    ) -> Result<i64, StoreError>;

    async fn delete_associations_created_by(&self, created_by_key: i64) -> Result<u64, StoreError>;

    /// Move the association sequence to the current maximum key.
    async fn refresh_assoc_sequence(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgCurationStore {
    pool: PgPool,
}

impl PgCurationStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|source| StoreError::Query {
                query: "connect",
                source,
            })?;
        Ok(Self { pool })
    }
}

fn query_err(query: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Query { query, source }
}

fn workflow_status_from_row(row: &PgRow) -> Result<WorkflowStatusRow, sqlx::Error> {
    Ok(WorkflowStatusRow {
        ref_id: row.try_get("ref_id")?,
        refs_key: row.try_get("refs_key")?,
        is_discard: row.try_get("is_discard")?,
        status_key: row.try_get("status_key")?,
    })
}

const WORKFLOW_STATUS_SQL: &str = r#"
    SELECT c.mgiid AS ref_id,
           b._Refs_key::bigint AS refs_key,
           (b.isDiscard = 1) AS is_discard,
           s._Status_key::bigint AS status_key
      FROM BIB_Refs b
      JOIN BIB_Workflow_Status s ON s._Refs_key = b._Refs_key
      JOIN BIB_Citation_Cache c ON c._Refs_key = b._Refs_key
     WHERE s._Group_key = $1
       AND s.isCurrent = 1
"#;

#[async_trait]
impl CurationStore for PgCurationStore {
    fn store_id(&self) -> &str {
        "postgres"
    }

    async fn references_with_pubmed_ids(&self) -> Result<Vec<ReferenceRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT a1._Object_key::bigint AS refs_key, a1.accid AS ref_id, a3.accid AS pubmed_id
              FROM ACC_Accession a1, ACC_Accession a2, ACC_Accession a3
             WHERE a1._MGIType_key = 1
               AND a1._LogicalDB_key = 1
               AND a1.preferred = 1
               AND a1.prefixPart = 'MGI:'
               AND a1._Object_key = a2._Object_key
               AND a2._MGIType_key = 1
               AND a2._LogicalDB_key = 1
               AND a2.prefixPart = 'J:'
               AND a2.preferred = 1
               AND a1._Object_key = a3._Object_key
               AND a3._MGIType_key = 1
               AND a3._LogicalDB_key = 29
               AND a3.preferred = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("reference"))?;

        rows.iter()
            .map(|row| -> Result<ReferenceRow, sqlx::Error> {
                Ok(ReferenceRow {
                    pubmed_id: row.try_get("pubmed_id")?,
                    ref_id: row.try_get("ref_id")?,
                    refs_key: row.try_get("refs_key")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err("reference"))
    }

    async fn feed_pairs(&self, taxon_id: i32) -> Result<Vec<FeedPair>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT geneid, pubmedid
              FROM DP_EntrezGene_PubMed
             WHERE taxid = $1
             ORDER BY pubmedid
            "#,
        )
        .bind(taxon_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("feed"))?;

        rows.iter()
            .map(|row| -> Result<FeedPair, sqlx::Error> {
                Ok(FeedPair {
                    gene_id: row.try_get("geneid")?,
                    pubmed_id: row.try_get("pubmedid")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err("feed"))
    }

    async fn markers_by_gene_id(&self) -> Result<Vec<MarkerRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT a1.accid AS gene_id, m._Marker_key::bigint AS marker_key, m.symbol,
                   a2.accid AS marker_id
              FROM ACC_Accession a1, MRK_Marker m, ACC_Accession a2
             WHERE a1._MGIType_key = 2
               AND a1._LogicalDB_key = 55
               AND a1.preferred = 1
               AND a1._Object_key = m._Marker_key
               AND a1._Object_key = a2._Object_key
               AND a2._MGIType_key = 2
               AND a2._LogicalDB_key = 1
               AND a2.preferred = 1
               AND a2.prefixPart = 'MGI:'
             ORDER BY a1.accid
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("marker"))?;

        rows.iter()
            .map(|row| -> Result<MarkerRow, sqlx::Error> {
                Ok(MarkerRow {
                    gene_id: row.try_get("gene_id")?,
                    marker_id: row.try_get("marker_id")?,
                    symbol: row.try_get("symbol")?,
                    marker_key: row.try_get("marker_key")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err("marker"))
    }

    async fn curated_pairs(&self, rules: &ReconcileRules) -> Result<Vec<CuratedPair>, StoreError> {
        // Rows created by this load are excluded; they are replaced later in the run.
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ra._Refs_key::bigint AS refs_key, a._Object_key::bigint AS marker_key
              FROM MGI_Reference_Assoc ra, ACC_Accession a, MGI_User u
             WHERE ra._MGIType_key = $1
               AND ra._RefAssocType_key = $2
               AND ra._CreatedBy_key != $3
               AND ra._CreatedBy_key = u._User_key
               AND ra._Object_key = a._Object_key
               AND a._MGIType_key = $1
               AND a._LogicalDB_key = 55
               AND a.preferred = 1
            "#,
        )
        .bind(rules.mgi_type_key)
        .bind(rules.ref_assoc_type_key)
        .bind(rules.created_by_key)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err("curated association"))?;

        rows.iter()
            .map(|row| -> Result<CuratedPair, sqlx::Error> {
                Ok(CuratedPair {
                    refs_key: row.try_get("refs_key")?,
                    marker_key: row.try_get("marker_key")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err("curated association"))
    }

    async fn workflow_statuses(&self, group_key: i64) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        let rows = sqlx::query(WORKFLOW_STATUS_SQL)
            .bind(group_key)
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("workflow status"))?;
        rows.iter()
            .map(workflow_status_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err("workflow status"))
    }

    async fn workflow_statuses_for(
        &self,
        group_key: i64,
        ref_ids: &[String],
    ) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        let sql = format!("{WORKFLOW_STATUS_SQL} AND c.mgiid = ANY($2)");
        let rows = sqlx::query(&sql)
            .bind(group_key)
            .bind(ref_ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(query_err("workflow status verification"))?;
        rows.iter()
            .map(workflow_status_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_err("workflow status verification"))
    }

    async fn next_assoc_key(
        &self,
        strategy: KeyStrategy,
        created_by_key: i64,
    ) -> Result<i64, StoreError> {
        let row = match strategy {
            KeyStrategy::Sequence => {
                // Own rows are replaced later in the run, so numbering restarts after other creators.
                sqlx::query(
                    r#"
                    SELECT setval('mgi_reference_assoc_seq', COALESCE(MAX(_Assoc_key), 0) + 1, false)
                      FROM MGI_Reference_Assoc
                     WHERE _CreatedBy_key != $1
                    "#,
                )
                .bind(created_by_key)
                .execute(&self.pool)
                .await
                .map_err(query_err("association sequence rewind"))?;
                sqlx::query("SELECT nextval('mgi_reference_assoc_seq')::bigint AS next_key")
                    .fetch_one(&self.pool)
                    .await
            }
            KeyStrategy::MaxPlusOne => {
                sqlx::query(
                    r#"
                    SELECT (COALESCE(MAX(_Assoc_key), 0) + 1)::bigint AS next_key
                      FROM MGI_Reference_Assoc
                     WHERE _CreatedBy_key != $1
                    "#,
                )
                .bind(created_by_key)
                .fetch_one(&self.pool)
                .await
            }
        }
        .map_err(query_err("next association key"))?;
        row.try_get("next_key").map_err(query_err("next association key"))
    }

    async fn delete_associations_created_by(&self, created_by_key: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM MGI_Reference_Assoc WHERE _CreatedBy_key = $1")
            .bind(created_by_key)
            .execute(&self.pool)
            .await
            .map_err(query_err("association delete"))?;
        Ok(result.rows_affected())
    }

    async fn refresh_assoc_sequence(&self) -> Result<(), StoreError> {
        sqlx::query(
            "SELECT setval('mgi_reference_assoc_seq', (SELECT MAX(_Assoc_key) FROM MGI_Reference_Assoc))",
        )
        .execute(&self.pool)
        .await
        .map_err(query_err("sequence refresh"))?;
        Ok(())
    }
}

/// JSON stand-in for the curation database, used for dry runs and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDocument {
    pub fixture_id: String,
    #[serde(default)]
    pub references: Vec<ReferenceRow>,
    #[serde(default)]
    pub feed: Vec<FixtureFeedRow>,
    #[serde(default)]
    pub markers: Vec<MarkerRow>,
    #[serde(default)]
    pub associations: Vec<FixtureAssociation>,
    #[serde(default)]
    pub workflow_statuses: Vec<FixtureWorkflowStatus>,
    #[serde(default)]
    pub assoc_sequence: i64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFeedRow {
    pub gene_id: String,
    pub pubmed_id: String,
    pub taxon_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureAssociation {
    pub assoc_key: i64,
    pub refs_key: i64,
    pub marker_key: i64,
    pub mgi_type_key: i64,
    pub ref_assoc_type_key: i64,
    pub created_by_key: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureWorkflowStatus {
    pub ref_id: String,
    pub refs_key: i64,
    #[serde(default)]
    pub is_discard: bool,
    pub group_key: i64,
    pub status_key: i64,
}

#[derive(Debug, Default)]
struct FixtureState {
    associations: Vec<FixtureAssociation>,
    assoc_sequence: i64,
}

#[derive(Debug)]
pub struct FixtureCurationStore {
    document: FixtureDocument,
    state: Mutex<FixtureState>,
}

impl FixtureCurationStore {
    pub fn new(document: FixtureDocument) -> Self {
        let state = FixtureState {
            associations: document.associations.clone(),
            assoc_sequence: document.assoc_sequence,
        };
        Self {
            document,
            state: Mutex::new(state),
        }
    }

    pub fn document(&self) -> &FixtureDocument {
        &self.document
    }

    /// Current association rows, including rows inserted by a bulk load.
    pub fn associations(&self) -> Vec<FixtureAssociation> {
        self.lock_state().associations.clone()
    }

    pub fn assoc_sequence(&self) -> i64 {
        self.lock_state().assoc_sequence
    }

    /// Insert rows the way the bulk-load utility would.
    pub fn insert_associations(&self, rows: impl IntoIterator<Item = FixtureAssociation>) {
        self.lock_state().associations.extend(rows);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FixtureState> {
        // Poisoning only follows a panic in another test thread; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn statuses_matching(
        &self,
        group_key: i64,
        keep: impl Fn(&FixtureWorkflowStatus) -> bool,
    ) -> Vec<WorkflowStatusRow> {
        self.document
            .workflow_statuses
            .iter()
            .filter(|s| s.group_key == group_key && keep(s))
            .map(|s| WorkflowStatusRow {
                ref_id: s.ref_id.clone(),
                refs_key: s.refs_key,
                is_discard: s.is_discard,
                status_key: s.status_key,
            })
            .collect()
    }
}

#[async_trait]
impl CurationStore for FixtureCurationStore {
    fn store_id(&self) -> &str {
        &self.document.fixture_id
    }

    async fn references_with_pubmed_ids(&self) -> Result<Vec<ReferenceRow>, StoreError> {
        Ok(self.document.references.clone())
    }

    async fn feed_pairs(&self, taxon_id: i32) -> Result<Vec<FeedPair>, StoreError> {
        let mut pairs = self
            .document
            .feed
            .iter()
            .filter(|row| row.taxon_id == taxon_id)
            .map(|row| FeedPair {
                gene_id: row.gene_id.clone(),
                pubmed_id: row.pubmed_id.clone(),
            })
            .collect::<Vec<_>>();
        pairs.sort_by(|a, b| a.pubmed_id.cmp(&b.pubmed_id));
        Ok(pairs)
    }

    async fn markers_by_gene_id(&self) -> Result<Vec<MarkerRow>, StoreError> {
        let mut markers = self.document.markers.clone();
        markers.sort_by(|a, b| a.gene_id.cmp(&b.gene_id));
        Ok(markers)
    }

    async fn curated_pairs(&self, rules: &ReconcileRules) -> Result<Vec<CuratedPair>, StoreError> {
        let gene_markers: HashSet<i64> =
            self.document.markers.iter().map(|m| m.marker_key).collect();
        let pairs: BTreeSet<CuratedPair> = self
            .lock_state()
            .associations
            .iter()
            .filter(|a| {
                a.mgi_type_key == rules.mgi_type_key
                    && a.ref_assoc_type_key == rules.ref_assoc_type_key
                    && a.created_by_key != rules.created_by_key
                    && gene_markers.contains(&a.marker_key)
            })
            .map(|a| CuratedPair {
                refs_key: a.refs_key,
                marker_key: a.marker_key,
            })
            .collect();
        Ok(pairs.into_iter().collect())
    }

    async fn workflow_statuses(&self, group_key: i64) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        Ok(self.statuses_matching(group_key, |_| true))
    }

    async fn workflow_statuses_for(
        &self,
        group_key: i64,
        ref_ids: &[String],
    ) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        Ok(self.statuses_matching(group_key, |s| ref_ids.contains(&s.ref_id)))
    }

    async fn next_assoc_key(
        &self,
        strategy: KeyStrategy,
        created_by_key: i64,
    ) -> Result<i64, StoreError> {
        let mut state = self.lock_state();
        let key = state
            .associations
            .iter()
            .filter(|a| a.created_by_key != created_by_key)
            .map(|a| a.assoc_key)
            .max()
            .unwrap_or(0)
            + 1;
        if strategy == KeyStrategy::Sequence {
            state.assoc_sequence = key;
        }
        debug!(store = %self.document.fixture_id, ?strategy, key, "allocated association key");
        Ok(key)
    }

    async fn delete_associations_created_by(&self, created_by_key: i64) -> Result<u64, StoreError> {
        let mut state = self.lock_state();
        let before = state.associations.len();
        state
            .associations
            .retain(|a| a.created_by_key != created_by_key);
        Ok((before - state.associations.len()) as u64)
    }

    async fn refresh_assoc_sequence(&self) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if let Some(max) = state.associations.iter().map(|a| a.assoc_key).max() {
            state.assoc_sequence = max;
        }
        Ok(())
    }
}

pub fn load_fixture_store(path: impl AsRef<Path>) -> anyhow::Result<FixtureCurationStore> {
    let document: FixtureDocument = read_json_file(path)?;
    Ok(FixtureCurationStore::new(document))
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
