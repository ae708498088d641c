//! Core domain model for the PubMed-to-gene association load.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pubmed2gene-core";

/// Column delimiter of the bulk-load file.
pub const BULK_FIELD_DELIMITER: &str = "|";

/// Row delimiter of the bulk-load file.
pub const BULK_ROW_DELIMITER: &str = "\n";

/// Date rendering used for the creation/modification columns.
pub const BULK_DATE_FORMAT: &str = "%m/%d/%Y";

/// A curated reference that carries a PubMed ID, a public `MGI:` ID and a J: number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub pubmed_id: String,
    pub ref_id: String,
    pub refs_key: i64,
}

/// One species-filtered (gene, publication) pair from the external feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedPair {
    pub gene_id: String,
    pub pubmed_id: String,
}

/// Marker addressed by its Entrez Gene ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerRow {
    pub gene_id: String,
    pub marker_id: String,
    pub symbol: String,
    pub marker_key: i64,
}

/// Reference/marker pair already curated by some other creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CuratedPair {
    pub refs_key: i64,
    pub marker_key: i64,
}

/// Current workflow status of a reference for the configured curation group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatusRow {
    pub ref_id: String,
    pub refs_key: i64,
    pub is_discard: bool,
    pub status_key: i64,
}

/// A reference/marker association row destined for the bulk-load file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub assoc_key: i64,
    pub refs_key: i64,
    pub marker_key: i64,
    pub mgi_type_key: i64,
    pub ref_assoc_type_key: i64,
    pub created_by_key: i64,
    pub modified_by_key: i64,
    pub creation_date: NaiveDate,
    pub modification_date: NaiveDate,
}

impl Association {
    pub fn pair(&self) -> CuratedPair {
        CuratedPair {
            refs_key: self.refs_key,
            marker_key: self.marker_key,
        }
    }

    /// Render the row in bulk-load column order, without the row delimiter.
    pub fn to_bulk_line(&self) -> String {
        [
            self.assoc_key.to_string(),
            self.refs_key.to_string(),
            self.marker_key.to_string(),
            self.mgi_type_key.to_string(),
            self.ref_assoc_type_key.to_string(),
            self.created_by_key.to_string(),
            self.modified_by_key.to_string(),
            self.creation_date.format(BULK_DATE_FORMAT).to_string(),
            self.modification_date.format(BULK_DATE_FORMAT).to_string(),
        ]
        .join(BULK_FIELD_DELIMITER)
    }
}

/// Outcome of resolving a key against a multi-valued lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a, T> {
    Unique(&'a T),
    Ambiguous(&'a [T]),
    Missing,
}

impl<'a, T> Lookup<'a, T> {
    pub fn from_candidates(candidates: Option<&'a [T]>) -> Self {
        match candidates {
            None | Some([]) => Lookup::Missing,
            Some([only]) => Lookup::Unique(only),
            Some(many) => Lookup::Ambiguous(many),
        }
    }
}

/// How the first association key of a run is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Rewind the association sequence past rows not created by this load, then `nextval`.
    #[default]
    Sequence,
    /// Highest key not created by this load, plus one, without touching the sequence.
    MaxPlusOne,
}

/// Domain constants that differ between revisions of the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileRules {
    pub taxon_id: i32,
    pub multi_gene_threshold: usize,
    pub created_by_key: i64,
    pub mgi_type_key: i64,
    pub ref_assoc_type_key: i64,
    pub workflow_group_key: i64,
    pub rejected_status_keys: Vec<i64>,
    pub terminal_status_keys: Vec<i64>,
    pub status_update_group: String,
    pub status_update_target: String,
    pub api_username: String,
    pub key_strategy: KeyStrategy,
}

impl Default for ReconcileRules {
    fn default() -> Self {
        Self {
            taxon_id: 10090,
            multi_gene_threshold: 15,
            created_by_key: 1571,
            mgi_type_key: 2,
            ref_assoc_type_key: 1018,
            workflow_group_key: 31576666,
            rejected_status_keys: vec![31576672],
            terminal_status_keys: vec![31576673, 31576674],
            status_update_group: "GO".to_string(),
            status_update_target: "Indexed".to_string(),
            api_username: "pm2geneload".to_string(),
            key_strategy: KeyStrategy::Sequence,
        }
    }
}

impl ReconcileRules {
    pub fn is_rejected(&self, status_key: i64) -> bool {
        self.rejected_status_keys.contains(&status_key)
    }

    pub fn is_terminal(&self, status_key: i64) -> bool {
        self.terminal_status_keys.contains(&status_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 9).unwrap()
    }

    #[test]
    fn bulk_line_uses_fixed_column_order() {
        let assoc = Association {
            assoc_key: 9001,
            refs_key: 500,
            marker_key: 700,
            mgi_type_key: 2,
            ref_assoc_type_key: 1018,
            created_by_key: 1571,
            modified_by_key: 1571,
            creation_date: date(),
            modification_date: date(),
        };
        assert_eq!(
            assoc.to_bulk_line(),
            "9001|500|700|2|1018|1571|1571|02/09/2026|02/09/2026"
        );
        assert_eq!(
            assoc.pair(),
            CuratedPair {
                refs_key: 500,
                marker_key: 700
            }
        );
    }

    #[test]
    fn lookup_classifies_candidate_lists() {
        let none: Option<&[i64]> = None;
        assert_eq!(Lookup::from_candidates(none), Lookup::Missing);

        let empty: Vec<i64> = vec![];
        assert_eq!(Lookup::from_candidates(Some(empty.as_slice())), Lookup::Missing);

        let one = vec![7i64];
        assert_eq!(Lookup::from_candidates(Some(one.as_slice())), Lookup::Unique(&7));

        let many = vec![7i64, 8];
        assert_eq!(
            Lookup::from_candidates(Some(many.as_slice())),
            Lookup::Ambiguous(&[7, 8][..])
        );
    }

    #[test]
    fn default_rules_match_current_revision() {
        let rules = ReconcileRules::default();
        assert_eq!(rules.multi_gene_threshold, 15);
        assert!(rules.is_rejected(31576672));
        assert!(rules.is_terminal(31576673));
        assert!(rules.is_terminal(31576674));
        assert!(!rules.is_terminal(31576671));
        assert_eq!(rules.key_strategy, KeyStrategy::Sequence);
    }
}
