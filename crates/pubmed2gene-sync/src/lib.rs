//! Load pipeline orchestration: lookups, reconciliation, bulk load, status updates, curation log.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use pubmed2gene_adapters::{
    load_fixture_store, CurationStore, FixtureAssociation, FixtureCurationStore, PgCurationStore,
    ASSOC_TABLE,
};
use pubmed2gene_core::{
    Association, CuratedPair, FeedPair, KeyStrategy, Lookup, MarkerRow, ReconcileRules,
    ReferenceRow, WorkflowStatusRow, BULK_FIELD_DELIMITER,
};
use pubmed2gene_storage::{
    write_bulk_file, BulkLoadCommand, StatusApiClient, StatusApiConfig, WrittenBulkFile,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pubmed2gene-sync";

const TAB: &str = "\t";
const CRT: &str = "\n";

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub database_url: String,
    pub db_server: String,
    pub db_name: String,
    pub output_dir: PathBuf,
    pub bulk_file: PathBuf,
    pub curation_log: PathBuf,
    pub dbutils_dir: PathBuf,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub update_batch: usize,
    pub rules_path: PathBuf,
    pub http_timeout_secs: u64,
}

impl LoadConfig {
    pub fn from_env() -> Self {
        let output_dir = std::env::var("OUTPUTDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./output"));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://mgd_dbo@localhost:5432/mgd".to_string()),
            db_server: std::env::var("PG_DBSERVER").unwrap_or_else(|_| "localhost".to_string()),
            db_name: std::env::var("PG_DBNAME").unwrap_or_else(|_| "mgd".to_string()),
            bulk_file: std::env::var("BCP_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| output_dir.join(format!("{ASSOC_TABLE}.bcp"))),
            curation_log: std::env::var("LOG_CUR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| output_dir.join("pubmed2geneload.cur.log")),
            dbutils_dir: std::env::var("PG_DBUTILS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/local/mgi/live/dbutils/pgdbutilities")),
            api_url: std::env::var("JAVA_API_URL").ok(),
            api_token: std::env::var("JAVA_API_TOKEN").ok(),
            update_batch: positive_from_env("UPDATE_BATCH", 100),
            rules_path: std::env::var("PM2GENE_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rules/reconcile.yaml")),
            http_timeout_secs: positive_from_env("PM2GENE_HTTP_TIMEOUT_SECS", 60),
            output_dir,
        }
    }
}

fn positive_from_env<T>(name: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Display + Copy,
{
    parse_positive(name, std::env::var(name).ok().as_deref(), default)
}

/// Unset falls back silently; a value that is set but unusable is warned about.
fn parse_positive<T>(name: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Display + Copy,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            warn!(variable = name, value = raw, %default, "ignoring invalid setting; using default");
            default
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    reconcile: ReconcileRules,
}

pub fn parse_rules(text: &str) -> Result<ReconcileRules> {
    let file: RulesFile = serde_yaml::from_str(text).context("parsing reconcile rules")?;
    Ok(file.reconcile)
}

/// Read the rules file; a missing file falls back to the current-revision defaults.
pub fn load_rules(path: &Path) -> Result<ReconcileRules> {
    if !path.exists() {
        warn!(path = %path.display(), "rules file not found; using default rules");
        return Ok(ReconcileRules::default());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_rules(&text).with_context(|| format!("loading {}", path.display()))
}

/// In-memory lookup structures built from the curation database and the feed.
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub references_by_pubmed: HashMap<String, Vec<ReferenceRow>>,
    pub feed_by_pubmed: HashMap<String, Vec<String>>,
    pub markers_by_gene: HashMap<String, Vec<MarkerRow>>,
    pub curated_pairs: HashSet<CuratedPair>,
    pub statuses_by_ref_id: HashMap<String, WorkflowStatusRow>,
    pub next_assoc_key: i64,
    pub total_feed_pairs: usize,
}

impl Lookups {
    pub fn from_rows(
        references: Vec<ReferenceRow>,
        feed: Vec<FeedPair>,
        markers: Vec<MarkerRow>,
        curated: Vec<CuratedPair>,
        statuses: Vec<WorkflowStatusRow>,
        next_assoc_key: i64,
    ) -> Self {
        let mut lookups = Self {
            next_assoc_key,
            total_feed_pairs: feed.len(),
            curated_pairs: curated.into_iter().collect(),
            ..Default::default()
        };

        for reference in references {
            lookups
                .references_by_pubmed
                .entry(reference.pubmed_id.clone())
                .or_default()
                .push(reference);
        }
        for pair in feed {
            lookups
                .feed_by_pubmed
                .entry(pair.pubmed_id)
                .or_default()
                .push(pair.gene_id);
        }
        for marker in markers {
            let candidates = lookups.markers_by_gene.entry(marker.gene_id.clone()).or_default();
            if !candidates.contains(&marker) {
                candidates.push(marker);
            }
        }
        for status in statuses {
            lookups.statuses_by_ref_id.insert(status.ref_id.clone(), status);
        }
        lookups
    }

    /// Feed groups in ascending PubMed ID order.
    pub fn feed_groups(&self) -> Vec<(&String, &Vec<String>)> {
        let mut groups: Vec<_> = self.feed_by_pubmed.iter().collect();
        groups.sort_by(|a, b| pubmed_id_order(a.0, b.0));
        groups
    }

    pub fn reference(&self, pubmed_id: &str) -> Lookup<'_, ReferenceRow> {
        Lookup::from_candidates(self.references_by_pubmed.get(pubmed_id).map(Vec::as_slice))
    }

    pub fn marker(&self, gene_id: &str) -> Lookup<'_, MarkerRow> {
        Lookup::from_candidates(self.markers_by_gene.get(gene_id).map(Vec::as_slice))
    }
}

/// Numeric IDs compare as numbers; non-numeric IDs sort after them by text.
fn pubmed_id_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// `key_strategy` is passed separately so a run that loads nothing can allocate read-only.
pub async fn load_lookups(
    store: &dyn CurationStore,
    rules: &ReconcileRules,
    key_strategy: KeyStrategy,
) -> Result<Lookups> {
    let span = info_span!("load_lookups", store = store.store_id(), ?key_strategy);
    async {
        let next_assoc_key = store
            .next_assoc_key(key_strategy, rules.created_by_key)
            .await
            .context("allocating next association key")?;
        let references = store
            .references_with_pubmed_ids()
            .await
            .context("loading references")?;
        let feed = store
            .feed_pairs(rules.taxon_id)
            .await
            .context("loading feed pairs")?;
        let markers = store.markers_by_gene_id().await.context("loading markers")?;
        let curated = store
            .curated_pairs(rules)
            .await
            .context("loading curated associations")?;
        let statuses = store
            .workflow_statuses(rules.workflow_group_key)
            .await
            .context("loading workflow statuses")?;

        let lookups = Lookups::from_rows(references, feed, markers, curated, statuses, next_assoc_key);
        info!(
            next_assoc_key,
            pubmed_ids = lookups.references_by_pubmed.len(),
            feed_pairs = lookups.total_feed_pairs,
            feed_groups = lookups.feed_by_pubmed.len(),
            gene_ids = lookups.markers_by_gene.len(),
            curated_pairs = lookups.curated_pairs.len(),
            statuses = lookups.statuses_by_ref_id.len(),
            "lookups loaded"
        );
        Ok::<_, anyhow::Error>(lookups)
    }
    .instrument(span)
    .await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiGeneGroup {
    pub pubmed_id: String,
    pub gene_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultiReference {
    pub pubmed_id: String,
    pub ref_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneNotFound {
    pub gene_id: String,
    pub pubmed_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneMultiMarker {
    pub gene_id: String,
    pub pubmed_id: String,
    pub markers: Vec<(String, String)>,
}

/// Data-quality findings; none of these fail the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Discrepancies {
    pub pubmed_not_found: Vec<String>,
    pub pubmed_multi_gene: Vec<MultiGeneGroup>,
    pub pubmed_multi_reference: Vec<MultiReference>,
    pub gene_not_found: Vec<GeneNotFound>,
    pub gene_multi_marker: Vec<GeneMultiMarker>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub accepted: Vec<Association>,
    /// Public reference IDs of accepted associations, first-seen order, no repeats.
    pub status_candidates: Vec<String>,
    pub discrepancies: Discrepancies,
    pub already_in_db: usize,
    pub duplicates_skipped: usize,
}

pub struct Reconciler<'a> {
    rules: &'a ReconcileRules,
    load_date: NaiveDate,
}

impl<'a> Reconciler<'a> {
    pub fn new(rules: &'a ReconcileRules, load_date: NaiveDate) -> Self {
        Self { rules, load_date }
    }

    pub fn reconcile(&self, lookups: &Lookups) -> Reconciliation {
        let mut out = Reconciliation::default();
        let mut next_key = lookups.next_assoc_key;
        let mut emitted: HashSet<CuratedPair> = HashSet::new();
        let mut queued_refs: HashSet<&str> = HashSet::new();

        for (pubmed_id, gene_ids) in lookups.feed_groups() {
            if gene_ids.len() > self.rules.multi_gene_threshold {
                debug!(%pubmed_id, genes = gene_ids.len(), "group over gene threshold");
                out.discrepancies.pubmed_multi_gene.push(MultiGeneGroup {
                    pubmed_id: pubmed_id.clone(),
                    gene_ids: gene_ids.clone(),
                });
                continue;
            }

            let reference = match lookups.reference(pubmed_id) {
                Lookup::Unique(reference) => reference,
                Lookup::Missing => {
                    out.discrepancies.pubmed_not_found.push(pubmed_id.clone());
                    continue;
                }
                Lookup::Ambiguous(references) => {
                    let ref_ids: Vec<String> = references.iter().map(|r| r.ref_id.clone()).collect();
                    warn!(%pubmed_id, ?ref_ids, "more than one reference for pubmed id");
                    out.discrepancies
                        .pubmed_multi_reference
                        .push(MultiReference {
                            pubmed_id: pubmed_id.clone(),
                            ref_ids,
                        });
                    continue;
                }
            };

            for gene_id in gene_ids {
                let marker = match lookups.marker(gene_id) {
                    Lookup::Unique(marker) => marker,
                    Lookup::Missing => {
                        out.discrepancies.gene_not_found.push(GeneNotFound {
                            gene_id: gene_id.clone(),
                            pubmed_id: pubmed_id.clone(),
                        });
                        continue;
                    }
                    Lookup::Ambiguous(markers) => {
                        out.discrepancies.gene_multi_marker.push(GeneMultiMarker {
                            gene_id: gene_id.clone(),
                            pubmed_id: pubmed_id.clone(),
                            markers: markers
                                .iter()
                                .map(|m| (m.marker_id.clone(), m.symbol.clone()))
                                .collect(),
                        });
                        continue;
                    }
                };

                let pair = CuratedPair {
                    refs_key: reference.refs_key,
                    marker_key: marker.marker_key,
                };
                if lookups.curated_pairs.contains(&pair) {
                    out.already_in_db += 1;
                    continue;
                }
                if !emitted.insert(pair) {
                    out.duplicates_skipped += 1;
                    continue;
                }

                if queued_refs.insert(reference.ref_id.as_str()) {
                    out.status_candidates.push(reference.ref_id.clone());
                }
                out.accepted.push(Association {
                    assoc_key: next_key,
                    refs_key: pair.refs_key,
                    marker_key: pair.marker_key,
                    mgi_type_key: self.rules.mgi_type_key,
                    ref_assoc_type_key: self.rules.ref_assoc_type_key,
                    created_by_key: self.rules.created_by_key,
                    modified_by_key: self.rules.created_by_key,
                    creation_date: self.load_date,
                    modification_date: self.load_date,
                });
                next_key += 1;
            }
        }

        info!(
            accepted = out.accepted.len(),
            already_in_db = out.already_in_db,
            duplicates = out.duplicates_skipped,
            pubmed_not_found = out.discrepancies.pubmed_not_found.len(),
            pubmed_multi_gene = out.discrepancies.pubmed_multi_gene.len(),
            gene_not_found = out.discrepancies.gene_not_found.len(),
            gene_multi_marker = out.discrepancies.gene_multi_marker.len(),
            "reconciliation complete"
        );
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscardOrRejected {
    pub ref_id: String,
    pub is_discard: bool,
    pub is_rejected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusPlan {
    pub eligible: Vec<String>,
    pub discarded_or_rejected: Vec<DiscardOrRejected>,
    pub already_terminal: Vec<String>,
    pub missing_status: Vec<String>,
}

impl StatusPlan {
    pub fn batches(&self, size: usize) -> std::slice::Chunks<'_, String> {
        self.eligible.chunks(size.max(1))
    }
}

pub fn plan_status_updates(
    candidates: &[String],
    statuses: &HashMap<String, WorkflowStatusRow>,
    rules: &ReconcileRules,
) -> StatusPlan {
    let mut plan = StatusPlan::default();
    for ref_id in candidates {
        let Some(status) = statuses.get(ref_id) else {
            warn!(%ref_id, "reference has no current workflow status");
            plan.missing_status.push(ref_id.clone());
            continue;
        };
        let is_rejected = rules.is_rejected(status.status_key);
        if status.is_discard || is_rejected {
            plan.discarded_or_rejected.push(DiscardOrRejected {
                ref_id: ref_id.clone(),
                is_discard: status.is_discard,
                is_rejected,
            });
            continue;
        }
        if rules.is_terminal(status.status_key) {
            plan.already_terminal.push(ref_id.clone());
            continue;
        }
        plan.eligible.push(ref_id.clone());
    }
    plan
}

/// Loads a written bulk file into the association table.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    fn describe(&self, bulk_file: &Path) -> String;
    async fn load(&self, bulk_file: &Path) -> Result<()>;
}

pub struct CommandBulkLoader {
    command: BulkLoadCommand,
}

impl CommandBulkLoader {
    pub fn new(command: BulkLoadCommand) -> Self {
        Self { command }
    }
}

fn split_bulk_path(bulk_file: &Path) -> (PathBuf, String) {
    let dir = bulk_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = bulk_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    (dir, name)
}

#[async_trait]
impl BulkLoader for CommandBulkLoader {
    fn describe(&self, bulk_file: &Path) -> String {
        let (dir, name) = split_bulk_path(bulk_file);
        self.command.command_line(&dir, &name)
    }

    async fn load(&self, bulk_file: &Path) -> Result<()> {
        let (dir, name) = split_bulk_path(bulk_file);
        self.command.run(&dir, &name).await?;
        Ok(())
    }
}

/// Inserts bulk file rows straight into a fixture store.
pub struct FixtureBulkLoader {
    store: Arc<FixtureCurationStore>,
}

impl FixtureBulkLoader {
    pub fn new(store: Arc<FixtureCurationStore>) -> Self {
        Self { store }
    }
}

fn parse_bulk_line(line: &str) -> Result<FixtureAssociation> {
    let fields: Vec<&str> = line.split(BULK_FIELD_DELIMITER).collect();
    if fields.len() != 9 {
        bail!("expected 9 bulk columns, found {}: {line}", fields.len());
    }
    let key = |idx: usize| -> Result<i64> {
        fields[idx]
            .parse()
            .with_context(|| format!("column {idx} of bulk line {line}"))
    };
    Ok(FixtureAssociation {
        assoc_key: key(0)?,
        refs_key: key(1)?,
        marker_key: key(2)?,
        mgi_type_key: key(3)?,
        ref_assoc_type_key: key(4)?,
        created_by_key: key(5)?,
    })
}

#[async_trait]
impl BulkLoader for FixtureBulkLoader {
    fn describe(&self, bulk_file: &Path) -> String {
        format!(
            "fixture load of {} into {}",
            bulk_file.display(),
            self.store.document().fixture_id
        )
    }

    async fn load(&self, bulk_file: &Path) -> Result<()> {
        let text = fs::read_to_string(bulk_file)
            .await
            .with_context(|| format!("reading {}", bulk_file.display()))?;
        let rows = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(parse_bulk_line)
            .collect::<Result<Vec<_>>>()?;
        self.store.insert_associations(rows);
        Ok(())
    }
}

/// Submits one batch of reference IDs to the workflow status endpoint.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update(&self, ref_ids: &[String]) -> Result<()>;
}

#[async_trait]
impl StatusUpdater for StatusApiClient {
    async fn update(&self, ref_ids: &[String]) -> Result<()> {
        self.update_batch(ref_ids).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmitSummary {
    pub bulk_file: String,
    pub bulk_file_sha256: String,
    pub rows: usize,
    pub deleted: u64,
    pub loaded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifySummary {
    pub batches: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub bulk_load: bool,
    pub status_updates: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            bulk_load: true,
            status_updates: true,
        }
    }
}

impl LoadOptions {
    pub fn dry_run() -> Self {
        Self {
            bulk_load: false,
            status_updates: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_id: String,
    pub total_feed_pairs: usize,
    pub already_in_db: usize,
    pub duplicates_skipped: usize,
    pub deleted: u64,
    pub added: usize,
    pub status_updates: usize,
    pub status_batches: usize,
    pub bulk_file: String,
    pub bulk_file_sha256: String,
    pub pubmed_not_found: usize,
    pub pubmed_multi_gene: usize,
    pub pubmed_multi_reference: usize,
    pub gene_not_found: usize,
    pub gene_multi_marker: usize,
    pub discarded_or_rejected: usize,
}

/// Everything the curation log reports on.
#[derive(Debug, Clone)]
pub struct CurationReport<'a> {
    pub rules: &'a ReconcileRules,
    pub total_feed_pairs: usize,
    pub deleted: u64,
    pub status_updates: usize,
    pub reconciliation: &'a Reconciliation,
    pub plan: &'a StatusPlan,
}

fn push_section(out: &mut String, title: &str, header: Option<String>, rows: Vec<String>) {
    if rows.is_empty() {
        return;
    }
    out.push_str(CRT);
    out.push_str(CRT);
    out.push_str(&format!("{title:^60}"));
    out.push_str(CRT);
    if let Some(header) = header {
        out.push_str(&header);
        out.push_str(CRT);
    }
    out.push_str(&rows.join(CRT));
    out.push_str(CRT);
    out.push_str(&format!("Total: {}", rows.len()));
}

pub fn render_curation_log(report: &CurationReport<'_>) -> String {
    let rec = report.reconciliation;
    let found = &rec.discrepancies;
    let mut out = String::new();

    let totals = [
        format!(
            "Total PubMed/EG ID associations from EntrezGene: {}",
            report.total_feed_pairs
        ),
        format!(
            "Total PubMed/EG ID associations already in Database: {}",
            rec.already_in_db
        ),
        format!(
            "Total PubMed/EG ID associations deleted from the Database: {}",
            report.deleted
        ),
        format!("Total PubMed/EG ID added to the Database: {}", rec.accepted.len()),
        format!(
            "Total References updated to \"{}\" for {}: {}",
            report.rules.status_update_target, report.rules.status_update_group, report.status_updates
        ),
    ];
    for line in totals {
        out.push_str(CRT);
        out.push_str(CRT);
        out.push_str(&line);
    }

    push_section(
        &mut out,
        "PM IDs not in the Database or reference has no J: number",
        None,
        found.pubmed_not_found.clone(),
    );
    push_section(
        &mut out,
        &format!(
            "PM IDs Associated with > {} egID in Input",
            report.rules.multi_gene_threshold
        ),
        Some(format!("{:<12}  {:<20}", "PM ID", "EG IDs")),
        found
            .pubmed_multi_gene
            .iter()
            .map(|g| format!("{}{TAB}{}", g.pubmed_id, g.gene_ids.join(", ")))
            .collect(),
    );
    push_section(
        &mut out,
        "EG IDs not in the Database",
        Some(format!("{:<12}  {:<20}", "EG ID", "PM ID")),
        found
            .gene_not_found
            .iter()
            .map(|g| format!("{}{TAB}{}", g.gene_id, g.pubmed_id))
            .collect(),
    );
    push_section(
        &mut out,
        "EG IDs associated with > 1 marker in the Database",
        Some(format!("{:<12}  {:<20}  {:<20}", "EG ID", "PM ID", "Markers")),
        found
            .gene_multi_marker
            .iter()
            .map(|g| {
                let markers = g
                    .markers
                    .iter()
                    .map(|(id, symbol)| format!("{id}|{symbol}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}{TAB}{}{TAB}{}", g.gene_id, g.pubmed_id, markers)
            })
            .collect(),
    );
    push_section(
        &mut out,
        "References with isDiscard=true or Status=Rejected",
        Some(format!("{:<12}  {:<20}  {:<20}", "Reference ID", "isDiscard", "Status")),
        report
            .plan
            .discarded_or_rejected
            .iter()
            .map(|d| {
                let discard = if d.is_discard { "True" } else { "False" };
                let status = if d.is_rejected { "Rejected" } else { "Not Rejected" };
                format!("{}{TAB}{discard}{TAB}{status}", d.ref_id)
            })
            .collect(),
    );
    out
}

async fn append_to_file(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(text.as_bytes())
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

pub struct LoadPipeline {
    config: LoadConfig,
    rules: ReconcileRules,
    options: LoadOptions,
    load_date: NaiveDate,
    store: Arc<dyn CurationStore>,
    bulk_loader: Option<Box<dyn BulkLoader>>,
    status_updater: Option<Box<dyn StatusUpdater>>,
}

impl LoadPipeline {
    pub fn new(
        config: LoadConfig,
        rules: ReconcileRules,
        options: LoadOptions,
        store: Arc<dyn CurationStore>,
    ) -> Self {
        Self {
            config,
            rules,
            options,
            load_date: Local::now().date_naive(),
            store,
            bulk_loader: None,
            status_updater: None,
        }
    }

    pub fn with_bulk_loader(mut self, loader: Box<dyn BulkLoader>) -> Self {
        self.bulk_loader = Some(loader);
        self
    }

    pub fn with_status_updater(mut self, updater: Box<dyn StatusUpdater>) -> Self {
        self.status_updater = Some(updater);
        self
    }

    pub fn with_load_date(mut self, load_date: NaiveDate) -> Self {
        self.load_date = load_date;
        self
    }

    pub async fn run_once(&self) -> Result<LoadRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("load_run", %run_id, store = self.store.store_id());

        async {
            info!(options = ?self.options, load_date = %self.load_date, "starting load");
            let key_strategy = if self.options.bulk_load {
                self.rules.key_strategy
            } else {
                KeyStrategy::MaxPlusOne
            };
            let lookups = load_lookups(self.store.as_ref(), &self.rules, key_strategy).await?;
            let reconciliation = Reconciler::new(&self.rules, self.load_date).reconcile(&lookups);
            let emitted = self.emit(&reconciliation.accepted).await?;

            let plan = plan_status_updates(
                &reconciliation.status_candidates,
                &lookups.statuses_by_ref_id,
                &self.rules,
            );
            info!(
                candidates = reconciliation.status_candidates.len(),
                eligible = plan.eligible.len(),
                discarded_or_rejected = plan.discarded_or_rejected.len(),
                already_terminal = plan.already_terminal.len(),
                "status update plan"
            );
            let notified = self.notify(&plan).await?;

            let report = CurationReport {
                rules: &self.rules,
                total_feed_pairs: lookups.total_feed_pairs,
                deleted: emitted.deleted,
                status_updates: notified.updated,
                reconciliation: &reconciliation,
                plan: &plan,
            };
            append_to_file(&self.config.curation_log, &render_curation_log(&report)).await?;

            let found = &reconciliation.discrepancies;
            let summary = LoadRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                store_id: self.store.store_id().to_string(),
                total_feed_pairs: lookups.total_feed_pairs,
                already_in_db: reconciliation.already_in_db,
                duplicates_skipped: reconciliation.duplicates_skipped,
                deleted: emitted.deleted,
                added: reconciliation.accepted.len(),
                status_updates: notified.updated,
                status_batches: notified.batches,
                bulk_file: emitted.bulk_file,
                bulk_file_sha256: emitted.bulk_file_sha256,
                pubmed_not_found: found.pubmed_not_found.len(),
                pubmed_multi_gene: found.pubmed_multi_gene.len(),
                pubmed_multi_reference: found.pubmed_multi_reference.len(),
                gene_not_found: found.gene_not_found.len(),
                gene_multi_marker: found.gene_multi_marker.len(),
                discarded_or_rejected: plan.discarded_or_rejected.len(),
            };
            self.write_summary(&summary).await?;
            info!(added = summary.added, deleted = summary.deleted, status_updates = summary.status_updates, "load complete");
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn emit(&self, accepted: &[Association]) -> Result<EmitSummary> {
        let written: WrittenBulkFile = write_bulk_file(&self.config.bulk_file, accepted).await?;
        info!(path = %written.path.display(), rows = written.rows, sha256 = %written.sha256, "bulk file written");

        let mut summary = EmitSummary {
            bulk_file: written.path.display().to_string(),
            bulk_file_sha256: written.sha256,
            rows: written.rows,
            deleted: 0,
            loaded: false,
        };
        if !self.options.bulk_load {
            info!("bulk load disabled; leaving database untouched");
            return Ok(summary);
        }
        let Some(loader) = &self.bulk_loader else {
            bail!("bulk load enabled but no bulk loader configured");
        };

        summary.deleted = self
            .store
            .delete_associations_created_by(self.rules.created_by_key)
            .await
            .context("deleting previously loaded associations")?;
        info!(deleted = summary.deleted, "deleted previously loaded associations");

        info!(command = %loader.describe(&self.config.bulk_file), "running bulk load");
        loader
            .load(&self.config.bulk_file)
            .await
            .context("bulk loading associations")?;
        self.store
            .refresh_assoc_sequence()
            .await
            .context("refreshing association sequence")?;
        summary.loaded = true;
        Ok(summary)
    }

    async fn notify(&self, plan: &StatusPlan) -> Result<NotifySummary> {
        let mut summary = NotifySummary::default();
        if !self.options.status_updates {
            info!(eligible = plan.eligible.len(), "status updates disabled");
            return Ok(summary);
        }
        let Some(updater) = &self.status_updater else {
            bail!("status updates enabled but no status updater configured");
        };

        for batch in plan.batches(self.config.update_batch) {
            info!(batch = summary.batches + 1, size = batch.len(), "submitting status update batch");
            updater
                .update(batch)
                .await
                .with_context(|| format!("status update batch {} failed", summary.batches + 1))?;
            summary.batches += 1;
            summary.updated += batch.len();
            self.verify_batch(batch).await;
        }
        Ok(summary)
    }

    /// Diagnostic only: report the workflow status now recorded for a submitted batch.
    async fn verify_batch(&self, batch: &[String]) {
        match self
            .store
            .workflow_statuses_for(self.rules.workflow_group_key, batch)
            .await
        {
            Ok(rows) => {
                for row in rows {
                    debug!(ref_id = %row.ref_id, status_key = row.status_key, "status after update");
                }
            }
            Err(err) => warn!(error = %err, "could not verify status update batch"),
        }
    }

    async fn write_summary(&self, summary: &LoadRunSummary) -> Result<()> {
        fs::create_dir_all(&self.config.output_dir)
            .await
            .with_context(|| format!("creating {}", self.config.output_dir.display()))?;
        let path = self.config.output_dir.join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Build the pipeline from the environment and run it once.
pub async fn run_load_once_from_env(
    options: LoadOptions,
    fixture: Option<PathBuf>,
) -> Result<LoadRunSummary> {
    let config = LoadConfig::from_env();
    let rules = load_rules(&config.rules_path)?;

    let mut pipeline = match fixture {
        Some(path) => {
            let store = Arc::new(load_fixture_store(&path)?);
            let loader = FixtureBulkLoader::new(store.clone());
            LoadPipeline::new(config.clone(), rules.clone(), options, store)
                .with_bulk_loader(Box::new(loader))
        }
        None => {
            let store = PgCurationStore::connect(&config.database_url)
                .await
                .context("connecting to curation database")?;
            let command = BulkLoadCommand::from_dbutils(
                &config.dbutils_dir,
                config.db_server.clone(),
                config.db_name.clone(),
                ASSOC_TABLE,
            );
            LoadPipeline::new(config.clone(), rules.clone(), options, Arc::new(store))
                .with_bulk_loader(Box::new(CommandBulkLoader::new(command)))
        }
    };

    if options.status_updates {
        let (Some(base_url), Some(access_token)) = (config.api_url.clone(), config.api_token.clone())
        else {
            bail!("JAVA_API_URL and JAVA_API_TOKEN are required for status updates");
        };
        let client = StatusApiClient::new(StatusApiConfig {
            base_url,
            access_token,
            username: rules.api_username.clone(),
            group: rules.status_update_group.clone(),
            status: rules.status_update_target.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })?;
        pipeline = pipeline.with_status_updater(Box::new(client));
    }

    pipeline.run_once().await
}
