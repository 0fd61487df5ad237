//src/hierarchy.rs

use ahash::AHashMap;
use serde::Serialize;

use crate::background::BackgroundStats;
use crate::metrics::{absent_metrics, aggregatescore, count_metrics, Normalization};
use crate::types::{
    CountMetrics, CountType, MetricName, SampleCounts, TaxId, TaxLevel, TaxonCount, CATEGORY_UNCATEGORIZED,
};

/// Base for ids of genus buckets made up for species whose genus row is missing.
/// Same scheme as the pipeline's own invalid-call ids, so it cannot hit a real taxon.
pub const SYNTHETIC_GENUS_BASE_ID: TaxId = -100_000_000;

/// One report line: a species, or a genus with its rollup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub tax_id: TaxId,
    pub tax_level: TaxLevel,
    pub genus_taxid: TaxId,
    pub name: String,
    pub category_name: String,
    pub is_phage: bool,
    #[serde(rename = "NT")]
    pub nt: CountMetrics,
    #[serde(rename = "NR")]
    pub nr: CountMetrics,
    pub aggregatescore: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub species_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded: Option<bool>,
    #[serde(skip)]
    pub synthetic: bool,
}

impl ReportRow {
    pub fn metrics(&self, count_type: CountType) -> &CountMetrics {
        match count_type {
            CountType::Nt => &self.nt,
            CountType::Nr => &self.nr,
        }
    }

    fn metrics_mut(&mut self, count_type: CountType) -> &mut CountMetrics {
        match count_type {
            CountType::Nt => &mut self.nt,
            CountType::Nr => &mut self.nr,
        }
    }

    /// Value of a named metric on this row.
    pub fn value(&self, metric: MetricName) -> f64 {
        match metric.count_type {
            Some(ct) => self.metrics(ct).get(metric.metric),
            None => self.aggregatescore,
        }
    }

    fn set_aggregatescore(&mut self, score: f64) {
        self.aggregatescore = score;
        self.nt.aggregatescore = score;
        self.nr.aggregatescore = score;
    }
}

/// Merges the NT and NR rows of every `(tax_id, tax_level)` into one `ReportRow`
/// with its metrics computed. Rows keep the order of first appearance.
///
/// Negative (synthetic) ids are never looked up in the background.
pub fn compute_rows(sample: &SampleCounts, stats: &BackgroundStats, mass_normalized: bool) -> Vec<ReportRow> {
    let norm = Normalization {
        adjusted_total_reads: sample.adjusted_total_reads(),
        total_ercc_reads: sample.total_ercc_reads,
        mass_normalized,
    };
    rows_from_counts(&sample.counts, stats, &norm)
}

/// Same as [`compute_rows`] over any subset of a sample's counts.
pub fn rows_from_counts<'a, I>(counts: I, stats: &BackgroundStats, norm: &Normalization) -> Vec<ReportRow>
where
    I: IntoIterator<Item = &'a TaxonCount>,
{
    let mut index: AHashMap<(TaxId, TaxLevel), usize> = AHashMap::new();
    let mut rows: Vec<ReportRow> = Vec::new();
    let mut present: Vec<[bool; 2]> = Vec::new();

    for count in counts {
        let slot = *index.entry((count.tax_id, count.tax_level)).or_insert_with(|| {
            rows.push(ReportRow {
                tax_id: count.tax_id,
                tax_level: count.tax_level,
                genus_taxid: count.genus_taxid,
                name: count.name.clone(),
                category_name: count.category_name.clone(),
                is_phage: count.is_phage,
                nt: absent_metrics(),
                nr: absent_metrics(),
                aggregatescore: 0.0,
                species_count: None,
                expanded: None,
                synthetic: false,
            });
            present.push([false; 2]);
            rows.len() - 1
        });
        let stat = if count.tax_id > 0 {
            stats.get(&(count.tax_id, count.count_type))
        } else {
            None
        };
        *rows[slot].metrics_mut(count.count_type) = count_metrics(count, stat, norm);
        present[slot][count.count_type as usize] = true;
    }

    for (row, seen) in rows.iter_mut().zip(&present) {
        let nt = seen[CountType::Nt as usize].then_some(&row.nt);
        let nr = seen[CountType::Nr as usize].then_some(&row.nr);
        let score = aggregatescore(nt, nr);
        row.set_aggregatescore(score);
    }
    rows
}

/// A genus row and the species rows grouped under it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenusNode {
    pub genus: ReportRow,
    pub species: Vec<ReportRow>,
}

/// Which genera start out expanded. Presentation toggles are not tracked here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandPolicy {
    /// Genus the view was scoped to by a search, if any.
    pub searched_genus: Option<TaxId>,
}

impl ExpandPolicy {
    pub fn is_expanded(&self, genus_id: TaxId) -> bool {
        self.searched_genus.map_or(true, |searched| searched == genus_id)
    }
}

/// Two-level genus -> species tree of one sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaxonTree {
    pub genera: Vec<GenusNode>,
}

impl TaxonTree {
    /// Genus-major order: each genus immediately followed by its species.
    pub fn flatten(&self) -> Vec<&ReportRow> {
        let mut out = Vec::with_capacity(self.len());
        for node in &self.genera {
            out.push(&node.genus);
            out.extend(node.species.iter());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.genera.iter().map(|g| 1 + g.species.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.genera.is_empty()
    }

    pub fn genus(&self, tax_id: TaxId) -> Option<&GenusNode> {
        self.genera.iter().find(|g| g.genus.tax_id == tax_id)
    }
}

/// Groups rows into a genus -> species tree.
///
/// 1. rows are split by tax level,
/// 2. species without a genus row get a synthetic genus (and are relinked to it),
/// 3. every genus gets its `species_count` and rollup metrics,
/// 4. the expand flag is set from `policy`.
pub fn build_hierarchy(rows: Vec<ReportRow>, policy: ExpandPolicy) -> TaxonTree {
    let (genus_rows, species_rows): (Vec<ReportRow>, Vec<ReportRow>) =
        rows.into_iter().partition(|r| r.tax_level == TaxLevel::Genus);

    let mut genera: Vec<GenusNode> = Vec::with_capacity(genus_rows.len());
    let mut genus_index: AHashMap<TaxId, usize> = AHashMap::with_capacity(genus_rows.len());
    for genus in genus_rows {
        if genus_index.contains_key(&genus.tax_id) {
            log::warn!("duplicate genus row {} ignored", genus.tax_id);
            continue;
        }
        genus_index.insert(genus.tax_id, genera.len());
        genera.push(GenusNode { genus, species: Vec::new() });
    }

    for mut species in species_rows {
        let slot = match genus_index.get(&species.genus_taxid) {
            Some(&slot) => slot,
            None => {
                let synthetic_id = synthetic_genus_id(species.genus_taxid);
                log::debug!(
                    "species {} references missing genus {}, grouping under {}",
                    species.tax_id,
                    species.genus_taxid,
                    synthetic_id
                );
                species.genus_taxid = synthetic_id;
                *genus_index.entry(synthetic_id).or_insert_with(|| {
                    genera.push(GenusNode { genus: synthetic_genus(synthetic_id), species: Vec::new() });
                    genera.len() - 1
                })
            }
        };
        genera[slot].species.push(species);
    }

    for node in &mut genera {
        rollup(node);
        node.genus.expanded = Some(policy.is_expanded(node.genus.tax_id));
    }

    TaxonTree { genera }
}

fn synthetic_genus_id(genus_taxid: TaxId) -> TaxId {
    if genus_taxid < 0 {
        genus_taxid
    } else {
        SYNTHETIC_GENUS_BASE_ID.saturating_sub(genus_taxid)
    }
}

fn synthetic_genus(tax_id: TaxId) -> ReportRow {
    ReportRow {
        tax_id,
        tax_level: TaxLevel::Genus,
        genus_taxid: tax_id,
        name: String::new(),
        category_name: CATEGORY_UNCATEGORIZED.to_string(),
        is_phage: false,
        nt: absent_metrics(),
        nr: absent_metrics(),
        aggregatescore: 0.0,
        species_count: None,
        expanded: None,
        synthetic: true,
    }
}

/// Species count, best child aggregate score, and for synthetic genera the
/// per-metric maximum over their species.
fn rollup(node: &mut GenusNode) {
    node.genus.species_count = Some(node.species.len());
    if node.species.is_empty() {
        return;
    }

    if node.genus.synthetic {
        for ct in CountType::ALL {
            let best = node
                .species
                .iter()
                .map(|s| *s.metrics(ct))
                .reduce(|a, b| max_metrics(&a, &b))
                .unwrap_or_else(absent_metrics);
            *node.genus.metrics_mut(ct) = best;
        }
    }

    let best_score = node
        .species
        .iter()
        .map(|s| s.aggregatescore)
        .fold(f64::NEG_INFINITY, f64::max);
    node.genus.set_aggregatescore(best_score);
}

fn max_metrics(a: &CountMetrics, b: &CountMetrics) -> CountMetrics {
    CountMetrics {
        r: a.r.max(b.r),
        rpm: a.rpm.max(b.rpm),
        zscore: a.zscore.max(b.zscore),
        aggregatescore: a.aggregatescore.max(b.aggregatescore),
        percentidentity: a.percentidentity.max(b.percentidentity),
        alignmentlength: a.alignmentlength.max(b.alignmentlength),
        neglogevalue: a.neglogevalue.max(b.neglogevalue),
        percentconcordant: a.percentconcordant.max(b.percentconcordant),
    }
}
