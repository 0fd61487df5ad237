// src/heatmap/mod.rs

//! Abundance matrices over many samples.
//!
//! A request runs in four stages:
//! 1. every sample is fetched and prefiltered to its top taxa on the worker pool,
//! 2. the per-sample lists are merged into one bounded union,
//! 3. background stats for the union are fetched in a single call,
//! 4. metrics are computed for each sample and assembled into a sparse matrix.

pub mod aggregate;
pub mod export;
pub mod prefilter;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::background::{BackgroundStats, BackgroundStore};
use crate::counts::CountSource;
use crate::error::{ReportError, Result};
use crate::filter::{thresholds_from_operators, OperatorThreshold};
use crate::hierarchy::ReportRow;
use crate::types::{
    BackgroundId, BackgroundInfo, CountType, MetricKind, MetricName, SampleId, SortDirection, SortSpec, TaxId, TaxLevel,
};

pub use aggregate::{HeatmapMatrix, TaxonUnion};
pub use export::write_heatmap_csv;
pub use prefilter::{PrefilterParams, RankBy, BLACKLIST_GENUS_ID, HOST_TAX_ID};

use aggregate::{assemble, ordered_taxa, union_top_taxa, CellLayout, CellSelection};
use prefilter::{prefilter_samples, PrefilteredSample};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapRequest {
    pub sample_ids: Vec<SampleId>,
    /// Falls back to the first fetched sample's default background.
    pub background_id: Option<BackgroundId>,
    pub categories: Vec<String>,
    /// e.g. `{"Viruses": ["Phage"]}`.
    pub subcategories: BTreeMap<String, Vec<String>>,
    /// Empty means all.
    pub metrics: Vec<MetricKind>,
    /// Empty means both.
    pub count_types: Vec<CountType>,
    pub top_n_per_sample: Option<usize>,
    pub min_reads_threshold: Option<u64>,
    pub rank_by: RankBy,
    pub read_specificity: bool,
    pub tax_level: Option<TaxLevel>,
    /// `{"metric": "NT_zscore", "value": "5", "operator": ">="}` records, checked per (sample, taxon).
    pub threshold_filters: Vec<OperatorThreshold>,
    /// `NT.rpm`, `nr_zscore` or `highest_nt_rpm`. When given, samples are also ranked by it.
    pub sort_by: Option<String>,
    /// Detail call: exact metrics for these taxa in every sample.
    pub taxon_ids: Option<Vec<TaxId>>,
    pub removed_taxon_ids: Vec<TaxId>,
}

impl HeatmapRequest {
    fn include_phage(&self) -> bool {
        self.subcategories
            .iter()
            .filter(|(category, _)| category.eq_ignore_ascii_case("viruses"))
            .any(|(_, subs)| subs.iter().any(|s| s.eq_ignore_ascii_case("phage")))
    }

    fn metrics(&self) -> Vec<MetricKind> {
        if self.metrics.is_empty() {
            MetricKind::ALL.to_vec()
        } else {
            self.metrics.clone()
        }
    }

    fn count_types(&self) -> Vec<CountType> {
        if self.count_types.is_empty() {
            CountType::ALL.to_vec()
        } else {
            self.count_types.clone()
        }
    }

    fn sort(&self) -> SortSpec {
        self.sort_by.as_deref().map_or_else(default_sort, parse_sort)
    }
}

fn default_sort() -> SortSpec {
    SortSpec { metric: MetricName::new(CountType::Nt, MetricKind::Rpm), direction: SortDirection::Highest }
}

/// Accepts a bare metric (highest first) or a `<direction>_<metric>` sort.
fn parse_sort(raw: &str) -> SortSpec {
    if let Ok(metric) = raw.parse::<MetricName>() {
        return SortSpec { metric, direction: SortDirection::Highest };
    }
    match raw.parse::<SortSpec>() {
        Ok(sort) => sort,
        Err(e) => {
            log::warn!("unknown heatmap sort ({e}), using {}", default_sort());
            default_sort()
        }
    }
}

/// Limits and defaults applied to every heatmap request.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapDefaults {
    pub top_n_per_sample: usize,
    pub min_reads: u64,
    pub max_total_taxa: usize,
    pub blacklist: Vec<TaxId>,
    pub default_background_id: Option<BackgroundId>,
}

impl Default for HeatmapDefaults {
    fn default() -> Self {
        Self {
            top_n_per_sample: 1000,
            min_reads: 5,
            max_total_taxa: 10_000,
            blacklist: vec![BLACKLIST_GENUS_ID, HOST_TAX_ID],
            default_background_id: None,
        }
    }
}

/// Per-sample summary; `error` is set when the sample could not contribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapSample {
    pub sample_id: SampleId,
    pub pipeline_run_id: Option<u64>,
    pub total_reads: Option<u64>,
    pub adjusted_total_reads: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapTaxon {
    pub tax_id: TaxId,
    pub name: String,
    pub tax_level: TaxLevel,
    pub genus_taxid: TaxId,
    pub category_name: String,
    pub is_phage: bool,
}

impl From<&ReportRow> for HeatmapTaxon {
    fn from(row: &ReportRow) -> Self {
        Self {
            tax_id: row.tax_id,
            name: row.name.clone(),
            tax_level: row.tax_level,
            genus_taxid: row.genus_taxid,
            category_name: row.category_name.clone(),
            is_phage: row.is_phage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapMetadata {
    pub background_id: Option<BackgroundId>,
    pub top_n_per_sample: usize,
    /// Worst per-sample rank kept after the total cap. `None` for detail calls.
    pub effective_top_rank: Option<usize>,
    pub min_reads: u64,
    pub max_total_taxa: usize,
    pub union_size: usize,
    pub capped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapResponse {
    pub samples: Vec<HeatmapSample>,
    pub taxa: Vec<HeatmapTaxon>,
    pub results: HeatmapMatrix,
    pub backgrounds: Vec<BackgroundInfo>,
    pub metrics: Vec<MetricKind>,
    pub count_types: Vec<CountType>,
    pub metadata: HeatmapMetadata,
}

impl HeatmapResponse {
    /// Samples that produced data.
    pub fn valid_samples(&self) -> usize {
        self.samples.iter().filter(|s| s.error.is_none()).count()
    }
}

/// Runs heatmap requests against one count source and background store.
pub struct HeatmapAggregator {
    source: Arc<dyn CountSource>,
    backgrounds: Arc<dyn BackgroundStore>,
    pool: rayon::ThreadPool,
    sample_timeout: Duration,
    defaults: HeatmapDefaults,
}

impl HeatmapAggregator {
    /// `threads == 0` lets rayon pick.
    pub fn new(
        source: Arc<dyn CountSource>,
        backgrounds: Arc<dyn BackgroundStore>,
        threads: usize,
        sample_timeout: Duration,
        defaults: HeatmapDefaults,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("heatmap-{i}"))
            .build()?;
        Ok(Self { source, backgrounds, pool, sample_timeout, defaults })
    }

    pub fn run(&self, request: &HeatmapRequest) -> Result<HeatmapResponse> {
        if let Some(id) = request.background_id {
            if self.backgrounds.background(id).is_none() {
                return Err(ReportError::BackgroundModelNotFound(id));
            }
        }

        let top_n = request.top_n_per_sample.unwrap_or(self.defaults.top_n_per_sample);
        let min_reads = request.min_reads_threshold.unwrap_or(self.defaults.min_reads);
        let sort = request.sort();
        let thresholds = thresholds_from_operators(&request.threshold_filters);
        // z-score based checks wait for the background fetch
        let early_thresholds = thresholds.iter().copied().filter(|t| !t.metric.needs_background()).collect();
        let rank_metric = request.sort_by.as_ref().map(|_| sort).filter(|s| !s.metric.needs_background());
        let params = PrefilterParams {
            top_n_per_sample: top_n,
            min_reads,
            rank_by: request.rank_by,
            rank_count_types: request.count_types(),
            categories: request.categories.clone(),
            include_phage: request.include_phage(),
            read_specificity: request.read_specificity,
            tax_level: request.tax_level,
            blacklist: self.defaults.blacklist.iter().copied().collect(),
            thresholds: early_thresholds,
            rank_metric,
        };

        // Stage 1: per-sample fetch + prefilter
        let stage = Instant::now();
        let outcomes = prefilter_samples(
            &self.pool,
            Arc::clone(&self.source),
            &request.sample_ids,
            Arc::new(params),
            self.sample_timeout,
        );
        let fetched: Vec<&PrefilteredSample> = outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect();
        log::debug!(
            "prefiltered {}/{} samples in {:?}",
            fetched.len(),
            outcomes.len(),
            stage.elapsed()
        );

        let background_id = request
            .background_id
            .or_else(|| fetched.iter().find_map(|s| s.sample.default_background_id))
            .or(self.defaults.default_background_id);
        let background = match background_id {
            Some(id) => Some(
                self.backgrounds
                    .background(id)
                    .ok_or(ReportError::BackgroundModelNotFound(id))?,
            ),
            None => None,
        };

        // Stage 2: union
        let removed: AHashSet<TaxId> = request.removed_taxon_ids.iter().copied().collect();
        let detail_taxa: Option<AHashSet<TaxId>> = request
            .taxon_ids
            .as_ref()
            .map(|ids| ids.iter().copied().filter(|id| !removed.contains(id)).collect());
        let union = match &detail_taxa {
            Some(taxa) => {
                let mut tax_ids: Vec<TaxId> = taxa.iter().copied().collect();
                tax_ids.sort_unstable();
                TaxonUnion { tax_ids, effective_rank: None, capped: false }
            }
            None => union_top_taxa(
                fetched.iter().map(|s| s.top.as_slice()),
                self.defaults.max_total_taxa,
                &removed,
            ),
        };
        if union.capped {
            log::info!(
                "heatmap union capped at {} taxa (rank {:?})",
                union.len(),
                union.effective_rank
            );
        }

        // Stage 3: one background fetch for exactly the union
        let stage = Instant::now();
        let stats = match &background {
            Some(bg) if !union.is_empty() => self.backgrounds.stats(bg.id, &union.tax_ids)?,
            _ => BackgroundStats::new(),
        };
        log::debug!("fetched {} background stats in {:?}", stats.len(), stage.elapsed());

        // Stage 4: cells
        let metrics = request.metrics();
        let count_types = request.count_types();
        let layout = CellLayout {
            metrics: &metrics,
            count_types: &count_types,
            mass_normalized: background.as_ref().is_some_and(|b| b.mass_normalized),
            // detail calls show exact metrics
            thresholds: if detail_taxa.is_some() { &[] } else { thresholds.as_slice() },
            sort,
        };
        let selection = match &detail_taxa {
            Some(taxa) => CellSelection::Taxa(taxa),
            None => CellSelection::Survivors(&union),
        };
        let (results, taxa) = self.pool.install(|| assemble(&fetched, selection, &stats, &layout));
        let taxa = ordered_taxa(taxa, sort);

        let samples = outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(p) => HeatmapSample {
                    sample_id: o.sample_id,
                    pipeline_run_id: Some(p.sample.pipeline_run_id),
                    total_reads: Some(p.sample.total_reads),
                    adjusted_total_reads: Some(p.sample.adjusted_total_reads()),
                    error: None,
                },
                Err(e) => HeatmapSample {
                    sample_id: o.sample_id,
                    pipeline_run_id: None,
                    total_reads: None,
                    adjusted_total_reads: None,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        Ok(HeatmapResponse {
            samples,
            taxa,
            results,
            backgrounds: self.backgrounds.backgrounds(),
            metrics,
            count_types,
            metadata: HeatmapMetadata {
                background_id,
                top_n_per_sample: top_n,
                effective_top_rank: union.effective_rank,
                min_reads,
                max_total_taxa: self.defaults.max_total_taxa,
                union_size: union.len(),
                capped: union.capped,
            },
        })
    }
}
