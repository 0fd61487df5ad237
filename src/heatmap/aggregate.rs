// src/heatmap/aggregate.rs

use ahash::{AHashMap, AHashSet};
use rayon::prelude::*;
use std::collections::BTreeMap;

use super::prefilter::{PrefilteredSample, RankedTaxon};
use super::HeatmapTaxon;
use crate::background::BackgroundStats;
use crate::hierarchy::{rows_from_counts, ReportRow};
use crate::metrics::Normalization;
use crate::types::{CountType, MetricKind, SampleId, SortDirection, SortSpec, TaxId, ThresholdFilter};

pub type TaxonCells = BTreeMap<CountType, BTreeMap<MetricKind, f64>>;
pub type SampleCells = BTreeMap<TaxId, TaxonCells>;
/// `sample_id -> tax_id -> count_type -> metric -> value`. Only cells backed by count rows exist.
pub type HeatmapMatrix = BTreeMap<SampleId, SampleCells>;

/// Taxa selected across a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonUnion {
    /// Ascending.
    pub tax_ids: Vec<TaxId>,
    /// Worst per-sample rank that made it in, `None` for an empty union.
    pub effective_rank: Option<usize>,
    /// Some taxa were cut by the total cap.
    pub capped: bool,
}

impl TaxonUnion {
    pub fn len(&self) -> usize {
        self.tax_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tax_ids.is_empty()
    }

    pub fn contains(&self, tax_id: TaxId) -> bool {
        self.tax_ids.binary_search(&tax_id).is_ok()
    }
}

/// Union of the per-sample top lists, bounded by `max_total_taxa`.
///
/// Taxa are admitted by their best rank in any sample, a whole rank at a
/// time, until the cap is reached; the rank at which admission stopped is the
/// effective rank. A rank is never split, so the union can exceed the cap by
/// the size of its last rank.
pub fn union_top_taxa<'a, I>(per_sample: I, max_total_taxa: usize, excluded: &AHashSet<TaxId>) -> TaxonUnion
where
    I: IntoIterator<Item = &'a [RankedTaxon]>,
{
    let mut best_rank: AHashMap<TaxId, usize> = AHashMap::new();
    for top in per_sample {
        for t in top.iter().filter(|t| !excluded.contains(&t.tax_id)) {
            let slot = best_rank.entry(t.tax_id).or_insert(t.rank);
            *slot = (*slot).min(t.rank);
        }
    }

    let mut by_rank: Vec<(usize, TaxId)> = best_rank.into_iter().map(|(tax_id, rank)| (rank, tax_id)).collect();
    by_rank.sort_unstable();

    let mut union = TaxonUnion::default();
    for (rank, tax_id) in by_rank {
        if union.tax_ids.len() >= max_total_taxa && union.effective_rank != Some(rank) {
            union.capped = true;
            break;
        }
        union.tax_ids.push(tax_id);
        union.effective_rank = Some(rank);
    }
    union.tax_ids.sort_unstable();
    union
}

/// Which taxa get cells for a sample.
#[derive(Debug, Clone, Copy)]
pub enum CellSelection<'a> {
    /// The sample's own prefilter survivors within the union.
    Survivors(&'a TaxonUnion),
    /// Every listed taxon the sample has counts for.
    Taxa(&'a AHashSet<TaxId>),
}

/// Output shape of one assembly run.
#[derive(Debug, Clone, Copy)]
pub struct CellLayout<'a> {
    pub metrics: &'a [MetricKind],
    pub count_types: &'a [CountType],
    pub mass_normalized: bool,
    /// A (sample, taxon) pair failing any of these gets no cells.
    pub thresholds: &'a [ThresholdFilter],
    /// Orders the taxon info block.
    pub sort: SortSpec,
}

/// Taxon info keyed by id, with the best sort value seen in any sample.
pub type TaxonInfo = BTreeMap<TaxId, (HeatmapTaxon, f64)>;

/// Cells of one sample plus the rows they came from.
pub fn sample_cells(
    prefiltered: &PrefilteredSample,
    selection: CellSelection<'_>,
    stats: &BackgroundStats,
    layout: &CellLayout<'_>,
) -> (SampleCells, Vec<ReportRow>) {
    let wanted: AHashSet<TaxId> = match selection {
        CellSelection::Survivors(union) => prefiltered
            .top
            .iter()
            .map(|t| t.tax_id)
            .filter(|&id| union.contains(id))
            .collect(),
        CellSelection::Taxa(taxa) => taxa.clone(),
    };

    let sample = &prefiltered.sample;
    let selected: Vec<_> = sample.counts.iter().filter(|c| wanted.contains(&c.tax_id)).collect();
    let present: AHashSet<(TaxId, CountType)> = selected.iter().map(|c| (c.tax_id, c.count_type)).collect();
    let norm = Normalization {
        adjusted_total_reads: sample.adjusted_total_reads(),
        total_ercc_reads: sample.total_ercc_reads,
        mass_normalized: layout.mass_normalized,
    };
    let rows = rows_from_counts(selected, stats, &norm);

    let mut cells = SampleCells::new();
    for row in rows.iter().filter(|r| layout.thresholds.iter().all(|t| t.accepts(r.value(t.metric)))) {
        for &ct in layout.count_types {
            if !present.contains(&(row.tax_id, ct)) {
                continue;
            }
            let values = layout
                .metrics
                .iter()
                .map(|&m| (m, row.metrics(ct).get(m)))
                .collect();
            cells.entry(row.tax_id).or_default().insert(ct, values);
        }
    }
    (cells, rows)
}

/// Builds the sparse matrix and the taxon info block for every fetched sample in parallel.
pub fn assemble(
    samples: &[&PrefilteredSample],
    selection: CellSelection<'_>,
    stats: &BackgroundStats,
    layout: &CellLayout<'_>,
) -> (HeatmapMatrix, TaxonInfo) {
    samples
        .par_iter()
        .fold(
            || (HeatmapMatrix::new(), TaxonInfo::new()),
            |mut acc, prefiltered| {
                let (cells, rows) = sample_cells(prefiltered, selection, stats, layout);
                for row in rows.iter().filter(|r| cells.contains_key(&r.tax_id)) {
                    let value = row.value(layout.sort.metric);
                    acc.1
                        .entry(row.tax_id)
                        .and_modify(|(_, best)| *best = better(layout.sort.direction, *best, value))
                        .or_insert_with(|| (HeatmapTaxon::from(row), value));
                }
                acc.0.insert(prefiltered.sample.sample_id, cells);
                acc
            },
        )
        .reduce(
            || (HeatmapMatrix::new(), TaxonInfo::new()),
            |mut a, b| {
                a.0.extend(b.0);
                for (tax_id, (info, value)) in b.1 {
                    a.1.entry(tax_id)
                        .and_modify(|(_, best)| *best = better(layout.sort.direction, *best, value))
                        .or_insert((info, value));
                }
                a
            },
        )
}

fn better(direction: SortDirection, a: f64, b: f64) -> f64 {
    match direction {
        SortDirection::Highest => a.max(b),
        SortDirection::Lowest => a.min(b),
    }
}

/// Taxa by their best sort value across samples, ties by ascending tax id.
pub fn ordered_taxa(info: TaxonInfo, sort: SortSpec) -> Vec<HeatmapTaxon> {
    let mut taxa: Vec<(HeatmapTaxon, f64)> = info.into_values().collect();
    taxa.sort_by(|(a, av), (b, bv)| {
        let by_value = match sort.direction {
            SortDirection::Highest => bv.total_cmp(av),
            SortDirection::Lowest => av.total_cmp(bv),
        };
        by_value.then(a.tax_id.cmp(&b.tax_id))
    });
    taxa.into_iter().map(|(taxon, _)| taxon).collect()
}
