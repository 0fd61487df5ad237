// src/heatmap/prefilter.rs

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::background::BackgroundStats;
use crate::counts::CountSource;
use crate::error::{ReportError, Result};
use crate::hierarchy::{rows_from_counts, ReportRow};
use crate::metrics::Normalization;
use crate::types::{
    CountType, MetricKind, SampleCounts, SampleId, SortDirection, SortSpec, TaxId, TaxLevel, TaxonCount,
    ThresholdFilter,
};

/// Genus id the pipeline assigns to hits it considers uninformative.
pub const BLACKLIST_GENUS_ID: TaxId = -201;
/// Homo sapiens.
pub const HOST_TAX_ID: TaxId = 9606;

/// Metric a sample's taxa are ranked by before the union.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankBy {
    #[default]
    Reads,
    Rpm,
}

impl std::str::FromStr for RankBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "reads" => Ok(RankBy::Reads),
            "rpm" => Ok(RankBy::Rpm),
            other => Err(format!("unknown ranking metric '{other}'")),
        }
    }
}

/// Per-sample selection rules, identical for every sample of a batch.
#[derive(Debug, Clone)]
pub struct PrefilterParams {
    pub top_n_per_sample: usize,
    pub min_reads: u64,
    pub rank_by: RankBy,
    /// Count types whose rows take part in ranking.
    pub rank_count_types: Vec<CountType>,
    /// Categories to keep; empty keeps all.
    pub categories: Vec<String>,
    /// Keep phage rows. With no categories this selects phages only.
    pub include_phage: bool,
    /// Drop rows whose tax id is not a real (positive) NCBI id.
    pub read_specificity: bool,
    pub tax_level: Option<TaxLevel>,
    pub blacklist: AHashSet<TaxId>,
    /// Per-taxon thresholds on metrics that need no background.
    pub thresholds: Vec<ThresholdFilter>,
    /// Ranks by this metric instead of `rank_by` when set.
    pub rank_metric: Option<SortSpec>,
}

impl Default for PrefilterParams {
    fn default() -> Self {
        Self {
            top_n_per_sample: 1000,
            min_reads: 5,
            rank_by: RankBy::Reads,
            rank_count_types: CountType::ALL.to_vec(),
            categories: Vec::new(),
            include_phage: false,
            read_specificity: false,
            tax_level: None,
            blacklist: [BLACKLIST_GENUS_ID, HOST_TAX_ID].into_iter().collect(),
            thresholds: Vec::new(),
            rank_metric: None,
        }
    }
}

impl PrefilterParams {
    fn keeps(&self, row: &TaxonCount) -> bool {
        if row.count < self.min_reads {
            return false;
        }
        if self.blacklist.contains(&row.tax_id) || self.blacklist.contains(&row.genus_taxid) {
            return false;
        }
        if self.read_specificity && row.tax_id <= 0 {
            return false;
        }
        if self.tax_level.is_some_and(|level| level != row.tax_level) {
            return false;
        }
        if self.categories.is_empty() {
            return !self.include_phage || row.is_phage;
        }
        let in_category = self
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&row.category_name));
        in_category && (self.include_phage || !row.is_phage)
    }

    /// Higher is better. `None` when the taxon has no row of a ranked count type.
    fn score(&self, row: &ReportRow, ranked_types: &AHashSet<(TaxId, CountType)>) -> Option<f64> {
        let types: Vec<CountType> = self
            .rank_count_types
            .iter()
            .copied()
            .filter(|&ct| ranked_types.contains(&(row.tax_id, ct)))
            .collect();
        if types.is_empty() {
            return None;
        }
        if let Some(sort) = self.rank_metric {
            let value = row.value(sort.metric);
            return Some(match sort.direction {
                SortDirection::Highest => value,
                SortDirection::Lowest => -value,
            });
        }
        let kind = match self.rank_by {
            RankBy::Reads => MetricKind::R,
            RankBy::Rpm => MetricKind::Rpm,
        };
        types.into_iter().map(|ct| row.metrics(ct).get(kind)).reduce(f64::max)
    }
}

/// A taxon that survived a sample's prefilter, with its 1-based rank there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedTaxon {
    pub tax_id: TaxId,
    pub rank: usize,
}

/// Ranks the taxa of one sample and keeps its first `top_n_per_sample`.
///
/// NT and NR rows of a taxon are merged first so thresholds see both count
/// types. With `rank_metric` unset, a taxon's score is its best row over the
/// ranked count types. Ties break by ascending tax id so the selection never
/// depends on input order.
pub fn top_taxa(sample: &SampleCounts, params: &PrefilterParams) -> Vec<RankedTaxon> {
    let eligible: Vec<&TaxonCount> = sample.counts.iter().filter(|r| params.keeps(r)).collect();
    let ranked_types: AHashSet<(TaxId, CountType)> = eligible
        .iter()
        .filter(|r| params.rank_count_types.contains(&r.count_type))
        .map(|r| (r.tax_id, r.count_type))
        .collect();
    let norm = Normalization {
        adjusted_total_reads: sample.adjusted_total_reads(),
        total_ercc_reads: sample.total_ercc_reads,
        mass_normalized: false,
    };
    let rows = rows_from_counts(eligible, &BackgroundStats::new(), &norm);

    let mut best: AHashMap<TaxId, f64> = AHashMap::new();
    for row in rows.iter().filter(|r| params.thresholds.iter().all(|t| t.accepts(r.value(t.metric)))) {
        let Some(score) = params.score(row, &ranked_types) else {
            continue;
        };
        let slot = best.entry(row.tax_id).or_insert(score);
        if score > *slot {
            *slot = score;
        }
    }

    let mut ranked: Vec<(TaxId, f64)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(params.top_n_per_sample)
        .enumerate()
        .map(|(i, (tax_id, _))| RankedTaxon { tax_id, rank: i + 1 })
        .collect()
}

/// A sample whose counts were fetched and prefiltered.
#[derive(Debug, Clone)]
pub struct PrefilteredSample {
    pub sample: SampleCounts,
    pub top: Vec<RankedTaxon>,
}

/// Result for one sample of a batch, in request order.
#[derive(Debug)]
pub struct SampleOutcome {
    pub sample_id: SampleId,
    pub result: Result<PrefilteredSample>,
}

/// Fetches and prefilters every sample on `pool`.
///
/// Workers report back over a channel. A sample that takes longer than
/// `sample_timeout`, or that has not reported when the batch ceiling
/// (`sample_timeout` times the number of worker waves) is reached, is marked
/// `SampleTimedOut`; any other failure keeps its own error. Failures never
/// affect the other samples.
pub fn prefilter_samples(
    pool: &rayon::ThreadPool,
    source: Arc<dyn CountSource>,
    sample_ids: &[SampleId],
    params: Arc<PrefilterParams>,
    sample_timeout: Duration,
) -> Vec<SampleOutcome> {
    let (tx, rx) = mpsc::channel::<(usize, Result<PrefilteredSample>)>();

    for (idx, &sample_id) in sample_ids.iter().enumerate() {
        let tx = tx.clone();
        let source = Arc::clone(&source);
        let params = Arc::clone(&params);
        pool.spawn(move || {
            let started = Instant::now();
            let result = source.sample_counts(sample_id).map(|sample| {
                let top = top_taxa(&sample, &params);
                PrefilteredSample { sample, top }
            });
            let result = match result {
                Ok(_) if started.elapsed() > sample_timeout => Err(timed_out(sample_id, sample_timeout)),
                other => other,
            };
            // receiver is gone once the ceiling passed
            let _ = tx.send((idx, result));
        });
    }
    drop(tx);

    let workers = pool.current_num_threads().max(1);
    let waves = sample_ids.len().div_ceil(workers).max(1) as u32;
    let deadline = Instant::now() + sample_timeout * waves;

    let mut slots: Vec<Option<Result<PrefilteredSample>>> = (0..sample_ids.len()).map(|_| None).collect();
    let mut received = 0;
    while received < sample_ids.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((idx, result)) => {
                slots[idx] = Some(result);
                received += 1;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "heatmap batch ceiling reached with {} of {} samples reported",
                    received,
                    sample_ids.len()
                );
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    sample_ids
        .iter()
        .zip(slots)
        .map(|(&sample_id, slot)| {
            let result = slot.unwrap_or_else(|| Err(timed_out(sample_id, sample_timeout)));
            if let Err(e) = &result {
                log::warn!("sample {sample_id} left out of heatmap: {e}");
            }
            SampleOutcome { sample_id, result }
        })
        .collect()
}

fn timed_out(sample_id: SampleId, timeout: Duration) -> ReportError {
    ReportError::SampleTimedOut { sample_id, timeout_ms: timeout.as_millis() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::InMemoryCounts;
    use crate::hierarchy::tests::{sample, taxon};
    use crate::types::MetricName;
    use std::thread;

    /// Sleeps before answering for one sample id.
    struct SlowSource {
        inner: InMemoryCounts,
        slow: SampleId,
        delay: Duration,
    }

    impl CountSource for SlowSource {
        fn sample_counts(&self, sample_id: SampleId) -> Result<SampleCounts> {
            if sample_id == self.slow {
                thread::sleep(self.delay);
            }
            self.inner.sample_counts(sample_id)
        }
    }

    fn source(ids: &[SampleId]) -> InMemoryCounts {
        let mut source = InMemoryCounts::new();
        for &id in ids {
            let mut s = sample(vec![taxon(10, TaxLevel::Species, 1, CountType::Nt, 100)]);
            s.sample_id = id;
            source.insert(s);
        }
        source
    }

    fn phage(tax_id: TaxId, count: u64) -> TaxonCount {
        TaxonCount {
            is_phage: true,
            category_name: "Viruses".into(),
            ..taxon(tax_id, TaxLevel::Species, 70, CountType::Nt, count)
        }
    }

    fn ids(top: &[RankedTaxon]) -> Vec<TaxId> {
        top.iter().map(|t| t.tax_id).collect()
    }

    #[test]
    fn ranks_by_best_row_with_tax_id_tiebreak() {
        let s = sample(vec![
            taxon(30, TaxLevel::Species, 3, CountType::Nt, 50),
            taxon(20, TaxLevel::Species, 2, CountType::Nt, 50),
            taxon(10, TaxLevel::Species, 1, CountType::Nt, 10),
            taxon(10, TaxLevel::Species, 1, CountType::Nr, 80),
        ]);
        let top = top_taxa(&s, &PrefilterParams::default());
        assert_eq!(ids(&top), vec![10, 20, 30]);
        assert_eq!(top[2].rank, 3);

        let params = PrefilterParams { top_n_per_sample: 2, ..PrefilterParams::default() };
        assert_eq!(ids(&top_taxa(&s, &params)), vec![10, 20]);
    }

    #[test]
    fn drops_low_counts_and_blacklisted_taxa() {
        let s = sample(vec![
            taxon(10, TaxLevel::Species, 1, CountType::Nt, 4),
            taxon(HOST_TAX_ID, TaxLevel::Species, 9605, CountType::Nt, 900),
            taxon(11, TaxLevel::Species, BLACKLIST_GENUS_ID, CountType::Nt, 900),
            taxon(12, TaxLevel::Species, 1, CountType::Nt, 5),
        ]);
        assert_eq!(ids(&top_taxa(&s, &PrefilterParams::default())), vec![12]);
    }

    #[test]
    fn category_and_phage_selection() {
        let s = sample(vec![
            taxon(10, TaxLevel::Species, 1, CountType::Nt, 100),
            phage(20, 90),
            TaxonCount { category_name: "Viruses".into(), ..taxon(30, TaxLevel::Species, 3, CountType::Nt, 80) },
        ]);

        let viruses = PrefilterParams { categories: vec!["viruses".into()], ..PrefilterParams::default() };
        assert_eq!(ids(&top_taxa(&s, &viruses)), vec![30]);

        let with_phage = PrefilterParams { include_phage: true, ..viruses.clone() };
        assert_eq!(ids(&top_taxa(&s, &with_phage)), vec![20, 30]);

        let phage_only = PrefilterParams { include_phage: true, ..PrefilterParams::default() };
        assert_eq!(ids(&top_taxa(&s, &phage_only)), vec![20]);
    }

    #[test]
    fn specificity_and_level_filters() {
        let s = sample(vec![
            taxon(-10, TaxLevel::Species, 1, CountType::Nt, 100),
            taxon(1, TaxLevel::Genus, 1, CountType::Nt, 100),
            taxon(11, TaxLevel::Species, 1, CountType::Nt, 50),
        ]);
        let specific = PrefilterParams { read_specificity: true, ..PrefilterParams::default() };
        assert_eq!(ids(&top_taxa(&s, &specific)), vec![1, 11]);

        let genus = PrefilterParams { tax_level: Some(TaxLevel::Genus), ..PrefilterParams::default() };
        assert_eq!(ids(&top_taxa(&s, &genus)), vec![1]);
    }

    #[test]
    fn thresholds_apply_before_ranking() {
        let s = sample(vec![
            taxon(10, TaxLevel::Species, 1, CountType::Nt, 900),
            taxon(10, TaxLevel::Species, 1, CountType::Nr, 2),
            taxon(20, TaxLevel::Species, 2, CountType::Nt, 300),
            taxon(20, TaxLevel::Species, 2, CountType::Nr, 200),
            taxon(30, TaxLevel::Species, 3, CountType::Nt, 100),
            taxon(30, TaxLevel::Species, 3, CountType::Nr, 150),
        ]);
        // NR rpm >= 100 only holds for 20 and 30
        let params = PrefilterParams {
            top_n_per_sample: 1,
            thresholds: vec![ThresholdFilter {
                metric: MetricName::new(CountType::Nr, MetricKind::Rpm),
                min: Some(100.0),
                max: None,
            }],
            ..PrefilterParams::default()
        };
        assert_eq!(ids(&top_taxa(&s, &params)), vec![20]);
    }

    #[test]
    fn ranks_by_requested_metric() {
        let s = sample(vec![
            taxon(10, TaxLevel::Species, 1, CountType::Nt, 900),
            taxon(20, TaxLevel::Species, 2, CountType::Nt, 300),
            TaxonCount { alignment_length: 180.0, ..taxon(20, TaxLevel::Species, 2, CountType::Nr, 30) },
        ]);
        let nr_length = MetricName::new(CountType::Nr, MetricKind::Alignmentlength);
        let highest = PrefilterParams {
            rank_metric: Some(SortSpec { metric: nr_length, direction: SortDirection::Highest }),
            ..PrefilterParams::default()
        };
        assert_eq!(ids(&top_taxa(&s, &highest)), vec![20, 10]);

        let lowest = PrefilterParams {
            rank_metric: Some(SortSpec { metric: nr_length, direction: SortDirection::Lowest }),
            ..PrefilterParams::default()
        };
        assert_eq!(ids(&top_taxa(&s, &lowest)), vec![10, 20]);
    }

    #[test]
    fn slow_sample_times_out_alone() {
        let slow = SlowSource { inner: source(&[1, 2, 3]), slow: 2, delay: Duration::from_millis(1500) };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let timeout = Duration::from_millis(200);
        let started = Instant::now();
        let outcomes =
            prefilter_samples(&pool, Arc::new(slow), &[1, 2, 3], Arc::new(PrefilterParams::default()), timeout);
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(1000), "batch took {elapsed:?}");
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(ReportError::SampleTimedOut { sample_id: 2, timeout_ms: 200 })
        ));
        assert!(outcomes[2].result.is_ok());
    }

    #[test]
    fn batch_ceiling_covers_queued_samples() {
        // one worker: the second sample waits behind the first and both fit in two waves
        let slow = SlowSource { inner: source(&[1, 2]), slow: 1, delay: Duration::from_millis(50) };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let outcomes = prefilter_samples(
            &pool,
            Arc::new(slow),
            &[1, 2],
            Arc::new(PrefilterParams::default()),
            Duration::from_millis(400),
        );
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }

    #[test]
    fn failures_stay_with_their_sample() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let outcomes = prefilter_samples(
            &pool,
            Arc::new(source(&[1, 2])),
            &[2, 9, 1],
            Arc::new(PrefilterParams::default()),
            Duration::from_secs(5),
        );
        assert_eq!(outcomes.iter().map(|o| o.sample_id).collect::<Vec<_>>(), vec![2, 9, 1]);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(ReportError::SampleNotFound(9))));
        assert!(outcomes[2].result.is_ok());
    }
}
